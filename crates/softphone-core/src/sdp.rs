//! Minimal SDP model for the two rewrites the softphone performs
//!
//! Hold and resume flip the direction attribute of every audio section, and
//! outbound offers get their codec list reordered. Both work on a parsed
//! [`SessionDescription`] and serialize it back, so every line the rewrite
//! does not own survives byte for byte (apart from line endings, which are
//! normalized to CRLF).
//!
//! ```rust
//! use rvoip_softphone_core::sdp::{Direction, SessionDescription};
//!
//! let offer = "v=0\r\no=- 1 1 IN IP4 10.0.0.1\r\ns=-\r\nt=0 0\r\n\
//!              m=audio 4000 RTP/AVP 0 8 111\r\na=rtpmap:111 opus/48000/2\r\na=sendrecv\r\n";
//! let mut sdp = SessionDescription::parse(offer).unwrap();
//! sdp.set_audio_direction(Direction::SendOnly);
//! sdp.prefer_codecs(&["opus".to_string()]);
//!
//! let out = sdp.to_string();
//! assert!(out.contains("m=audio 4000 RTP/AVP 111 0 8\r\n"));
//! assert!(out.contains("a=sendonly\r\n"));
//! ```

use std::fmt;

use crate::error::{PhoneError, PhoneResult};

/// Media direction attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        }
    }

    fn from_attribute(line: &str) -> Option<Self> {
        let value = line.strip_prefix("a=").or_else(|| line.strip_prefix("A="))?;
        match value.trim().to_ascii_lowercase().as_str() {
            "sendrecv" => Some(Direction::SendRecv),
            "sendonly" => Some(Direction::SendOnly),
            "recvonly" => Some(Direction::RecvOnly),
            "inactive" => Some(Direction::Inactive),
            _ => None,
        }
    }
}

/// One `m=` section and the lines that follow it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    pub kind: String,
    pub port: String,
    pub proto: String,
    pub formats: Vec<String>,
    pub lines: Vec<String>,
}

impl MediaSection {
    fn parse(line: &str) -> PhoneResult<Self> {
        let body = &line[2..];
        let mut parts = body.split_whitespace();
        let (Some(kind), Some(port), Some(proto)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(PhoneError::MalformedSdp {
                reason: format!("incomplete media line '{}'", line),
            });
        };
        Ok(Self {
            kind: kind.to_string(),
            port: port.to_string(),
            proto: proto.to_string(),
            formats: parts.map(str::to_string).collect(),
            lines: Vec::new(),
        })
    }

    pub fn is_audio(&self) -> bool {
        self.kind.eq_ignore_ascii_case("audio")
    }

    /// The direction attribute of this section, if present
    pub fn direction(&self) -> Option<Direction> {
        self.lines.iter().find_map(|l| Direction::from_attribute(l))
    }

    /// Replace any direction attributes with `direction`, keeping the first one's position
    pub fn set_direction(&mut self, direction: Direction) {
        let first = self
            .lines
            .iter()
            .position(|l| Direction::from_attribute(l).is_some());
        self.lines.retain(|l| Direction::from_attribute(l).is_none());

        let attr = format!("a={}", direction.as_str());
        match first {
            Some(index) => self.lines.insert(index.min(self.lines.len()), attr),
            None => self.lines.push(attr),
        }
    }

    /// Codec name for a payload type, from `a=rtpmap` or the static table
    pub fn codec_name(&self, payload: &str) -> Option<String> {
        let mapped = self.lines.iter().find_map(|l| {
            let (prefix, rest) = l.split_at_checked("a=rtpmap:".len())?;
            if !prefix.eq_ignore_ascii_case("a=rtpmap:") {
                return None;
            }
            let (pt, encoding) = rest.split_once(char::is_whitespace)?;
            (pt == payload).then(|| encoding.trim().split('/').next().unwrap_or("").to_string())
        });
        mapped.or_else(|| static_payload_name(payload).map(str::to_string))
    }

    /// Move the preferred codecs to the front; nothing is removed
    pub fn prefer_codecs(&mut self, preferred: &[String]) {
        let names: Vec<Option<String>> = self.formats.iter().map(|f| self.codec_name(f)).collect();
        let mut taken = vec![false; self.formats.len()];
        let mut ordered = Vec::with_capacity(self.formats.len());

        for codec in preferred {
            for (i, name) in names.iter().enumerate() {
                if !taken[i] && name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(codec)) {
                    taken[i] = true;
                    ordered.push(self.formats[i].clone());
                }
            }
        }
        for (i, format) in self.formats.iter().enumerate() {
            if !taken[i] {
                ordered.push(format.clone());
            }
        }
        self.formats = ordered;
    }

    fn media_line(&self) -> String {
        let mut line = format!("m={} {} {}", self.kind, self.port, self.proto);
        for format in &self.formats {
            line.push(' ');
            line.push_str(format);
        }
        line
    }
}

fn static_payload_name(payload: &str) -> Option<&'static str> {
    match payload {
        "0" => Some("PCMU"),
        "3" => Some("GSM"),
        "4" => Some("G723"),
        "8" => Some("PCMA"),
        "9" => Some("G722"),
        "18" => Some("G729"),
        _ => None,
    }
}

/// A parsed session description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub session: Vec<String>,
    pub media: Vec<MediaSection>,
}

impl SessionDescription {
    pub fn parse(text: &str) -> PhoneResult<Self> {
        let mut lines = text
            .split('\n')
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.trim().is_empty());

        let first = lines.next().ok_or_else(|| PhoneError::MalformedSdp {
            reason: "empty description".to_string(),
        })?;
        if !first.starts_with("v=") {
            return Err(PhoneError::MalformedSdp {
                reason: format!("expected version line, got '{}'", first),
            });
        }

        let mut sdp = SessionDescription {
            session: vec![first.to_string()],
            media: Vec::new(),
        };
        for line in lines {
            if line.starts_with("m=") || line.starts_with("M=") {
                sdp.media.push(MediaSection::parse(line)?);
            } else if let Some(section) = sdp.media.last_mut() {
                section.lines.push(line.to_string());
            } else {
                sdp.session.push(line.to_string());
            }
        }
        Ok(sdp)
    }

    pub fn audio_sections(&self) -> impl Iterator<Item = &MediaSection> {
        self.media.iter().filter(|m| m.is_audio())
    }

    pub fn set_audio_direction(&mut self, direction: Direction) {
        for section in self.media.iter_mut().filter(|m| m.is_audio()) {
            section.set_direction(direction);
        }
    }

    pub fn prefer_codecs(&mut self, preferred: &[String]) {
        for section in self.media.iter_mut().filter(|m| m.is_audio()) {
            section.prefer_codecs(preferred);
        }
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.session {
            write!(f, "{}\r\n", line)?;
        }
        for section in &self.media {
            write!(f, "{}\r\n", section.media_line())?;
            for line in &section.lines {
                write!(f, "{}\r\n", line)?;
            }
        }
        Ok(())
    }
}

/// Rewrite the direction of every audio section of `sdp`
pub fn with_audio_direction(sdp: &str, direction: Direction) -> PhoneResult<String> {
    let mut parsed = SessionDescription::parse(sdp)?;
    parsed.set_audio_direction(direction);
    Ok(parsed.to_string())
}

/// Reorder the audio codecs of `sdp` so `preferred` come first
pub fn with_preferred_codecs(sdp: &str, preferred: &[String]) -> PhoneResult<String> {
    let mut parsed = SessionDescription::parse(sdp)?;
    parsed.prefer_codecs(preferred);
    Ok(parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\n\
        o=- 4611731400430051336 2 IN IP4 127.0.0.1\n\
        s=-\n\
        t=0 0\n\
        a=group:BUNDLE 0 1\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 0 8 9 111 101\n\
        c=IN IP4 0.0.0.0\n\
        a=rtpmap:111 OPUS/48000/2\n\
        a=rtpmap:101 telephone-event/8000\n\
        a=SendRecv\n\
        a=mid:0\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96\n\
        a=rtpmap:96 VP8/90000\n\
        a=sendrecv\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 8 0\n\
        a=mid:1\n";

    fn sdp() -> SessionDescription {
        SessionDescription::parse(OFFER).unwrap()
    }

    #[test]
    fn test_hold_rewrites_every_audio_section_only() {
        let mut parsed = sdp();
        parsed.set_audio_direction(Direction::SendOnly);

        assert_eq!(parsed.media[0].direction(), Some(Direction::SendOnly));
        assert_eq!(parsed.media[2].direction(), Some(Direction::SendOnly));
        // video untouched
        assert_eq!(parsed.media[1].direction(), Some(Direction::SendRecv));
        assert!(parsed.media[1].lines.contains(&"a=sendrecv".to_string()));

        // the replaced attribute keeps its position
        assert_eq!(parsed.media[0].lines[3], "a=sendonly");
        assert_eq!(parsed.media[0].lines[4], "a=mid:0");
    }

    #[test]
    fn test_direction_round_trip_preserves_other_lines() {
        let held = with_audio_direction(OFFER, Direction::SendOnly).unwrap();
        let resumed = with_audio_direction(&held, Direction::SendRecv).unwrap();
        let original = sdp().to_string();

        let strip = |s: &str| -> Vec<String> {
            s.lines()
                .filter(|l| Direction::from_attribute(l).is_none())
                .map(str::to_string)
                .collect()
        };
        assert_eq!(strip(&resumed), strip(&original));
        assert_eq!(resumed.matches("a=sendrecv").count(), 3);
    }

    #[test]
    fn test_prefer_codecs_reorders_without_dropping() {
        let mut parsed = sdp();
        parsed.prefer_codecs(&["opus".to_string(), "PCMA".to_string()]);

        assert_eq!(parsed.media[0].formats, vec!["111", "8", "0", "9", "101"]);
        assert_eq!(parsed.media[2].formats, vec!["8", "0"]);
        assert_eq!(parsed.media[1].formats, vec!["96"]);
    }

    #[test]
    fn test_prefer_unknown_codec_is_noop() {
        let mut parsed = sdp();
        parsed.prefer_codecs(&["iLBC".to_string()]);
        assert_eq!(parsed.media[0].formats, vec!["0", "8", "9", "111", "101"]);
    }

    #[test]
    fn test_serialize_uses_crlf() {
        let out = sdp().to_string();
        assert!(out.starts_with("v=0\r\n"));
        assert!(out.ends_with("a=mid:1\r\n"));
        assert!(!out.contains("\n\n"));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(SessionDescription::parse("").is_err());
        assert!(SessionDescription::parse("hello").is_err());
        assert!(SessionDescription::parse("v=0\r\nm=audio\r\n").is_err());
    }

    #[test]
    fn test_missing_direction_is_appended() {
        let mut parsed = SessionDescription::parse("v=0\r\nm=audio 1 RTP/AVP 0\r\na=mid:0\r\n").unwrap();
        parsed.set_audio_direction(Direction::SendOnly);
        assert_eq!(parsed.media[0].lines, vec!["a=mid:0", "a=sendonly"]);
    }

    #[test]
    fn test_rtpmap_prefix_is_case_insensitive() {
        let mut parsed = SessionDescription::parse(
            "v=0\r\nm=audio 1 RTP/AVP 0 111\r\nA=RTPMAP:111 opus/48000/2\r\n",
        )
        .unwrap();
        assert_eq!(parsed.media[0].codec_name("111").as_deref(), Some("opus"));

        parsed.prefer_codecs(&["opus".to_string()]);
        assert_eq!(parsed.media[0].formats, vec!["111", "0"]);
    }
}

//! message/sipfrag bodies of REFER NOTIFYs (RFC 3515)
//!
//! The transferee reports the progress of its INVITE to the target as a SIP
//! status line in the NOTIFY body:
//!
//! ```text
//! SIP/2.0 100 Trying
//! SIP/2.0 200 OK
//! SIP/2.0 486 Busy Here
//! ```

use crate::error::TransferFailure;

/// The status line of a sipfrag body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipFrag {
    pub status: u16,
    pub reason: String,
}

/// What a NOTIFY means for the transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// 1xx: still trying
    Progress(u16),
    /// 2xx: the transferee reached the target
    Success(u16),
    /// 3xx-6xx: the transfer failed
    Failure(u16, TransferFailure),
}

impl SipFrag {
    /// Find the status line in a NOTIFY body
    ///
    /// Accepts `SIP/2.0 <code> <reason>` anywhere in the body and, for
    /// lenient peers, a bare `<code> <reason>` on the first line.
    pub fn parse(body: &str) -> Option<Self> {
        let mut lines = body.lines().map(str::trim).filter(|l| !l.is_empty());

        let status_line = body
            .lines()
            .map(str::trim)
            .find(|l| l.get(..4).is_some_and(|p| p.eq_ignore_ascii_case("SIP/")));

        let (code, reason) = match status_line {
            Some(line) => {
                let mut parts = line.splitn(3, ' ');
                parts.next()?;
                (parts.next()?, parts.next().unwrap_or(""))
            }
            None => {
                let line = lines.next()?;
                let (code, reason) = line.split_once(' ').unwrap_or((line, ""));
                (code, reason)
            }
        };

        let status = code.trim().parse::<u16>().ok()?;
        if !(100..700).contains(&status) {
            return None;
        }
        Some(Self {
            status,
            reason: reason.trim().to_string(),
        })
    }

    pub fn outcome(&self) -> NotifyOutcome {
        match self.status {
            100..=199 => NotifyOutcome::Progress(self.status),
            200..=299 => NotifyOutcome::Success(self.status),
            code => NotifyOutcome::Failure(code, TransferFailure::from_status(code)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_standard_lines() {
        let frag = SipFrag::parse("SIP/2.0 100 Trying\r\n").unwrap();
        assert_eq!(frag.status, 100);
        assert_eq!(frag.reason, "Trying");
        assert_eq!(frag.outcome(), NotifyOutcome::Progress(100));

        let frag = SipFrag::parse("SIP/2.0 200 OK").unwrap();
        assert_eq!(frag.outcome(), NotifyOutcome::Success(200));
    }

    #[test]
    fn test_failure_reasons() {
        let cases = [
            ("SIP/2.0 503 Service Unavailable", TransferFailure::Unavailable),
            ("SIP/2.0 486 Busy Here", TransferFailure::Busy),
            ("SIP/2.0 404 Not Found", TransferFailure::NotFound),
            ("SIP/2.0 487 Request Terminated", TransferFailure::Cancelled),
            ("SIP/2.0 603 Decline", TransferFailure::Rejected),
        ];
        for (body, reason) in cases {
            let frag = SipFrag::parse(body).unwrap();
            assert_eq!(frag.outcome(), NotifyOutcome::Failure(frag.status, reason), "{}", body);
        }
    }

    #[test]
    fn test_status_line_after_headers() {
        let body = "Content-Type: message/sipfrag\r\n\r\nsip/2.0 180 Ringing\r\n";
        assert_eq!(SipFrag::parse(body).unwrap().status, 180);
    }

    #[test]
    fn test_bare_status() {
        assert_eq!(SipFrag::parse("200 OK").unwrap().status, 200);
    }

    #[test]
    fn test_garbage_is_ignored() {
        assert!(SipFrag::parse("").is_none());
        assert!(SipFrag::parse("hello world").is_none());
        assert!(SipFrag::parse("SIP/2.0 abc").is_none());
        assert!(SipFrag::parse("SIP/2.0 999 Nope").is_none());
    }
}

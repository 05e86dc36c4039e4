//! Endpoint and softphone configuration
//!
//! Two layers, mirroring how a deployment hands them over:
//!
//! - **EndpointConfig** - who we are and where the registrar is. Delivered by
//!   the directory service at login (usually as JSON) and kept as the "last
//!   config" so reconnection never has to re-prompt.
//! - **PhoneConfig** - timers, codec preferences and the nested
//!   [`ResilienceConfig`]. Defaults are what production uses; tests shrink them.
//!
//! ```rust
//! use rvoip_softphone_core::config::{EndpointConfig, PhoneConfig};
//! use std::time::Duration;
//!
//! let endpoint = EndpointConfig::new("1001", "pbx.example.com", "s3cret")
//!     .with_expires(300);
//! assert!(endpoint.validate().is_ok());
//! assert_eq!(endpoint.aor(), "sip:1001@pbx.example.com");
//!
//! let phone = PhoneConfig::default()
//!     .with_transfer_timeout(Duration::from_secs(10));
//! assert_eq!(phone.connect_timeout, Duration::from_secs(15));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{PhoneError, PhoneResult};

/// Lowest registration expiry we ever request
pub const MIN_REGISTER_EXPIRES: u32 = 60;
/// Highest registration expiry we ever request
pub const MAX_REGISTER_EXPIRES: u32 = 3600;
/// Port used for the derived WebSocket signaling URI
pub const DEFAULT_WSS_PORT: u16 = 8089;

/// A STUN/TURN server passed through to the media stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Identity and registrar settings for one endpoint
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    pub extension: String,
    pub registrar_host: String,
    pub credential_secret: String,
    #[serde(default, rename = "signalingURIs")]
    pub signaling_uris: Vec<String>,
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(default = "default_expires")]
    pub register_expires_seconds: u32,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Stable device instance for `+sip.instance`; a fresh one is used when absent
    #[serde(default)]
    pub instance_id: Option<Uuid>,
}

fn default_expires() -> u32 {
    300
}

// The secret never reaches logs.
impl std::fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("extension", &self.extension)
            .field("registrar_host", &self.registrar_host)
            .field("credential_secret", &"<redacted>")
            .field("signaling_uris", &self.signaling_uris)
            .field("ice_servers", &self.ice_servers.len())
            .field("register_expires_seconds", &self.register_expires_seconds)
            .field("display_name", &self.display_name)
            .finish()
    }
}

impl EndpointConfig {
    pub fn new(
        extension: impl Into<String>,
        registrar_host: impl Into<String>,
        credential_secret: impl Into<String>,
    ) -> Self {
        Self {
            extension: extension.into(),
            registrar_host: registrar_host.into(),
            credential_secret: credential_secret.into(),
            signaling_uris: Vec::new(),
            ice_servers: Vec::new(),
            register_expires_seconds: default_expires(),
            display_name: None,
            user_agent: None,
            instance_id: None,
        }
    }

    /// Parse the JSON document a directory service returns
    pub fn from_json(json: &str) -> PhoneResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| PhoneError::invalid_configuration("endpoint", e.to_string()))
    }

    pub fn with_expires(mut self, seconds: u32) -> Self {
        self.register_expires_seconds = seconds;
        self
    }

    pub fn with_signaling_uri(mut self, uri: impl Into<String>) -> Self {
        self.signaling_uris.push(uri.into());
        self
    }

    pub fn with_ice_server(mut self, server: IceServer) -> Self {
        self.ice_servers.push(server);
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_instance_id(mut self, id: Uuid) -> Self {
        self.instance_id = Some(id);
        self
    }

    /// Check the fields registration cannot do without
    pub fn validate(&self) -> PhoneResult<()> {
        if self.registrar_host.trim().is_empty() {
            return Err(PhoneError::missing_configuration("registrar_host"));
        }
        if self.extension.trim().is_empty() {
            return Err(PhoneError::missing_configuration("extension"));
        }
        if self.credential_secret.is_empty() {
            return Err(PhoneError::missing_configuration("credential_secret"));
        }
        if self.registrar_host.contains(char::is_whitespace) {
            return Err(PhoneError::invalid_configuration(
                "registrar_host",
                "must not contain whitespace",
            ));
        }
        Ok(())
    }

    /// Address of record, `sip:<extension>@<registrar>`
    pub fn aor(&self) -> String {
        format!("sip:{}@{}", self.extension, self.registrar_host)
    }

    /// Expiry clamped into the range the registrar is asked for
    pub fn clamped_expires(&self) -> u32 {
        self.register_expires_seconds
            .clamp(MIN_REGISTER_EXPIRES, MAX_REGISTER_EXPIRES)
    }

    /// The transport URI: the first configured one, otherwise `wss://<registrar>:8089/ws`
    pub fn signaling_uri(&self) -> PhoneResult<Url> {
        let raw = match self.signaling_uris.iter().find(|u| !u.trim().is_empty()) {
            Some(uri) => uri.trim().to_string(),
            None => format!("wss://{}:{}/ws", self.registrar_host, DEFAULT_WSS_PORT),
        };

        let url = Url::parse(&raw)
            .map_err(|e| PhoneError::invalid_configuration("signaling_uris", format!("{}: {}", raw, e)))?;
        match url.scheme() {
            "ws" | "wss" | "sip" | "sips" | "tcp" | "udp" | "tls" => Ok(url),
            other => Err(PhoneError::invalid_configuration(
                "signaling_uris",
                format!("unsupported scheme '{}'", other),
            )),
        }
    }
}

/// Reconnection, health-check and heartbeat tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Delay before the first reconnection attempt
    pub base_delay: Duration,
    /// Multiplier applied per failed attempt
    pub backoff_multiplier: f64,
    /// Upper bound on a single delay
    pub max_delay: Duration,
    /// Attempts before giving up
    pub max_attempts: u32,
    /// Period of channel health checks
    pub health_check_interval: Duration,
    /// Period of transport keep-alives
    pub heartbeat_interval: Duration,
    /// Consecutive failed health checks that count as a disconnect
    pub health_failure_threshold: u32,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 15,
            health_check_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(25),
            health_failure_threshold: 3,
        }
    }
}

impl ResilienceConfig {
    /// Short timers for tests and local development
    pub fn quick() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            max_attempts: 5,
            health_check_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(1),
            ..Self::default()
        }
    }
}

/// Softphone timers and preferences
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoneConfig {
    /// Bound on opening the transport and on the registrar's answer
    pub connect_timeout: Duration,
    /// Rolling window in which `safe_register` sends at most one REGISTER
    pub register_throttle: Duration,
    /// How long before expiry the safety re-register fires
    pub refresh_margin: Duration,
    /// Retry period for a safety re-register that was held off by a call
    pub refresh_retry: Duration,
    /// Pause between teardown and connect in `reconnect`
    pub reconnect_settle: Duration,
    /// Pause between Established and binding remote audio
    pub media_settle: Duration,
    /// A BYE this soon after Established is flagged as a media negotiation failure
    pub early_bye_window: Duration,
    /// Overall bound on a transfer waiting for its NOTIFY
    pub transfer_timeout: Duration,
    /// Optional bound on `answer_call` waiting for Established
    pub answer_timeout: Option<Duration>,
    /// Period of signal level sampling
    pub level_sample_interval: Duration,
    /// Consecutive silent samples before a "no audio signal" warning
    pub silent_sample_threshold: u32,
    /// Codecs moved to the front of outbound offers, in order
    pub preferred_codecs: Vec<String>,
    /// Status used when declining an incoming call
    pub reject_status: u16,
    /// Capacity of each event channel
    pub event_capacity: usize,
    pub resilience: ResilienceConfig,
}

impl Default for PhoneConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            register_throttle: Duration::from_secs(3),
            refresh_margin: Duration::from_secs(45),
            refresh_retry: Duration::from_secs(30),
            reconnect_settle: Duration::from_millis(500),
            media_settle: Duration::from_millis(300),
            early_bye_window: Duration::from_millis(2000),
            transfer_timeout: Duration::from_secs(30),
            answer_timeout: None,
            level_sample_interval: Duration::from_secs(1),
            silent_sample_threshold: 5,
            preferred_codecs: vec!["opus".to_string(), "PCMU".to_string(), "PCMA".to_string()],
            reject_status: 486,
            event_capacity: 256,
            resilience: ResilienceConfig::default(),
        }
    }
}

impl PhoneConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    pub fn with_answer_timeout(mut self, timeout: Duration) -> Self {
        self.answer_timeout = Some(timeout);
        self
    }

    pub fn with_preferred_codecs(mut self, codecs: Vec<String>) -> Self {
        self.preferred_codecs = codecs;
        self
    }

    pub fn with_resilience(mut self, resilience: ResilienceConfig) -> Self {
        self.resilience = resilience;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_missing_fields() {
        let err = EndpointConfig::new("", "pbx.example.com", "s3cret").validate().unwrap_err();
        assert!(matches!(err, PhoneError::MissingConfiguration { ref field } if field == "extension"));

        let err = EndpointConfig::new("1001", " ", "s3cret").validate().unwrap_err();
        assert!(matches!(err, PhoneError::MissingConfiguration { ref field } if field == "registrar_host"));

        let err = EndpointConfig::new("1001", "pbx.example.com", "").validate().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_expires_clamped() {
        let config = EndpointConfig::new("1001", "pbx.example.com", "s3cret");
        assert_eq!(config.clone().with_expires(10).clamped_expires(), 60);
        assert_eq!(config.clone().with_expires(300).clamped_expires(), 300);
        assert_eq!(config.with_expires(86_400).clamped_expires(), 3600);
    }

    #[test]
    fn test_signaling_uri_default_and_explicit() {
        let config = EndpointConfig::new("1001", "pbx.example.com", "s3cret");
        assert_eq!(config.signaling_uri().unwrap().as_str(), "wss://pbx.example.com:8089/ws");

        let config = config.with_signaling_uri("wss://edge.example.com/sip");
        assert_eq!(config.signaling_uri().unwrap().host_str(), Some("edge.example.com"));

        let bad = EndpointConfig::new("1001", "pbx.example.com", "s3cret")
            .with_signaling_uri("http://pbx.example.com");
        assert!(bad.signaling_uri().is_err());
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "extension": "1001",
            "registrarHost": "pbx.example.com",
            "credentialSecret": "s3cret",
            "iceServers": [{"urls": ["stun:stun.example.com:3478"]}],
            "registerExpiresSeconds": 600
        }"#;
        let config = EndpointConfig::from_json(json).unwrap();
        assert_eq!(config.extension, "1001");
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.register_expires_seconds, 600);
        assert!(config.signaling_uris.is_empty());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = EndpointConfig::new("1001", "pbx.example.com", "s3cret");
        assert!(!format!("{:?}", config).contains("s3cret"));
    }
}

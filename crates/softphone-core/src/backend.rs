//! Backend services the softphone consumes
//!
//! Both are optional collaborators: the directory hands out endpoint
//! configuration at login and lists transfer targets; the call monitor is
//! told about established calls on a best-effort basis and its failures are
//! ignored.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::call::CallDirection;
use crate::config::EndpointConfig;

/// A destination offered in transfer pickers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTarget {
    pub extension: String,
    pub display_name: Option<String>,
    /// Whether the directory believes the target can take a call now
    #[serde(default)]
    pub available: bool,
}

/// Call registration sent to the monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub call_id: String,
    pub extension: String,
    pub remote_number: String,
    pub direction: CallDirection,
    pub timestamp: DateTime<Utc>,
}

/// Directory service
#[async_trait]
pub trait Directory: Send + Sync {
    /// Endpoint configuration for the logged-in user
    async fn endpoint_config(&self) -> anyhow::Result<EndpointConfig>;

    /// Targets for transfer pickers
    async fn available_targets(&self) -> anyhow::Result<Vec<TransferTarget>>;
}

/// Backend call monitor
#[async_trait]
pub trait CallMonitor: Send + Sync {
    async fn register_call(&self, record: CallRecord) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_record_wire_shape() {
        let record = CallRecord {
            call_id: "abc@host".into(),
            extension: "1001".into(),
            remote_number: "1002".into(),
            direction: CallDirection::Outgoing,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["callId"], "abc@host");
        assert_eq!(json["remoteNumber"], "1002");
        assert_eq!(json["direction"], "outgoing");
    }
}

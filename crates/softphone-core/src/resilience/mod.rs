//! Connection resilience
//!
//! Watches every logical channel of one softphone (signaling transport,
//! registration, an optional auxiliary real-time channel), schedules
//! reconnection with exponential backoff when one drops, and runs periodic
//! health checks and heartbeats.
//!
//! Login and logout sequences change the session lifecycle on purpose. While
//! the [`LifecyclePhase`] published on the shared `watch` channel is
//! `Authenticating` or `LoggingOut`, nothing is scheduled and due attempts
//! are skipped.

pub mod backoff;
pub mod manager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use backoff::{BackoffPolicy, ReconnectState};
pub use manager::{ChannelDriver, ConnectionResilience};

/// Where the application is in its login/logout lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecyclePhase {
    /// Logged out
    Idle,
    /// Login sequence running
    Authenticating,
    /// Logged in
    Active,
    /// Logout sequence running
    LoggingOut,
}

impl LifecyclePhase {
    /// Reconnection, health checks and heartbeats are suppressed in this phase
    pub fn suppresses_reconnect(&self) -> bool {
        matches!(self, LifecyclePhase::Authenticating | LifecyclePhase::LoggingOut)
    }
}

/// A logical connection the resilience manager watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Signaling,
    Registration,
    Auxiliary,
}

impl Channel {
    /// The channel whose driver brings this one back
    pub fn driver_channel(&self) -> Channel {
        match self {
            Channel::Registration => Channel::Signaling,
            other => *other,
        }
    }
}

/// Health as seen by checks and heartbeats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Unhealthy,
    Unknown,
}

/// State of one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub connected: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub health: Health,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            connected: false,
            last_seen: None,
            health: Health::Unknown,
        }
    }
}

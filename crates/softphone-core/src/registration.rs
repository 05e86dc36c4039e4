//! Registration state and REGISTER construction
//!
//! The actual connect/register/disconnect operations live on
//! [`Softphone`](crate::Softphone) (see `phone/registration.rs`). This module
//! holds what they share:
//!
//! - **RegistrationState** - driven only by registrar responses
//! - **RegistrationInfo** - snapshot for the application
//! - **RegisterThrottle** - at most one REGISTER per rolling window
//! - **build_register_request** - single-contact REGISTER with `reg-id=1`
//!   and a `+sip.instance`
//!
//! # Safety refresh
//!
//! The underlying stack refreshes registrations on its own, but the softphone
//! also schedules a re-register `refresh_margin` before expiry so a missed
//! stack refresh cannot silently drop us. See [`refresh_delay`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::EndpointConfig;
use crate::stack::{ContactPolicy, RegisterRequest};

/// `reg-id` used for the single outbound flow
pub const REG_ID: u32 = 1;

/// Registration with the registrar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationState {
    /// No binding
    Unregistered,
    /// REGISTER sent, no final answer yet
    Registering,
    /// Binding accepted
    Registered,
    /// The stack disposed of its registerer
    Terminated,
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationState::Unregistered => write!(f, "Unregistered"),
            RegistrationState::Registering => write!(f, "Registering"),
            RegistrationState::Registered => write!(f, "Registered"),
            RegistrationState::Terminated => write!(f, "Terminated"),
        }
    }
}

/// Snapshot of the registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationInfo {
    pub state: RegistrationState,
    pub aor: Option<String>,
    pub expires: Option<u32>,
    pub registered_at: Option<DateTime<Utc>>,
    pub transport_connected: bool,
}

/// Rolling-window throttle for REGISTER
#[derive(Debug)]
pub struct RegisterThrottle {
    window: Duration,
    last: Option<Instant>,
}

impl RegisterThrottle {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Claim the window; false if a REGISTER went out less than `window` ago
    pub fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last {
            if now.duration_since(last) < self.window {
                return false;
            }
        }
        self.last = Some(now);
        true
    }

    /// Record a REGISTER that bypassed the throttle
    pub fn record(&mut self) {
        self.last = Some(Instant::now());
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Time until the safety re-register: `expires - margin`, never below one second
pub fn refresh_delay(expires: u32, margin: Duration) -> Duration {
    Duration::from_secs(u64::from(expires))
        .saturating_sub(margin)
        .max(Duration::from_secs(1))
}

/// Build the REGISTER for `config`
pub fn build_register_request(config: &EndpointConfig, fallback_instance: Uuid) -> RegisterRequest {
    let instance = config.instance_id.unwrap_or(fallback_instance);
    RegisterRequest {
        aor: config.aor(),
        registrar: format!("sip:{}", config.registrar_host),
        username: config.extension.clone(),
        secret: config.credential_secret.clone(),
        expires: config.clamped_expires(),
        contact: ContactPolicy {
            max_contacts: 1,
            remove_existing: true,
            reg_id: REG_ID,
            instance: format!("<urn:uuid:{}>", instance),
        },
        user_agent: config.user_agent.clone(),
    }
}

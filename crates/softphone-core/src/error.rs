//! Error types for the softphone core
//!
//! Every public operation returns [`PhoneResult`]. Errors are grouped into the
//! categories the surrounding application cares about: configuration problems
//! are fatal, transport and registration problems are connectivity state, and
//! call or transfer problems are per-call notices that never touch the
//! registration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::call::{CallId, CallState};

/// Result type alias for softphone operations
pub type PhoneResult<T> = Result<T, PhoneError>;

/// Why a transfer attempt failed
///
/// Derived from the SIP status carried in a NOTIFY sipfrag, from the REFER
/// response itself, or from the coordinator's own timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferFailure {
    /// Target or transferee refused (REFER rejected, or a non-specific final failure)
    Rejected,
    /// No definitive NOTIFY arrived in time
    Timeout,
    /// 503 Service Unavailable
    Unavailable,
    /// 486 Busy Here
    Busy,
    /// 487 Request Terminated, or the user cancelled an attended transfer
    Cancelled,
    /// 404 Not Found
    NotFound,
}

impl TransferFailure {
    /// Map a final SIP status code to a failure reason
    pub fn from_status(code: u16) -> Self {
        match code {
            503 => Self::Unavailable,
            486 | 600 => Self::Busy,
            404 | 604 => Self::NotFound,
            487 => Self::Cancelled,
            408 => Self::Timeout,
            _ => Self::Rejected,
        }
    }

    /// Stable lowercase name used in events and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
            Self::Unavailable => "unavailable",
            Self::Busy => "busy",
            Self::Cancelled => "cancelled",
            Self::NotFound => "not_found",
        }
    }
}

impl std::fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comprehensive error type for softphone operations
#[derive(Error, Debug, Clone)]
pub enum PhoneError {
    // Configuration errors
    /// A configuration field is present but unusable
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    /// A required configuration field is missing
    #[error("Missing required configuration: {field}")]
    MissingConfiguration { field: String },

    // Transport errors
    /// The signaling transport failed or could not be opened
    #[error("Transport failed: {reason}")]
    TransportFailed { reason: String },

    /// Transport did not connect within the bounded wait
    #[error("Connection timed out after {seconds}s")]
    ConnectionTimeout { seconds: u64 },

    /// Operation needs a connected transport
    #[error("Not connected")]
    NotConnected,

    /// A connect or reconnect is already running
    #[error("Already initializing")]
    AlreadyInitializing,

    // Registration errors
    /// The registrar rejected or never answered the REGISTER
    #[error("Registration failed: {reason}")]
    RegistrationFailed { status: Option<u16>, reason: String },

    /// Operation needs an active registration
    #[error("Not registered")]
    NotRegistered,

    // Call errors
    /// Outbound or inbound call setup failed
    #[error("Call setup failed: {reason}")]
    CallSetupFailed { reason: String },

    /// There is no current call to operate on
    #[error("No active call")]
    NoActiveCall,

    /// There is no pending incoming call
    #[error("No incoming call")]
    NoIncomingCall,

    /// Another call is already live
    #[error("Call already in progress: {call_id}")]
    CallInProgress { call_id: CallId },

    /// The call is not in a state that permits the operation
    #[error("Invalid call state for call {call_id}: {current_state:?}")]
    InvalidCallState { call_id: CallId, current_state: CallState },

    /// The call ended while the operation was waiting on it
    #[error("Call terminated: {reason}")]
    CallTerminated { reason: String },

    /// Placing the call on hold failed; the call is still up
    #[error("Hold failed: {reason}")]
    HoldFailed { reason: String },

    /// Resuming the call failed; the call is still up
    #[error("Unhold failed: {reason}")]
    UnholdFailed { reason: String },

    // Transfer errors
    /// The transfer attempt failed
    #[error("Transfer failed ({reason}): {detail}")]
    TransferFailed { reason: TransferFailure, detail: String },

    /// A transfer is already in flight for this call
    #[error("Transfer already in progress")]
    TransferInProgress,

    /// The transfer is not in a state that permits the operation
    #[error("Invalid transfer state: {state}")]
    InvalidTransferState { state: String },

    // Media / SDP
    /// A session description could not be parsed
    #[error("Malformed SDP: {reason}")]
    MalformedSdp { reason: String },

    // Collaborators
    /// A backend service (directory, monitor) failed
    #[error("Backend {service} failed: {reason}")]
    BackendFailed { service: String, reason: String },

    /// Operation timed out
    #[error("Operation timed out after {duration_ms}ms")]
    OperationTimeout { duration_ms: u64 },

    /// Internal error
    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl PhoneError {
    /// Create an invalid configuration error
    pub fn invalid_configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a missing configuration error
    pub fn missing_configuration(field: impl Into<String>) -> Self {
        Self::MissingConfiguration { field: field.into() }
    }

    /// Create a transport error
    pub fn transport_failed(reason: impl Into<String>) -> Self {
        Self::TransportFailed { reason: reason.into() }
    }

    /// Create a registration error
    pub fn registration_failed(status: Option<u16>, reason: impl Into<String>) -> Self {
        Self::RegistrationFailed {
            status,
            reason: reason.into(),
        }
    }

    /// Create a call setup error
    pub fn call_setup_failed(reason: impl Into<String>) -> Self {
        Self::CallSetupFailed { reason: reason.into() }
    }

    /// Create a transfer error
    pub fn transfer_failed(reason: TransferFailure, detail: impl Into<String>) -> Self {
        Self::TransferFailed {
            reason,
            detail: detail.into(),
        }
    }

    /// Create an internal error
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Configuration errors are fatal and never retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PhoneError::InvalidConfiguration { .. } | PhoneError::MissingConfiguration { .. }
        )
    }

    /// Check if this error is recoverable by retrying later
    pub fn is_recoverable(&self) -> bool {
        match self {
            PhoneError::TransportFailed { .. }
            | PhoneError::ConnectionTimeout { .. }
            | PhoneError::NotConnected
            | PhoneError::RegistrationFailed { .. }
            | PhoneError::OperationTimeout { .. }
            | PhoneError::BackendFailed { .. } => true,

            PhoneError::InvalidConfiguration { .. }
            | PhoneError::MissingConfiguration { .. }
            | PhoneError::InternalError { .. } => false,

            _ => false,
        }
    }

    /// Check if this error only affects a single call
    pub fn is_call_error(&self) -> bool {
        matches!(
            self,
            PhoneError::CallSetupFailed { .. }
                | PhoneError::NoActiveCall
                | PhoneError::NoIncomingCall
                | PhoneError::CallInProgress { .. }
                | PhoneError::InvalidCallState { .. }
                | PhoneError::CallTerminated { .. }
                | PhoneError::HoldFailed { .. }
                | PhoneError::UnholdFailed { .. }
        )
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            PhoneError::InvalidConfiguration { .. } | PhoneError::MissingConfiguration { .. } => {
                "configuration"
            }
            PhoneError::TransportFailed { .. }
            | PhoneError::ConnectionTimeout { .. }
            | PhoneError::NotConnected
            | PhoneError::AlreadyInitializing => "transport",
            PhoneError::RegistrationFailed { .. } | PhoneError::NotRegistered => "registration",
            PhoneError::HoldFailed { .. } | PhoneError::UnholdFailed { .. } => "hold",
            PhoneError::TransferFailed { .. }
            | PhoneError::TransferInProgress
            | PhoneError::InvalidTransferState { .. } => "transfer",
            PhoneError::MalformedSdp { .. } => "media",
            PhoneError::BackendFailed { .. } => "backend",
            PhoneError::OperationTimeout { .. } | PhoneError::InternalError { .. } => "system",
            _ => "call",
        }
    }
}

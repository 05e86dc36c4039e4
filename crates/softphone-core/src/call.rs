//! Call session types
//!
//! A [`CallSession`] is owned by the call controller inside
//! [`Softphone`](crate::Softphone); the rest of the crate and the application
//! only ever see [`CallInfo`] snapshots.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::stack::{DialogHandle, DialogId};

/// Unique identifier for a call
pub type CallId = Uuid;

/// Current state of a call
///
/// `Initial → Establishing → Established → Terminating → Terminated`. Hold is
/// tracked separately on the session because it is orthogonal to the
/// signaling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// Created; outbound INVITE not sent yet or inbound INVITE not answered
    Initial,
    /// INVITE sent or accepted, waiting for the dialog to confirm
    Establishing,
    /// Dialog confirmed, media flowing
    Established,
    /// BYE/CANCEL sent, waiting for the stack to finish
    Terminating,
    /// Finished
    Terminated,
}

impl CallState {
    /// Establishing or Established; registration refreshes are held off in these states
    pub fn is_live(&self) -> bool {
        matches!(self, CallState::Establishing | CallState::Established)
    }

    /// Check if the call is in a terminated state
    pub fn is_terminated(&self) -> bool {
        matches!(self, CallState::Terminating | CallState::Terminated)
    }
}

/// Direction of a call (from the endpoint's perspective)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    /// We placed the call
    Outgoing,
    /// The call came in
    Incoming,
}

impl std::fmt::Display for CallDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallDirection::Outgoing => write!(f, "outgoing"),
            CallDirection::Incoming => write!(f, "incoming"),
        }
    }
}

/// Which slot a session occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionRole {
    /// The user's call (current or incoming)
    Primary,
    /// Leg to the transfer target during an attended transfer
    Consultation,
}

/// How a call was put on hold, so unhold can reverse the same mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldMethod {
    /// The dialog's own hold primitive
    Native,
    /// re-INVITE with the audio direction rewritten
    Renegotiation,
    /// Outbound audio sender disabled, no signaling
    LocalOnly,
}

/// Why a call ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndCause {
    /// We hung up
    LocalHangup,
    /// The remote party sent BYE
    RemoteHangup,
    /// We declined an incoming call
    Rejected,
    /// The call was cancelled before it was answered
    Cancelled,
    /// The remote side answered the INVITE with a final failure
    Failed { status: u16 },
    /// The call left us through a completed transfer
    TransferCompleted,
    /// The consultation leg was replaced during an attended transfer
    Replaced,
    /// The stack reported an error on the dialog
    Error { reason: String },
    /// Torn down together with the connection
    Disconnected,
}

impl std::fmt::Display for EndCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndCause::LocalHangup => write!(f, "local_hangup"),
            EndCause::RemoteHangup => write!(f, "remote_hangup"),
            EndCause::Rejected => write!(f, "rejected"),
            EndCause::Cancelled => write!(f, "cancelled"),
            EndCause::Failed { status } => write!(f, "failed_{}", status),
            EndCause::TransferCompleted => write!(f, "transfer_completed"),
            EndCause::Replaced => write!(f, "replaced"),
            EndCause::Error { .. } => write!(f, "error"),
            EndCause::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Options for an outbound call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallOptions {
    /// Display name to present in From, overriding the endpoint's
    pub display_name: Option<String>,
    /// Extra SIP headers passed through to the stack
    pub extra_headers: Vec<(String, String)>,
}

impl CallOptions {
    /// Add a pass-through header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    /// Set the display name
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// Turn a dialed number into a request target
///
/// SIP, SIPS and tel URIs pass through; `user@host` gets a `sip:` scheme;
/// anything else is taken as a user part at `domain`.
pub fn normalize_target(target: &str, domain: &str) -> String {
    let target = target.trim();
    let lower = target.to_ascii_lowercase();
    if lower.starts_with("sip:") || lower.starts_with("sips:") || lower.starts_with("tel:") {
        target.to_string()
    } else if target.contains('@') {
        format!("sip:{}", target)
    } else {
        format!("sip:{}@{}", target, domain)
    }
}

/// Live session record held by the controller
#[derive(Debug, Clone)]
pub(crate) struct CallSession {
    pub id: CallId,
    pub handle: DialogHandle,
    pub direction: CallDirection,
    pub role: SessionRole,
    pub state: CallState,
    pub remote_identity: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub established_at: Option<DateTime<Utc>>,
    pub established_instant: Option<Instant>,
    pub is_on_hold: bool,
    pub hold_method: Option<HoldMethod>,
    pub dialog_id: Option<DialogId>,
    pub transferred: bool,
    /// Serializes answer/hold/unhold/transfer on this dialog
    pub op_guard: Arc<tokio::sync::Mutex<()>>,
}

impl CallSession {
    pub fn new(
        handle: DialogHandle,
        direction: CallDirection,
        role: SessionRole,
        remote_identity: impl Into<String>,
        display_name: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            handle,
            direction,
            role,
            state: CallState::Initial,
            remote_identity: remote_identity.into(),
            display_name,
            created_at: Utc::now(),
            established_at: None,
            established_instant: None,
            is_on_hold: false,
            hold_method: None,
            dialog_id: None,
            transferred: false,
            op_guard: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn mark_established(&mut self, dialog: DialogId) {
        self.state = CallState::Established;
        self.established_at = Some(Utc::now());
        self.established_instant = Some(Instant::now());
        self.dialog_id = Some(dialog);
    }

    pub fn was_established(&self) -> bool {
        self.established_at.is_some()
    }

    pub fn info(&self) -> CallInfo {
        CallInfo {
            call_id: self.id,
            direction: self.direction,
            role: self.role,
            state: self.state,
            remote_identity: self.remote_identity.clone(),
            display_name: self.display_name.clone(),
            created_at: self.created_at,
            established_at: self.established_at,
            is_on_hold: self.is_on_hold,
            sip_call_id: self.dialog_id.as_ref().map(|d| d.call_id.clone()),
        }
    }
}

/// Snapshot of a call for the application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallInfo {
    pub call_id: CallId,
    pub direction: CallDirection,
    pub role: SessionRole,
    pub state: CallState,
    pub remote_identity: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub established_at: Option<DateTime<Utc>>,
    pub is_on_hold: bool,
    /// SIP Call-ID once the dialog is confirmed
    pub sip_call_id: Option<String>,
}

/// The three session slots
#[derive(Debug, Default)]
pub(crate) struct CallTable {
    pub current: Option<CallSession>,
    pub incoming: Option<CallSession>,
    pub consultation: Option<CallSession>,
}

impl CallTable {
    pub fn find(&self, handle: &DialogHandle) -> Option<&CallSession> {
        [&self.current, &self.incoming, &self.consultation]
            .into_iter()
            .flatten()
            .find(|s| &s.handle == handle)
    }

    pub fn find_mut(&mut self, handle: &DialogHandle) -> Option<&mut CallSession> {
        [&mut self.current, &mut self.incoming, &mut self.consultation]
            .into_iter()
            .flatten()
            .find(|s| &s.handle == handle)
    }

    /// Remove the session from whichever slot holds it
    pub fn remove(&mut self, handle: &DialogHandle) -> Option<CallSession> {
        for slot in [&mut self.current, &mut self.incoming, &mut self.consultation] {
            if slot.as_ref().is_some_and(|s| &s.handle == handle) {
                return slot.take();
            }
        }
        None
    }

    /// A call that blocks registration refreshes and new calls
    ///
    /// A ringing incoming call does not count; one being answered does.
    pub fn live_call(&self) -> Option<&CallSession> {
        [&self.current, &self.consultation, &self.incoming]
            .into_iter()
            .flatten()
            .find(|s| s.state.is_live())
    }
}

//! Transfer types
//!
//! The coordinator itself lives on [`Softphone`](crate::Softphone) (see
//! `phone/transfer.rs`); this module holds the context it owns and the
//! protocol helpers for NOTIFY bodies and Refer-To URIs.
//!
//! ```text
//! blind:    Idle -> Transferring -> Accepted -> Completed
//!                               \-> Failed
//! attended: Idle -> Consulting -> Completed | Failed
//!                             \-> Idle (cancelled)
//! ```

pub mod replaces;
pub mod sipfrag;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::call::CallId;
use crate::stack::DialogHandle;

pub use replaces::refer_to_with_replaces;
pub use sipfrag::{NotifyOutcome, SipFrag};

/// Blind or attended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    Blind,
    Attended,
}

/// Where a transfer attempt stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Idle,
    Transferring,
    Accepted,
    Consulting,
    Completed,
    Failed,
}

impl TransferState {
    /// An attempt is running and a new one must be refused
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TransferState::Transferring | TransferState::Accepted | TransferState::Consulting
        )
    }

    /// Remote BYE on the original leg in these states belongs to the transfer
    pub fn defers_termination(&self) -> bool {
        matches!(self, TransferState::Transferring | TransferState::Accepted)
    }
}

/// The running (or last finished) transfer of the current call
#[derive(Debug)]
pub(crate) struct TransferContext {
    pub mode: TransferMode,
    pub target: String,
    pub state: TransferState,
    pub original_call: CallId,
    pub original_handle: DialogHandle,
    pub consultation_call: Option<CallId>,
    pub consultation_handle: Option<DialogHandle>,
    /// We put the original on hold for the consultation and must undo it on failure
    pub held_original: bool,
    /// The original leg ended while the transfer was resolving
    pub original_ended: bool,
    pub started_at: DateTime<Utc>,
    pub timeout_task: Option<JoinHandle<()>>,
}

impl TransferContext {
    pub fn new(mode: TransferMode, target: String, original_call: CallId, original_handle: DialogHandle) -> Self {
        Self {
            mode,
            target,
            state: TransferState::Idle,
            original_call,
            original_handle,
            consultation_call: None,
            consultation_handle: None,
            held_original: false,
            original_ended: false,
            started_at: Utc::now(),
            timeout_task: None,
        }
    }

    pub fn cancel_timeout(&mut self) {
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
    }
}

impl Drop for TransferContext {
    fn drop(&mut self) {
        self.cancel_timeout();
    }
}

//! Typed event channels
//!
//! Each event kind has its own broadcast channel with its own payload enum:
//! registration, calls, transfers, connection state and media warnings.
//! Subscribers see events of one kind in the order they were emitted; there
//! is no ordering across kinds.
//!
//! ```rust
//! use rvoip_softphone_core::events::{EventBus, RegistrationEvent};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let bus = EventBus::new(16);
//! let mut rx = bus.registration.subscribe();
//! bus.registration.emit(RegistrationEvent::Registering);
//! assert!(matches!(rx.recv().await, Ok(RegistrationEvent::Registering)));
//! # }
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::call::{CallDirection, CallId, EndCause, HoldMethod};
use crate::error::TransferFailure;
use crate::resilience::{Channel, Health};
use crate::transfer::{TransferMode, TransferState};

/// Registration lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegistrationEvent {
    /// REGISTER sent
    Registering,
    /// Registrar accepted us
    Registered {
        aor: String,
        expires: u32,
        at: DateTime<Utc>,
    },
    /// Binding removed
    Unregistered,
    /// Registrar rejected the REGISTER or never answered
    Failed { status: Option<u16>, reason: String },
    /// Stack disposed of the registration
    Terminated,
}

/// Call lifecycle (`call:*`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallEvent {
    /// New inbound call waiting for answer/reject
    Incoming {
        call_id: CallId,
        remote_identity: String,
        display_name: Option<String>,
    },
    /// 1xx on an outbound call
    Progress { call_id: CallId, status: u16 },
    /// Dialog confirmed
    Established {
        call_id: CallId,
        remote_identity: String,
        direction: CallDirection,
    },
    /// `answer_call` completed
    Answered { call_id: CallId },
    /// Call setup failed with a SIP status
    Failed {
        call_id: CallId,
        status: Option<u16>,
        reason: String,
    },
    /// The single terminal event of a call
    Ended {
        call_id: CallId,
        cause: EndCause,
        /// The call never reached Established
        abandoned: bool,
        /// BYE arrived right after Established
        media_negotiation_suspected: bool,
    },
    Held { call_id: CallId, method: HoldMethod },
    Unheld { call_id: CallId, method: HoldMethod },
    HoldFailed { call_id: CallId, reason: String },
    UnholdFailed { call_id: CallId, reason: String },
}

impl CallEvent {
    /// The call this event is about
    pub fn call_id(&self) -> CallId {
        match self {
            CallEvent::Incoming { call_id, .. }
            | CallEvent::Progress { call_id, .. }
            | CallEvent::Established { call_id, .. }
            | CallEvent::Answered { call_id }
            | CallEvent::Failed { call_id, .. }
            | CallEvent::Ended { call_id, .. }
            | CallEvent::Held { call_id, .. }
            | CallEvent::Unheld { call_id, .. }
            | CallEvent::HoldFailed { call_id, .. }
            | CallEvent::UnholdFailed { call_id, .. } => *call_id,
        }
    }
}

/// Transfer progress (`transfer:*`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransferEvent {
    Initiated {
        call_id: CallId,
        target: String,
        mode: TransferMode,
    },
    /// Provisional sipfrag status
    Progress { call_id: CallId, status: u16 },
    /// REFER accepted, or a 2xx sipfrag before completion
    Accepted { call_id: CallId },
    Completed { call_id: CallId },
    Failed {
        call_id: CallId,
        reason: TransferFailure,
        status: Option<u16>,
    },
    ConsultationStarted {
        call_id: CallId,
        consultation_id: CallId,
    },
    ConsultationEstablished {
        call_id: CallId,
        consultation_id: CallId,
    },
    /// Attended transfer abandoned by the user
    Cancelled { call_id: CallId },
    StateChanged {
        call_id: CallId,
        from: TransferState,
        to: TransferState,
    },
}

/// Connection state per channel (`connection:*`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    StateChanged {
        channel: Channel,
        connected: bool,
        health: Health,
    },
    ReconnectScheduled { attempt: u32, delay: Duration },
    Reconnected { attempts: u32 },
    /// Emitted once when backoff gives up
    MaxAttemptsReached { attempts: u32 },
}

/// Non-fatal media observations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MediaEvent {
    RemoteAudioBound { call_id: CallId },
    EarlyMediaStarted { call_id: CallId },
    /// Playback was refused by policy; `resume_audio_playback` after user interaction
    PlaybackBlocked { call_id: CallId },
    PlaybackResumed { call_id: CallId },
    NoAudioSignal { call_id: CallId, silent_for: Duration },
    Warning { call_id: Option<CallId>, message: String },
}

/// Broadcast channel for one event kind
#[derive(Debug)]
pub struct EventChannel<T: Clone> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone> Clone for EventChannel<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> EventChannel<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event; having no subscribers is fine
    pub fn emit(&self, event: T) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Subscribe as a `Stream`
    pub fn stream(&self) -> BroadcastStream<T> {
        BroadcastStream::new(self.sender.subscribe())
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// All event channels of one softphone instance
#[derive(Debug, Clone)]
pub struct EventBus {
    pub registration: EventChannel<RegistrationEvent>,
    pub calls: EventChannel<CallEvent>,
    pub transfers: EventChannel<TransferEvent>,
    pub connection: EventChannel<ConnectionEvent>,
    pub media: EventChannel<MediaEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            registration: EventChannel::new(capacity),
            calls: EventChannel::new(capacity),
            transfers: EventChannel::new(capacity),
            connection: EventChannel::new(capacity),
            media: EventChannel::new(capacity),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_channels_are_independent() {
        let bus = EventBus::new(8);
        let mut calls = bus.calls.subscribe();
        let mut transfers = bus.transfers.subscribe();

        let id = Uuid::new_v4();
        bus.transfers.emit(TransferEvent::Accepted { call_id: id });
        bus.calls.emit(CallEvent::Answered { call_id: id });

        assert_eq!(calls.recv().await.unwrap(), CallEvent::Answered { call_id: id });
        assert_eq!(transfers.recv().await.unwrap(), TransferEvent::Accepted { call_id: id });
    }

    #[tokio::test]
    async fn test_stream_preserves_order() {
        let bus = EventBus::new(8);
        let mut stream = bus.registration.stream();
        bus.registration.emit(RegistrationEvent::Registering);
        bus.registration.emit(RegistrationEvent::Unregistered);

        assert_eq!(stream.next().await.unwrap().unwrap(), RegistrationEvent::Registering);
        assert_eq!(stream.next().await.unwrap().unwrap(), RegistrationEvent::Unregistered);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.media.emit(MediaEvent::Warning { call_id: None, message: "x".into() });
        assert_eq!(bus.media.receiver_count(), 0);
    }
}

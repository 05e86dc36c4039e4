//! The softphone façade
//!
//! [`Softphone`] is the owned record of one endpoint instance: registration
//! state, the call table, the running transfer, the media binder and the
//! resilience manager all hang off it, so several instances can run side by
//! side and dropping one tears everything down with it.
//!
//! Operations are split by concern across `impl Softphone` blocks:
//!
//! - `registration.rs` - connect, disconnect, reconnect, safe_register, login/logout
//! - `calls.rs` - make/answer/reject/end, hold/unhold, centralized termination
//! - `transfer.rs` - blind and attended transfer
//!
//! Protocol outcomes from the stack arrive on an unbounded channel and are
//! handled in order by one dispatcher task.

mod builder;
mod calls;
mod registration;
mod transfer;

pub use builder::SoftphoneBuilder;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::backend::{CallMonitor, Directory};
use crate::call::{CallTable, EndCause};
use crate::config::{EndpointConfig, PhoneConfig};
use crate::error::{PhoneError, PhoneResult};
use crate::events::{CallEvent, ConnectionEvent, EventBus, MediaEvent, RegistrationEvent, TransferEvent};
use crate::media::MediaBinder;
use crate::registration::{RegisterThrottle, RegistrationState};
use crate::resilience::{Channel, ChannelDriver, ConnectionResilience, ConnectionState, LifecyclePhase};
use crate::stack::{DialogHandle, StackEvent, UserAgent};
use crate::transfer::TransferContext;

/// Registration and transport bookkeeping of one instance
pub(crate) struct RegistrationCell {
    pub state: Mutex<RegistrationState>,
    pub last_config: Mutex<Option<EndpointConfig>>,
    pub transport_connected: AtomicBool,
    /// Transport up and registered
    pub connected: AtomicBool,
    pub initializing: AtomicBool,
    pub disconnecting: AtomicBool,
    pub register_in_flight: AtomicBool,
    pub throttle: Mutex<RegisterThrottle>,
    pub expires: Mutex<Option<u32>>,
    pub registered_at: Mutex<Option<DateTime<Utc>>>,
    pub refresh_task: Mutex<Option<JoinHandle<()>>>,
    pub pending_transport: Mutex<Option<oneshot::Sender<PhoneResult<()>>>>,
    pub pending_register: Mutex<Option<oneshot::Sender<PhoneResult<u32>>>>,
}

impl RegistrationCell {
    fn new(config: &PhoneConfig) -> Self {
        Self {
            state: Mutex::new(RegistrationState::Unregistered),
            last_config: Mutex::new(None),
            transport_connected: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            initializing: AtomicBool::new(false),
            disconnecting: AtomicBool::new(false),
            register_in_flight: AtomicBool::new(false),
            throttle: Mutex::new(RegisterThrottle::new(config.register_throttle)),
            expires: Mutex::new(None),
            registered_at: Mutex::new(None),
            refresh_task: Mutex::new(None),
            pending_transport: Mutex::new(None),
            pending_register: Mutex::new(None),
        }
    }

    pub fn cancel_refresh(&self) -> bool {
        match self.refresh_task.lock().take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

/// Raised while an operation runs; lowered on drop, including when the future is cancelled
pub(crate) struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    pub fn raise(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One softphone endpoint
pub struct Softphone {
    pub(crate) config: PhoneConfig,
    pub(crate) stack: Arc<dyn UserAgent>,
    pub(crate) media: MediaBinder,
    pub(crate) events: EventBus,
    pub(crate) resilience: Arc<ConnectionResilience>,
    pub(crate) directory: Option<Arc<dyn Directory>>,
    pub(crate) monitor: Option<Arc<dyn CallMonitor>>,
    pub(crate) lifecycle: watch::Sender<LifecyclePhase>,
    pub(crate) instance_id: Uuid,
    pub(crate) reg: RegistrationCell,
    pub(crate) calls: Mutex<CallTable>,
    pub(crate) transfer: Mutex<Option<TransferContext>>,
    pub(crate) answer_waiters: Mutex<HashMap<DialogHandle, oneshot::Sender<PhoneResult<()>>>>,
    pub(crate) weak_self: Weak<Softphone>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Softphone {
    /// Start building a softphone
    pub fn builder() -> SoftphoneBuilder {
        SoftphoneBuilder::new()
    }

    pub fn config(&self) -> &PhoneConfig {
        &self.config
    }

    /// Device instance used in `+sip.instance` when the endpoint config has none
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe_registration(&self) -> broadcast::Receiver<RegistrationEvent> {
        self.events.registration.subscribe()
    }

    pub fn subscribe_calls(&self) -> broadcast::Receiver<CallEvent> {
        self.events.calls.subscribe()
    }

    pub fn subscribe_transfers(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.transfers.subscribe()
    }

    pub fn subscribe_connection(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.connection.subscribe()
    }

    pub fn subscribe_media(&self) -> broadcast::Receiver<MediaEvent> {
        self.events.media.subscribe()
    }

    pub fn resilience(&self) -> &Arc<ConnectionResilience> {
        &self.resilience
    }

    pub fn connection_state(&self, channel: Channel) -> ConnectionState {
        self.resilience.channel_state(channel)
    }

    /// Publish the login/logout phase to the resilience manager
    pub fn set_lifecycle_phase(&self, phase: LifecyclePhase) {
        let previous = self.lifecycle.send_replace(phase);
        if previous != phase {
            debug!(from = ?previous, to = ?phase, "Lifecycle phase changed");
        }
    }

    pub fn lifecycle_phase(&self) -> LifecyclePhase {
        *self.lifecycle.borrow()
    }

    /// Retry remote audio playback that was blocked until user interaction
    pub async fn resume_audio_playback(&self) -> bool {
        self.media.resume_playback().await
    }

    pub(crate) fn spawn_dispatcher(&self, mut rx: mpsc::UnboundedReceiver<StackEvent>) {
        let weak = self.weak_self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(phone) = weak.upgrade() else { break };
                phone.handle_stack_event(event).await;
            }
            trace!("Stack event dispatcher finished");
        });
        *self.dispatcher.lock() = Some(task);
    }

    async fn handle_stack_event(&self, event: StackEvent) {
        trace!(?event, "Stack event");
        match event {
            StackEvent::TransportConnected => self.on_transport_connected(),
            StackEvent::TransportDisconnected { reason } => {
                self.on_transport_lost(reason.unwrap_or_else(|| "transport closed".to_string()))
            }
            StackEvent::TransportError { reason } => self.on_transport_lost(reason),
            StackEvent::Registered { expires } => self.on_registered(expires),
            StackEvent::Unregistered => self.on_registration_lost(RegistrationState::Unregistered),
            StackEvent::RegistrationTerminated => self.on_registration_lost(RegistrationState::Terminated),
            StackEvent::RegistrationFailed { status, reason } => self.on_registration_failed(status, reason),
            StackEvent::IncomingInvite {
                handle,
                remote_identity,
                display_name,
            } => self.on_incoming_invite(handle, remote_identity, display_name).await,
            StackEvent::Provisional { handle, status, .. } => self.on_provisional(handle, status),
            StackEvent::Established { handle, dialog } => self.on_established(handle, dialog),
            StackEvent::Rejected { handle, status, reason } => self.on_rejected(handle, status, reason).await,
            StackEvent::RemoteBye { handle } => self.on_remote_bye(handle).await,
            StackEvent::RemoteCancel { handle } => {
                self.terminate_session(&handle, calls::Termination::new(EndCause::Cancelled))
                    .await
            }
            StackEvent::SessionError { handle, reason } => {
                self.terminate_session(&handle, calls::Termination::new(EndCause::Error { reason }))
                    .await
            }
            StackEvent::Notify { handle, body } => self.on_notify(handle, body).await,
            StackEvent::RemoteTrack { handle, track } => self.on_remote_track(handle, track),
        }
    }
}

impl Drop for Softphone {
    fn drop(&mut self) {
        if let Some(task) = self.dispatcher.lock().take() {
            task.abort();
        }
        self.reg.cancel_refresh();
        self.resilience.stop();
    }
}

/// Reconnects and probes the signaling channel on behalf of the resilience manager
pub(crate) struct SignalingDriver {
    pub phone: Weak<Softphone>,
}

#[async_trait]
impl ChannelDriver for SignalingDriver {
    async fn reconnect(&self) -> PhoneResult<()> {
        let phone = self
            .phone
            .upgrade()
            .ok_or_else(|| PhoneError::internal_error("softphone dropped"))?;
        if phone.is_connected() && phone.stack.is_transport_connected().await {
            return Ok(());
        }
        phone.reconnect().await
    }

    async fn health_check(&self) -> bool {
        let Some(phone) = self.phone.upgrade() else {
            return false;
        };
        phone.stack.is_transport_connected().await
    }

    async fn heartbeat(&self) -> PhoneResult<()> {
        let phone = self
            .phone
            .upgrade()
            .ok_or_else(|| PhoneError::internal_error("softphone dropped"))?;
        phone
            .stack
            .send_keepalive()
            .await
            .map_err(|e| PhoneError::transport_failed(e.to_string()))
    }
}

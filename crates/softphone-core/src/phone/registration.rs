//! Connection and registration operations for [`Softphone`]
//!
//! # Connect flow
//!
//! ```text
//! validate ──► enable resilience ──► connect transport ──► REGISTER ──► Registered
//!   │ fatal           (15s bound)           │ (same bound)      │
//!   ▼                                       ▼                   ▼
//! error, no retry              signaling channel down    safety refresh at
//!                              → resilience retries      expires - 45s
//! ```
//!
//! Only registrar responses move the [`RegistrationState`]. A REGISTER is
//! never sent while another one is in flight, more often than the throttle
//! window allows, or (for refreshes) while a call is live, since a
//! re-REGISTER mid-call can disturb media on some servers.

use std::sync::atomic::Ordering;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use url::Url;

use super::{FlagGuard, Softphone};
use crate::config::EndpointConfig;
use crate::error::{PhoneError, PhoneResult};
use crate::events::RegistrationEvent;
use crate::registration::{build_register_request, refresh_delay, RegistrationInfo, RegistrationState};
use crate::resilience::{Channel, LifecyclePhase};

impl Softphone {
    /// Connect the signaling transport and register
    ///
    /// Configuration problems fail immediately and are never retried. Any
    /// other failure is returned to the caller and also hands the signaling
    /// channel to the resilience manager, which keeps retrying with backoff.
    pub async fn connect(&self, config: EndpointConfig) -> PhoneResult<()> {
        config.validate()?;
        let uri = config.signaling_uri()?;

        let _initializing = FlagGuard::raise(&self.reg.initializing).ok_or(PhoneError::AlreadyInitializing)?;

        *self.reg.last_config.lock() = Some(config.clone());
        self.resilience.enable();

        match self.connect_inner(&config, &uri).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.report_connect_failure(&e);
                Err(e)
            }
        }
    }

    /// Tear down calls, registration and transport
    ///
    /// Resilience is stopped first so the teardown does not look like a
    /// connection loss. Partial failures are logged; the softphone always
    /// ends up disconnected.
    pub async fn disconnect(&self) -> PhoneResult<()> {
        let Some(_disconnecting) = FlagGuard::raise(&self.reg.disconnecting) else {
            debug!("Disconnect already in progress");
            return Ok(());
        };

        self.resilience.stop();
        self.teardown().await;
        Ok(())
    }

    /// Disconnect and connect again with the last configuration
    pub async fn reconnect(&self) -> PhoneResult<()> {
        let _initializing = FlagGuard::raise(&self.reg.initializing).ok_or(PhoneError::AlreadyInitializing)?;

        let config = self
            .reg
            .last_config
            .lock()
            .clone()
            .ok_or_else(|| PhoneError::missing_configuration("endpoint configuration"))?;
        let uri = config.signaling_uri()?;

        info!("Reconnecting as {}", config.aor());
        if let Some(_disconnecting) = FlagGuard::raise(&self.reg.disconnecting) {
            self.teardown().await;
        }
        sleep(self.config.reconnect_settle).await;

        self.resilience.enable();
        match self.connect_inner(&config, &uri).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.report_connect_failure(&e);
                Err(e)
            }
        }
    }

    /// Re-register if it is safe to do so
    ///
    /// Returns `Ok(false)` without sending anything when a REGISTER is already
    /// in flight, one went out within the throttle window, or a call is live.
    pub async fn safe_register(&self) -> PhoneResult<bool> {
        let config = self.reg.last_config.lock().clone().ok_or(PhoneError::NotConnected)?;
        if !self.reg.transport_connected.load(Ordering::SeqCst) {
            return Err(PhoneError::NotConnected);
        }

        if let Some(call) = self.calls.lock().live_call() {
            debug!(call_id = %call.id, "Call is live, holding off REGISTER");
            return Ok(false);
        }
        if self.reg.register_in_flight.load(Ordering::SeqCst) {
            debug!("REGISTER already in flight");
            return Ok(false);
        }
        if !self.reg.throttle.lock().try_acquire() {
            debug!("REGISTER throttled");
            return Ok(false);
        }

        self.send_register(&config).await?;
        Ok(true)
    }

    /// Fetch the endpoint configuration from the directory and connect
    pub async fn login(&self) -> PhoneResult<()> {
        let directory = self
            .directory
            .clone()
            .ok_or_else(|| PhoneError::missing_configuration("directory"))?;

        self.set_lifecycle_phase(LifecyclePhase::Authenticating);
        let result = async {
            let config = directory.endpoint_config().await.map_err(|e| PhoneError::BackendFailed {
                service: "directory".to_string(),
                reason: e.to_string(),
            })?;
            self.connect(config).await
        }
        .await;

        match &result {
            Ok(()) => self.set_lifecycle_phase(LifecyclePhase::Active),
            Err(e) => {
                warn!("Login failed: {}", e);
                self.set_lifecycle_phase(LifecyclePhase::Idle);
            }
        }
        result
    }

    /// Disconnect with the logout guard up so nothing reconnects behind us
    pub async fn logout(&self) -> PhoneResult<()> {
        self.set_lifecycle_phase(LifecyclePhase::LoggingOut);
        let result = self.disconnect().await;
        self.set_lifecycle_phase(LifecyclePhase::Idle);
        result
    }

    pub fn registration_state(&self) -> RegistrationState {
        *self.reg.state.lock()
    }

    /// Transport up and registered
    pub fn is_connected(&self) -> bool {
        self.reg.connected.load(Ordering::SeqCst) && self.registration_state() == RegistrationState::Registered
    }

    pub fn registration_info(&self) -> RegistrationInfo {
        RegistrationInfo {
            state: self.registration_state(),
            aor: self.reg.last_config.lock().as_ref().map(|c| c.aor()),
            expires: *self.reg.expires.lock(),
            registered_at: *self.reg.registered_at.lock(),
            transport_connected: self.reg.transport_connected.load(Ordering::SeqCst),
        }
    }

    pub(crate) fn require_registered(&self) -> PhoneResult<EndpointConfig> {
        if !self.reg.transport_connected.load(Ordering::SeqCst) {
            return Err(PhoneError::NotConnected);
        }
        if !self.is_connected() {
            return Err(PhoneError::NotRegistered);
        }
        self.reg.last_config.lock().clone().ok_or(PhoneError::NotConnected)
    }

    async fn connect_inner(&self, config: &EndpointConfig, uri: &Url) -> PhoneResult<()> {
        let (tx, rx) = oneshot::channel();
        *self.reg.pending_transport.lock() = Some(tx);

        info!("Connecting to {} as {}", uri, config.aor());
        if let Err(e) = self.stack.connect_transport(uri, &config.ice_servers).await {
            self.reg.pending_transport.lock().take();
            return Err(PhoneError::transport_failed(e.to_string()));
        }

        match timeout(self.config.connect_timeout, rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_)) => return Err(PhoneError::transport_failed("connection attempt abandoned")),
            Err(_) => {
                self.reg.pending_transport.lock().take();
                warn!("Transport did not connect within {:?}", self.config.connect_timeout);
                if let Err(e) = self.stack.disconnect_transport().await {
                    debug!("Closing timed-out transport failed: {}", e);
                }
                return Err(PhoneError::ConnectionTimeout {
                    seconds: self.config.connect_timeout.as_secs(),
                });
            }
        }

        let expires = self.register_and_wait(config).await?;
        self.reg.connected.store(true, Ordering::SeqCst);
        info!("Registered as {} (expires {}s)", config.aor(), expires);
        Ok(())
    }

    async fn register_and_wait(&self, config: &EndpointConfig) -> PhoneResult<u32> {
        let (tx, rx) = oneshot::channel();
        *self.reg.pending_register.lock() = Some(tx);

        self.reg.throttle.lock().record();
        self.send_register(config).await?;

        match timeout(self.config.connect_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PhoneError::registration_failed(None, "registration attempt abandoned")),
            Err(_) => {
                self.reg.pending_register.lock().take();
                self.reg.register_in_flight.store(false, Ordering::SeqCst);
                *self.reg.state.lock() = RegistrationState::Unregistered;
                let reason = "no response from registrar".to_string();
                self.events.registration.emit(RegistrationEvent::Failed {
                    status: None,
                    reason: reason.clone(),
                });
                Err(PhoneError::registration_failed(None, reason))
            }
        }
    }

    async fn send_register(&self, config: &EndpointConfig) -> PhoneResult<()> {
        let request = build_register_request(config, self.instance_id);

        self.reg.register_in_flight.store(true, Ordering::SeqCst);
        *self.reg.state.lock() = RegistrationState::Registering;
        self.events.registration.emit(RegistrationEvent::Registering);
        debug!(aor = %request.aor, expires = request.expires, "Sending REGISTER");

        if let Err(e) = self.stack.register(&request).await {
            self.reg.register_in_flight.store(false, Ordering::SeqCst);
            *self.reg.state.lock() = RegistrationState::Unregistered;
            self.reg.pending_register.lock().take();
            return Err(PhoneError::registration_failed(None, e.to_string()));
        }
        Ok(())
    }

    fn report_connect_failure(&self, e: &PhoneError) {
        self.reg.connected.store(false, Ordering::SeqCst);
        let channel = match e {
            PhoneError::RegistrationFailed { .. } => Channel::Registration,
            _ => Channel::Signaling,
        };
        error!("Connect failed: {}", e);
        self.resilience.channel_disconnected(channel, &e.to_string());
    }

    /// Drop calls, unregister, stop the refresh and close the transport
    ///
    /// Callers hold the disconnecting flag.
    pub(crate) async fn teardown(&self) {
        info!("Disconnecting");
        self.terminate_all_calls().await;

        let state = self.registration_state();
        if matches!(state, RegistrationState::Registered | RegistrationState::Registering) {
            if let Err(e) = self.stack.unregister().await {
                warn!("Unregister failed: {}", e);
            }
        }

        self.reg.cancel_refresh();

        if let Err(e) = self.stack.disconnect_transport().await {
            warn!("Closing transport failed: {}", e);
        }

        self.reg.pending_transport.lock().take();
        self.reg.pending_register.lock().take();
        self.reg.transport_connected.store(false, Ordering::SeqCst);
        self.reg.connected.store(false, Ordering::SeqCst);
        self.reg.register_in_flight.store(false, Ordering::SeqCst);
        self.reg.throttle.lock().reset();
        *self.reg.state.lock() = RegistrationState::Unregistered;
        *self.reg.expires.lock() = None;
        *self.reg.registered_at.lock() = None;

        self.events.registration.emit(RegistrationEvent::Unregistered);
        info!("Disconnected");
    }

    fn schedule_safety_refresh(&self, expires: u32) {
        let mut wait = refresh_delay(expires, self.config.refresh_margin);
        let retry = self.config.refresh_retry;
        let weak = self.weak_self.clone();
        debug!("Safety re-register in {:?}", wait);

        let task = tokio::spawn(async move {
            loop {
                sleep(wait).await;
                let Some(phone) = weak.upgrade() else { break };
                match phone.safe_register().await {
                    Ok(true) => break,
                    Ok(false) => {
                        debug!("Safety re-register deferred for {:?}", retry);
                        wait = retry;
                    }
                    Err(e) => {
                        warn!("Safety re-register failed: {}", e);
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self.reg.refresh_task.lock().replace(task) {
            previous.abort();
        }
    }

    pub(super) fn on_transport_connected(&self) {
        self.reg.transport_connected.store(true, Ordering::SeqCst);

        if let Some(tx) = self.reg.pending_transport.lock().take() {
            self.resilience.channel_connected(Channel::Signaling);
            let _ = tx.send(Ok(()));
            return;
        }
        if self.reg.disconnecting.load(Ordering::SeqCst) {
            return;
        }

        // the stack came back on its own
        self.resilience.channel_connected(Channel::Signaling);
        if self.registration_state() != RegistrationState::Registered {
            let weak = self.weak_self.clone();
            tokio::spawn(async move {
                if let Some(phone) = weak.upgrade() {
                    if let Err(e) = phone.safe_register().await {
                        debug!("Re-register after transport recovery failed: {}", e);
                    }
                }
            });
        }
    }

    pub(super) fn on_transport_lost(&self, reason: String) {
        let was_connected = self.reg.transport_connected.swap(false, Ordering::SeqCst);

        if let Some(tx) = self.reg.pending_transport.lock().take() {
            let _ = tx.send(Err(PhoneError::transport_failed(reason)));
            return;
        }
        if let Some(tx) = self.reg.pending_register.lock().take() {
            let _ = tx.send(Err(PhoneError::transport_failed(reason)));
            return;
        }
        if self.reg.disconnecting.load(Ordering::SeqCst) || self.reg.initializing.load(Ordering::SeqCst) {
            debug!("Ignoring transport loss during connect/disconnect: {}", reason);
            return;
        }
        if !was_connected {
            return;
        }

        warn!("Signaling transport lost: {}", reason);
        self.reg.connected.store(false, Ordering::SeqCst);
        self.reg.register_in_flight.store(false, Ordering::SeqCst);
        self.reg.cancel_refresh();
        self.resilience.channel_disconnected(Channel::Signaling, &reason);
    }

    pub(super) fn on_registered(&self, expires: u32) {
        let config = self.reg.last_config.lock().clone();
        let expires = match (expires, &config) {
            (0, Some(config)) => config.clamped_expires(),
            (value, _) => value,
        };
        let at = Utc::now();

        self.reg.register_in_flight.store(false, Ordering::SeqCst);
        *self.reg.state.lock() = RegistrationState::Registered;
        *self.reg.expires.lock() = Some(expires);
        *self.reg.registered_at.lock() = Some(at);
        if self.reg.transport_connected.load(Ordering::SeqCst) && self.reg.pending_register.lock().is_none() {
            // refresh on an already connected softphone
            self.reg.connected.store(true, Ordering::SeqCst);
        }

        self.events.registration.emit(RegistrationEvent::Registered {
            aor: config.as_ref().map(|c| c.aor()).unwrap_or_default(),
            expires,
            at,
        });
        self.resilience.channel_connected(Channel::Registration);
        self.schedule_safety_refresh(expires);

        if let Some(tx) = self.reg.pending_register.lock().take() {
            let _ = tx.send(Ok(expires));
        }
    }

    pub(super) fn on_registration_failed(&self, status: Option<u16>, reason: String) {
        self.reg.register_in_flight.store(false, Ordering::SeqCst);
        *self.reg.state.lock() = RegistrationState::Unregistered;
        self.events.registration.emit(RegistrationEvent::Failed {
            status,
            reason: reason.clone(),
        });

        if let Some(tx) = self.reg.pending_register.lock().take() {
            let _ = tx.send(Err(PhoneError::registration_failed(status, reason)));
            return;
        }

        warn!("Registration refresh failed ({:?}): {}", status, reason);
        if self.reg.connected.swap(false, Ordering::SeqCst) {
            self.reg.cancel_refresh();
            self.resilience.channel_disconnected(Channel::Registration, &reason);
        }
    }

    pub(super) fn on_registration_lost(&self, state: RegistrationState) {
        *self.reg.state.lock() = state;
        self.reg.register_in_flight.store(false, Ordering::SeqCst);
        self.events.registration.emit(match state {
            RegistrationState::Terminated => RegistrationEvent::Terminated,
            _ => RegistrationEvent::Unregistered,
        });

        if self.reg.disconnecting.load(Ordering::SeqCst) {
            return;
        }
        if self.reg.connected.swap(false, Ordering::SeqCst) {
            warn!("Registration lost ({})", state);
            self.reg.cancel_refresh();
            self.resilience.channel_disconnected(Channel::Registration, "registration lost");
        }
    }
}

//! Call operations for [`Softphone`]
//!
//! At most one call is live at a time. The table has three slots:
//!
//! ```text
//!   incoming ──answer──► current ◄── make_call
//!                           │
//!                           └── attended transfer ──► consultation
//! ```
//!
//! Every way a call can end (local hangup, remote BYE, CANCEL, rejection,
//! stack error, disconnect, transfer) goes through [`Softphone::terminate_session`],
//! which removes the session from its slot before doing anything else. A
//! session that is already gone is ignored, so each call emits exactly one
//! [`CallEvent::Ended`].

use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::Softphone;
use crate::backend::CallRecord;
use crate::call::{
    normalize_target, CallDirection, CallId, CallInfo, CallOptions, CallSession, CallState, EndCause, HoldMethod,
    SessionRole,
};
use crate::error::{PhoneError, PhoneResult};
use crate::events::CallEvent;
use crate::sdp::{self, Direction};
use crate::stack::{DialogHandle, DialogId, InviteRequest, MediaConstraints, RemoteTrack};

/// How a session is being finished
#[derive(Debug, Clone)]
pub(crate) struct Termination {
    pub cause: EndCause,
    pub media_suspected: bool,
}

impl Termination {
    pub fn new(cause: EndCause) -> Self {
        Self {
            cause,
            media_suspected: false,
        }
    }
}

type OpGuard = std::sync::Arc<tokio::sync::Mutex<()>>;

impl Softphone {
    /// Place an outbound call
    ///
    /// `number` may be an extension, `user@host`, or a full `sip:`/`tel:` URI.
    /// Returns once the INVITE has been handed to the stack; progress and the
    /// outcome arrive as [`CallEvent`]s.
    pub async fn make_call(&self, number: &str, options: CallOptions) -> PhoneResult<CallId> {
        let number = number.trim();
        if number.is_empty() {
            return Err(PhoneError::call_setup_failed("empty call target"));
        }
        let config = self.require_registered()?;
        self.ensure_no_current_call()?;

        let target = normalize_target(number, &config.registrar_host);
        let offer = self
            .stack
            .create_offer(MediaConstraints::audio_only())
            .await
            .map_err(|e| PhoneError::call_setup_failed(format!("could not create offer: {}", e)))?;
        let offer = self.prefer_codecs(offer);

        let mut session = CallSession::new(
            DialogHandle::new(),
            CallDirection::Outgoing,
            SessionRole::Primary,
            number,
            options.display_name.clone(),
        );
        session.state = CallState::Establishing;
        let call_id = session.id;
        let handle = session.handle.clone();

        {
            let mut calls = self.calls.lock();
            if let Some(existing) = calls.current.as_ref().filter(|s| !s.state.is_terminated()) {
                return Err(PhoneError::CallInProgress { call_id: existing.id });
            }
            calls.current = Some(session);
        }

        info!("Calling {} ({})", target, call_id);
        let request = InviteRequest {
            handle: handle.clone(),
            target,
            display_name: options.display_name.or(config.display_name),
            offer,
            extra_headers: options.extra_headers,
        };

        if let Err(e) = self.stack.invite(request).await {
            let reason = e.to_string();
            warn!("INVITE for {} failed: {}", call_id, reason);
            self.events.calls.emit(CallEvent::Failed {
                call_id,
                status: None,
                reason: reason.clone(),
            });
            self.terminate_session(&handle, Termination::new(EndCause::Error { reason: reason.clone() }))
                .await;
            return Err(PhoneError::call_setup_failed(reason));
        }
        Ok(call_id)
    }

    /// Answer the pending incoming call
    ///
    /// Waits until the stack confirms the dialog. Without
    /// [`PhoneConfig::answer_timeout`](crate::PhoneConfig) the wait is only
    /// ended by the dialog confirming or the call terminating.
    pub async fn answer_call(&self) -> PhoneResult<CallId> {
        let (call_id, handle, guard) = {
            let calls = self.calls.lock();
            let incoming = calls.incoming.as_ref().ok_or(PhoneError::NoIncomingCall)?;
            if !matches!(incoming.state, CallState::Initial | CallState::Establishing) {
                return Err(PhoneError::InvalidCallState {
                    call_id: incoming.id,
                    current_state: incoming.state,
                });
            }
            if let Some(current) = calls.current.as_ref().filter(|s| !s.state.is_terminated()) {
                return Err(PhoneError::CallInProgress { call_id: current.id });
            }
            (incoming.id, incoming.handle.clone(), incoming.op_guard.clone())
        };

        let _op = guard.lock_owned().await;

        {
            let mut calls = self.calls.lock();
            match calls.incoming.as_mut().filter(|s| s.handle == handle) {
                Some(session) if session.state == CallState::Initial => session.state = CallState::Establishing,
                Some(session) => {
                    return Err(PhoneError::InvalidCallState {
                        call_id,
                        current_state: session.state,
                    });
                }
                None => {
                    return Err(PhoneError::CallTerminated {
                        reason: "caller went away".to_string(),
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.answer_waiters.lock().insert(handle.clone(), tx);

        info!("Answering call {}", call_id);
        if let Err(e) = self.stack.accept(&handle).await {
            self.answer_waiters.lock().remove(&handle);
            let reason = e.to_string();
            warn!("Accept for {} failed: {}", call_id, reason);
            self.terminate_session(&handle, Termination::new(EndCause::Error { reason: reason.clone() }))
                .await;
            return Err(PhoneError::call_setup_failed(reason));
        }

        let outcome = match self.config.answer_timeout {
            Some(limit) => match timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.answer_waiters.lock().remove(&handle);
                    warn!("Call {} not confirmed within {:?}", call_id, limit);
                    if let Err(e) = self.stack.bye(&handle).await {
                        debug!("BYE after answer timeout failed: {}", e);
                    }
                    self.terminate_session(
                        &handle,
                        Termination::new(EndCause::Error {
                            reason: "answer timed out".to_string(),
                        }),
                    )
                    .await;
                    return Err(PhoneError::OperationTimeout {
                        duration_ms: limit.as_millis() as u64,
                    });
                }
            },
            None => rx.await,
        };

        match outcome {
            Ok(Ok(())) => {
                self.events.calls.emit(CallEvent::Answered { call_id });
                Ok(call_id)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(PhoneError::CallTerminated {
                reason: "answer abandoned".to_string(),
            }),
        }
    }

    /// Decline the pending incoming call
    ///
    /// The reference is cleared even when the stack refuses the rejection.
    pub async fn reject_call(&self) -> PhoneResult<()> {
        let session = self.calls.lock().incoming.clone().ok_or(PhoneError::NoIncomingCall)?;

        info!("Rejecting call {}", session.id);
        let result = match session.state {
            CallState::Initial | CallState::Establishing => {
                self.stack.reject(&session.handle, self.config.reject_status).await
            }
            CallState::Established => self.stack.bye(&session.handle).await,
            CallState::Terminating | CallState::Terminated => Ok(()),
        };
        if let Err(e) = result {
            warn!("Rejecting {} failed, clearing it anyway: {}", session.id, e);
        }

        self.terminate_session(&session.handle, Termination::new(EndCause::Rejected))
            .await;
        Ok(())
    }

    /// Hang up the current call (or the pending incoming one)
    pub async fn end_call(&self) -> PhoneResult<()> {
        let session = {
            let calls = self.calls.lock();
            calls.current.clone().or_else(|| calls.incoming.clone())
        }
        .ok_or(PhoneError::NoActiveCall)?;

        self.end_session(&session, EndCause::LocalHangup).await;
        Ok(())
    }

    /// Put the current call on hold
    pub async fn hold_call(&self) -> PhoneResult<()> {
        let (call_id, handle, guard) = self.current_established()?;
        let _op = guard.lock_owned().await;
        self.apply_hold(call_id, &handle, true).await
    }

    /// Take the current call off hold, reversing the mechanism that held it
    pub async fn unhold_call(&self) -> PhoneResult<()> {
        let (call_id, handle, guard) = self.current_established()?;
        let _op = guard.lock_owned().await;
        self.apply_hold(call_id, &handle, false).await
    }

    pub fn is_call_on_hold(&self) -> bool {
        self.calls.lock().current.as_ref().is_some_and(|s| s.is_on_hold)
    }

    pub fn current_call(&self) -> Option<CallInfo> {
        self.calls.lock().current.as_ref().map(CallSession::info)
    }

    pub fn incoming_call(&self) -> Option<CallInfo> {
        self.calls.lock().incoming.as_ref().map(CallSession::info)
    }

    /// The consultation leg of an attended transfer
    pub fn consultation_call(&self) -> Option<CallInfo> {
        self.calls.lock().consultation.as_ref().map(CallSession::info)
    }

    pub(crate) fn ensure_no_current_call(&self) -> PhoneResult<()> {
        let calls = self.calls.lock();
        match calls.current.as_ref().filter(|s| !s.state.is_terminated()) {
            Some(existing) => Err(PhoneError::CallInProgress { call_id: existing.id }),
            None => Ok(()),
        }
    }

    pub(crate) fn current_established(&self) -> PhoneResult<(CallId, DialogHandle, OpGuard)> {
        let calls = self.calls.lock();
        let session = calls.current.as_ref().ok_or(PhoneError::NoActiveCall)?;
        if session.state != CallState::Established {
            return Err(PhoneError::InvalidCallState {
                call_id: session.id,
                current_state: session.state,
            });
        }
        Ok((session.id, session.handle.clone(), session.op_guard.clone()))
    }

    pub(crate) fn prefer_codecs(&self, offer: String) -> String {
        match sdp::with_preferred_codecs(&offer, &self.config.preferred_codecs) {
            Ok(rewritten) => rewritten,
            Err(e) => {
                warn!("Keeping offer as generated, codec preference failed: {}", e);
                offer
            }
        }
    }

    /// Hold or unhold; the caller holds the session's op guard
    pub(crate) async fn apply_hold(&self, call_id: CallId, handle: &DialogHandle, hold: bool) -> PhoneResult<()> {
        let (on_hold, held_with) = {
            let calls = self.calls.lock();
            let session = calls.find(handle).ok_or(PhoneError::NoActiveCall)?;
            if session.state != CallState::Established {
                return Err(PhoneError::InvalidCallState {
                    call_id,
                    current_state: session.state,
                });
            }
            (session.is_on_hold, session.hold_method)
        };
        if on_hold == hold {
            debug!("Call {} already {}", call_id, if hold { "on hold" } else { "active" });
            return Ok(());
        }

        let method = match (hold, held_with) {
            (false, Some(method)) => method,
            _ => self.choose_hold_method(handle).await,
        };

        match self.run_hold_method(handle, method, hold).await {
            Ok(()) => {
                if let Some(session) = self.calls.lock().find_mut(handle) {
                    session.is_on_hold = hold;
                    session.hold_method = hold.then_some(method);
                }
                info!("Call {} {} ({:?})", call_id, if hold { "held" } else { "resumed" }, method);
                self.events.calls.emit(if hold {
                    CallEvent::Held { call_id, method }
                } else {
                    CallEvent::Unheld { call_id, method }
                });
                Ok(())
            }
            Err(reason) => {
                warn!("{} of {} failed: {}", if hold { "Hold" } else { "Unhold" }, call_id, reason);
                if hold {
                    self.events.calls.emit(CallEvent::HoldFailed {
                        call_id,
                        reason: reason.clone(),
                    });
                    Err(PhoneError::HoldFailed { reason })
                } else {
                    self.events.calls.emit(CallEvent::UnholdFailed {
                        call_id,
                        reason: reason.clone(),
                    });
                    Err(PhoneError::UnholdFailed { reason })
                }
            }
        }
    }

    async fn choose_hold_method(&self, handle: &DialogHandle) -> HoldMethod {
        let caps = self.stack.capabilities(handle);
        if caps.native_hold {
            return HoldMethod::Native;
        }
        if caps.renegotiation {
            match self.stack.local_description(handle).await {
                Ok(Some(_)) => return HoldMethod::Renegotiation,
                Ok(None) => debug!("No local description, falling back to local hold"),
                Err(e) => debug!("Local description unavailable, falling back to local hold: {}", e),
            }
        }
        HoldMethod::LocalOnly
    }

    async fn run_hold_method(&self, handle: &DialogHandle, method: HoldMethod, hold: bool) -> Result<(), String> {
        match method {
            HoldMethod::Native => self
                .stack
                .set_native_hold(handle, hold)
                .await
                .map_err(|e| e.to_string()),
            HoldMethod::Renegotiation => {
                let local = self
                    .stack
                    .local_description(handle)
                    .await
                    .map_err(|e| e.to_string())?
                    .ok_or_else(|| "no local description".to_string())?;
                let direction = if hold { Direction::SendOnly } else { Direction::SendRecv };
                let rewritten = sdp::with_audio_direction(&local, direction).map_err(|e| e.to_string())?;
                self.stack
                    .renegotiate(handle, rewritten)
                    .await
                    .map_err(|e| e.to_string())
            }
            HoldMethod::LocalOnly => self
                .stack
                .set_audio_sender_enabled(handle, !hold)
                .await
                .map_err(|e| e.to_string()),
        }
    }

    /// Send whatever ends the session in its current state, then terminate it
    pub(crate) async fn end_session(&self, session: &CallSession, requested: EndCause) {
        let state = {
            let mut calls = self.calls.lock();
            match calls.find_mut(&session.handle) {
                Some(live) if !live.state.is_terminated() => {
                    let state = live.state;
                    live.state = CallState::Terminating;
                    state
                }
                _ => return,
            }
        };

        let (result, cause) = match (state, session.direction) {
            (CallState::Established, _) => (self.stack.bye(&session.handle).await, requested),
            (CallState::Establishing, CallDirection::Incoming) => (self.stack.bye(&session.handle).await, requested),
            (CallState::Initial, CallDirection::Incoming) => (
                self.stack.reject(&session.handle, self.config.reject_status).await,
                match requested {
                    EndCause::LocalHangup => EndCause::Rejected,
                    other => other,
                },
            ),
            (_, CallDirection::Outgoing) => (
                self.stack.cancel(&session.handle).await,
                match requested {
                    EndCause::LocalHangup => EndCause::Cancelled,
                    other => other,
                },
            ),
            (_, CallDirection::Incoming) => (Ok(()), requested),
        };
        if let Err(e) = result {
            warn!("Ending call {} failed at the stack: {}", session.id, e);
        }

        self.terminate_session(&session.handle, Termination::new(cause)).await;
    }

    /// End every session; used by disconnect
    pub(crate) async fn terminate_all_calls(&self) {
        if let Some(mut context) = self.transfer.lock().take() {
            context.cancel_timeout();
        }
        let sessions: Vec<CallSession> = {
            let calls = self.calls.lock();
            [&calls.consultation, &calls.current, &calls.incoming]
                .into_iter()
                .flatten()
                .cloned()
                .collect()
        };
        for session in sessions {
            self.end_session(&session, EndCause::Disconnected).await;
        }
    }

    /// The single exit for every session
    pub(crate) async fn terminate_session(&self, handle: &DialogHandle, termination: Termination) {
        let Some(mut session) = self.calls.lock().remove(handle) else {
            debug!("Session {} already terminated", handle);
            return;
        };
        session.state = CallState::Terminated;

        let mut cause = termination.cause;
        if let Some(waiter) = self.answer_waiters.lock().remove(handle) {
            let _ = waiter.send(Err(PhoneError::CallTerminated {
                reason: cause.to_string(),
            }));
        }

        self.media.release(session.id, handle).await;

        let deferred = match session.role {
            SessionRole::Primary => self.transfer_on_original_ended(&session, &mut cause),
            SessionRole::Consultation => {
                self.transfer_on_consultation_ended(&session, &cause).await;
                false
            }
        };
        if session.transferred {
            cause = EndCause::TransferCompleted;
        }
        if deferred {
            info!("Call {} ended during transfer, waiting for the transfer outcome", session.id);
            return;
        }

        info!("Call {} ended: {}", session.id, cause);
        self.events.calls.emit(CallEvent::Ended {
            call_id: session.id,
            cause,
            abandoned: !session.was_established(),
            media_negotiation_suspected: termination.media_suspected,
        });
    }

    pub(super) async fn on_incoming_invite(
        &self,
        handle: DialogHandle,
        remote_identity: String,
        display_name: Option<String>,
    ) {
        let session = CallSession::new(
            handle.clone(),
            CallDirection::Incoming,
            SessionRole::Primary,
            remote_identity.clone(),
            display_name.clone(),
        );
        let call_id = session.id;

        let busy = {
            let mut calls = self.calls.lock();
            if calls.incoming.is_some() {
                true
            } else {
                calls.incoming = Some(session);
                false
            }
        };
        if busy {
            info!("Rejecting second incoming call from {}", remote_identity);
            if let Err(e) = self.stack.reject(&handle, 486).await {
                debug!("Busy rejection failed: {}", e);
            }
            return;
        }

        info!("Incoming call {} from {}", call_id, remote_identity);
        self.events.calls.emit(CallEvent::Incoming {
            call_id,
            remote_identity,
            display_name,
        });
    }

    pub(super) fn on_provisional(&self, handle: DialogHandle, status: u16) {
        let Some(call_id) = self.calls.lock().find(&handle).map(|s| s.id) else {
            debug!("Provisional {} for unknown session {}", status, handle);
            return;
        };
        debug!("Call {} progress {}", call_id, status);
        self.events.calls.emit(CallEvent::Progress { call_id, status });

        if status == 180 || status == 183 {
            let weak = self.weak_self.clone();
            tokio::spawn(async move {
                if let Some(phone) = weak.upgrade() {
                    phone.media.try_early_media(call_id, &handle).await;
                }
            });
        }
    }

    pub(super) fn on_established(&self, handle: DialogHandle, dialog: DialogId) {
        let established = {
            let mut calls = self.calls.lock();
            if calls.incoming.as_ref().is_some_and(|s| s.handle == handle) && calls.current.is_none() {
                let mut session = calls.incoming.take();
                if let Some(session) = session.as_mut() {
                    session.mark_established(dialog.clone());
                }
                calls.current = session;
                calls.current.clone()
            } else {
                match calls.find_mut(&handle) {
                    Some(session) if !session.state.is_terminated() => {
                        session.mark_established(dialog.clone());
                        Some(session.clone())
                    }
                    _ => None,
                }
            }
        };
        let Some(session) = established else {
            debug!("Established for unknown session {}", handle);
            return;
        };

        info!("Call {} established with {}", session.id, session.remote_identity);
        self.events.calls.emit(CallEvent::Established {
            call_id: session.id,
            remote_identity: session.remote_identity.clone(),
            direction: session.direction,
        });
        if let Some(waiter) = self.answer_waiters.lock().remove(&handle) {
            let _ = waiter.send(Ok(()));
        }

        self.bind_media_after_settle(session.id, handle.clone(), self.config.media_settle);
        self.media.start_level_monitor(session.id, handle);

        match session.role {
            SessionRole::Primary => self.notify_call_monitor(&session, &dialog),
            SessionRole::Consultation => self.transfer_on_consultation_established(session.id),
        }
    }

    pub(super) async fn on_rejected(&self, handle: DialogHandle, status: u16, reason: String) {
        let Some(call_id) = self.calls.lock().find(&handle).map(|s| s.id) else {
            debug!("Rejection {} for unknown session {}", status, handle);
            return;
        };
        warn!("Call {} rejected: {} {}", call_id, status, reason);
        self.events.calls.emit(CallEvent::Failed {
            call_id,
            status: Some(status),
            reason,
        });
        self.terminate_session(&handle, Termination::new(EndCause::Failed { status }))
            .await;
    }

    pub(super) async fn on_remote_bye(&self, handle: DialogHandle) {
        let window = self.config.early_bye_window;
        let suspected = self
            .calls
            .lock()
            .find(&handle)
            .and_then(|s| s.established_instant)
            .is_some_and(|at| at.elapsed() <= window);
        if suspected {
            warn!(
                "BYE on {} within {}ms of establishment, media negotiation probably failed",
                handle,
                window.as_millis()
            );
        }

        self.terminate_session(
            &handle,
            Termination {
                cause: EndCause::RemoteHangup,
                media_suspected: suspected,
            },
        )
        .await;
    }

    pub(super) fn on_remote_track(&self, handle: DialogHandle, track: RemoteTrack) {
        let Some(call_id) = self.calls.lock().find(&handle).map(|s| s.id) else {
            return;
        };
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            if let Some(phone) = weak.upgrade() {
                phone.media.bind_track(call_id, track).await;
            }
        });
    }

    fn bind_media_after_settle(&self, call_id: CallId, handle: DialogHandle, settle: Duration) {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            sleep(settle).await;
            let Some(phone) = weak.upgrade() else { return };
            if phone.calls.lock().find(&handle).is_none() {
                return;
            }
            phone.media.bind_session(call_id, &handle).await;
        });
    }

    fn notify_call_monitor(&self, session: &CallSession, dialog: &DialogId) {
        let Some(monitor) = self.monitor.clone() else { return };
        let extension = self
            .reg
            .last_config
            .lock()
            .as_ref()
            .map(|c| c.extension.clone())
            .unwrap_or_default();
        let record = CallRecord {
            call_id: dialog.call_id.clone(),
            extension,
            remote_number: session.remote_identity.clone(),
            direction: session.direction,
            timestamp: Utc::now(),
        };
        tokio::spawn(async move {
            if let Err(e) = monitor.register_call(record).await {
                debug!("Call monitor registration failed: {}", e);
            }
        });
    }
}

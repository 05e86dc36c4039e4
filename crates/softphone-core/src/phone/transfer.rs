//! Call transfer for [`Softphone`]
//!
//! ## Blind
//!
//! ```text
//! Idle ─REFER─► Transferring ─202─► Accepted ─NOTIFY 2xx─► Completed
//!                    │                  │
//!                    └──── NOTIFY ≥300 / REFER error / timeout ──► Failed
//! ```
//!
//! A BYE on the original call while the transfer is still in flight does not
//! end the call right away: the terminal event waits for the NOTIFY outcome so
//! it can report `transfer_completed` or `remote_hangup` correctly.
//!
//! ## Attended
//!
//! The original call is held and a consultation call is placed to the target.
//! Completing sends REFER with `Replaces` naming the consultation dialog; on
//! acceptance both local legs are cleared. If the consultation never comes up,
//! or the user cancels, the original is resumed.

use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::calls::Termination;
use super::Softphone;
use crate::backend::TransferTarget;
use crate::call::{normalize_target, CallDirection, CallId, CallSession, CallState, EndCause, SessionRole};
use crate::error::{PhoneError, PhoneResult, TransferFailure};
use crate::events::{CallEvent, TransferEvent};
use crate::stack::{DialogHandle, InviteRequest, MediaConstraints};
use crate::transfer::{refer_to_with_replaces, NotifyOutcome, SipFrag, TransferContext, TransferMode, TransferState};

impl Softphone {
    /// Transfer the current call
    ///
    /// Blind mode sends REFER and reports the outcome through
    /// [`TransferEvent`]s. Attended mode starts a consultation; see
    /// [`Softphone::attended_transfer`].
    pub async fn transfer_call(&self, target: &str, mode: TransferMode) -> PhoneResult<()> {
        if mode == TransferMode::Attended {
            return self.attended_transfer(target).await.map(|_| ());
        }

        let domain = self.transfer_domain()?;
        let (call_id, handle, guard) = self.current_established()?;
        let _op = guard.lock_owned().await;
        let target_uri = normalize_target(target, &domain);

        {
            let mut slot = self.transfer.lock();
            if slot.as_ref().is_some_and(|c| c.state.is_in_flight()) {
                return Err(PhoneError::TransferInProgress);
            }
            let mut context = TransferContext::new(TransferMode::Blind, target_uri.clone(), call_id, handle.clone());
            self.transition(&mut context, TransferState::Transferring);
            context.timeout_task = Some(self.spawn_transfer_timeout(handle.clone()));
            *slot = Some(context);
        }
        self.events.transfers.emit(TransferEvent::Initiated {
            call_id,
            target: target_uri.clone(),
            mode: TransferMode::Blind,
        });

        info!("Transferring call {} to {}", call_id, target_uri);
        match self.stack.refer(&handle, &target_uri).await {
            Ok(()) => {
                let accepted = {
                    let mut slot = self.transfer.lock();
                    match slot.as_mut().filter(|c| c.original_handle == handle) {
                        Some(context) if context.state == TransferState::Transferring => {
                            self.transition(context, TransferState::Accepted);
                            true
                        }
                        _ => false,
                    }
                };
                if accepted {
                    self.events.transfers.emit(TransferEvent::Accepted { call_id });
                }
                Ok(())
            }
            Err(e) => {
                let detail = e.to_string();
                self.fail_blind_transfer(&handle, TransferFailure::Rejected, None).await;
                Err(PhoneError::transfer_failed(TransferFailure::Rejected, detail))
            }
        }
    }

    /// Hold the current call and place a consultation call to `target`
    ///
    /// Returns the consultation call id. Finish with
    /// [`complete_attended_transfer`](Self::complete_attended_transfer) once the
    /// consultation is established, or back out with
    /// [`cancel_attended_transfer`](Self::cancel_attended_transfer).
    pub async fn attended_transfer(&self, target: &str) -> PhoneResult<CallId> {
        let config = self.require_registered()?;
        let (call_id, handle, guard) = self.current_established()?;
        let op = guard.lock_owned().await;

        if self.transfer.lock().as_ref().is_some_and(|c| c.state.is_in_flight()) {
            return Err(PhoneError::TransferInProgress);
        }
        let target = target.trim();
        let target_uri = normalize_target(target, &config.registrar_host);

        let offer = self
            .stack
            .create_offer(MediaConstraints::audio_only())
            .await
            .map_err(|e| PhoneError::transfer_failed(TransferFailure::Rejected, format!("could not create offer: {}", e)))?;
        let offer = self.prefer_codecs(offer);

        let was_on_hold = self.calls.lock().find(&handle).is_some_and(|s| s.is_on_hold);
        if !was_on_hold {
            self.apply_hold(call_id, &handle, true).await?;
        }

        let mut consultation = CallSession::new(
            DialogHandle::new(),
            CallDirection::Outgoing,
            SessionRole::Consultation,
            target,
            None,
        );
        consultation.state = CallState::Establishing;
        let consultation_id = consultation.id;
        let consultation_handle = consultation.handle.clone();

        {
            let mut slot = self.transfer.lock();
            let mut context = TransferContext::new(TransferMode::Attended, target_uri.clone(), call_id, handle.clone());
            context.consultation_call = Some(consultation_id);
            context.consultation_handle = Some(consultation_handle.clone());
            context.held_original = !was_on_hold;
            self.transition(&mut context, TransferState::Consulting);
            *slot = Some(context);
        }
        self.calls.lock().consultation = Some(consultation);

        self.events.transfers.emit(TransferEvent::Initiated {
            call_id,
            target: target_uri.clone(),
            mode: TransferMode::Attended,
        });
        self.events.transfers.emit(TransferEvent::ConsultationStarted {
            call_id,
            consultation_id,
        });

        info!("Consulting {} before transferring {}", target_uri, call_id);
        let request = InviteRequest {
            handle: consultation_handle.clone(),
            target: target_uri,
            display_name: config.display_name,
            offer,
            extra_headers: Vec::new(),
        };
        if let Err(e) = self.stack.invite(request).await {
            let detail = e.to_string();
            warn!("Consultation INVITE failed: {}", detail);
            // restoring the original needs its op guard
            drop(op);
            self.terminate_session(
                &consultation_handle,
                Termination::new(EndCause::Error { reason: detail.clone() }),
            )
            .await;
            return Err(PhoneError::transfer_failed(TransferFailure::Rejected, detail));
        }

        Ok(consultation_id)
    }

    /// Send REFER with Replaces and clear both local legs
    pub async fn complete_attended_transfer(&self) -> PhoneResult<()> {
        let (call_id, handle, consultation_handle, target) = {
            let slot = self.transfer.lock();
            let context = slot
                .as_ref()
                .filter(|c| c.mode == TransferMode::Attended && c.state == TransferState::Consulting)
                .ok_or_else(|| PhoneError::InvalidTransferState {
                    state: self.describe_transfer_state(slot.as_ref()),
                })?;
            let consultation_handle = context
                .consultation_handle
                .clone()
                .ok_or_else(|| PhoneError::internal_error("consulting without a consultation call"))?;
            (
                context.original_call,
                context.original_handle.clone(),
                consultation_handle,
                context.target.clone(),
            )
        };

        let (dialog, guard) = {
            let calls = self.calls.lock();
            let consultation = calls
                .consultation
                .as_ref()
                .filter(|s| s.handle == consultation_handle && s.state == CallState::Established)
                .ok_or_else(|| PhoneError::InvalidTransferState {
                    state: "consultation not established".to_string(),
                })?;
            let dialog = consultation
                .dialog_id
                .clone()
                .ok_or_else(|| PhoneError::internal_error("established consultation without dialog"))?;
            let guard = calls
                .find(&handle)
                .map(|s| s.op_guard.clone())
                .ok_or(PhoneError::NoActiveCall)?;
            (dialog, guard)
        };

        let op = guard.lock_owned().await;
        let refer_to = refer_to_with_replaces(&target, &dialog);
        info!("Completing attended transfer of {} to {}", call_id, target);

        let outcome = match timeout(self.config.transfer_timeout, self.stack.refer(&handle, &refer_to)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err((TransferFailure::Rejected, e.to_string())),
            Err(_) => Err((
                TransferFailure::Timeout,
                format!("REFER not accepted within {:?}", self.config.transfer_timeout),
            )),
        };
        drop(op);

        match outcome {
            Ok(()) => {
                {
                    let mut slot = self.transfer.lock();
                    if let Some(context) = slot.as_mut().filter(|c| c.original_handle == handle) {
                        self.transition(context, TransferState::Completed);
                    }
                }
                if let Some(session) = self.calls.lock().find_mut(&handle) {
                    session.transferred = true;
                }
                self.events.transfers.emit(TransferEvent::Completed { call_id });

                let (consultation, original) = {
                    let calls = self.calls.lock();
                    (calls.find(&consultation_handle).cloned(), calls.find(&handle).cloned())
                };
                if let Some(consultation) = consultation {
                    self.end_session(&consultation, EndCause::Replaced).await;
                }
                if let Some(original) = original {
                    self.end_session(&original, EndCause::TransferCompleted).await;
                }
                info!("Attended transfer of {} completed", call_id);
                Ok(())
            }
            Err((reason, detail)) => {
                warn!("Attended transfer of {} failed: {}", call_id, detail);
                let held_original = {
                    let mut slot = self.transfer.lock();
                    match slot.as_mut() {
                        Some(context) if context.original_handle == handle => {
                            self.transition(context, TransferState::Failed);
                            let held = context.held_original;
                            *slot = None;
                            held
                        }
                        _ => false,
                    }
                };
                let consultation = self.calls.lock().find(&consultation_handle).cloned();
                if let Some(consultation) = consultation {
                    self.end_session(&consultation, EndCause::LocalHangup).await;
                }
                if held_original {
                    self.restore_original(call_id, &handle).await;
                }
                self.events.transfers.emit(TransferEvent::Failed {
                    call_id,
                    reason,
                    status: None,
                });
                Err(PhoneError::transfer_failed(reason, detail))
            }
        }
    }

    /// Abandon an attended transfer: hang up the consultation and resume the original
    pub async fn cancel_attended_transfer(&self) -> PhoneResult<()> {
        let context = {
            let mut slot = self.transfer.lock();
            if !slot
                .as_ref()
                .is_some_and(|c| c.mode == TransferMode::Attended && c.state == TransferState::Consulting)
            {
                return Err(PhoneError::InvalidTransferState {
                    state: self.describe_transfer_state(slot.as_ref()),
                });
            }
            slot.take()
        };
        let Some(context) = context else {
            return Err(PhoneError::internal_error("transfer context vanished"));
        };
        self.events.transfers.emit(TransferEvent::StateChanged {
            call_id: context.original_call,
            from: TransferState::Consulting,
            to: TransferState::Idle,
        });

        info!("Cancelling attended transfer of {}", context.original_call);
        let consultation = context
            .consultation_handle
            .as_ref()
            .and_then(|h| self.calls.lock().find(h).cloned());
        if let Some(consultation) = consultation {
            self.end_session(&consultation, EndCause::Cancelled).await;
        }
        if context.held_original {
            self.restore_original(context.original_call, &context.original_handle)
                .await;
        }

        self.events.transfers.emit(TransferEvent::Cancelled {
            call_id: context.original_call,
        });
        Ok(())
    }

    pub fn transfer_state(&self) -> TransferState {
        self.transfer
            .lock()
            .as_ref()
            .map(|c| c.state)
            .unwrap_or(TransferState::Idle)
    }

    /// Destinations offered by the directory
    pub async fn available_transfer_targets(&self) -> PhoneResult<Vec<TransferTarget>> {
        let directory = self
            .directory
            .as_ref()
            .ok_or_else(|| PhoneError::missing_configuration("directory"))?;
        directory
            .available_targets()
            .await
            .map_err(|e| PhoneError::BackendFailed {
                service: "directory".to_string(),
                reason: e.to_string(),
            })
    }

    fn transfer_domain(&self) -> PhoneResult<String> {
        self.reg
            .last_config
            .lock()
            .as_ref()
            .map(|c| c.registrar_host.clone())
            .ok_or(PhoneError::NotConnected)
    }

    fn describe_transfer_state(&self, context: Option<&TransferContext>) -> String {
        context
            .map(|c| format!("{:?} ({:?})", c.state, c.mode))
            .unwrap_or_else(|| format!("{:?}", TransferState::Idle))
    }

    fn transition(&self, context: &mut TransferContext, to: TransferState) {
        let from = context.state;
        if from == to {
            return;
        }
        context.state = to;
        debug!("Transfer of {}: {:?} -> {:?}", context.original_call, from, to);
        self.events.transfers.emit(TransferEvent::StateChanged {
            call_id: context.original_call,
            from,
            to,
        });
    }

    fn spawn_transfer_timeout(&self, handle: DialogHandle) -> tokio::task::JoinHandle<()> {
        let weak = self.weak_self.clone();
        let limit = self.config.transfer_timeout;
        tokio::spawn(async move {
            sleep(limit).await;
            if let Some(phone) = weak.upgrade() {
                phone.on_transfer_timeout(&handle).await;
            }
        })
    }

    async fn on_transfer_timeout(&self, handle: &DialogHandle) {
        {
            let mut slot = self.transfer.lock();
            match slot.as_mut() {
                Some(context) if &context.original_handle == handle && context.state.defers_termination() => {
                    // detach ourselves so clearing the context does not abort this task
                    context.timeout_task.take();
                }
                _ => return,
            }
        }
        warn!("No final NOTIFY for transfer on {} within {:?}", handle, self.config.transfer_timeout);
        self.fail_blind_transfer(handle, TransferFailure::Timeout, None).await;
    }

    async fn fail_blind_transfer(&self, handle: &DialogHandle, reason: TransferFailure, status: Option<u16>) {
        let (call_id, original_ended) = {
            let mut slot = self.transfer.lock();
            let Some(context) = slot.as_mut().filter(|c| &c.original_handle == handle) else {
                return;
            };
            if !context.state.defers_termination() {
                return;
            }
            context.cancel_timeout();
            self.transition(context, TransferState::Failed);
            let outcome = (context.original_call, context.original_ended);
            if context.original_ended {
                *slot = None;
            }
            outcome
        };

        warn!("Transfer of {} failed: {}", call_id, reason);
        self.events.transfers.emit(TransferEvent::Failed {
            call_id,
            reason,
            status,
        });
        if original_ended {
            info!("Call {} ended: {}", call_id, EndCause::RemoteHangup);
            self.events.calls.emit(CallEvent::Ended {
                call_id,
                cause: EndCause::RemoteHangup,
                abandoned: false,
                media_negotiation_suspected: false,
            });
        }
    }

    async fn complete_blind_transfer(&self, handle: &DialogHandle) {
        let (call_id, was_transferring, original_ended, took) = {
            let mut slot = self.transfer.lock();
            let Some(context) = slot.as_mut().filter(|c| &c.original_handle == handle) else {
                return;
            };
            if !context.state.defers_termination() {
                return;
            }
            context.cancel_timeout();
            let was_transferring = context.state == TransferState::Transferring;
            if was_transferring {
                self.transition(context, TransferState::Accepted);
            }
            self.transition(context, TransferState::Completed);
            let outcome = (
                context.original_call,
                was_transferring,
                context.original_ended,
                chrono::Utc::now() - context.started_at,
            );
            if context.original_ended {
                *slot = None;
            }
            outcome
        };

        if let Some(session) = self.calls.lock().find_mut(handle) {
            session.transferred = true;
        }
        if was_transferring {
            self.events.transfers.emit(TransferEvent::Accepted { call_id });
        }
        info!("Transfer of {} completed after {}ms", call_id, took.num_milliseconds());
        self.events.transfers.emit(TransferEvent::Completed { call_id });

        if original_ended {
            info!("Call {} ended: {}", call_id, EndCause::TransferCompleted);
            self.events.calls.emit(CallEvent::Ended {
                call_id,
                cause: EndCause::TransferCompleted,
                abandoned: false,
                media_negotiation_suspected: false,
            });
        }
    }

    pub(super) async fn on_notify(&self, handle: DialogHandle, body: String) {
        let call_id = {
            let slot = self.transfer.lock();
            match slot.as_ref() {
                Some(context)
                    if context.original_handle == handle
                        && context.mode == TransferMode::Blind
                        && context.state.defers_termination() =>
                {
                    context.original_call
                }
                _ => {
                    debug!("NOTIFY on {} without a blind transfer in flight", handle);
                    return;
                }
            }
        };
        let Some(frag) = SipFrag::parse(&body) else {
            debug!("Ignoring NOTIFY without a sipfrag status line");
            return;
        };

        match frag.outcome() {
            NotifyOutcome::Progress(status) => {
                debug!("Transfer of {} progress {}", call_id, status);
                self.events.transfers.emit(TransferEvent::Progress { call_id, status });
            }
            NotifyOutcome::Success(_) => self.complete_blind_transfer(&handle).await,
            NotifyOutcome::Failure(status, reason) => {
                debug!("Transfer target answered {} {}", status, frag.reason);
                self.fail_blind_transfer(&handle, reason, Some(status)).await
            }
        }
    }

    /// Hook for the original call leaving the table; true defers its `Ended`
    pub(crate) fn transfer_on_original_ended(&self, session: &CallSession, cause: &mut EndCause) -> bool {
        let mut slot = self.transfer.lock();
        let Some(context) = slot.as_mut().filter(|c| c.original_handle == session.handle) else {
            return false;
        };

        match context.state {
            TransferState::Completed => {
                *cause = EndCause::TransferCompleted;
                *slot = None;
                false
            }
            state if state.defers_termination() => {
                context.original_ended = true;
                true
            }
            TransferState::Consulting => {
                warn!("Original call {} ended during consultation, abandoning transfer", session.id);
                let call_id = context.original_call;
                self.transition(context, TransferState::Failed);
                *slot = None;
                drop(slot);
                self.events.transfers.emit(TransferEvent::Failed {
                    call_id,
                    reason: TransferFailure::Cancelled,
                    status: None,
                });
                // the consultation carries on as an ordinary call
                let mut calls = self.calls.lock();
                if calls.current.is_none() {
                    if let Some(mut consultation) = calls.consultation.take() {
                        consultation.role = SessionRole::Primary;
                        calls.current = Some(consultation);
                    }
                }
                false
            }
            _ => {
                *slot = None;
                false
            }
        }
    }

    /// Hook for the consultation leaving the table before the transfer finished
    pub(crate) async fn transfer_on_consultation_ended(&self, session: &CallSession, cause: &EndCause) {
        let context = {
            let mut slot = self.transfer.lock();
            if !slot.as_ref().is_some_and(|c| {
                c.state == TransferState::Consulting && c.consultation_handle.as_ref() == Some(&session.handle)
            }) {
                return;
            }
            slot.take()
        };
        let Some(context) = context else { return };

        let (reason, status) = match cause {
            EndCause::Failed { status } => (TransferFailure::from_status(*status), Some(*status)),
            EndCause::RemoteHangup | EndCause::Cancelled => (TransferFailure::Cancelled, None),
            _ => (TransferFailure::Rejected, None),
        };
        warn!("Consultation for {} ended ({}), resuming original", context.original_call, cause);
        self.events.transfers.emit(TransferEvent::StateChanged {
            call_id: context.original_call,
            from: TransferState::Consulting,
            to: TransferState::Idle,
        });

        if context.held_original {
            self.restore_original(context.original_call, &context.original_handle)
                .await;
        }
        self.events.transfers.emit(TransferEvent::Failed {
            call_id: context.original_call,
            reason,
            status,
        });
    }

    pub(crate) fn transfer_on_consultation_established(&self, consultation_id: CallId) {
        let call_id = self
            .transfer
            .lock()
            .as_ref()
            .filter(|c| c.consultation_call == Some(consultation_id) && c.state == TransferState::Consulting)
            .map(|c| c.original_call);
        if let Some(call_id) = call_id {
            info!("Consultation {} established", consultation_id);
            self.events.transfers.emit(TransferEvent::ConsultationEstablished {
                call_id,
                consultation_id,
            });
        }
    }

    async fn restore_original(&self, call_id: CallId, handle: &DialogHandle) {
        let Some(guard) = self.calls.lock().find(handle).map(|s| s.op_guard.clone()) else {
            debug!("Original call {} is gone, nothing to resume", call_id);
            return;
        };
        let _op = guard.lock_owned().await;
        if let Err(e) = self.apply_hold(call_id, handle, false).await {
            warn!("Resuming {} after transfer failed: {}", call_id, e);
            return;
        }
        // the consultation may have taken over the sink
        if self.media.bound_call() != Some(call_id) {
            self.media.bind_session(call_id, handle).await;
        }
    }
}

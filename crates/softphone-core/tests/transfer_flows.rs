//! Blind and attended transfer against a scripted stack

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use rvoip_softphone_core::stack::DialogHandle;
use rvoip_softphone_core::{
    CallEvent, CallId, EndCause, PhoneConfig, PhoneError, StackEvent, TransferEvent, TransferFailure, TransferMode,
    TransferState,
};

use common::{connected, dialog, drain, established_outbound, settle, wait_for, Harness, Op};

fn notify(h: &Harness, handle: &DialogHandle, status_line: &str) {
    h.stack.emit(StackEvent::Notify {
        handle: handle.clone(),
        body: format!("{}\r\n", status_line),
    });
}

/// Start an attended transfer to 1003 and bring the consultation up
async fn consulting(h: &Harness) -> (CallId, DialogHandle) {
    let consultation_id = h.phone.attended_transfer("1003").await.unwrap();
    let consultation = h.stack.last_invite().unwrap().handle;
    h.stack.emit(StackEvent::Established {
        handle: consultation.clone(),
        dialog: dialog("c0nsult-77@pbx.example.com"),
    });
    settle().await;
    (consultation_id, consultation)
}

#[tokio::test(start_paused = true)]
async fn test_blind_transfer_completes_on_notify() {
    let h = connected(PhoneConfig::default()).await;
    let (call_id, handle) = established_outbound(&h, "1002").await;
    let mut transfers = h.phone.subscribe_transfers();
    let mut calls = h.phone.subscribe_calls();

    h.phone.transfer_call("1003", TransferMode::Blind).await.unwrap();

    assert!(h
        .stack
        .ops()
        .contains(&Op::Refer(handle.clone(), "sip:1003@pbx.example.com".to_string())));
    assert_eq!(h.phone.transfer_state(), TransferState::Accepted);
    let events = drain(&mut transfers);
    assert_eq!(
        events,
        vec![
            TransferEvent::StateChanged {
                call_id,
                from: TransferState::Idle,
                to: TransferState::Transferring,
            },
            TransferEvent::Initiated {
                call_id,
                target: "sip:1003@pbx.example.com".into(),
                mode: TransferMode::Blind,
            },
            TransferEvent::StateChanged {
                call_id,
                from: TransferState::Transferring,
                to: TransferState::Accepted,
            },
            TransferEvent::Accepted { call_id },
        ]
    );

    notify(&h, &handle, "SIP/2.0 100 Trying");
    assert_eq!(
        wait_for(&mut transfers, |e| matches!(e, TransferEvent::Progress { .. })).await,
        TransferEvent::Progress { call_id, status: 100 }
    );

    notify(&h, &handle, "SIP/2.0 200 OK");
    wait_for(&mut transfers, |e| matches!(e, TransferEvent::Completed { .. })).await;
    assert_eq!(h.phone.transfer_state(), TransferState::Completed);

    h.stack.emit(StackEvent::RemoteBye { handle });
    assert_eq!(
        wait_for(&mut calls, |e| matches!(e, CallEvent::Ended { .. })).await,
        CallEvent::Ended {
            call_id,
            cause: EndCause::TransferCompleted,
            abandoned: false,
            media_negotiation_suspected: false,
        }
    );
    assert_eq!(h.phone.transfer_state(), TransferState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_blind_transfer_to_busy_target() {
    let h = connected(PhoneConfig::default()).await;
    let (call_id, handle) = established_outbound(&h, "1002").await;
    let mut transfers = h.phone.subscribe_transfers();

    h.phone.transfer_call("1003", TransferMode::Blind).await.unwrap();
    notify(&h, &handle, "SIP/2.0 486 Busy Here");

    assert_eq!(
        wait_for(&mut transfers, |e| matches!(e, TransferEvent::Failed { .. })).await,
        TransferEvent::Failed {
            call_id,
            reason: TransferFailure::Busy,
            status: Some(486),
        }
    );
    assert_eq!(h.phone.transfer_state(), TransferState::Failed);
    // the caller is still with us
    assert!(h.phone.current_call().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_bye_during_transfer_waits_for_outcome() {
    let h = connected(PhoneConfig::default()).await;
    let (call_id, handle) = established_outbound(&h, "1002").await;
    let mut calls = h.phone.subscribe_calls();

    h.phone.transfer_call("1003", TransferMode::Blind).await.unwrap();
    h.stack.emit(StackEvent::RemoteBye { handle: handle.clone() });
    settle().await;

    assert!(h.phone.current_call().is_none());
    assert!(drain(&mut calls).is_empty(), "Ended must wait for the NOTIFY");

    notify(&h, &handle, "SIP/2.0 200 OK");
    assert_eq!(
        wait_for(&mut calls, |e| matches!(e, CallEvent::Ended { .. })).await,
        CallEvent::Ended {
            call_id,
            cause: EndCause::TransferCompleted,
            abandoned: false,
            media_negotiation_suspected: false,
        }
    );
    assert_eq!(h.phone.transfer_state(), TransferState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_bye_then_failed_notify_reports_remote_hangup() {
    let h = connected(PhoneConfig::default()).await;
    let (call_id, handle) = established_outbound(&h, "1002").await;
    let mut calls = h.phone.subscribe_calls();
    let mut transfers = h.phone.subscribe_transfers();

    h.phone.transfer_call("1003", TransferMode::Blind).await.unwrap();
    h.stack.emit(StackEvent::RemoteBye { handle: handle.clone() });
    notify(&h, &handle, "SIP/2.0 503 Service Unavailable");

    assert!(matches!(
        wait_for(&mut transfers, |e| matches!(e, TransferEvent::Failed { .. })).await,
        TransferEvent::Failed {
            reason: TransferFailure::Unavailable,
            status: Some(503),
            ..
        }
    ));
    assert_eq!(
        wait_for(&mut calls, |e| matches!(e, CallEvent::Ended { .. })).await,
        CallEvent::Ended {
            call_id,
            cause: EndCause::RemoteHangup,
            abandoned: false,
            media_negotiation_suspected: false,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_blind_transfer_times_out_without_notify() {
    let h = connected(PhoneConfig::default()).await;
    let (call_id, _handle) = established_outbound(&h, "1002").await;
    let mut transfers = h.phone.subscribe_transfers();

    h.phone.transfer_call("1003", TransferMode::Blind).await.unwrap();
    tokio::time::sleep(Duration::from_secs(31)).await;

    assert_eq!(
        wait_for(&mut transfers, |e| matches!(e, TransferEvent::Failed { .. })).await,
        TransferEvent::Failed {
            call_id,
            reason: TransferFailure::Timeout,
            status: None,
        }
    );
    assert_eq!(h.phone.transfer_state(), TransferState::Failed);

    // a finished attempt does not block the next one
    h.phone.transfer_call("1004", TransferMode::Blind).await.unwrap();
    assert_eq!(h.stack.count(|op| matches!(op, Op::Refer(..))), 2);
}

#[tokio::test(start_paused = true)]
async fn test_refused_refer_fails_transfer() {
    let h = connected(PhoneConfig::default()).await;
    let (call_id, _handle) = established_outbound(&h, "1002").await;
    h.stack.fail_refer.store(true, Ordering::SeqCst);
    let mut transfers = h.phone.subscribe_transfers();

    let err = h.phone.transfer_call("1003", TransferMode::Blind).await.unwrap_err();
    assert!(matches!(
        err,
        PhoneError::TransferFailed {
            reason: TransferFailure::Rejected,
            ..
        }
    ));
    assert_eq!(
        wait_for(&mut transfers, |e| matches!(e, TransferEvent::Failed { .. })).await,
        TransferEvent::Failed {
            call_id,
            reason: TransferFailure::Rejected,
            status: None,
        }
    );
    assert!(h.phone.current_call().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_only_one_transfer_at_a_time() {
    let h = connected(PhoneConfig::default()).await;
    established_outbound(&h, "1002").await;

    h.phone.transfer_call("1003", TransferMode::Blind).await.unwrap();
    assert!(matches!(
        h.phone.transfer_call("1004", TransferMode::Blind).await,
        Err(PhoneError::TransferInProgress)
    ));
    assert!(matches!(
        h.phone.attended_transfer("1004").await,
        Err(PhoneError::TransferInProgress)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_transfer_needs_established_call() {
    let h = connected(PhoneConfig::default()).await;
    assert!(matches!(
        h.phone.transfer_call("1003", TransferMode::Blind).await,
        Err(PhoneError::NoActiveCall)
    ));
    assert!(matches!(
        h.phone.complete_attended_transfer().await,
        Err(PhoneError::InvalidTransferState { .. })
    ));
    assert!(matches!(
        h.phone.cancel_attended_transfer().await,
        Err(PhoneError::InvalidTransferState { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_attended_transfer_replaces_consultation() {
    let h = connected(PhoneConfig::default()).await;
    let (call_id, handle) = established_outbound(&h, "1002").await;
    let mut transfers = h.phone.subscribe_transfers();
    let mut calls = h.phone.subscribe_calls();

    let (consultation_id, consultation) = consulting(&h).await;

    assert!(h.stack.ops().contains(&Op::NativeHold(handle.clone(), true)));
    assert_eq!(h.phone.transfer_state(), TransferState::Consulting);
    assert_eq!(h.phone.consultation_call().unwrap().call_id, consultation_id);
    assert_eq!(
        wait_for(&mut transfers, |e| matches!(e, TransferEvent::ConsultationEstablished { .. })).await,
        TransferEvent::ConsultationEstablished {
            call_id,
            consultation_id,
        }
    );

    h.phone.complete_attended_transfer().await.unwrap();

    assert!(h.stack.ops().contains(&Op::Refer(
        handle.clone(),
        "sip:1003@pbx.example.com?Replaces=c0nsult-77%40pbx.example.com%3Bto-tag%3Da6c85cf%3Bfrom-tag%3D1928301774"
            .to_string()
    )));
    assert!(h.stack.ops().contains(&Op::Bye(consultation)));
    assert!(h.stack.ops().contains(&Op::Bye(handle)));
    wait_for(&mut transfers, |e| matches!(e, TransferEvent::Completed { .. })).await;

    let ends: Vec<CallEvent> = drain(&mut calls)
        .into_iter()
        .filter(|e| matches!(e, CallEvent::Ended { .. }))
        .collect();
    assert_eq!(
        ends,
        vec![
            CallEvent::Ended {
                call_id: consultation_id,
                cause: EndCause::Replaced,
                abandoned: false,
                media_negotiation_suspected: false,
            },
            CallEvent::Ended {
                call_id,
                cause: EndCause::TransferCompleted,
                abandoned: false,
                media_negotiation_suspected: false,
            },
        ]
    );
    assert!(h.phone.current_call().is_none());
    assert!(h.phone.consultation_call().is_none());
    assert_eq!(h.phone.transfer_state(), TransferState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_declined_consultation_resumes_original() {
    let h = connected(PhoneConfig::default()).await;
    let (call_id, handle) = established_outbound(&h, "1002").await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    let mut transfers = h.phone.subscribe_transfers();

    h.phone.attended_transfer("1003").await.unwrap();
    let consultation = h.stack.last_invite().unwrap().handle;
    assert!(h.phone.is_call_on_hold());

    h.stack.emit(StackEvent::Rejected {
        handle: consultation,
        status: 486,
        reason: "Busy Here".into(),
    });

    assert_eq!(
        wait_for(&mut transfers, |e| matches!(e, TransferEvent::Failed { .. })).await,
        TransferEvent::Failed {
            call_id,
            reason: TransferFailure::Busy,
            status: Some(486),
        }
    );
    assert!(h.stack.ops().contains(&Op::NativeHold(handle.clone(), false)));
    assert!(!h.phone.is_call_on_hold());
    assert_eq!(h.phone.transfer_state(), TransferState::Idle);
    assert!(h.phone.consultation_call().is_none());
    // the failed consultation never owned the sink
    assert_eq!(h.media.stops(), 0);
    assert!(h.media.is_playing(&handle));
}

#[tokio::test(start_paused = true)]
async fn test_complete_before_consultation_answers() {
    let h = connected(PhoneConfig::default()).await;
    established_outbound(&h, "1002").await;
    h.phone.attended_transfer("1003").await.unwrap();

    assert!(matches!(
        h.phone.complete_attended_transfer().await,
        Err(PhoneError::InvalidTransferState { .. })
    ));
    assert_eq!(h.phone.transfer_state(), TransferState::Consulting);
    assert_eq!(h.stack.count(|op| matches!(op, Op::Refer(..))), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_attended_transfer() {
    let h = connected(PhoneConfig::default()).await;
    let (call_id, handle) = established_outbound(&h, "1002").await;
    h.phone.attended_transfer("1003").await.unwrap();
    let consultation = h.stack.last_invite().unwrap().handle;
    let mut transfers = h.phone.subscribe_transfers();

    h.phone.cancel_attended_transfer().await.unwrap();

    assert!(h.stack.ops().contains(&Op::Cancel(consultation)));
    assert!(h.stack.ops().contains(&Op::NativeHold(handle, false)));
    assert!(!h.phone.is_call_on_hold());
    assert_eq!(h.phone.transfer_state(), TransferState::Idle);
    assert_eq!(
        drain(&mut transfers),
        vec![
            TransferEvent::StateChanged {
                call_id,
                from: TransferState::Consulting,
                to: TransferState::Idle,
            },
            TransferEvent::Cancelled { call_id },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_consultation_gives_audio_back() {
    let h = connected(PhoneConfig::default()).await;
    let (_call_id, handle) = established_outbound(&h, "1002").await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(h.media.is_playing(&handle));

    let (_consultation_id, consultation) = consulting(&h).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(h.media.is_playing(&consultation));
    let plays = h.media.plays();

    h.phone.cancel_attended_transfer().await.unwrap();

    assert!(h.phone.consultation_call().is_none());
    assert!(!h.phone.is_call_on_hold());
    assert_eq!(h.media.stops(), 1);
    assert_eq!(h.media.plays(), plays + 1);
    assert!(h.media.is_playing(&handle));
}

#[tokio::test(start_paused = true)]
async fn test_user_hold_survives_cancelled_consultation() {
    let h = connected(PhoneConfig::default()).await;
    established_outbound(&h, "1002").await;
    h.phone.hold_call().await.unwrap();

    h.phone.attended_transfer("1003").await.unwrap();
    h.phone.cancel_attended_transfer().await.unwrap();

    assert_eq!(h.stack.count(|op| matches!(op, Op::NativeHold(_, _))), 1);
    assert!(h.phone.is_call_on_hold());
}

#[tokio::test(start_paused = true)]
async fn test_original_hangup_promotes_consultation() {
    let h = connected(PhoneConfig::default()).await;
    let (call_id, handle) = established_outbound(&h, "1002").await;
    let mut transfers = h.phone.subscribe_transfers();
    let (consultation_id, _consultation) = consulting(&h).await;

    h.stack.emit(StackEvent::RemoteBye { handle });

    assert_eq!(
        wait_for(&mut transfers, |e| matches!(e, TransferEvent::Failed { .. })).await,
        TransferEvent::Failed {
            call_id,
            reason: TransferFailure::Cancelled,
            status: None,
        }
    );
    settle().await;
    let current = h.phone.current_call().unwrap();
    assert_eq!(current.call_id, consultation_id);
    assert!(h.phone.consultation_call().is_none());
    assert_eq!(h.phone.transfer_state(), TransferState::Idle);
}

//! Anrufabläufe zwischen zwei Engines über In-Memory-Signaling

mod utils;

use pulse_call::call_engine::{
    AudioConditionerConfig, CallError, CallEvent, CallFailure, CallRole, CallState, EndReason,
    MediaAcquisitionError, MediaKind, RingDirection, TrackKind,
};
use pulse_call::database::CallRating;
use pulse_call::signaling::{SessionId, SignalingChannel, SignalingMessage, SignalingPayload};
use std::time::Duration;
use utils::*;

fn in_call_count(events: &[CallEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, CallEvent::StateChanged(s) if s.state == CallState::InCall))
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_audio_call_reaches_in_call_once() {
    let (mut alice, mut bob) = spawn_pair(PeerSetup::default(), PeerSetup::default());
    let mut alice_all = alice.handle.subscribe();
    let mut bob_all = bob.handle.subscribe();

    connect(&mut alice, &mut bob).await;
    settle().await;

    assert_eq!(in_call_count(&drain(&mut alice_all)), 1);
    assert_eq!(in_call_count(&drain(&mut bob_all)), 1);

    let a = alice.handle.snapshot();
    let b = bob.handle.snapshot();
    assert_eq!(a.role, Some(CallRole::Caller));
    assert_eq!(b.role, Some(CallRole::Receiver));
    assert_eq!(a.session_id, b.session_id);
    assert_eq!(a.partner_id.as_deref(), Some("bob"));
    assert!(a.media.audio_enabled);
    assert!(a.media.remote_audio);

    assert_eq!(alice.transports.created_count(), 1);
    assert_eq!(bob.transports.created_count(), 1);
    let transport = alice.transports.last().unwrap();
    assert!(transport.tracks().contains(&TrackKind::Audio));
    assert!(transport.remote_candidate_count() >= 1);

    assert_eq!(
        alice.signaling.sent_kinds().iter().filter(|k| **k == "sdp_offer").count(),
        1
    );
    assert_eq!(
        bob.signaling.sent_kinds().iter().filter(|k| **k == "sdp_answer").count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_quality_follows_connection() {
    let (mut alice, mut bob) = spawn_pair(PeerSetup::default(), PeerSetup::default());
    connect(&mut alice, &mut bob).await;
    assert!(alice.handle.snapshot().quality.bars >= 4);

    let event = next_matching(&mut alice.events, |e| matches!(e, CallEvent::Quality(_))).await;
    match event {
        CallEvent::Quality(sample) => {
            assert_eq!(sample.bars, 5);
            assert_eq!(sample.round_trip_time_ms, Some(30.0));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(alice.handle.snapshot().quality.bars, 5);

    alice.handle.end_call().await;
    assert_eq!(alice.handle.snapshot().quality.bars, 0);
}

#[tokio::test(start_paused = true)]
async fn test_end_call_is_idempotent_and_releases_everything() {
    let (mut alice, mut bob) = spawn_pair(PeerSetup::default(), PeerSetup::default());
    connect(&mut alice, &mut bob).await;
    let mut alice_all = alice.handle.subscribe();

    alice.handle.end_call().await;
    alice.handle.end_call().await;

    assert_eq!(
        alice.handle.state(),
        CallState::Ended {
            reason: EndReason::LocalHangup
        }
    );
    let bob_state = wait_for_state(&mut bob, |s| matches!(s, CallState::Ended { .. })).await;
    assert_eq!(
        bob_state.state,
        CallState::Ended {
            reason: EndReason::RemoteHangup { reason: None }
        }
    );

    let finished = drain(&mut alice_all)
        .into_iter()
        .filter(|e| matches!(e, CallEvent::Finished(_)))
        .count();
    assert_eq!(finished, 1);

    assert!(alice.transports.all_closed());
    assert!(bob.transports.all_closed());
    assert_eq!(alice.capture.released(), 1);
    assert_eq!(bob.capture.released(), 1);
    assert_eq!(
        alice.signaling.sent_kinds().iter().filter(|k| **k == "call_end").count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_end_call_without_call_is_noop() {
    let (alice, _bob) = spawn_pair(PeerSetup::default(), PeerSetup::default());
    alice.handle.end_call().await;
    assert_eq!(alice.handle.state(), CallState::Idle);
    assert!(alice.signaling.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reject_never_creates_peer_connection() {
    let (mut alice, mut bob) = spawn_pair(PeerSetup::default(), PeerSetup::default());

    alice.handle.start_call("bob", MediaKind::Audio).await.unwrap();
    let ringing = wait_for_state(&mut bob, |s| {
        *s == CallState::Ringing {
            direction: RingDirection::Incoming,
        }
    })
    .await;
    assert_eq!(ringing.partner_id.as_deref(), Some("alice"));

    bob.handle.reject_call(Some("not now".into())).await.unwrap();

    let ended = wait_for_state(&mut alice, |s| matches!(s, CallState::Ended { .. })).await;
    assert_eq!(
        ended.state,
        CallState::Ended {
            reason: EndReason::RemoteRejected {
                reason: Some("not now".into())
            }
        }
    );
    assert_eq!(
        bob.handle.state(),
        CallState::Ended {
            reason: EndReason::Rejected {
                reason: Some("not now".into())
            }
        }
    );

    assert_eq!(alice.transports.created_count(), 0);
    assert_eq!(bob.transports.created_count(), 0);
    assert_eq!(bob.capture.acquired(), 0);
    assert_eq!(alice.capture.released(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_messages_for_other_sessions_are_ignored() {
    let (mut alice, mut bob) = spawn_pair(PeerSetup::default(), PeerSetup::default());
    connect(&mut alice, &mut bob).await;
    let session = alice.handle.snapshot().session_id.unwrap();

    let strays = vec![
        SignalingMessage::new(
            SessionId::from("bogus-session"),
            "bob",
            "alice",
            SignalingPayload::CallEnd { reason: None },
        ),
        SignalingMessage::new(
            session.clone(),
            "mallory",
            "alice",
            SignalingPayload::CallEnd { reason: None },
        ),
        SignalingMessage::new(
            session.clone(),
            "bob",
            "carol",
            SignalingPayload::CallEnd { reason: None },
        ),
        SignalingMessage::new(
            SessionId::from("bogus-session"),
            "bob",
            "alice",
            SignalingPayload::SdpAnswer {
                sdp: "v=0".into(),
            },
        ),
    ];
    for message in strays {
        alice.inbox.send(message).await.unwrap();
    }
    settle().await;

    assert_eq!(alice.handle.state(), CallState::InCall);
    assert_eq!(alice.handle.snapshot().session_id, Some(session));
}

#[tokio::test(start_paused = true)]
async fn test_third_party_invite_gets_busy() {
    let (mut alice, mut bob) = spawn_pair(PeerSetup::default(), PeerSetup::default());
    connect(&mut alice, &mut bob).await;

    alice
        .inbox
        .send(SignalingMessage::new(
            SessionId::from("carol-session"),
            "carol",
            "alice",
            SignalingPayload::CallInvite {
                media_kind: MediaKind::Audio,
            },
        ))
        .await
        .unwrap();
    settle().await;

    assert_eq!(alice.handle.state(), CallState::InCall);
    let reject = alice
        .signaling
        .sent()
        .into_iter()
        .find(|m| m.to_peer_id == "carol")
        .expect("busy reject sent");
    assert_eq!(reject.session_id, SessionId::from("carol-session"));
    assert_eq!(
        reject.payload,
        SignalingPayload::CallReject {
            reason: Some("busy".into())
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_finished_session_is_not_resurrected() {
    let (mut alice, mut bob) = spawn_pair(PeerSetup::default(), PeerSetup::default());
    connect(&mut alice, &mut bob).await;

    alice.handle.end_call().await;
    wait_for_state(&mut bob, |s| matches!(s, CallState::Ended { .. })).await;

    let invite = alice
        .signaling
        .sent()
        .into_iter()
        .find(|m| matches!(m.payload, SignalingPayload::CallInvite { .. }))
        .unwrap();
    bob.inbox.send(invite).await.unwrap();
    settle().await;

    assert!(matches!(bob.handle.state(), CallState::Ended { .. }));
    assert!(drain(&mut bob.events)
        .iter()
        .all(|e| !matches!(e, CallEvent::IncomingCall { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_glare_resolves_to_single_call() {
    let (mut alice, mut bob) = spawn_pair(PeerSetup::default(), PeerSetup::default());

    let (a, b) = tokio::join!(
        alice.handle.start_call("bob", MediaKind::Audio),
        bob.handle.start_call("alice", MediaKind::Audio),
    );
    assert!(a.is_ok());
    assert!(b.is_ok());

    wait_for_state(&mut alice, |s| *s == CallState::InCall).await;
    wait_for_state(&mut bob, |s| *s == CallState::InCall).await;

    let a = alice.handle.snapshot();
    let b = bob.handle.snapshot();
    assert_eq!(a.role, Some(CallRole::Caller));
    assert_eq!(b.role, Some(CallRole::Receiver));
    assert_eq!(a.session_id, b.session_id);
    assert_eq!(alice.transports.created_count(), 1);
    assert_eq!(bob.transports.created_count(), 1);
    assert_eq!(bob.capture.acquired(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_glare_with_different_media_reacquires() {
    let (mut alice, mut bob) = spawn_pair(PeerSetup::default(), PeerSetup::default());

    let (a, b) = tokio::join!(
        alice.handle.start_call("bob", MediaKind::Video),
        bob.handle.start_call("alice", MediaKind::Audio),
    );
    assert!(a.is_ok());
    assert!(b.is_ok());

    wait_for_state(&mut alice, |s| *s == CallState::InCall).await;
    wait_for_state(&mut bob, |s| *s == CallState::InCall).await;

    let b = bob.handle.snapshot();
    assert_eq!(b.role, Some(CallRole::Receiver));
    assert_eq!(b.media_kind, Some(MediaKind::Video));
    assert!(b.media.video_enabled);

    // Audio-Stream der verworfenen Session freigegeben, Video neu aufgenommen
    assert_eq!(bob.capture.acquired(), 2);
    assert_eq!(bob.capture.released(), 1);

    let tracks = bob.transports.last().unwrap().tracks();
    assert!(tracks.contains(&TrackKind::Audio));
    assert!(tracks.contains(&TrackKind::Video));
    assert_eq!(bob.handle.toggle_camera().await, Ok(false));
}

#[tokio::test(start_paused = true)]
async fn test_glare_with_different_media_fails_when_capture_denied() {
    let (mut alice, mut bob) = spawn_pair(
        PeerSetup::default(),
        PeerSetup {
            capture: CaptureBehavior::GrantOnce,
            ..Default::default()
        },
    );

    let (a, b) = tokio::join!(
        alice.handle.start_call("bob", MediaKind::Video),
        bob.handle.start_call("alice", MediaKind::Audio),
    );
    assert!(a.is_ok());
    assert!(b.is_ok());

    let ended = wait_for_state(&mut bob, |s| matches!(s, CallState::Ended { .. })).await;
    assert!(matches!(
        ended.state,
        CallState::Ended {
            reason: EndReason::Failed {
                failure: CallFailure::MediaAcquisition { .. }
            }
        }
    ));
    assert_eq!(ended.media_kind, Some(MediaKind::Video));
    assert_eq!(bob.capture.released(), 1);
    assert_eq!(bob.transports.created_count(), 0);

    let ended = wait_for_state(&mut alice, |s| matches!(s, CallState::Ended { .. })).await;
    assert_eq!(
        ended.state,
        CallState::Ended {
            reason: EndReason::RemoteHangup {
                reason: Some("media_acquisition".into())
            }
        }
    );
    assert_eq!(alice.capture.released(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_media_denied_returns_to_idle() {
    let (alice, bob) = spawn_pair(
        PeerSetup {
            capture: CaptureBehavior::Deny,
            ..Default::default()
        },
        PeerSetup::default(),
    );

    let result = alice.handle.start_call("bob", MediaKind::Audio).await;
    assert_eq!(
        result,
        Err(CallError::MediaAcquisition(
            MediaAcquisitionError::PermissionDenied
        ))
    );
    assert_eq!(alice.handle.state(), CallState::Idle);

    settle().await;
    assert_eq!(bob.handle.state(), CallState::Idle);
    assert!(alice.signaling.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_hangup_during_media_acquisition() {
    let (alice, bob) = spawn_pair(
        PeerSetup {
            capture: CaptureBehavior::Hang,
            ..Default::default()
        },
        PeerSetup::default(),
    );

    let handle = alice.handle.clone();
    let start = tokio::spawn(async move { handle.start_call("bob", MediaKind::Audio).await });
    settle().await;

    alice.handle.end_call().await;
    assert_eq!(start.await.unwrap(), Err(CallError::Cancelled));
    assert_eq!(
        alice.handle.state(),
        CallState::Ended {
            reason: EndReason::LocalHangup
        }
    );
    assert!(alice.signaling.sent().is_empty());
    assert_eq!(bob.handle.state(), CallState::Idle);

    // Engine bleibt danach benutzbar
    assert_eq!(alice.handle.toggle_mic().await, Err(CallError::NoActiveCall));
}

#[tokio::test(start_paused = true)]
async fn test_hangup_while_accepting() {
    let (mut alice, mut bob) = spawn_pair(
        PeerSetup::default(),
        PeerSetup {
            capture: CaptureBehavior::Hang,
            ..Default::default()
        },
    );

    alice.handle.start_call("bob", MediaKind::Audio).await.unwrap();
    next_matching(&mut bob.events, |e| matches!(e, CallEvent::IncomingCall { .. })).await;

    let handle = bob.handle.clone();
    let accept = tokio::spawn(async move { handle.accept_call().await });
    settle().await;

    bob.handle.end_call().await;
    assert_eq!(accept.await.unwrap(), Err(CallError::Cancelled));
    assert_eq!(bob.transports.created_count(), 0);

    let ended = wait_for_state(&mut alice, |s| matches!(s, CallState::Ended { .. })).await;
    assert_eq!(
        ended.state,
        CallState::Ended {
            reason: EndReason::RemoteHangup { reason: None }
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_times_out() {
    let mut patient = PeerSetup::default();
    patient.config.ring_timeout_ms = 120_000;
    let (mut alice, mut bob) = spawn_pair(PeerSetup::default(), patient);

    alice.handle.start_call("bob", MediaKind::Audio).await.unwrap();
    let ended = wait_for_state(&mut alice, |s| matches!(s, CallState::Ended { .. })).await;
    assert_eq!(
        ended.state,
        CallState::Ended {
            reason: EndReason::RingTimeout
        }
    );

    let ended = wait_for_state(&mut bob, |s| matches!(s, CallState::Ended { .. })).await;
    assert_eq!(
        ended.state,
        CallState::Ended {
            reason: EndReason::RemoteHangup {
                reason: Some("timeout".into())
            }
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_negotiation_timeout_fails_call() {
    let mut slow = PeerSetup {
        ice: IceOutcome::Silent,
        ..Default::default()
    };
    slow.config.negotiation_timeout_ms = 60_000;
    let (mut alice, mut bob) = spawn_pair(
        PeerSetup {
            ice: IceOutcome::Silent,
            ..Default::default()
        },
        slow,
    );

    alice.handle.start_call("bob", MediaKind::Audio).await.unwrap();
    next_matching(&mut bob.events, |e| matches!(e, CallEvent::IncomingCall { .. })).await;
    bob.handle.accept_call().await.unwrap();

    next_matching(&mut alice.events, |e| {
        matches!(e, CallEvent::Error(CallError::NegotiationTimeout))
    })
    .await;
    assert!(matches!(
        alice.handle.state(),
        CallState::Ended {
            reason: EndReason::Failed { .. }
        }
    ));

    let ended = wait_for_state(&mut bob, |s| matches!(s, CallState::Ended { .. })).await;
    assert_eq!(
        ended.state,
        CallState::Ended {
            reason: EndReason::RemoteHangup {
                reason: Some("negotiation_timeout".into())
            }
        }
    );
    assert!(alice.transports.all_closed());
}

#[tokio::test(start_paused = true)]
async fn test_ice_failure_ends_call() {
    let (mut alice, mut bob) = spawn_pair(
        PeerSetup {
            ice: IceOutcome::Fail,
            ..Default::default()
        },
        PeerSetup::default(),
    );

    alice.handle.start_call("bob", MediaKind::Audio).await.unwrap();
    next_matching(&mut bob.events, |e| matches!(e, CallEvent::IncomingCall { .. })).await;
    bob.handle.accept_call().await.unwrap();

    next_matching(&mut alice.events, |e| {
        matches!(e, CallEvent::Error(CallError::ConnectivityFailure))
    })
    .await;
    wait_for_state(&mut bob, |s| matches!(s, CallState::Ended { .. })).await;
    assert_eq!(alice.capture.released(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_candidate_delivery_failure_is_reported_not_fatal() {
    let (mut alice, mut bob) = spawn_pair(PeerSetup::default(), PeerSetup::default());
    alice.signaling.fail_kind("ice_candidate");
    let mut alice_all = alice.handle.subscribe();

    connect(&mut alice, &mut bob).await;
    settle().await;

    assert!(drain(&mut alice_all)
        .iter()
        .any(|e| matches!(e, CallEvent::Error(CallError::SignalingDelivery(_)))));
    assert_eq!(alice.handle.state(), CallState::InCall);
}

#[tokio::test(start_paused = true)]
async fn test_toggle_mic_and_camera() {
    let (mut alice, mut bob) = spawn_pair(PeerSetup::default(), PeerSetup::default());
    assert_eq!(alice.handle.toggle_mic().await, Err(CallError::NoActiveCall));

    connect(&mut alice, &mut bob).await;

    assert_eq!(alice.handle.toggle_mic().await, Ok(false));
    assert!(!alice.handle.snapshot().media.audio_enabled);
    next_matching(&mut alice.events, |e| {
        matches!(e, CallEvent::MediaChanged(flags) if !flags.audio_enabled)
    })
    .await;

    assert_eq!(alice.handle.toggle_mic().await, Ok(true));
    assert!(alice.handle.snapshot().media.audio_enabled);

    assert!(matches!(
        alice.handle.toggle_camera().await,
        Err(CallError::InvalidState(_))
    ));
    assert_eq!(alice.handle.state(), CallState::InCall);
}

#[tokio::test(start_paused = true)]
async fn test_video_call_sends_both_tracks() {
    let (mut alice, mut bob) = spawn_pair(PeerSetup::default(), PeerSetup::default());

    alice.handle.start_call("bob", MediaKind::Video).await.unwrap();
    next_matching(&mut bob.events, |e| {
        matches!(e, CallEvent::IncomingCall { media_kind: MediaKind::Video, .. })
    })
    .await;
    bob.handle.accept_call().await.unwrap();
    wait_for_state(&mut alice, |s| *s == CallState::InCall).await;

    let tracks = alice.transports.last().unwrap().tracks();
    assert!(tracks.contains(&TrackKind::Audio));
    assert!(tracks.contains(&TrackKind::Video));

    assert_eq!(alice.handle.toggle_camera().await, Ok(false));
    assert!(!alice.handle.snapshot().media.video_enabled);
}

#[tokio::test(start_paused = true)]
async fn test_conditioner_restart_replaces_track() {
    let (mut alice, mut bob) = spawn_pair(PeerSetup::default(), PeerSetup::default());
    connect(&mut alice, &mut bob).await;

    alice
        .handle
        .restart_conditioner(AudioConditionerConfig::with_threshold(0.05))
        .await
        .unwrap();
    settle().await;

    assert_eq!(alice.handle.state(), CallState::InCall);
    assert_eq!(
        alice.signaling.sent_kinds().iter().filter(|k| **k == "sdp_offer").count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_finished_call_can_be_rated() {
    let (mut alice, mut bob) = spawn_pair(PeerSetup::default(), PeerSetup::default());
    connect(&mut alice, &mut bob).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    alice.handle.end_call().await;
    let summary = match next_matching(&mut alice.events, |e| matches!(e, CallEvent::Finished(_))).await {
        CallEvent::Finished(summary) => summary,
        other => panic!("unexpected event {:?}", other),
    };
    assert!(summary.was_connected);
    assert_eq!(summary.partner_id, "bob");
    assert!(summary.duration_seconds >= 5);

    let record = alice.log.get(&summary.call_id).unwrap().unwrap();
    assert!(record.was_connected);

    alice
        .log
        .submit_rating(&CallRating {
            call_id: summary.call_id.clone(),
            partner_id: summary.partner_id.clone(),
            stars: 5,
            comment: None,
            duration_seconds: summary.duration_seconds,
        })
        .unwrap();
    assert_eq!(alice.log.get(&summary.call_id).unwrap().unwrap().stars, Some(5));

    wait_for_state(&mut bob, |s| matches!(s, CallState::Ended { .. })).await;
    let bob_record = bob.log.get(&summary.call_id).unwrap().unwrap();
    assert_eq!(bob_record.role, CallRole::Receiver);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_all_handles_hangs_up() {
    let (mut alice, mut bob) = spawn_pair(PeerSetup::default(), PeerSetup::default());
    connect(&mut alice, &mut bob).await;

    let alice_transports = alice.transports.clone();
    drop(alice);

    let ended = wait_for_state(&mut bob, |s| matches!(s, CallState::Ended { .. })).await;
    assert_eq!(
        ended.state,
        CallState::Ended {
            reason: EndReason::RemoteHangup { reason: None }
        }
    );
    assert!(alice_transports.all_closed());
}

fn finished_count(events: &[CallEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, CallEvent::Finished(_)))
        .count()
}

/// Zweimal auflegen, Gegenseite sieht genau ein `RemoteHangup`
async fn hang_up_twice(local: &mut TestPeer, remote: &mut TestPeer) {
    let mut local_all = local.handle.subscribe();

    local.handle.end_call().await;
    local.handle.end_call().await;

    assert_eq!(
        local.handle.state(),
        CallState::Ended {
            reason: EndReason::LocalHangup
        }
    );
    let ended = wait_for_state(remote, |s| matches!(s, CallState::Ended { .. })).await;
    assert_eq!(
        ended.state,
        CallState::Ended {
            reason: EndReason::RemoteHangup { reason: None }
        }
    );
    settle().await;

    assert_eq!(finished_count(&drain(&mut local_all)), 1);
    assert_eq!(
        local.signaling.sent_kinds().iter().filter(|k| **k == "call_end").count(),
        1
    );
    assert!(local.transports.all_closed());
    assert!(remote.transports.all_closed());
    assert_eq!(local.capture.released(), local.capture.acquired());
    assert_eq!(remote.capture.released(), remote.capture.acquired());
}

#[tokio::test(start_paused = true)]
async fn test_end_call_while_ringing_outgoing() {
    let (mut alice, mut bob) = spawn_pair(PeerSetup::default(), PeerSetup::default());

    alice.handle.start_call("bob", MediaKind::Audio).await.unwrap();
    next_matching(&mut bob.events, |e| matches!(e, CallEvent::IncomingCall { .. })).await;
    assert_eq!(
        alice.handle.state(),
        CallState::Ringing {
            direction: RingDirection::Outgoing
        }
    );

    hang_up_twice(&mut alice, &mut bob).await;
    assert_eq!(alice.capture.released(), 1);
    assert_eq!(bob.capture.acquired(), 0);
    assert_eq!(alice.transports.created_count(), 0);
    assert_eq!(bob.transports.created_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_end_call_while_ringing_incoming() {
    let (mut alice, mut bob) = spawn_pair(PeerSetup::default(), PeerSetup::default());

    alice.handle.start_call("bob", MediaKind::Audio).await.unwrap();
    wait_for_state(&mut bob, |s| {
        *s == CallState::Ringing {
            direction: RingDirection::Incoming,
        }
    })
    .await;

    hang_up_twice(&mut bob, &mut alice).await;
    assert_eq!(bob.capture.acquired(), 0);
    assert_eq!(alice.capture.released(), 1);
    assert_eq!(alice.transports.created_count(), 0);
    assert_eq!(bob.transports.created_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_end_call_while_connecting() {
    let stalled = || PeerSetup {
        ice: IceOutcome::Silent,
        ..Default::default()
    };
    let (mut alice, mut bob) = spawn_pair(stalled(), stalled());

    alice.handle.start_call("bob", MediaKind::Audio).await.unwrap();
    next_matching(&mut bob.events, |e| matches!(e, CallEvent::IncomingCall { .. })).await;
    bob.handle.accept_call().await.unwrap();
    assert_eq!(bob.handle.state(), CallState::Connecting);
    wait_for_state(&mut alice, |s| *s == CallState::Connecting).await;
    settle().await;

    hang_up_twice(&mut bob, &mut alice).await;
    assert_eq!(alice.transports.created_count(), 1);
    assert_eq!(bob.transports.created_count(), 1);
    assert_eq!(alice.capture.released(), 1);
    assert_eq!(bob.capture.released(), 1);
}

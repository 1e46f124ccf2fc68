mod common;

use std::time::Duration;

use common::Harness;
use room_signaling::controller::{Command, ControllerEvent, SessionController};
use room_signaling::negotiation::{NegotiationState, DEFAULT_RENEGOTIATION_TIMEOUT};
use room_signaling::signaling::{ClientMessage, ServerMessage, SessionDescription};
use room_signaling::testing::FakeBackend;
use room_signaling::Error;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

const A: usize = 0;
const B: usize = 1;

async fn joined_pair() -> Harness {
    let mut h = Harness::new();
    h.add_peer("a");
    h.add_peer("b");
    h.join(A, "r1").await;
    h.join(B, "r1").await;
    h
}

async fn established_pair() -> Harness {
    let mut h = joined_pair().await;
    h.command(A, Command::Call).await.unwrap();
    h.settle().await;
    h
}

#[tokio::test]
async fn join_call_answer_scenario() {
    let mut h = Harness::new();
    h.add_peer("a");
    h.add_peer("b");

    h.join(A, "r1").await;
    assert_eq!(h.peer(A).received, vec![ServerMessage::Joined { room_id: "r1".into() }]);

    h.join(B, "r1").await;
    assert_eq!(
        h.peer(A).received_of("member-joined"),
        vec![&ServerMessage::MemberJoined {
            connection_id: 2,
            display_token: Some("1@example.com".into()),
        }]
    );
    assert_eq!(h.peer(B).received, vec![ServerMessage::Joined { room_id: "r1".into() }]);
    assert_eq!(h.peer(A).controller.remote_member(), Some(2));

    h.command(A, Command::Call).await.unwrap();
    assert_eq!(h.peer(A).controller.negotiation_state(), Some(NegotiationState::OfferPending));

    h.flush(A);
    let o1 = SessionDescription::offer("a1-offer-1").to_value().unwrap();
    assert_eq!(h.peer(A).sent_of("call-offer"), vec![&ClientMessage::CallOffer { to: 2, offer: o1.clone() }]);

    h.receive(B).await;
    assert_eq!(h.peer(B).received_of("call-offer"), vec![&ServerMessage::CallOffer { from: 1, offer: o1 }]);
    assert_eq!(h.peer(B).controller.negotiation_state(), Some(NegotiationState::Stable));
    assert_eq!(h.peer(B).controller.remote_member(), Some(1));

    h.flush(B);
    let an1 = SessionDescription::answer("b1-answer-1").to_value().unwrap();
    assert_eq!(h.peer(B).sent_of("call-answer"), vec![&ClientMessage::CallAnswer { to: 1, answer: an1 }]);

    h.receive(A).await;
    assert_eq!(h.peer(A).controller.negotiation_state(), Some(NegotiationState::Stable));

    h.settle().await;
    assert_eq!(h.peer(A).controller.negotiation_state(), Some(NegotiationState::Stable));
    assert_eq!(h.peer(B).controller.negotiation_state(), Some(NegotiationState::Stable));
    assert!(h.peer(A).controller.monitor().current().connected);
    assert!(h.peer(B).controller.monitor().current().connected);

    let members: Vec<_> = h.relay.rooms().room("r1").unwrap().members().iter().map(|m| m.id).collect();
    assert_eq!(members, vec![1, 2]);
    assert!(h.peer(A).errors.is_empty());
    assert!(h.peer(B).errors.is_empty());
}

#[tokio::test]
async fn initiator_sends_media_once_after_answer() {
    let mut h = established_pair().await;

    assert_eq!(h.peer(A).engine().tracks(), vec!["a-audio".to_string(), "a-video".to_string()]);
    // Two added tracks raise two triggers; only one renegotiation goes out.
    assert_eq!(h.peer(A).sent_of("renegotiation-offer").len(), 1);
    assert_eq!(h.peer(B).sent_of("renegotiation-answer").len(), 1);
    assert!(!h.peer(A).controller.is_renegotiating());

    h.command(A, Command::SendMedia).await.unwrap();
    h.settle().await;
    assert_eq!(h.peer(A).engine().tracks().len(), 2);
    assert_eq!(h.peer(A).sent_of("renegotiation-offer").len(), 1);
}

#[tokio::test]
async fn responder_sends_media_on_request() {
    let mut h = established_pair().await;
    assert!(h.peer(B).engine().tracks().is_empty());

    h.command(B, Command::SendMedia).await.unwrap();
    h.settle().await;
    assert_eq!(h.peer(B).engine().tracks().len(), 2);
    assert_eq!(h.peer(B).sent_of("renegotiation-offer").len(), 1);
    assert_eq!(h.peer(A).controller.negotiation_state(), Some(NegotiationState::Stable));
    assert_eq!(h.peer(B).controller.negotiation_state(), Some(NegotiationState::Stable));
}

#[tokio::test]
async fn duplicate_call_answer_is_ignored() {
    let mut h = established_pair().await;
    let engine = h.peer(A).engine();
    let remote_before = engine.remote_description();

    let result = h
        .peer(A)
        .controller
        .handle_server_message(ServerMessage::CallAnswer {
            from: 2,
            answer: json!({"type": "answer", "sdp": "duplicate"}),
        })
        .await;
    assert!(result.is_ok());
    assert_eq!(h.peer(A).controller.negotiation_state(), Some(NegotiationState::Stable));
    assert_eq!(engine.remote_description(), remote_before);
}

#[tokio::test]
async fn rapid_renegotiation_triggers_produce_one_offer() {
    let mut h = established_pair().await;
    let before = h.peer(A).sent_of("renegotiation-offer").len();

    let engine = h.peer(A).engine();
    engine.fire_negotiation_needed();
    engine.fire_negotiation_needed();
    h.pump_engine(A).await;
    h.flush(A);
    assert_eq!(h.peer(A).sent_of("renegotiation-offer").len(), before + 1);
    assert!(h.peer(A).controller.is_renegotiating());

    h.settle().await;
    assert!(!h.peer(A).controller.is_renegotiating());

    engine.fire_negotiation_needed();
    h.settle().await;
    assert_eq!(h.peer(A).sent_of("renegotiation-offer").len(), before + 2);
}

#[tokio::test]
async fn renegotiation_leaves_connected_indicator_alone() {
    let mut h = established_pair().await;
    h.peer(A).take_events();
    h.peer(B).take_events();

    h.peer(B).engine().fire_negotiation_needed();
    h.settle().await;

    for index in [A, B] {
        let established = h
            .peer(index)
            .take_events()
            .into_iter()
            .filter(|e| matches!(e, ControllerEvent::CallEstablished { .. }))
            .count();
        assert_eq!(established, 0);
        assert!(h.peer(index).controller.monitor().current().connected);
    }
}

#[tokio::test]
async fn failed_renegotiation_keeps_established_call() {
    tokio::time::pause();
    let mut h = established_pair().await;
    h.peer(B).engine().fail_next("create_answer");

    h.peer(A).engine().fire_negotiation_needed();
    h.settle().await;

    assert_eq!(h.peer(B).errors.len(), 1);
    assert_eq!(h.peer(B).controller.negotiation_state(), Some(NegotiationState::Stable));
    assert!(h.peer(B).controller.monitor().current().connected);
    assert!(!h.peer(B).engine().is_closed());

    // The unanswered offer blocks new ones only until it times out.
    let offers = h.peer(A).sent_of("renegotiation-offer").len();
    assert!(h.peer(A).controller.is_renegotiating());
    h.peer(A).engine().fire_negotiation_needed();
    h.settle().await;
    assert_eq!(h.peer(A).sent_of("renegotiation-offer").len(), offers);

    tokio::time::advance(DEFAULT_RENEGOTIATION_TIMEOUT + Duration::from_secs(1)).await;
    h.peer(A).engine().fire_negotiation_needed();
    h.settle().await;
    assert_eq!(h.peer(A).sent_of("renegotiation-offer").len(), offers + 1);
    assert!(!h.peer(A).controller.is_renegotiating());
    assert_eq!(h.peer(A).controller.negotiation_state(), Some(NegotiationState::Stable));
    assert_eq!(h.peer(B).errors.len(), 1);
}

#[tokio::test]
async fn member_left_tears_down_session_and_track() {
    let mut h = established_pair().await;
    let engine = h.peer(A).engine();
    engine.fire_track("b-audio");
    h.settle().await;
    assert!(h
        .peer(A)
        .take_events()
        .iter()
        .any(|e| matches!(e, ControllerEvent::RemoteTrack { from: 2, track } if track == "b-audio")));

    h.disconnect(B);
    h.settle().await;

    assert_eq!(h.peer(A).received_of("member-left").len(), 1);
    let events = h.peer(A).take_events();
    assert!(events.iter().any(|e| matches!(e, ControllerEvent::RemoteTrackCleared { from: 2 })));
    assert!(events.iter().any(|e| matches!(e, ControllerEvent::MemberLeft { connection_id: 2 })));

    assert_eq!(h.peer(A).controller.negotiation_state(), None);
    assert_eq!(h.peer(A).controller.remote_member(), None);
    assert!(engine.is_closed());
    let status = h.peer(A).controller.monitor().current();
    assert!(!status.connected);
    assert_eq!(status.remote_member, None);

    let members: Vec<_> = h.relay.rooms().room("r1").unwrap().members().iter().map(|m| m.id).collect();
    assert_eq!(members, vec![1]);
}

#[tokio::test]
async fn late_messages_after_teardown_are_dropped() {
    let mut h = established_pair().await;
    h.disconnect(B);
    h.settle().await;

    let controller = &mut h.peer(A).controller;
    controller
        .handle_server_message(ServerMessage::CallAnswer {
            from: 2,
            answer: json!({"type": "answer", "sdp": "late"}),
        })
        .await
        .unwrap();
    controller
        .handle_server_message(ServerMessage::RenegotiationOffer {
            from: 2,
            offer: json!({"type": "offer", "sdp": "late"}),
        })
        .await
        .unwrap();
    assert_eq!(controller.negotiation_state(), None);
    assert_eq!(h.peer(A).backend.engines().len(), 1);
}

#[tokio::test]
async fn media_failure_aborts_call_without_signaling() {
    let mut h = joined_pair().await;
    h.peer(A).backend.deny_media("camera permission denied");

    h.command(A, Command::Call).await.unwrap();
    h.settle().await;

    assert!(h.peer(A).sent_of("call-offer").is_empty());
    assert!(h.peer(B).received_of("call-offer").is_empty());
    assert_eq!(h.peer(A).controller.negotiation_state(), None);
    assert!(h.peer(A).take_events().iter().any(|e| matches!(
        e,
        ControllerEvent::MediaAcquisitionFailed { reason } if reason == "camera permission denied"
    )));
}

#[tokio::test]
async fn media_failure_on_responder_sends_no_answer() {
    let mut h = joined_pair().await;
    h.peer(B).backend.deny_media("no device");

    h.command(A, Command::Call).await.unwrap();
    h.settle().await;

    assert!(h.peer(B).sent_of("call-answer").is_empty());
    assert_eq!(h.peer(A).controller.negotiation_state(), Some(NegotiationState::OfferPending));
}

#[tokio::test]
async fn local_media_is_acquired_once() {
    let mut h = established_pair().await;
    assert_eq!(h.peer(A).backend.acquisitions(), 1);
    assert_eq!(h.peer(B).backend.acquisitions(), 1);

    h.command(B, Command::Call).await.unwrap_err();
    assert_eq!(h.peer(B).backend.acquisitions(), 1);
}

#[tokio::test]
async fn call_without_remote_member_fails() {
    let mut h = Harness::new();
    h.add_peer("a");
    h.join(A, "alone").await;

    let err = h.command(A, Command::Call).await.unwrap_err();
    assert!(matches!(err, Error::NoRemoteMember));
    assert!(h.peer(A).sent.iter().all(|m| !matches!(m, ClientMessage::CallOffer { .. })));
}

#[tokio::test]
async fn third_peer_is_told_room_is_full() {
    let mut h = established_pair().await;
    let c = h.add_peer("c");
    h.join(c, "r1").await;

    assert!(h.peer(c).take_events().iter().any(|e| matches!(e, ControllerEvent::RoomFull { room_id } if room_id == "r1")));
    assert!(h.peer(A).received_of("member-joined").len() == 1);
    assert_eq!(h.peer(A).controller.negotiation_state(), Some(NegotiationState::Stable));
    assert_eq!(h.relay.rooms().room("r1").unwrap().members().len(), 2);
}

#[tokio::test]
async fn leave_command_ends_call_for_both_sides() {
    let mut h = established_pair().await;
    h.command(A, Command::Leave).await.unwrap();
    h.settle().await;

    assert_eq!(h.peer(A).controller.negotiation_state(), None);
    assert_eq!(h.peer(A).controller.monitor().current().room_id, None);
    assert_eq!(h.peer(B).controller.negotiation_state(), None);
    assert!(h.peer(B).take_events().iter().any(|e| matches!(e, ControllerEvent::MemberLeft { connection_id: 1 })));
}

#[tokio::test]
async fn repeated_offer_restarts_responder_negotiation() {
    let mut h = established_pair().await;

    h.peer(B)
        .controller
        .handle_server_message(ServerMessage::CallOffer {
            from: 1,
            offer: json!({"type": "offer", "sdp": "fresh"}),
        })
        .await
        .unwrap();
    assert_eq!(h.peer(B).controller.negotiation_state(), Some(NegotiationState::Stable));
    assert_eq!(h.peer(B).engine().remote_description(), Some(SessionDescription::offer("fresh")));
    assert_eq!(h.peer(B).backend.engines().len(), 1);
}

#[tokio::test]
async fn malformed_description_is_reported_not_applied() {
    let mut h = joined_pair().await;
    let result = h
        .peer(B)
        .controller
        .handle_server_message(ServerMessage::CallOffer { from: 1, offer: json!({"sdp": 5}) })
        .await;
    assert!(matches!(result, Err(Error::Json(_))));
    assert_eq!(h.peer(B).controller.negotiation_state(), None);
}

#[tokio::test]
async fn switching_rooms_ends_the_call() {
    let mut h = established_pair().await;
    let engine = h.peer(A).engine();

    h.join(A, "r2").await;

    assert_eq!(h.peer(A).controller.negotiation_state(), None);
    assert_eq!(h.peer(A).controller.remote_member(), None);
    assert!(engine.is_closed());
    let status = h.peer(A).controller.monitor().current();
    assert_eq!(status.room_id.as_deref(), Some("r2"));
    assert!(!status.connected);

    assert_eq!(h.peer(B).controller.negotiation_state(), None);
    assert!(h.peer(B).take_events().iter().any(|e| matches!(e, ControllerEvent::MemberLeft { connection_id: 1 })));
}

#[tokio::test]
async fn rejected_room_switch_keeps_the_call() {
    let mut h = established_pair().await;
    let c = h.add_peer("c");
    let d = h.add_peer("d");
    h.join(c, "r2").await;
    h.join(d, "r2").await;

    h.join(A, "r2").await;

    assert!(h.peer(A).take_events().iter().any(|e| matches!(e, ControllerEvent::RoomFull { .. })));
    assert_eq!(h.peer(A).controller.negotiation_state(), Some(NegotiationState::Stable));
    assert_eq!(h.peer(A).controller.remote_member(), Some(2));
    assert!(h.peer(A).controller.monitor().current().connected);
    assert_eq!(h.peer(A).controller.monitor().current().room_id.as_deref(), Some("r1"));
}

#[tokio::test]
async fn member_left_discards_answer_still_gathering() {
    let backend = FakeBackend::new("b");
    let gate = backend.hold_next("set_local_description");
    let (outbound, mut sent) = mpsc::channel(16);
    let (controller, _events) = SessionController::new(backend.clone(), outbound);
    let monitor = controller.monitor().clone();
    let (incoming, incoming_rx) = mpsc::channel(16);
    let (commands, commands_rx) = mpsc::channel(16);
    let task = tokio::spawn(controller.run(incoming_rx, commands_rx));

    incoming
        .send(ServerMessage::CallOffer {
            from: 1,
            offer: json!({"type": "offer", "sdp": "o1"}),
        })
        .await
        .unwrap();
    let engine = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(engine) = backend.last_engine().filter(|e| e.calls().contains(&"create_answer")) {
                break engine;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("answer never started");

    incoming.send(ServerMessage::MemberLeft { connection_id: 1 }).await.unwrap();
    timeout(Duration::from_secs(5), async {
        while !engine.is_closed() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session was not torn down");
    gate.notify_one();

    commands.send(Command::Shutdown).await.unwrap();
    task.await.unwrap();

    assert!(sent.try_recv().is_err());
    assert!(!engine.calls().contains(&"set_local_description"));
    let status = monitor.current();
    assert_eq!(status.negotiation, None);
    assert_eq!(status.remote_member, None);
    assert!(!status.connected);
}

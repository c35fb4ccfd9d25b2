//! End-to-end routing through the in-memory broker.

mod common;

use std::time::Duration;

use iris_broker::MemoryBroker;
use iris_client::{ClientError, Outcome};
use serde_json::json;

use common::*;

fn sentences(outcome: &Outcome) -> Vec<String> {
    match outcome {
        Outcome::Response(reply) => reply.sentences().iter().map(|s| s.to_string()).collect(),
        other => panic!("expected a response, got {other:?}"),
    }
}

// ── Routing ──

#[tokio::test]
async fn interleaved_replies_reach_their_own_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let h = connect(&broker, dir.path(), "iris_a", 5_000).await;
    let alice = register(&h.client, "alice");
    let bob = register(&h.client, "bob");

    let alice_call = tokio::spawn({
        let client = h.client.clone();
        let alice = alice.clone();
        async move { client.send_utterance(&alice, "hi from alice", None).await }
    });
    let bob_call = tokio::spawn({
        let client = h.client.clone();
        let bob = bob.clone();
        async move { client.send_utterance(&bob, "hi from bob", None).await }
    });

    let sent = wait_for_requests(&broker, 2).await;
    let to_alice = reply_to(request_from(&sent, "alice"), "klat.response", completion("for alice"));
    let to_bob = reply_to(request_from(&sent, "bob"), "klat.response", completion("for bob"));
    broker.inject("iris_a", to_bob);
    broker.inject("iris_a", to_alice);

    assert_eq!(sentences(&alice_call.await.unwrap().unwrap()), vec!["for alice"]);
    assert_eq!(sentences(&bob_call.await.unwrap().unwrap()), vec!["for bob"]);
}

#[tokio::test]
async fn multi_language_reply_keeps_wire_order() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let h = connect(&broker, dir.path(), "iris_a", 5_000).await;
    let alice = register(&h.client, "alice");

    let call = tokio::spawn({
        let client = h.client.clone();
        let alice = alice.clone();
        async move { client.send_utterance(&alice, "hello", None).await }
    });
    let sent = wait_for_requests(&broker, 1).await;
    let data: serde_json::Value = serde_json::from_str(
        r#"{"responses": {"en-us": {"sentence": "Hello"}, "de-de": {"sentence": "Hallo"}}}"#,
    )
    .unwrap();
    broker.inject("iris_a", reply_to(request_from(&sent, "alice"), "klat.response", data));

    let outcome = call.await.unwrap().unwrap();
    assert_eq!(sentences(&outcome), vec!["Hello", "Hallo"]);
    let Outcome::Response(reply) = outcome else {
        unreachable!()
    };
    let langs: Vec<&str> = reply.responses.iter().map(|r| r.lang.as_str()).collect();
    assert_eq!(langs, vec!["en-us", "de-de"]);
}

#[tokio::test]
async fn two_clients_on_one_broker_do_not_cross_talk() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let responder = responder(&broker).await;
    let first = connect(&broker, &dir.path().join("a"), "iris_a", 5_000).await;
    let second = connect(&broker, &dir.path().join("b"), "iris_b", 5_000).await;
    let s1 = register(&first.client, "user");
    let s2 = register(&second.client, "user");

    let (a, b) = tokio::join!(
        first.client.send_utterance(&s1, "apples", None),
        second.client.send_utterance(&s2, "pears", None),
    );
    assert_eq!(sentences(&a.unwrap()), vec!["You said: apples"]);
    assert_eq!(sentences(&b.unwrap()), vec!["You said: pears"]);
    assert_eq!(first.handler.events(), vec!["completion:user:You said: apples"]);
    assert_eq!(second.handler.events(), vec!["completion:user:You said: pears"]);
    responder.stop().await;
}

#[tokio::test]
async fn reply_for_another_identity_is_not_delivered() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let h = connect(&broker, dir.path(), "iris_a", 300).await;
    let alice = register(&h.client, "alice");

    let call = tokio::spawn({
        let client = h.client.clone();
        async move { client.send_utterance(&alice, "hello", None).await }
    });
    let sent = wait_for_requests(&broker, 1).await;
    let mut foreign = sent[0].clone();
    foreign.context.routing.as_mut().unwrap().routing_key = "iris_other".into();
    broker.inject("iris_a", reply_to(&foreign, "klat.response", completion("not yours")));

    assert!(call.await.unwrap().unwrap().is_timeout());
    assert!(h.handler.events().is_empty());
}

// ── Timeouts and stale replies ──

#[tokio::test]
async fn timed_out_session_accepts_the_next_request() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let h = connect(&broker, dir.path(), "iris_a", 200).await;
    let alice = register(&h.client, "alice");

    let first = h.client.send_utterance(&alice, "anyone there", None).await.unwrap();
    assert_eq!(
        first,
        Outcome::TimedOut {
            after: Duration::from_millis(200)
        }
    );
    assert!(!h.client.sessions().get(&alice).unwrap().awaiting);

    let responder = responder(&broker).await;
    let second = h.client.send_utterance(&alice, "now?", None).await.unwrap();
    assert_eq!(sentences(&second), vec!["You said: now?"]);
    responder.stop().await;
}

#[tokio::test]
async fn late_reply_does_not_complete_the_following_request() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let h = connect(&broker, dir.path(), "iris_a", 200).await;
    let alice = register(&h.client, "alice");

    assert!(h
        .client
        .send_utterance(&alice, "first", None)
        .await
        .unwrap()
        .is_timeout());

    let call = tokio::spawn({
        let client = h.client.clone();
        let alice = alice.clone();
        async move { client.send_utterance(&alice, "second", None).await }
    });
    let sent = wait_for_requests(&broker, 2).await;
    broker.inject("iris_a", reply_to(&sent[0], "klat.response", completion("answer to first")));
    broker.inject("iris_a", reply_to(&sent[1], "klat.response", completion("answer to second")));

    assert_eq!(sentences(&call.await.unwrap().unwrap()), vec!["answer to second"]);
    assert_eq!(h.handler.events(), vec!["completion:alice:answer to second"]);
}

#[tokio::test]
async fn intent_failure_is_not_a_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let responder = responder(&broker).await;
    let h = connect(&broker, dir.path(), "iris_a", 5_000).await;
    let alice = register(&h.client, "alice");

    let outcome = h.client.send_utterance(&alice, "???", None).await.unwrap();
    assert_eq!(outcome, Outcome::NoIntentMatch);
    assert_eq!(h.handler.events(), vec!["failure:alice"]);
    responder.stop().await;
}

// ── API requests ──

#[tokio::test]
async fn stt_and_tts_complete_on_their_response_types() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let responder = responder(&broker).await;
    let h = connect(&broker, dir.path(), "iris_a", 5_000).await;
    let alice = register(&h.client, "alice");

    let Outcome::Api(stt) = h.client.get_stt(&alice, b"abcd", Some("de-de")).await.unwrap() else {
        panic!("expected an api reply");
    };
    assert_eq!(stt.msg_type, "neon.get_stt.response");
    assert_eq!(stt.transcript(), Some("4 bytes of audio"));

    let Outcome::Api(tts) = h.client.get_tts(&alice, "hello", None).await.unwrap() else {
        panic!("expected an api reply");
    };
    assert_eq!(tts.msg_type, "neon.get_tts.response");
    assert_eq!(tts.data["en-us"]["sentence"], "hello");
    responder.stop().await;
}

#[tokio::test]
async fn audio_input_carries_transcript_and_materializes_audio() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let responder = responder(&broker).await;
    let h = connect(&broker, dir.path(), "iris_a", 5_000).await;
    let alice = register(&h.client, "alice");

    let clip = dir.path().join("clip.wav");
    std::fs::write(&clip, [0u8; 6]).unwrap();
    let Outcome::Response(reply) = h.client.send_audio_file(&alice, &clip, None).await.unwrap() else {
        panic!("expected a response");
    };
    assert_eq!(reply.transcript.as_deref(), Some("6 bytes of audio"));
    assert_eq!(reply.sentences(), vec!["You said: 6 bytes of audio"]);

    let artifact = reply.artifacts()[0].to_path_buf();
    assert!(artifact.starts_with(h.client.artifacts().root().join("tts/en-us/female")));
    assert!(artifact.is_file());
    assert_eq!(h.client.sessions().get(&alice).unwrap().last_artifact, Some(artifact));
    responder.stop().await;
}

#[tokio::test]
async fn missing_audio_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let h = connect(&broker, dir.path(), "iris_a", 5_000).await;
    let alice = register(&h.client, "alice");
    let err = h
        .client
        .send_audio_file(&alice, &dir.path().join("nope.wav"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Io(_)));
}

#[tokio::test]
async fn language_comes_from_the_session_profile() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let responder = responder(&broker).await;
    let h = connect(&broker, dir.path(), "iris_a", 5_000).await;
    let alice = register(&h.client, "alice");
    h.client
        .update_profile(&alice, &json!({"speech": {"stt_language": "fr-fr"}}))
        .unwrap();

    h.client.send_utterance(&alice, "bonjour", None).await.unwrap();
    let sent = requests(&broker);
    assert_eq!(sent[0].data["lang"], "fr-fr");
    responder.stop().await;
}

// ── Broadcast replies ──

#[tokio::test]
async fn profile_update_reaches_only_the_named_user() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let h = connect(&broker, dir.path(), "iris_a", 5_000).await;
    let alice = register(&h.client, "alice");
    let bob = register(&h.client, "bob");

    let update = iris_core::encode(
        "neon.profile_update",
        &json!({"profile": {"user": {"username": "alice"}, "units": {"measure": "metric"}}}),
        &Default::default(),
    )
    .unwrap();
    broker.inject("iris_a", update);

    assert_eq!(h.handler.wait_for(1).await, vec!["profile:alice:metric"]);
    let sessions = h.client.sessions();
    assert_eq!(sessions.profile(&alice).unwrap().units.measure, "metric");
    assert_eq!(sessions.profile(&bob).unwrap().units.measure, "imperial");
}

#[tokio::test]
async fn clear_data_wipes_the_audio_cache() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let responder = responder(&broker).await;
    let h = connect(&broker, dir.path(), "iris_a", 5_000).await;
    let alice = register(&h.client, "alice");

    let Outcome::Response(reply) = h.client.send_utterance(&alice, "cache me", None).await.unwrap() else {
        panic!("expected a response");
    };
    let cached = reply.artifacts()[0].to_path_buf();
    assert!(cached.is_file());

    let request = iris_core::encode(
        "neon.clear_data",
        &json!({"username": "alice", "data_to_remove": ["ALL_DATA"]}),
        &Default::default(),
    )
    .unwrap();
    broker.inject("iris_a", request);

    let events = h.handler.wait_for(3).await;
    assert_eq!(&events[1..], ["clear_caches:alice", "clear_media:alice"]);
    assert!(!cached.exists());
    responder.stop().await;
}

// ── Error queue ──

#[tokio::test]
async fn error_reply_is_claimed_only_by_its_client() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let first = connect(&broker, &dir.path().join("a"), "iris_a", 5_000).await;
    let second = connect(&broker, &dir.path().join("b"), "iris_b", 5_000).await;
    assert_eq!(broker.consumer_count(ERROR_QUEUE), 2);
    let bob = register(&second.client, "bob");

    let call = tokio::spawn({
        let client = second.client.clone();
        let bob = bob.clone();
        async move { client.send_utterance(&bob, "break things", None).await }
    });
    let sent = wait_for_requests(&broker, 1).await;
    let mut context = sent[0].context.clone();
    context.routing = None;
    context.extra.insert("routing_key".into(), json!("iris_b"));
    let error = iris_core::encode("klat.error", &json!({"error": "skill crashed"}), &context).unwrap();
    broker.inject(ERROR_QUEUE, error);

    let Outcome::Error(reply) = call.await.unwrap().unwrap() else {
        panic!("expected an error outcome");
    };
    assert_eq!(reply.data["error"], "skill crashed");
    assert_eq!(second.handler.events(), vec!["error:bob:klat.error"]);
    assert!(first.handler.events().is_empty());
}

#[tokio::test]
async fn undecodable_delivery_is_dropped_and_drain_continues() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let responder = responder(&broker).await;
    let h = connect(&broker, dir.path(), "iris_a", 5_000).await;
    let alice = register(&h.client, "alice");

    broker.inject("iris_a", "definitely not base64 json");
    let outcome = h.client.send_utterance(&alice, "still here", None).await.unwrap();
    assert_eq!(sentences(&outcome), vec!["You said: still here"]);
    responder.stop().await;
}

// ── Sessions ──

#[tokio::test]
async fn started_sessions_are_addressed_by_their_id() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let responder = responder(&broker).await;
    let h = connect(&broker, dir.path(), "iris_a", 5_000).await;
    let session = h.client.start_session();

    let outcome = h.client.send_utterance(&session.id, "web tab", None).await.unwrap();
    assert_eq!(sentences(&outcome), vec!["You said: web tab"]);
    let sent = requests(&broker);
    assert_eq!(sent[0].context.username.as_deref(), Some(session.id.as_str()));
    assert_eq!(sent[0].context.session_id(), Some(&session.id));
    assert_eq!(h.client.sessions().len(), 1);
    responder.stop().await;
}

//! Shared fixtures for the client integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use iris_broker::{BrokerConfig, MemoryBroker};
use iris_client::{ApiReply, ChatReply, EchoResponder, IrisClient, IrisSettings, ResponseHandler};
use iris_core::{decode, encode, Envelope, RoutingIdentity, SessionId, UserProfile};
use parking_lot::Mutex;
use serde_json::{json, Value};

pub const REQUEST_QUEUE: &str = "neon_chat_api_request";
pub const ERROR_QUEUE: &str = "neon_chat_api_error";
pub const WAIT: Duration = Duration::from_secs(5);

// ── Handler ──

#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<String>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().push(event);
    }

    /// Wait until at least `n` events were recorded.
    pub async fn wait_for(&self, n: usize) -> Vec<String> {
        tokio::time::timeout(WAIT, async {
            loop {
                let events = self.events();
                if events.len() >= n {
                    return events;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("handler events")
    }
}

impl ResponseHandler for RecordingHandler {
    fn handle_completion(&self, session: &SessionId, reply: &ChatReply) {
        self.push(format!("completion:{session}:{}", reply.text()));
    }

    fn handle_failure(&self, session: &SessionId, _envelope: &Envelope) {
        self.push(format!("failure:{session}"));
    }

    fn handle_error(&self, session: Option<&SessionId>, reply: &ApiReply) {
        let session = session.map(SessionId::as_str).unwrap_or("-");
        self.push(format!("error:{session}:{}", reply.msg_type));
    }

    fn handle_profile_update(&self, session: &SessionId, profile: &UserProfile) {
        self.push(format!("profile:{session}:{}", profile.units.measure));
    }

    fn clear_caches(&self, session: &SessionId) {
        self.push(format!("clear_caches:{session}"));
    }

    fn clear_media(&self, session: &SessionId) {
        self.push(format!("clear_media:{session}"));
    }
}

// ── Client setup ──

pub fn settings(dir: &Path, timeout_ms: u64) -> IrisSettings {
    let mut settings = IrisSettings::default();
    settings.client.client_name = "it".into();
    settings.client.response_timeout_ms = timeout_ms;
    settings.client.audio_cache_dir = Some(dir.join("audio"));
    settings
}

pub struct Harness {
    pub client: Arc<IrisClient>,
    pub handler: Arc<RecordingHandler>,
}

pub async fn connect(broker: &MemoryBroker, dir: &Path, identity: &str, timeout_ms: u64) -> Harness {
    let handler = Arc::new(RecordingHandler::default());
    let client = IrisClient::connect_with_identity(
        settings(dir, timeout_ms),
        Arc::new(broker.clone()),
        handler.clone(),
        RoutingIdentity::from_raw(identity),
    )
    .await
    .expect("client connects");
    Harness {
        client: Arc::new(client),
        handler,
    }
}

pub async fn responder(broker: &MemoryBroker) -> EchoResponder {
    EchoResponder::start(Arc::new(broker.clone()), &BrokerConfig::default(), REQUEST_QUEUE)
        .await
        .expect("responder starts")
}

pub fn register(client: &IrisClient, username: &str) -> SessionId {
    let id = SessionId::from_raw(username);
    client.register_session(id.clone(), UserProfile::default().with_username(username));
    id
}

// ── Wire helpers ──

pub fn requests(broker: &MemoryBroker) -> Vec<Envelope> {
    broker
        .published_to(REQUEST_QUEUE)
        .iter()
        .map(|body| decode(body).expect("request decodes"))
        .collect()
}

/// Wait until `n` requests were published and return them.
pub async fn wait_for_requests(broker: &MemoryBroker, n: usize) -> Vec<Envelope> {
    tokio::time::timeout(WAIT, async {
        loop {
            let published = requests(broker);
            if published.len() >= n {
                return published;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("requests published")
}

/// Find the request a session sent.
pub fn request_from<'a>(requests: &'a [Envelope], session: &str) -> &'a Envelope {
    requests
        .iter()
        .find(|r| r.context.session_id().map(SessionId::as_str) == Some(session))
        .expect("request for session")
}

/// Encode a reply that echoes `request`'s context.
pub fn reply_to(request: &Envelope, msg_type: &str, data: Value) -> Vec<u8> {
    encode(msg_type, &data, &request.context).expect("reply encodes")
}

pub fn completion(sentence: &str) -> Value {
    json!({"responses": {"en-us": {"sentence": sentence}}})
}

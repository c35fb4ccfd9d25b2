//! Request correlation.
//!
//! Outbound requests are stamped with this client's routing identity. Every
//! inbound delivery is decoded, classified into a [`ReplyKind`] and either
//! dispatched to the session it is addressed to or ignored. The returned
//! [`Verdict`] tells the drain task how to settle the delivery.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use iris_core::reply::{response_type_for, AUDIO_INPUT};
use iris_core::{
    decode, encode, DataKind, Envelope, ReplyKind, RequestId, RoutingContext, RoutingIdentity,
    RoutingTag, SessionId, SessionTag, Timing,
};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::artifacts::ArtifactCache;
use crate::errors::ClientError;
use crate::handler::ResponseHandler;
use crate::request::{ApiReply, ChatReply, Expectation, LangResponse, Outcome, Request};
use crate::sessions::{Admission, Completion, Session, SessionRegistry};
use crate::settings::{ClientSettings, DecodeFailurePolicy};

/// Which subscription a delivery came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Response,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Addressed to another client instance.
    RoutingMismatch,
    /// Profile update for a user this client does not serve, or malformed.
    ProfileRejected,
    /// Addressed to this client but to no known session.
    UnknownSession,
    /// Nobody is waiting, e.g. the request already timed out.
    NoWaiter,
    /// Echoes an older request than the one pending.
    Stale,
    /// The pending request expects a different reply type.
    Unexpected,
    Unhandled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Delivered,
    Ignored(IgnoreReason),
    /// The delivery could not be decoded.
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ack {
    Ack,
    Nack { requeue: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub disposition: Disposition,
    pub ack: Ack,
}

impl Verdict {
    fn acked(disposition: Disposition) -> Self {
        Self {
            disposition,
            ack: Ack::Ack,
        }
    }
}

pub struct Correlator {
    identity: RoutingIdentity,
    client_name: String,
    client: String,
    decode_failure: DecodeFailurePolicy,
    sessions: Arc<SessionRegistry>,
    artifacts: Arc<ArtifactCache>,
    handler: Arc<dyn ResponseHandler>,
}

impl Correlator {
    pub fn new(
        identity: RoutingIdentity,
        settings: &ClientSettings,
        sessions: Arc<SessionRegistry>,
        artifacts: Arc<ArtifactCache>,
        handler: Arc<dyn ResponseHandler>,
    ) -> Self {
        Self {
            identity,
            client_name: settings.client_name.clone(),
            client: settings.client.clone(),
            decode_failure: settings.decode_failure,
            sessions,
            artifacts,
            handler,
        }
    }

    pub fn identity(&self) -> &RoutingIdentity {
        &self.identity
    }

    /// Routing context for a request from `session`.
    pub fn stamp(&self, session: &Session, request_id: &RequestId, waited: Duration) -> RoutingContext {
        RoutingContext {
            client_name: self.client_name.clone(),
            client: self.client.clone(),
            ident: request_id.to_string(),
            username: Some(session.username().to_string()),
            user_profiles: vec![session.profile.to_value()],
            routing: Some(RoutingTag {
                routing_key: self.identity.to_string(),
            }),
            session: Some(SessionTag {
                session_id: session.id.clone(),
            }),
            timing: Some(Timing {
                wait_in_queue: waited.as_secs_f64(),
                client_sent: epoch_secs(),
            }),
            extra: Map::new(),
        }
    }

    pub fn encode_request(
        &self,
        session: &Session,
        request_id: &RequestId,
        request: &Request,
        waited: Duration,
    ) -> Result<Bytes, ClientError> {
        let context = self.stamp(session, request_id, waited);
        let wire = encode(request.msg_type(), &request.payload(), &context)?;
        Ok(Bytes::from(wire))
    }

    /// Decode and dispatch one delivery.
    pub fn on_delivery(&self, channel: Channel, body: &[u8]) -> Verdict {
        let envelope = match decode(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    channel = ?channel,
                    error = %e,
                    policy = ?self.decode_failure,
                    "dropping undecodable delivery"
                );
                let ack = match self.decode_failure {
                    DecodeFailurePolicy::Ack => Ack::Ack,
                    DecodeFailurePolicy::Nack => Ack::Nack { requeue: true },
                };
                return Verdict {
                    disposition: Disposition::Rejected,
                    ack,
                };
            }
        };
        match channel {
            Channel::Response => Verdict::acked(self.on_response(&envelope)),
            Channel::Error => self.on_error(&envelope),
        }
    }

    /// Dispatch an envelope from the response subscription.
    pub fn on_response(&self, envelope: &Envelope) -> Disposition {
        let kind = envelope.reply_kind();
        let disposition = match &kind {
            ReplyKind::Completion => {
                self.with_session(envelope, |session| self.completion(session, envelope))
            }
            ReplyKind::IntentFailure => {
                self.with_session(envelope, |session| self.intent_failure(session, envelope))
            }
            ReplyKind::ApiResponse(msg_type) => self.with_session(envelope, |session| {
                self.api_response(session, msg_type, envelope)
            }),
            ReplyKind::ProfileUpdate => self.profile_update(envelope),
            ReplyKind::ClearData => self.clear_data(envelope),
            ReplyKind::Error | ReplyKind::Unhandled(_) => {
                warn!(msg_type = %envelope.msg_type, "message not handled");
                Disposition::Ignored(IgnoreReason::Unhandled)
            }
        };
        debug!(
            msg_type = %envelope.msg_type,
            kind = kind.label(),
            disposition = ?disposition,
            "response processed"
        );
        disposition
    }

    /// Error replies are claimed only when addressed to this client; others
    /// go back to the shared queue for the client they belong to.
    pub fn on_error(&self, envelope: &Envelope) -> Verdict {
        match envelope.context.target_identity() {
            Some(target) if target == self.identity.as_str() => {
                let session = self.resolve_session(&envelope.context);
                let reply = ApiReply {
                    msg_type: envelope.msg_type.clone(),
                    data: envelope.data.clone(),
                };
                warn!(
                    msg_type = %envelope.msg_type,
                    session_id = ?session.as_ref().map(SessionId::as_str),
                    "error reply from service"
                );
                self.handler.handle_error(session.as_ref(), &reply);
                if let Some(session) = &session {
                    let admission = self.sessions.admit(
                        session,
                        envelope.context.request_ident(),
                        &Expectation::Chat,
                    );
                    if matches!(admission, Admission::Accept | Admission::Unexpected) {
                        self.release(session, Outcome::Error(reply));
                    }
                }
                Verdict::acked(Disposition::Delivered)
            }
            other => {
                debug!(addressed_to = ?other, "error reply for another client, returning it");
                Verdict {
                    disposition: Disposition::Ignored(IgnoreReason::RoutingMismatch),
                    ack: Ack::Nack { requeue: true },
                }
            }
        }
    }

    fn with_session(&self, envelope: &Envelope, f: impl FnOnce(&SessionId) -> Disposition) -> Disposition {
        match envelope.context.target_identity() {
            Some(target) if target == self.identity.as_str() => {}
            other => {
                debug!(
                    msg_type = %envelope.msg_type,
                    addressed_to = ?other,
                    "reply addressed to another client"
                );
                return Disposition::Ignored(IgnoreReason::RoutingMismatch);
            }
        }
        match self.resolve_session(&envelope.context) {
            Some(session) => f(&session),
            None => {
                warn!(
                    msg_type = %envelope.msg_type,
                    username = ?envelope.context.username,
                    "reply for an unknown session"
                );
                Disposition::Ignored(IgnoreReason::UnknownSession)
            }
        }
    }

    fn resolve_session(&self, context: &RoutingContext) -> Option<SessionId> {
        if let Some(id) = context.session_id() {
            if self.sessions.contains(id) {
                return Some(id.clone());
            }
        }
        context
            .username
            .as_deref()
            .and_then(|username| self.sessions.find_by_username(username))
    }

    fn admit(&self, session: &SessionId, envelope: &Envelope, reply: &Expectation) -> Result<(), IgnoreReason> {
        match self
            .sessions
            .admit(session, envelope.context.request_ident(), reply)
        {
            Admission::Accept => Ok(()),
            Admission::NoWaiter => {
                debug!(session_id = %session, msg_type = %envelope.msg_type, "no request awaiting this reply");
                Err(IgnoreReason::NoWaiter)
            }
            Admission::Stale { pending } => {
                info!(
                    session_id = %session,
                    ident = ?envelope.context.request_ident(),
                    pending = %pending,
                    "dropping stale reply"
                );
                Err(IgnoreReason::Stale)
            }
            Admission::Unexpected => {
                debug!(session_id = %session, msg_type = %envelope.msg_type, "pending request expects another reply");
                Err(IgnoreReason::Unexpected)
            }
        }
    }

    fn release(&self, session: &SessionId, outcome: Outcome) {
        if self.sessions.complete(session, outcome) == Completion::NoWaiter {
            debug!(session_id = %session, "waiter gave up before the reply arrived");
        }
    }

    fn completion(&self, session: &SessionId, envelope: &Envelope) -> Disposition {
        if let Err(reason) = self.admit(session, envelope, &Expectation::Chat) {
            return Disposition::Ignored(reason);
        }
        let mut reply = self.chat_reply(session, &envelope.data);
        reply.transcript = self.sessions.take_transcript(session);
        self.handler.handle_completion(session, &reply);
        self.release(session, Outcome::Response(reply));
        Disposition::Delivered
    }

    fn intent_failure(&self, session: &SessionId, envelope: &Envelope) -> Disposition {
        if let Err(reason) = self.admit(session, envelope, &Expectation::Chat) {
            return Disposition::Ignored(reason);
        }
        info!(session_id = %session, "no intent matched");
        self.handler.handle_failure(session, envelope);
        self.release(session, Outcome::NoIntentMatch);
        Disposition::Delivered
    }

    fn api_response(&self, session: &SessionId, msg_type: &str, envelope: &Envelope) -> Disposition {
        let reply = ApiReply {
            msg_type: msg_type.to_string(),
            data: envelope.data.clone(),
        };
        if msg_type == response_type_for(AUDIO_INPUT) {
            // Transcript of spoken input; the completion follows separately.
            if let Err(reason) = self.admit(session, envelope, &Expectation::Chat) {
                return Disposition::Ignored(reason);
            }
            if let Some(transcript) = reply.transcript() {
                debug!(session_id = %session, transcript, "recorded transcript");
                self.sessions.record_transcript(session, transcript.to_string());
            }
            self.handler.handle_api_response(Some(session), &reply);
            return Disposition::Delivered;
        }
        if let Err(reason) = self.admit(session, envelope, &Expectation::Api(msg_type.to_string())) {
            return Disposition::Ignored(reason);
        }
        self.handler.handle_api_response(Some(session), &reply);
        self.release(session, Outcome::Api(reply));
        Disposition::Delivered
    }

    fn profile_update(&self, envelope: &Envelope) -> Disposition {
        let Some(profile) = envelope.data.get("profile") else {
            warn!("profile update without a profile");
            return Disposition::Ignored(IgnoreReason::ProfileRejected);
        };
        let username = profile
            .pointer("/user/username")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match self.sessions.apply_profile_update(username, profile) {
            Some((session, updated)) => {
                self.handler.handle_profile_update(&session, &updated);
                Disposition::Delivered
            }
            None => Disposition::Ignored(IgnoreReason::ProfileRejected),
        }
    }

    fn clear_data(&self, envelope: &Envelope) -> Disposition {
        let username = envelope
            .data
            .get("username")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let Some(session) = self.sessions.find_by_username(username) else {
            debug!(username, "clear-data request for another user");
            return Disposition::Ignored(IgnoreReason::RoutingMismatch);
        };
        let requested: Vec<DataKind> = envelope
            .data
            .get("data_to_remove")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).map(DataKind::parse).collect())
            .unwrap_or_default();
        info!(session_id = %session, requested = ?requested, "clear-data request");

        if requested.contains(&DataKind::AllData) {
            self.clear_audio_cache();
            self.handler.clear_caches(&session);
            self.handler.clear_media(&session);
            return Disposition::Delivered;
        }
        if requested.contains(&DataKind::Caches) {
            self.clear_audio_cache();
            self.handler.clear_caches(&session);
        }
        if requested.contains(&DataKind::AllMedia) {
            self.handler.clear_media(&session);
        }
        Disposition::Delivered
    }

    fn clear_audio_cache(&self) {
        if let Err(e) = self.artifacts.clear() {
            warn!(error = %e, "failed to clear audio cache");
        }
    }

    /// Sentences and audio for each language of a completion. Audio is
    /// materialized into the cache; the session keeps only the last file.
    fn chat_reply(&self, session: &SessionId, data: &Map<String, Value>) -> ChatReply {
        let mut reply = ChatReply::default();
        let Some(responses) = data.get("responses").and_then(Value::as_object) else {
            warn!(session_id = %session, "completion without responses");
            return reply;
        };
        for (lang, response) in responses {
            let sentence = response
                .get("sentence")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let mut artifacts = Vec::new();
            if let Some(audio) = response.get("audio").and_then(Value::as_object) {
                for (gender, payload) in audio {
                    let Some(payload) = payload.as_str() else {
                        continue;
                    };
                    let derived = response
                        .get(gender)
                        .and_then(Value::as_str)
                        .and_then(ArtifactCache::derive_path)
                        .unwrap_or_else(|| ArtifactCache::fallback_path(lang, gender, &sentence));
                    match self.artifacts.materialize(payload, &derived) {
                        Ok(path) => {
                            self.sessions.record_artifact(session, path.clone());
                            artifacts.push(path);
                        }
                        Err(e) => warn!(
                            session_id = %session,
                            lang = %lang,
                            gender = %gender,
                            error = %e,
                            "failed to materialize audio"
                        ),
                    }
                }
            }
            reply.responses.push(LangResponse {
                lang: lang.clone(),
                sentence,
                artifacts,
            });
        }
        reply
    }
}

fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

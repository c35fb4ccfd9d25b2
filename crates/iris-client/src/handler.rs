use iris_core::{Envelope, SessionId, UserProfile};

use crate::request::{ApiReply, ChatReply};

/// Front-end hooks called by the correlator from the inbound drain task.
///
/// Calls happen one at a time, in delivery order. Implementations should
/// return quickly; anything slow (playback, network) belongs on another task.
pub trait ResponseHandler: Send + Sync {
    fn handle_completion(&self, session: &SessionId, reply: &ChatReply);

    /// No intent matched the request from `session`.
    fn handle_failure(&self, session: &SessionId, envelope: &Envelope);

    /// An error reply addressed to this client.
    fn handle_error(&self, session: Option<&SessionId>, reply: &ApiReply);

    fn handle_profile_update(&self, session: &SessionId, profile: &UserProfile);

    fn handle_api_response(&self, _session: Option<&SessionId>, _reply: &ApiReply) {}

    /// The service asked this user's cached responses to be dropped.
    fn clear_caches(&self, _session: &SessionId) {}

    /// The service asked this user's media (photos etc.) to be dropped.
    fn clear_media(&self, _session: &SessionId) {}
}

/// Handler that ignores everything; outcomes still reach the caller.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHandler;

impl ResponseHandler for NoopHandler {
    fn handle_completion(&self, _session: &SessionId, _reply: &ChatReply) {}

    fn handle_failure(&self, _session: &SessionId, _envelope: &Envelope) {}

    fn handle_error(&self, _session: Option<&SessionId>, _reply: &ApiReply) {}

    fn handle_profile_update(&self, _session: &SessionId, _profile: &UserProfile) {}
}

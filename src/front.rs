//! Terminal front end for reply callbacks.

use iris_client::{ApiReply, ChatReply, ResponseHandler};
use iris_core::{Envelope, SessionId, UserProfile};
use tracing::{error, info};

/// Prints replies as they arrive. Playback happens on the prompt task.
#[derive(Debug, Default)]
pub struct CliFront;

impl CliFront {
    pub fn render(reply: &ChatReply) -> String {
        let files: Vec<String> = reply
            .artifacts()
            .iter()
            .map(|path| path.display().to_string())
            .collect();
        format!("{:?}\n{:?}\n", reply.sentences(), files)
    }
}

impl ResponseHandler for CliFront {
    fn handle_completion(&self, _session: &SessionId, reply: &ChatReply) {
        if let Some(transcript) = &reply.transcript {
            println!("Heard: {transcript}");
        }
        println!("{}", Self::render(reply));
    }

    fn handle_failure(&self, _session: &SessionId, _envelope: &Envelope) {
        println!("No Intent Matched");
    }

    fn handle_error(&self, session: Option<&SessionId>, reply: &ApiReply) {
        error!(
            session_id = ?session.map(SessionId::as_str),
            msg_type = %reply.msg_type,
            data = %serde_json::Value::Object(reply.data.clone()),
            "error reply"
        );
        println!("Error: {}", reply.msg_type);
    }

    fn handle_profile_update(&self, session: &SessionId, profile: &UserProfile) {
        info!(session_id = %session, username = profile.username(), "profile updated by the service");
    }

    fn clear_caches(&self, session: &SessionId) {
        info!(session_id = %session, "cached responses cleared");
    }
}

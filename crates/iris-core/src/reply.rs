//! Classification of inbound replies.
//!
//! The remote service tags replies with free-form type strings. They are
//! mapped once, here, onto a closed set of kinds so dispatch elsewhere is an
//! exhaustive `match`.

pub const UTTERANCE: &str = "recognizer_loop:utterance";
pub const AUDIO_INPUT: &str = "neon.audio_input";
pub const GET_STT: &str = "neon.get_stt";
pub const GET_TTS: &str = "neon.get_tts";

pub const COMPLETION: &str = "klat.response";
pub const INTENT_FAILURE: &str = "complete.intent.failure";
pub const PROFILE_UPDATE: &str = "neon.profile_update";
pub const CLEAR_DATA: &str = "neon.clear_data";
pub const RESPONSE_SUFFIX: &str = ".response";

/// Reply type the service emits for an API request of type `msg_type`.
pub fn response_type_for(msg_type: &str) -> String {
    format!("{msg_type}{RESPONSE_SUFFIX}")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyKind {
    /// Full response to a chat request.
    Completion,
    /// No skill matched the request. Still a completion, not an error.
    IntentFailure,
    /// Broadcast-style profile change for one user.
    ProfileUpdate,
    /// Broadcast-style request to wipe local data for one user.
    ClearData,
    /// Response to an API-style request, e.g. `neon.get_stt.response`.
    ApiResponse(String),
    /// Anything arriving on the error queue.
    Error,
    Unhandled(String),
}

impl ReplyKind {
    pub fn classify(msg_type: &str) -> Self {
        match msg_type {
            COMPLETION => Self::Completion,
            INTENT_FAILURE => Self::IntentFailure,
            PROFILE_UPDATE => Self::ProfileUpdate,
            CLEAR_DATA => Self::ClearData,
            other if other.ends_with(RESPONSE_SUFFIX) => Self::ApiResponse(other.to_string()),
            other => Self::Unhandled(other.to_string()),
        }
    }

    /// Kinds that are only ever addressed by username, never by routing identity.
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::ProfileUpdate | Self::ClearData)
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Completion => "completion",
            Self::IntentFailure => "intent_failure",
            Self::ProfileUpdate => "profile_update",
            Self::ClearData => "clear_data",
            Self::ApiResponse(_) => "api_response",
            Self::Error => "error",
            Self::Unhandled(_) => "unhandled",
        }
    }
}

/// Data categories named in a clear-data request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataKind {
    AllData,
    Caches,
    AllMedia,
    Other(String),
}

impl DataKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "ALL_DATA" => Self::AllData,
            "CACHES" => Self::Caches,
            "ALL_MEDIA" => Self::AllMedia,
            other => Self::Other(other.to_string()),
        }
    }
}

use iris_broker::BrokerError;
use iris_core::{CodecError, SessionId};
use thiserror::Error;

/// Errors that can occur when loading or parsing settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Failed to read a settings file from disk.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in a settings file.
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A settings value was invalid (e.g., out of range).
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// Errors surfaced to callers of the client.
///
/// A request that gets no reply is not an error; it completes with
/// `Outcome::TimedOut`.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(#[from] BrokerError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("invalid profile: {0}")]
    InvalidProfile(String),

    #[error("client is shutting down")]
    ShuttingDown,

    #[error("unknown session: {0}")]
    UnknownSession(SessionId),
}

impl ClientError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Codec(e) => e.error_kind(),
            Self::Artifact(_) => "artifact",
            Self::Io(_) => "io",
            Self::Settings(_) => "settings",
            Self::InvalidProfile(_) => "invalid_profile",
            Self::ShuttingDown => "shutting_down",
            Self::UnknownSession(_) => "unknown_session",
        }
    }
}

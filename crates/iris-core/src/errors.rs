/// Failures while converting between envelopes and wire bytes.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("decoding error: {0}")]
    Decoding(String),
}

impl CodecError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Encoding(_) => "encoding",
            Self::Decoding(_) => "decoding",
        }
    }
}

impl From<base64::DecodeError> for CodecError {
    fn from(e: base64::DecodeError) -> Self {
        CodecError::Decoding(format!("invalid base64: {e}"))
    }
}

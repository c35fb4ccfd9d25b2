/// Failures reported by the broker transport or the supervisor.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("consumer stream lost on {0}")]
    StreamLost(String),

    #[error("unknown delivery tag {0}")]
    UnknownDelivery(u64),

    #[error("broker connection closed")]
    Closed,
}

impl BrokerError {
    /// Whether this error means the connection itself is gone and a
    /// reconnect may help.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::ChannelClosed(_) | Self::StreamLost(_)
        )
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ConnectionFailed(_) => "connection_failed",
            Self::ChannelClosed(_) => "channel_closed",
            Self::StreamLost(_) => "stream_lost",
            Self::UnknownDelivery(_) => "unknown_delivery",
            Self::Closed => "closed",
        }
    }
}

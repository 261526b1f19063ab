#[derive(Debug, thiserror::Error)]
pub enum SubtitleStreamError {
    #[error("decryption error: {0}")]
    DecryptionError(String),

    #[error("invalid key for {uri}: {reason}")]
    InvalidKey { uri: String, reason: String },

    #[error("playlist error: {0}")]
    PlaylistError(String),

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("{channel} channel closed")]
    ChannelClosed { channel: &'static str },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl SubtitleStreamError {
    pub fn invalid_key(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn channel_closed(channel: &'static str) -> Self {
        Self::ChannelClosed { channel }
    }

    /// Whether reloading the same fragment could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidKey { .. } | Self::Configuration { .. } | Self::ChannelClosed { .. } => false,
            Self::DecryptionError(_) | Self::PlaylistError(_) | Self::Internal { .. } => true,
        }
    }
}

/// Lifecycle state of the subtitle stream controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamState {
    #[default]
    Stopped,
    Idle,
    KeyLoading,
    FragLoading,
}

impl StreamState {
    /// A request is outstanding.
    pub fn is_loading(self) -> bool {
        matches!(self, Self::KeyLoading | Self::FragLoading)
    }
}

use crate::resources::SessionUsage;
use thiserror::Error;

/// Errors raised by the scheduling and playback engine.
#[derive(Error, Debug)]
pub enum PlayerError {
    /// A resource contract was broken. Indicates a programming defect.
    #[error("Logic error: {0}")]
    Logic(String),

    #[error("No free audio session available")]
    NoFreeSession,

    #[error("No session holds usage {0}")]
    UsageNotHeld(SessionUsage),

    #[error("No usable media found for source '{0}'")]
    NoUsableMedia(String),

    #[error("Unable to find a song which has not been played recently")]
    NoAcceptableItem,

    #[error("Nothing else to play: {0}")]
    NothingToPlay(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Repository error: {0}")]
    Repository(String),

    /// Lost contact with the schedule repository. Retryable.
    #[error("Repository connection error: {0}")]
    Connection(String),

    #[error("Audio engine error: {0}")]
    Audio(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl PlayerError {
    /// Shorthand for building a logic error.
    pub fn logic(msg: impl Into<String>) -> Self {
        PlayerError::Logic(msg.into())
    }

    /// Only connection failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PlayerError::Connection(_))
    }
}

pub type Result<T> = std::result::Result<T, PlayerError>;

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum VoxError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("audio input device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("capture held no usable speech ({bytes} bytes)")]
    EmptyCapture { bytes: usize },

    #[error("audio error: {0}")]
    Audio(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("playback error: {0}")]
    Playback(String),

    #[error("stale completion from turn {0}")]
    StaleCompletion(u64),

    #[error("history error: {0}")]
    History(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

impl VoxError {
    /// Errors that end the current turn and need the user to act before retrying.
    #[must_use]
    pub const fn is_device_error(&self) -> bool {
        matches!(self, Self::PermissionDenied(_) | Self::DeviceUnavailable(_))
    }

    /// Errors the loop recovers from on its own.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::EmptyCapture { .. }
                | Self::Transport(_)
                | Self::MalformedResponse(_)
                | Self::Playback(_)
                | Self::StaleCompletion(_)
        )
    }

    /// Short, actionable text for the status line.
    #[must_use]
    pub fn status_message(&self) -> String {
        match self {
            Self::PermissionDenied(_) => {
                "Microphone access denied. Please allow microphone access.".to_string()
            }
            Self::DeviceUnavailable(_) => {
                "No microphone available. Connect an input device and try again.".to_string()
            }
            Self::EmptyCapture { .. } => "Didn't catch that. Listening...".to_string(),
            Self::Transport(_) => "Connection error".to_string(),
            Self::MalformedResponse(_) => "Error processing response".to_string(),
            Self::Playback(_) => "Audio playback error. Continuing...".to_string(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, VoxError>;

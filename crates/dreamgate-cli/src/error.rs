use dreamgate_core::CoreError;
use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("command error: {0}")]
    Command(String),

    #[error("strict mode failed: warnings={warning_count}, errors={error_count}")]
    StrictModeViolation {
        warning_count: usize,
        error_count: usize,
    },

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Core(error) => match error {
                CoreError::Exhausted(_)
                | CoreError::Cancelled { .. }
                | CoreError::DeadlineExceeded { .. }
                | CoreError::HealthProbe { .. } => 3,
                CoreError::Serialization(_) => 4,
                CoreError::Pipeline { .. } => 6,
                CoreError::Io(_) => 10,
                _ => 2,
            },
            Self::Command(_) => 2,
            Self::StrictModeViolation { .. } => 5,
            Self::Serialization(_) => 4,
            Self::Io(_) => 10,
        }
    }
}

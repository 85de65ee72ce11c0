use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskmillError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskmillError {
    /// Short error code string, logged alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            TaskmillError::Config(_) => "CONFIG_ERROR",
            TaskmillError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskmillError>;

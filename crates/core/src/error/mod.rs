use thiserror::Error;

#[derive(Error, Debug)]
pub enum PostmateError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("AI error: {0}")]
    AI(String),

    /// The completion service rejected the request because it is overloaded.
    #[error("Model overloaded: {0}")]
    Overloaded(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PostmateError {
    pub fn is_overloaded(&self) -> bool {
        matches!(self, PostmateError::Overloaded(_))
    }
}

pub type Result<T> = std::result::Result<T, PostmateError>;

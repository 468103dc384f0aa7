use thiserror::Error;

use crate::types::ClassStatus;

#[derive(Debug, Error)]
pub enum ClassroomError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Class not found: {id}")]
    ClassNotFound { id: String },

    #[error("Invalid class transition: {from} -> {to}")]
    InvalidTransition { from: ClassStatus, to: ClassStatus },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl ClassroomError {
    /// Short error code string sent to HTTP clients alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            ClassroomError::Config(_) => "CONFIG_ERROR",
            ClassroomError::ClassNotFound { .. } => "CLASS_NOT_FOUND",
            ClassroomError::InvalidTransition { .. } => "INVALID_TRANSITION",
            ClassroomError::InvalidInput(_) => "INVALID_INPUT",
        }
    }
}

pub type Result<T> = std::result::Result<T, ClassroomError>;

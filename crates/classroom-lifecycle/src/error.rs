use classroom_core::ClassroomError;
use classroom_scheduler::SchedulerError;
use thiserror::Error;

/// Errors raised by the lifecycle stores, handlers and orchestrator.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Class not found: {id}")]
    ClassNotFound { id: String },

    /// A class was asked to move along an edge its state machine forbids.
    #[error(transparent)]
    Transition(#[from] ClassroomError),

    /// Job payload lacks a field the handler needs.
    #[error("Invalid job payload: {0}")]
    Payload(String),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Notification delivery failed: {0}")]
    Notification(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

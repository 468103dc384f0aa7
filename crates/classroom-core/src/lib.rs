//! `classroom-core`: configuration, shared error type and the entities the
//! class lifecycle scheduler reads and mutates.

pub mod config;
pub mod error;
pub mod types;

pub use error::{ClassroomError, Result};
pub use types::{
    Class, ClassField, ClassStatus, Notification, NotificationKind, Review, NO_SHOW_REASON,
};

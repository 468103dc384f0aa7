pub mod classes;
pub mod error;
pub mod health;
pub mod jobs;

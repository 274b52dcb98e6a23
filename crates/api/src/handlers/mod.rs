//! Request handlers.
//!
//! Handlers delegate to the repositories in `labrun_db` and the job runner,
//! and map errors via [`crate::error::AppError`].

pub mod jobs;

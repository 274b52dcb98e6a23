//! Job execution.
//!
//! [`runner::JobRunner`] drives one job through resolution, change
//! detection, an isolated engine run and result persistence.

pub mod runner;

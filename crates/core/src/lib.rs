//! Domain logic for labrun: configuration resolution, change detection and
//! isolated engine execution. No database access lives here.

pub mod config_tree;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod hashing;
pub mod types;

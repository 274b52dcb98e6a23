use crate::config_tree::ConfigParseError;
use crate::engine::ComputeError;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// No record matches the given key (`id 7` or `name "exp1"`).
    #[error("Entity not found: {entity} with {key}")]
    NotFound { entity: &'static str, key: String },

    /// Duplicate caller-supplied id, or a run already in flight for a job.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] ConfigParseError),

    /// The isolated worker crashed, exited non-zero, timed out or produced
    /// no usable result.
    #[error("Execution failed: {0}")]
    Execution(#[from] ComputeError),

    #[error("Internal error: {0}")]
    Internal(String),
}

use thiserror::Error;

/// Errors rejected synchronously at authoring or start time.
///
/// A definition error never produces an execution.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("duplicate step alias: '{0}'")]
    DuplicateAlias(String),

    #[error("chain '{0}' is disabled")]
    Disabled(String),

    #[error("chain must have at least one step")]
    NoSteps,

    #[error("invalid chain name: {0}")]
    InvalidName(String),
}

/// Errors from repository operations (used by trait definitions in chainflow-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

impl RepositoryError {
    /// Whether this error came from an optimistic version check.
    ///
    /// A conflicting writer should re-read and retry rather than fail.
    pub fn is_conflict(&self) -> bool {
        matches!(self, RepositoryError::Conflict(_))
    }
}

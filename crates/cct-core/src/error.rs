use thiserror::Error;

/// Taxonomy of errors surfaced by the orchestrator core.
///
/// Handler-level code maps each variant to a short, user-visible string on the
/// `error` frame (see spec §7) — never a stack trace or a `Debug` dump.
#[derive(Debug, Error)]
pub enum CctError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("permission request timed out")]
    PermissionTimeout,

    #[error("storage failure: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("agent sdk failure: {0}")]
    Sdk(String),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, CctError>;

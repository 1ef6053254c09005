use thiserror::Error;

use crate::model::Conflict;

#[derive(Debug, Error)]
pub enum ResvError {
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(Conflict),

    #[error("atomic acquire failed, nothing was reserved: {}", describe_conflicts(.0))]
    AtomicAcquireFailed(Vec<Conflict>),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("reservation {id} is owned by agent '{owner}', not '{requester}'")]
    NotOwner {
        id: String,
        owner: String,
        requester: String,
    },

    #[error("reservation {0} not found or no longer active")]
    NotFound(String),

    #[error("violation: agent '{agent}' used '{path}' for {purpose} without a valid reservation")]
    Violation {
        agent: String,
        path: String,
        purpose: String,
    },

    #[error("coordinator credential rejected")]
    Unauthorized,

    #[error("wait timed out: {0}")]
    WaitTimeout(String),

    #[error("wait cancelled for path '{0}'")]
    WaitCancelled(String),

    #[error("reservation store corrupt: {0}")]
    StoreCorrupt(String),

    #[error("locked by another process: {0}")]
    Locked(String),

    #[error("no reservation state found (run `resv init` or set RESV_DIR)")]
    NotInitialized,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

fn describe_conflicts(conflicts: &[Conflict]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ResvError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ResourceUnavailable(_) => "resource_unavailable",
            Self::AtomicAcquireFailed(_) => "atomic_acquire_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotOwner { .. } => "not_owner",
            Self::NotFound(_) => "not_found",
            Self::Violation { .. } => "violation",
            Self::Unauthorized => "unauthorized",
            Self::WaitTimeout(_) => "wait_timeout",
            Self::WaitCancelled(_) => "wait_cancelled",
            Self::StoreCorrupt(_) => "store_corrupt",
            Self::Locked(_) => "locked",
            Self::NotInitialized => "not_initialized",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Yaml(_) => "yaml_error",
            Self::Db(_) => "db_error",
        }
    }

    /// Conflicts carried by acquisition failures, empty for every other error.
    pub fn conflicts(&self) -> &[Conflict] {
        match self {
            Self::ResourceUnavailable(conflict) => std::slice::from_ref(conflict),
            Self::AtomicAcquireFailed(conflicts) => conflicts,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, ResvError>;

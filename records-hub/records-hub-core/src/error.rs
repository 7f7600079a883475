use uuid::Uuid;

/// Failure kinds surfaced by the store. Each variant is reported to callers
/// distinctly; only [`Error::StorageUnavailable`] is worth retrying.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("item or grant not found: {0}")]
    NotFound(Uuid),
    #[error("not authorized: {0}")]
    NotAuthorized(String),
    #[error("invalid parent: {0}")]
    InvalidParent(String),
    #[error("moving {item} under {parent} would create a cycle")]
    CycleDetected { item: Uuid, parent: Uuid },
    #[error("an item named {0:?} already exists in this folder")]
    NameConflict(String),
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("an item cannot be shared with its owner")]
    SelfShare,
    #[error("only the owner may share item {0}")]
    NotOwner(Uuid),
    #[error("item {id} was modified concurrently (expected revision {expected}, found {found})")]
    Conflict { id: Uuid, expected: u64, found: u64 },
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("data integrity violation: {0}")]
    Integrity(String),
}

impl Error {
    /// Whether a caller may reasonably retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StorageUnavailable(_))
    }

    /// Stable, machine readable name of the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::NotAuthorized(_) => "not_authorized",
            Error::InvalidParent(_) => "invalid_parent",
            Error::CycleDetected { .. } => "cycle_detected",
            Error::NameConflict(_) => "name_conflict",
            Error::InvalidName(_) => "invalid_name",
            Error::SelfShare => "self_share",
            Error::NotOwner(_) => "not_owner",
            Error::Conflict { .. } => "conflict",
            Error::StorageUnavailable(_) => "storage_unavailable",
            Error::Integrity(_) => "integrity",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::StorageUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Integrity(format!("malformed record: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

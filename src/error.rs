use std::fmt;

/// Error taxonomy shared across the manager core.
///
/// Kinds map to transport status codes at the API boundary: `NotFound` → 404,
/// `InvalidArgument` → 400, `Conflict` → 409, `Unavailable` → 503, the rest → 500.
#[derive(Debug)]
pub enum ManagerError {
    /// Entity lookup miss; surfaced to the caller unchanged.
    NotFound(String),
    /// Schema/validation error at the API boundary.
    InvalidArgument(String),
    /// State transition not allowed from the current status.
    Conflict(String),
    /// Transient failure (fetcher timeout, probe not ready); callers may retry.
    Unavailable(String),
    /// Structural failure (unparseable node, invalid kernel config).
    /// Triggers archival, never retried.
    Broken(String),
    /// Storage or process I/O failure after retry.
    Fatal(String),
}

impl ManagerError {
    /// HTTP status code for the transport layer.
    pub fn status_code(&self) -> u16 {
        match self {
            ManagerError::NotFound(_) => 404,
            ManagerError::InvalidArgument(_) => 400,
            ManagerError::Conflict(_) => 409,
            ManagerError::Unavailable(_) => 503,
            ManagerError::Broken(_) => 500,
            ManagerError::Fatal(_) => 500,
        }
    }
}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerError::NotFound(msg) => write!(f, "not found: {}", msg),
            ManagerError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            ManagerError::Conflict(msg) => write!(f, "conflict: {}", msg),
            ManagerError::Unavailable(msg) => write!(f, "unavailable: {}", msg),
            ManagerError::Broken(msg) => write!(f, "broken: {}", msg),
            ManagerError::Fatal(msg) => write!(f, "fatal: {}", msg),
        }
    }
}

impl std::error::Error for ManagerError {}

impl From<rusqlite::Error> for ManagerError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => {
                ManagerError::NotFound("row not found".to_string())
            }
            other => ManagerError::Fatal(format!("sqlite: {}", other)),
        }
    }
}

impl From<std::io::Error> for ManagerError {
    fn from(e: std::io::Error) -> Self {
        ManagerError::Fatal(format!("io: {}", e))
    }
}

/// Reached only when serializing the manager's own structs for disk or
/// SQLite storage, so a failure here is an internal bug, never a caller
/// error. Request-body parsing at the API boundary maps to
/// `InvalidArgument` explicitly at the call site instead.
impl From<serde_json::Error> for ManagerError {
    fn from(e: serde_json::Error) -> Self {
        ManagerError::Fatal(format!("json: {}", e))
    }
}

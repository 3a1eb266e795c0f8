//! Error types for vc
//!
//! Exit codes:
//! - 0: Success
//! - 2: User error (bad args, unknown version/branch, missing config)
//! - 3: Blocked by state (uncommitted changes, conflicts, non-fast-forward)
//! - 4: Operation failed (database error, lock timeout, stalled listener)

use thiserror::Error;

use crate::tree::VersionId;

/// Exit codes for the vc CLI
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const USER_ERROR: i32 = 2;
    pub const STATE_BLOCKED: i32 = 3;
    pub const OPERATION_FAILED: i32 = 4;
}

/// Main error type for vc operations
#[derive(Error, Debug)]
pub enum Error {
    // User errors (exit code 2)
    #[error("Collection '{0}' is not initialised for versioning")]
    NotInitialized(String),

    #[error("Collection '{0}' is already initialised for versioning")]
    AlreadyInitialized(String),

    #[error("Version {0} does not exist")]
    InvalidVersion(VersionId),

    #[error("Branch '{0}' already exists")]
    BranchExists(String),

    #[error("Branch '{0}' does not exist")]
    UnknownBranch(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // State blocks (exit code 3)
    #[error("The collection has uncommitted changes; register, stash or discard them first")]
    UncommittedChanges,

    #[error("Cannot register in detached mode without a branch name")]
    DetachedWithoutBranch,

    #[error("Push rejected: the remote tip of branch '{0}' is not an ancestor of the local tip; pull first")]
    NonFastForward(String),

    #[error("Automatic merge of branch '{0}' produced conflicts; run resolve-conflicts, then register")]
    AutoMergeFailed(String),

    #[error("The collection has {0} unresolved conflicts")]
    UnresolvedConflicts(usize),

    // Operation failures (exit code 4)
    #[error("The change listener did not reach the fence within {0:?}")]
    ListenerStalled(std::time::Duration),

    #[error("Could not acquire the versioning lock for '{0}' in time")]
    LockTimeout(String),

    #[error("The versioning lock for '{0}' was lost while held")]
    LockLost(String),

    #[error("Corrupt version data: {0}")]
    CorruptState(String),

    #[error("Delta codec error: {0}")]
    Codec(String),

    #[error("Database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("BSON encode error: {0}")]
    BsonSer(#[from] bson::ser::Error),

    #[error("BSON decode error: {0}")]
    BsonDe(#[from] bson::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Merge tool failed: {0}")]
    MergeTool(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

impl Error {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NotInitialized(_)
            | Error::AlreadyInitialized(_)
            | Error::InvalidVersion(_)
            | Error::BranchExists(_)
            | Error::UnknownBranch(_)
            | Error::InvalidArgument(_)
            | Error::InvalidConfig(_) => exit_codes::USER_ERROR,

            Error::UncommittedChanges
            | Error::DetachedWithoutBranch
            | Error::NonFastForward(_)
            | Error::AutoMergeFailed(_)
            | Error::UnresolvedConflicts(_) => exit_codes::STATE_BLOCKED,

            Error::ListenerStalled(_)
            | Error::LockTimeout(_)
            | Error::LockLost(_)
            | Error::CorruptState(_)
            | Error::Codec(_)
            | Error::Database(_)
            | Error::BsonSer(_)
            | Error::BsonDe(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::TomlParse(_)
            | Error::TomlSerialize(_)
            | Error::MergeTool(_)
            | Error::OperationFailed(_) => exit_codes::OPERATION_FAILED,
        }
    }
}

/// Result type alias for vc operations
pub type Result<T> = std::result::Result<T, Error>;

/// Wrapper for displaying errors in JSON format
#[derive(serde::Serialize)]
pub struct JsonError {
    pub error: String,
    pub code: i32,
}

impl From<&Error> for JsonError {
    fn from(err: &Error) -> Self {
        JsonError {
            error: err.to_string(),
            code: err.exit_code(),
        }
    }
}

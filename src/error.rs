//! Unified error types for the node agent, grouped along the taxonomy
//! used throughout the engines: validation, precondition, host-command,
//! transport, and persistence failures.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for sylved operations.
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to create C string: {0}")]
    CString(#[from] std::ffi::NulError),

    // --- Validation: structural/semantic input errors, never retried ---
    #[error("validation: {0}")]
    Validation(String),

    // --- Precondition: system state forbids the operation ---
    #[error("replication_lease_not_owned")]
    ReplicationLeaseNotOwned,

    #[error("backup_job_already_running")]
    BackupJobAlreadyRunning,

    #[error("cannot_add_network_when_inheriting_network")]
    CannotAddNetworkWhenInheriting,

    #[error("jail_base_storage_not_found")]
    JailBaseStorageNotFound,

    #[error("precondition: {0}")]
    Precondition(String),

    // --- Guest identity/lookup ---
    #[error("guest '{0}' not found")]
    GuestNotFound(String),

    #[error("guest '{0}' is already running")]
    GuestAlreadyRunning(String),

    #[error("guest '{0}' is not running")]
    GuestNotRunning(String),

    #[error("unknown dependency '{0}' - guest not defined")]
    UnknownDependency(String),

    // --- Jail engine ---
    #[error("jail path does not exist: {0}")]
    JailPathNotFound(PathBuf),

    #[error("jail operation failed: {0}")]
    JailOperation(String),

    #[error("jail_get syscall failed: {0}")]
    JailGet(String),

    #[error("failed to attach to jail with JID {0}")]
    JailAttachFailed(i32),

    #[error("command execution failed in jail: {0}")]
    JailExecFailed(String),

    // --- VM engine ---
    #[error("vm operation failed: {0}")]
    VmOperation(String),

    #[error("domain definition failed: {0}")]
    DomainDefinition(String),

    #[error("console session '{0}' not found")]
    ConsoleSessionNotFound(String),

    // --- ZFS gateway ---
    #[error("zfs operation failed: {0}")]
    Zfs(String),

    #[error("zfs not enabled but required for operation")]
    ZfsNotEnabled,

    // --- Snapshot / restore core ---
    #[error("snapshot '{0}' not found")]
    SnapshotNotFound(String),

    #[error("snapshot restore failed: {0}")]
    RestoreFailed(String),

    // --- System ---
    #[error("command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    // --- Network ---
    #[error("network error: {0}")]
    Network(String),

    #[error("interface '{0}' not found")]
    InterfaceNotFound(String),

    #[error("network object '{0}' not found")]
    NetworkObjectNotFound(u64),

    // --- Hooks ---
    #[error("hook failed at phase '{phase}': {command} - {message}")]
    HookFailed {
        phase: String,
        command: String,
        message: String,
    },

    #[error("hook timeout after {0} seconds")]
    HookTimeout(u64),

    #[error("jail command timeout after {0} seconds")]
    JailTimeout(u64),

    // --- Replication transport ---
    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("unknown peer '{0}'")]
    UnknownPeer(String),

    #[error("protocol version mismatch: expected {expected}, got {got}")]
    ProtocolVersion { expected: u32, got: u32 },

    // --- Backup scheduler ---
    #[error("invalid cron expression '{0}'")]
    InvalidCronExpr(String),

    #[error("all_{op}_failed: {details}")]
    AllFailed { op: String, details: String },

    #[error("partial_{op}_failure: {details}")]
    PartialFailure { op: String, details: String },

    // --- Persistence (SQL store collaborator) ---
    #[error("store error: {0}")]
    Store(String),
}

/// Result type alias for sylved operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Host-command output is recognized as a swallowable soft error when it
/// matches one of these case-insensitive substrings and the caller's
/// operation is idempotent (e.g. destroying an already-absent dataset,
/// or attaching a jail that is already attached).
const SOFT_ERROR_SUBSTRINGS: &[&str] = &[
    "not found",
    "no such process",
    "dataset does not exist",
    "no such dataset",
    "dataset already exists",
    "does not have any resumable receive state",
];

/// Case-insensitive substring match against the recognized soft-error
/// vocabulary. Used at call sites that treat absence as success
/// (delete, resume-token clearing, parent-exists checks).
pub fn is_soft_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    SOFT_ERROR_SUBSTRINGS
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Same check restricted to the ZFS "dataset is missing" family, used
/// where "dataset already exists" must NOT be treated as benign.
pub fn is_missing_dataset_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("dataset does not exist")
        || lower.contains("no such dataset")
        || lower.contains("not found")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_soft_errors() {
        assert!(is_soft_error("cannot open 'tank/x': dataset does not exist"));
        assert!(is_soft_error("jail: foo: not found"));
        assert!(is_soft_error("kill: No such process"));
        assert!(!is_soft_error("permission denied"));
    }

    #[test]
    fn missing_dataset_excludes_already_exists() {
        assert!(is_missing_dataset_error("no such dataset tank/x"));
        assert!(!is_missing_dataset_error("dataset already exists"));
    }
}

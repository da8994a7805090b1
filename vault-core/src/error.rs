//! Typed error taxonomy shared by the vault engine, backup manager and
//! health check engine, plus the FR-011 user-facing message shaping.

use std::path::PathBuf;
use thiserror::Error;

/// Minimum allowed Argon2 work factor. Values below this are rejected
/// outright; `0` stored on disk is interpreted as the legacy default
/// (see [`crate::vault::LEGACY_ITERATIONS`]).
pub const MIN_ITERATIONS: u32 = 100_000;

/// Work factor written into freshly created vaults.
pub const DEFAULT_ITERATIONS: u32 = 600_000;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault not found at {0}")]
    VaultNotFound(PathBuf),

    #[error("vault already exists at {0}")]
    VaultExists(PathBuf),

    #[error("vault is corrupted: {0}")]
    VaultCorrupted(String),

    #[error("wrong password")]
    WrongPassword,

    #[error("verification of the written vault failed: {0}")]
    VerificationFailed(String),

    #[error("disk space exhausted")]
    DiskSpaceExhausted,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("filesystem does not support atomic rename: {0}")]
    FilesystemNotAtomic(String),

    #[error("backup operation failed: {0}")]
    BackupFailed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("CRITICAL: commit failed during final rename: {0}")]
    CriticalCommitFailure(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VaultError {
    /// Whether this error belongs to the CRITICAL class: the second rename
    /// of the atomic save protocol failed.
    pub fn is_critical(&self) -> bool {
        matches!(self, VaultError::CriticalCommitFailure(_))
    }

    /// Exit code for CLI surfacing: 0 success path is handled by callers;
    /// any `VaultError` maps to a nonzero code, with CRITICAL failures
    /// mapped distinctly from ordinary failures.
    pub fn exit_code(&self) -> i32 {
        if self.is_critical() {
            3
        } else {
            1
        }
    }

    /// Remedial action to suggest, chosen by error kind.
    fn remedy(&self) -> &'static str {
        match self {
            VaultError::WrongPassword | VaultError::VerificationFailed(_) => {
                "Check your master password and try again"
            }
            VaultError::DiskSpaceExhausted => "Free up at least 50 MB and try again",
            VaultError::PermissionDenied(_) => "Check file permissions for your vault directory",
            VaultError::FilesystemNotAtomic(_) => {
                "Move your vault to a local filesystem (not NFS/SMB)"
            }
            VaultError::BackupFailed(_) => "Check that a valid backup exists and retry",
            VaultError::VaultNotFound(_) => "Run the init command to create a vault first",
            VaultError::VaultExists(_) => "Choose a different vault path or remove the existing vault",
            VaultError::VaultCorrupted(_) => "Restore from a backup with the restore command",
            VaultError::InvalidArgument(_) => "Check the arguments passed to this command",
            VaultError::CriticalCommitFailure(_) => {
                "Verify vault integrity and restore manually from the .backup file if needed"
            }
            VaultError::Io(_) => "Check the underlying filesystem and retry",
        }
    }

    /// FR-011 shaped user-visible message: non-critical errors describe the
    /// vault as unmodified and name a remedy; critical errors describe the
    /// attempted automatic restore.
    pub fn user_message(&self) -> String {
        if self.is_critical() {
            format!(
                "CRITICAL: save failed during final commit ({self}). Automatic restore attempted. {}",
                self.remedy()
            )
        } else {
            format!(
                "save failed: {self}. Your vault was not modified. {}",
                self.remedy()
            )
        }
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;

//! Filesystem abstraction: the narrow capability interface the vault
//! engine binds to instead of calling `std::fs` directly, so tests can
//! inject faults (permission denied, disk full, non-atomic rename) to
//! drive the atomic save protocol's failure paths.

use crate::error::VaultError;
use std::path::{Path, PathBuf};

/// Owner-only read/write file mode for vault artefacts.
#[cfg(unix)]
pub const FILE_MODE: u32 = 0o600;
/// Owner-only full directory mode.
#[cfg(unix)]
pub const DIR_MODE: u32 = 0o700;

pub trait Filesystem: Send + Sync {
    fn read_file(&self, path: &Path) -> Result<Vec<u8>, VaultError>;
    fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<(), VaultError>;
    fn rename(&self, old: &Path, new: &Path) -> Result<(), VaultError>;
    fn remove(&self, path: &Path) -> Result<(), VaultError>;
    fn mkdir_all(&self, path: &Path) -> Result<(), VaultError>;
    fn stat(&self, path: &Path) -> Result<FileStat, VaultError>;
    fn exists(&self, path: &Path) -> bool;
    fn glob(&self, dir: &Path, prefix: &str) -> Result<Vec<PathBuf>, VaultError>;
}

#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub len: u64,
    pub mode: u32,
    pub modified: std::time::SystemTime,
}

/// Production filesystem: a thin wrapper over `std::fs` that enforces
/// owner-only modes on everything it creates.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFilesystem;

impl OsFilesystem {
    fn io_err(path: &Path, e: std::io::Error) -> VaultError {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                VaultError::PermissionDenied(format!("{}: {e}", path.display()))
            }
            std::io::ErrorKind::NotFound => VaultError::VaultNotFound(path.to_path_buf()),
            _ if e.raw_os_error() == Some(28) => VaultError::DiskSpaceExhausted,
            _ => VaultError::Io(e),
        }
    }

    #[cfg(unix)]
    fn set_file_mode(path: &Path) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(FILE_MODE))
    }

    #[cfg(not(unix))]
    fn set_file_mode(_path: &Path) -> std::io::Result<()> {
        Ok(())
    }

    #[cfg(unix)]
    fn set_dir_mode(path: &Path) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(DIR_MODE))
    }

    #[cfg(not(unix))]
    fn set_dir_mode(_path: &Path) -> std::io::Result<()> {
        Ok(())
    }
}

impl Filesystem for OsFilesystem {
    fn read_file(&self, path: &Path) -> Result<Vec<u8>, VaultError> {
        std::fs::read(path).map_err(|e| Self::io_err(path, e))
    }

    fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<(), VaultError> {
        std::fs::write(path, bytes).map_err(|e| Self::io_err(path, e))?;
        let file = std::fs::File::open(path).map_err(|e| Self::io_err(path, e))?;
        file.sync_all().map_err(|e| Self::io_err(path, e))?;
        Self::set_file_mode(path).map_err(|e| Self::io_err(path, e))?;
        Ok(())
    }

    fn rename(&self, old: &Path, new: &Path) -> Result<(), VaultError> {
        std::fs::rename(old, new).map_err(|e| Self::io_err(old, e))
    }

    fn remove(&self, path: &Path) -> Result<(), VaultError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err(path, e)),
        }
    }

    fn mkdir_all(&self, path: &Path) -> Result<(), VaultError> {
        std::fs::create_dir_all(path).map_err(|e| Self::io_err(path, e))?;
        Self::set_dir_mode(path).map_err(|e| Self::io_err(path, e))?;
        Ok(())
    }

    fn stat(&self, path: &Path) -> Result<FileStat, VaultError> {
        let meta = std::fs::metadata(path).map_err(|e| Self::io_err(path, e))?;
        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            meta.permissions().mode() & 0o777
        };
        #[cfg(not(unix))]
        let mode = 0o600;
        Ok(FileStat {
            len: meta.len(),
            mode,
            modified: meta.modified().map_err(|e| Self::io_err(path, e))?,
        })
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn glob(&self, dir: &Path, prefix: &str) -> Result<Vec<PathBuf>, VaultError> {
        let mut matches = Vec::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(matches),
            Err(e) => return Err(Self::io_err(dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| Self::io_err(dir, e))?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(prefix) {
                matches.push(entry.path());
            }
        }
        Ok(matches)
    }
}

/// Fault-injection seam, always compiled (not `cfg(test)`-gated) so that
/// integration tests under `tests/` can also drive it.
pub mod fault {
    //! Fault-injecting filesystem used by the atomic-save-protocol tests.
    //! Wraps [`OsFilesystem`] and can be told to fail the Nth call to a
    //! given operation.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Op {
        WriteFile,
        Rename,
        Remove,
    }

    #[derive(Default)]
    struct State {
        call_counts: HashMap<Op, u32>,
        /// op -> [(call ordinal to fail, error to return), ...]; more than
        /// one entry per op lets a test drive both the primary failure and
        /// a subsequent rollback failure (the double-failure case).
        faults: HashMap<Op, Vec<(u32, FaultKind)>>,
    }

    #[derive(Debug, Clone, Copy)]
    pub enum FaultKind {
        PermissionDenied,
        DiskFull,
        NotAtomic,
    }

    pub struct FaultFilesystem {
        inner: OsFilesystem,
        state: Mutex<State>,
    }

    impl Default for FaultFilesystem {
        fn default() -> Self {
            Self {
                inner: OsFilesystem,
                state: Mutex::new(State::default()),
            }
        }
    }

    impl FaultFilesystem {
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail the `nth` (1-indexed) call to `op` with `kind`. Can be
        /// called more than once for the same `op` to fail several ordinals
        /// (e.g. a rename and the rollback rename that follows it).
        pub fn fail_nth(&self, op: Op, nth: u32, kind: FaultKind) {
            self.state.lock().faults.entry(op).or_default().push((nth, kind));
        }

        fn should_fail(&self, op: Op) -> Option<FaultKind> {
            let mut state = self.state.lock();
            let count = state.call_counts.entry(op).or_insert(0);
            *count += 1;
            let current = *count;
            if let Some(entries) = state.faults.get(&op) {
                for (nth, kind) in entries {
                    if *nth == current {
                        return Some(*kind);
                    }
                }
            }
            None
        }

        fn fault_to_error(kind: FaultKind, path: &Path) -> VaultError {
            match kind {
                FaultKind::PermissionDenied => {
                    VaultError::PermissionDenied(format!("injected fault: {}", path.display()))
                }
                FaultKind::DiskFull => VaultError::DiskSpaceExhausted,
                FaultKind::NotAtomic => {
                    VaultError::FilesystemNotAtomic(format!("injected fault: {}", path.display()))
                }
            }
        }
    }

    impl Filesystem for FaultFilesystem {
        fn read_file(&self, path: &Path) -> Result<Vec<u8>, VaultError> {
            self.inner.read_file(path)
        }

        fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<(), VaultError> {
            if let Some(kind) = self.should_fail(Op::WriteFile) {
                return Err(Self::fault_to_error(kind, path));
            }
            self.inner.write_file(path, bytes)
        }

        fn rename(&self, old: &Path, new: &Path) -> Result<(), VaultError> {
            if let Some(kind) = self.should_fail(Op::Rename) {
                return Err(Self::fault_to_error(kind, old));
            }
            self.inner.rename(old, new)
        }

        fn remove(&self, path: &Path) -> Result<(), VaultError> {
            if let Some(kind) = self.should_fail(Op::Remove) {
                return Err(Self::fault_to_error(kind, path));
            }
            self.inner.remove(path)
        }

        fn mkdir_all(&self, path: &Path) -> Result<(), VaultError> {
            self.inner.mkdir_all(path)
        }

        fn stat(&self, path: &Path) -> Result<FileStat, VaultError> {
            self.inner.stat(path)
        }

        fn exists(&self, path: &Path) -> bool {
            self.inner.exists(path)
        }

        fn glob(&self, dir: &Path, prefix: &str) -> Result<Vec<PathBuf>, VaultError> {
            self.inner.glob(dir, prefix)
        }
    }
}

//! Backup lifecycle: automatic N-1 backup discovery, timestamped manual
//! backups, cheap integrity pre-checks, and restore selection.
//!
//! Manual backups are written to a staging sibling, fsynced, then renamed
//! into place, so a crash mid-copy never leaves a half-written backup
//! visible under its real name.

use crate::error::VaultError;
use crate::fs::Filesystem;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::info;

/// Minimum plausible size for a vault-shaped file (cheap pre-check, not a
/// real parse).
const MIN_PLAUSIBLE_SIZE: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupType {
    Automatic,
    Manual,
}

#[derive(Debug, Clone)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub modified: SystemTime,
    pub size: u64,
    pub kind: BackupType,
    pub is_corrupted: bool,
}

pub struct BackupManager {
    vault_path: PathBuf,
    fs: Arc<dyn Filesystem>,
}

impl BackupManager {
    pub fn new(vault_path: impl Into<PathBuf>, fs: Arc<dyn Filesystem>) -> Self {
        Self {
            vault_path: vault_path.into(),
            fs,
        }
    }

    fn automatic_backup_path(&self) -> PathBuf {
        let mut p = self.vault_path.clone().into_os_string();
        p.push(".backup");
        PathBuf::from(p)
    }

    fn manual_backup_path(&self) -> PathBuf {
        let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
        let mut p = self.vault_path.clone().into_os_string();
        p.push(format!(".{timestamp}.manual.backup"));
        PathBuf::from(p)
    }

    fn vault_dir(&self) -> PathBuf {
        self.vault_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn vault_file_name(&self) -> String {
        self.vault_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Copies the vault under a UTC-timestamped manual-backup name: write to
    /// a `.staging` sibling, fsync, then rename into place, so a crash mid
    /// write never leaves a half-written manual backup visible under its
    /// real name.
    pub fn create_manual_backup(&self) -> Result<PathBuf, VaultError> {
        if !self.fs.exists(&self.vault_path) {
            return Err(VaultError::BackupFailed(format!(
                "vault not found at {}",
                self.vault_path.display()
            )));
        }
        self.fs.mkdir_all(&self.vault_dir())?;
        self.cleanup_staging();

        let bytes = self.fs.read_file(&self.vault_path)?;
        let dest = self.manual_backup_path();
        let staging = self.staging_path();
        self.fs.write_file(&staging, &bytes)?;
        if let Err(e) = self.fs.rename(&staging, &dest) {
            let _ = self.fs.remove(&staging);
            return Err(VaultError::BackupFailed(e.to_string()));
        }
        info!(path = %dest.display(), "manual backup created");
        Ok(dest)
    }

    fn staging_path(&self) -> PathBuf {
        let suffix = crate::crypto::random_hex(6);
        self.vault_dir()
            .join(format!("{}.staging.{suffix}", self.vault_file_name()))
    }

    fn cleanup_staging(&self) {
        let prefix = format!("{}.staging.", self.vault_file_name());
        if let Ok(matches) = self.fs.glob(&self.vault_dir(), &prefix) {
            for path in matches {
                let _ = self.fs.remove(&path);
            }
        }
    }

    /// Cheap, non-decrypting integrity pre-check: exists, size >= 100
    /// bytes, first 32 bytes readable.
    fn precheck(&self, path: &Path) -> bool {
        let stat = match self.fs.stat(path) {
            Ok(s) => s,
            Err(_) => return false,
        };
        if stat.len < MIN_PLAUSIBLE_SIZE {
            return false;
        }
        match self.fs.read_file(path) {
            Ok(bytes) => bytes.len() >= 32,
            Err(_) => false,
        }
    }

    /// Discovers the automatic backup (if present) and every manual backup,
    /// stats each, runs the integrity pre-check, and sorts newest-first by
    /// modification time.
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>, VaultError> {
        let mut results = Vec::new();

        let auto_path = self.automatic_backup_path();
        if self.fs.exists(&auto_path) {
            if let Ok(stat) = self.fs.stat(&auto_path) {
                results.push(BackupInfo {
                    path: auto_path.clone(),
                    modified: stat.modified,
                    size: stat.len,
                    kind: BackupType::Automatic,
                    is_corrupted: !self.precheck(&auto_path),
                });
            }
        }

        let manual_prefix = format!("{}.", self.vault_file_name());
        let candidates = self.fs.glob(&self.vault_dir(), &manual_prefix)?;
        for path in candidates {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if !name.ends_with(".manual.backup") {
                continue;
            }
            if let Ok(stat) = self.fs.stat(&path) {
                results.push(BackupInfo {
                    path: path.clone(),
                    modified: stat.modified,
                    size: stat.len,
                    kind: BackupType::Manual,
                    is_corrupted: !self.precheck(&path),
                });
            }
        }

        results.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(results)
    }

    /// Newest non-corrupted backup across both kinds, or `None`.
    pub fn find_newest_backup(&self) -> Result<Option<BackupInfo>, VaultError> {
        Ok(self
            .list_backups()?
            .into_iter()
            .find(|b| !b.is_corrupted))
    }

    /// Restores from `path`, or — when `path` is `None` — prefers the
    /// automatic backup when present, else the newest valid manual backup.
    /// The copy into vault position preserves atomic-rename semantics via
    /// the same staging pattern `create_manual_backup` uses.
    pub fn restore_from_backup(&self, path: Option<&Path>) -> Result<PathBuf, VaultError> {
        let chosen = match path {
            Some(p) => p.to_path_buf(),
            None => self.auto_pick_restore_source()?,
        };
        if !self.fs.exists(&chosen) {
            return Err(VaultError::BackupFailed(format!(
                "backup not found at {}",
                chosen.display()
            )));
        }
        let bytes = self.fs.read_file(&chosen)?;
        let staging = self.staging_path();
        self.fs.write_file(&staging, &bytes)?;
        if let Err(e) = self.fs.rename(&staging, &self.vault_path) {
            let _ = self.fs.remove(&staging);
            return Err(VaultError::BackupFailed(e.to_string()));
        }
        info!(source = %chosen.display(), "vault restored from backup");
        Ok(chosen)
    }

    fn auto_pick_restore_source(&self) -> Result<PathBuf, VaultError> {
        let auto_path = self.automatic_backup_path();
        if self.fs.exists(&auto_path) && self.precheck(&auto_path) {
            return Ok(auto_path);
        }
        self.find_newest_backup()?
            .map(|b| b.path)
            .ok_or_else(|| VaultError::BackupFailed("no valid backup found".into()))
    }

    /// Removes the automatic backup only. Absence is not an error.
    pub fn remove_backup(&self) -> Result<(), VaultError> {
        self.fs.remove(&self.automatic_backup_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::OsFilesystem;
    use std::thread::sleep;
    use std::time::Duration;
    use tempfile::tempdir;

    fn manager(dir: &Path) -> BackupManager {
        BackupManager::new(dir.join("vault.dat"), Arc::new(OsFilesystem))
    }

    fn write_vault(dir: &Path, contents: &[u8]) {
        std::fs::write(dir.join("vault.dat"), contents).unwrap();
    }

    #[test]
    fn manual_backup_missing_vault_errors() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        assert!(matches!(
            mgr.create_manual_backup(),
            Err(VaultError::BackupFailed(_))
        ));
    }

    #[test]
    fn manual_backup_copies_vault_contents() {
        let dir = tempdir().unwrap();
        write_vault(dir.path(), &[7u8; 200]);
        let mgr = manager(dir.path());
        let backup_path = mgr.create_manual_backup().unwrap();
        let copy = std::fs::read(&backup_path).unwrap();
        assert_eq!(copy, vec![7u8; 200]);
        assert!(backup_path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with(".manual.backup"));
    }

    #[test]
    fn list_backups_sorted_newest_first() {
        let dir = tempdir().unwrap();
        write_vault(dir.path(), &[1u8; 200]);
        let mgr = manager(dir.path());
        let first = mgr.create_manual_backup().unwrap();
        sleep(Duration::from_millis(1100));
        let second = mgr.create_manual_backup().unwrap();

        let listed = mgr.list_backups().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].path, second);
        assert_eq!(listed[1].path, first);
    }

    #[test]
    fn restore_prefers_automatic_over_manual() {
        let dir = tempdir().unwrap();
        write_vault(dir.path(), &[9u8; 200]);
        let mgr = manager(dir.path());
        mgr.create_manual_backup().unwrap();
        std::fs::write(dir.path().join("vault.dat.backup"), vec![5u8; 200]).unwrap();

        let chosen = mgr.restore_from_backup(None).unwrap();
        assert!(chosen.to_string_lossy().ends_with(".backup"));
        let restored = std::fs::read(dir.path().join("vault.dat")).unwrap();
        assert_eq!(restored, vec![5u8; 200]);
    }

    #[test]
    fn restore_falls_back_to_newest_manual_without_automatic() {
        let dir = tempdir().unwrap();
        write_vault(dir.path(), &[9u8; 200]);
        let mgr = manager(dir.path());
        let first = mgr.create_manual_backup().unwrap();
        sleep(Duration::from_millis(1100));
        write_vault(dir.path(), &[3u8; 200]);
        let second = mgr.create_manual_backup().unwrap();
        let _ = first;

        let chosen = mgr.restore_from_backup(None).unwrap();
        assert_eq!(chosen, second);
    }

    #[test]
    fn corrupted_backup_detected_by_precheck() {
        let dir = tempdir().unwrap();
        write_vault(dir.path(), &[9u8; 200]);
        let mgr = manager(dir.path());
        std::fs::write(dir.path().join("vault.dat.backup"), b"short").unwrap();
        let listed = mgr.list_backups().unwrap();
        let auto = listed.iter().find(|b| b.kind == BackupType::Automatic).unwrap();
        assert!(auto.is_corrupted);
    }

    #[test]
    fn remove_backup_absence_is_not_an_error() {
        let dir = tempdir().unwrap();
        write_vault(dir.path(), &[1u8; 200]);
        let mgr = manager(dir.path());
        assert!(mgr.remove_backup().is_ok());
    }
}

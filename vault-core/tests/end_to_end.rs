//! Cross-module end-to-end scenarios from the specification's testable
//! properties: doctor aggregation, orphaned keychain detection, and
//! backup-restore auto-pick, each driving the real `Vault` +
//! `BackupManager` + health check engine together rather than a single
//! module in isolation.

use std::sync::Arc;
use tempfile::tempdir;
use vault_core::backup::BackupManager;
use vault_core::fs::{Filesystem, OsFilesystem};
use vault_core::health::{self, CheckContext, CheckStatus};
use vault_core::keyring_backend::MockKeyringBackend;
use vault_core::vault::Vault;

fn fs() -> Arc<dyn Filesystem> {
    Arc::new(OsFilesystem)
}

#[test]
fn doctor_reports_all_pass_on_a_healthy_vault() {
    let dir = tempdir().unwrap();
    let vault_path = dir.path().join("vault.dat");
    let vault = Vault::new(&vault_path, fs());
    vault
        .initialize(b"TestPassword123!", br#"{"credentials":[]}"#)
        .unwrap();
    vault
        .save(br#"{"credentials":[{"service":"test"}]}"#, b"TestPassword123!", None)
        .unwrap();

    let context = CheckContext {
        vault_path: vault_path.clone(),
        config_path: dir.path().join("config.toml"),
        fs: fs(),
        keyring: Arc::new(MockKeyringBackend::new()),
        keyring_service: "securevault".into(),
        installed_version: "1.0.0".into(),
        release_api_url: None,
    };

    let report = health::run_all(&health::default_checkers(), &context);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.results.len(), 6);
    assert!(report.results.iter().all(|r| r.status == CheckStatus::Pass));
}

#[test]
fn doctor_flags_orphaned_keychain_entries_with_exit_code_two() {
    let dir = tempdir().unwrap();
    let vault_path = dir.path().join("vault.dat");
    let vault = Vault::new(&vault_path, fs());
    vault.initialize(b"pw", b"payload").unwrap();

    let mock = MockKeyringBackend::new();
    mock.insert("securevault", "/does/not/exist/one.dat", "secret-a");
    mock.insert("securevault", "/does/not/exist/two.dat", "secret-b");

    let context = CheckContext {
        vault_path,
        config_path: dir.path().join("config.toml"),
        fs: fs(),
        keyring: Arc::new(mock),
        keyring_service: "securevault".into(),
        installed_version: "1.0.0".into(),
        release_api_url: None,
    };

    let report = health::run_all(&health::default_checkers(), &context);
    assert_eq!(report.exit_code(), 2);
    let keychain = report.results.iter().find(|r| r.name == "keychain").unwrap();
    assert_eq!(keychain.status, CheckStatus::Error);
    assert_eq!(keychain.details.len(), 2);
}

#[test]
fn backup_restore_auto_pick_prefers_automatic_then_reloads_prior_payload() {
    let dir = tempdir().unwrap();
    let vault_path = dir.path().join("vault.dat");
    let vault = Vault::new(&vault_path, fs());
    let password = b"TestPassword123!";

    vault.initialize(password, b"generation-1").unwrap();
    vault.save(b"generation-2", password, None).unwrap();

    let backups = BackupManager::new(&vault_path, fs());
    let manual_1 = backups.create_manual_backup().unwrap();
    std::thread::sleep(std::time::Duration::from_millis(1100));
    vault.save(b"generation-3", password, None).unwrap();
    let manual_2 = backups.create_manual_backup().unwrap();
    let _ = (manual_1, manual_2);

    // Automatic backup now holds generation-2 (the N-1 of the last save).
    let chosen = backups.restore_from_backup(None).unwrap();
    assert!(chosen.to_string_lossy().ends_with(".backup"));

    let restored = vault.load(password).unwrap();
    assert_eq!(restored, b"generation-2");
}

#[test]
fn backup_restore_auto_pick_falls_back_to_newest_manual_when_no_automatic() {
    let dir = tempdir().unwrap();
    let vault_path = dir.path().join("only-manual.dat");
    let vault = Vault::new(&vault_path, fs());
    let password = b"TestPassword123!";
    vault.initialize(password, b"payload-a").unwrap();

    let backups = BackupManager::new(&vault_path, fs());
    let _older = backups.create_manual_backup().unwrap();

    // Remove the automatic backup (initialize() never creates one; this
    // asserts the precondition explicitly for readability).
    assert!(backups.remove_backup().is_ok());

    let chosen = backups.restore_from_backup(None).unwrap();
    assert!(chosen.to_string_lossy().ends_with(".manual.backup"));
}

//! Doctor-style health check engine: a pluggable `Checker` trait, six
//! registered checkers, and an aggregate report with an exit-code mapping.
//!
//! The Version checker probes over `reqwest::blocking` with a hard timeout;
//! the other checkers stat paths resolved via `directories` and go through
//! [`crate::keyring_backend::KeyringBackend`] for keychain access.

use crate::backup::BackupManager;
use crate::config::Config;
use crate::fs::Filesystem;
use crate::keyring_backend::{KeyringBackend, KeyringError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warning,
    Error,
}

impl CheckStatus {
    fn exit_weight(self) -> i32 {
        match self {
            CheckStatus::Pass => 0,
            CheckStatus::Warning => 1,
            CheckStatus::Error => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    pub recommendation: Option<String>,
    #[serde(default)]
    pub details: Vec<String>,
}

impl CheckResult {
    fn pass(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Pass,
            message: message.into(),
            recommendation: None,
            details: Vec::new(),
        }
    }

    fn warning(name: &str, message: impl Into<String>, recommendation: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Warning,
            message: message.into(),
            recommendation: Some(recommendation.into()),
            details: Vec::new(),
        }
    }

    fn error(name: &str, message: impl Into<String>, recommendation: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Error,
            message: message.into(),
            recommendation: Some(recommendation.into()),
            details: Vec::new(),
        }
    }

    fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = details;
        self
    }
}

/// Inputs every `Checker` may need, passed explicitly rather than read from
/// global state.
pub struct CheckContext {
    pub vault_path: PathBuf,
    pub config_path: PathBuf,
    pub fs: Arc<dyn Filesystem>,
    pub keyring: Arc<dyn KeyringBackend>,
    pub keyring_service: String,
    pub installed_version: String,
    pub release_api_url: Option<String>,
}

pub trait Checker: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, ctx: &CheckContext) -> CheckResult;
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub results: Vec<CheckResult>,
    pub pass_count: usize,
    pub warning_count: usize,
    pub error_count: usize,
}

impl HealthReport {
    /// P9: exit code is the `max` over {pass:0, warning:1, error:2}.
    pub fn exit_code(&self) -> i32 {
        self.results
            .iter()
            .map(|r| r.status.exit_weight())
            .max()
            .unwrap_or(0)
    }
}

/// Runs every registered checker and aggregates the results.
pub fn run_all(checkers: &[Box<dyn Checker>], ctx: &CheckContext) -> HealthReport {
    let results: Vec<CheckResult> = checkers.iter().map(|c| c.run(ctx)).collect();
    let pass_count = results.iter().filter(|r| r.status == CheckStatus::Pass).count();
    let warning_count = results
        .iter()
        .filter(|r| r.status == CheckStatus::Warning)
        .count();
    let error_count = results.iter().filter(|r| r.status == CheckStatus::Error).count();
    HealthReport {
        generated_at: Utc::now(),
        results,
        pass_count,
        warning_count,
        error_count,
    }
}

pub fn default_checkers() -> Vec<Box<dyn Checker>> {
    vec![
        Box::new(VersionChecker),
        Box::new(VaultFileChecker),
        Box::new(ConfigChecker),
        Box::new(KeychainChecker),
        Box::new(BackupChecker),
        Box::new(SyncChecker),
    ]
}

/// Outbound GET with a hard <=1s timeout to a release API. Network failure
/// never downgrades to a user-visible problem (P10): it passes with the
/// installed version echoed.
pub struct VersionChecker;

#[derive(Debug, serde::Deserialize)]
struct ReleaseResponse {
    tag_name: String,
}

impl Checker for VersionChecker {
    fn name(&self) -> &'static str {
        "version"
    }

    fn run(&self, ctx: &CheckContext) -> CheckResult {
        let Some(url) = ctx.release_api_url.as_deref() else {
            return CheckResult::pass("version", format!("running {}", ctx.installed_version));
        };

        let client = match reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(1))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                return CheckResult::pass(
                    "version",
                    format!("running {} (check_error: client build failed: {e})", ctx.installed_version),
                )
            }
        };

        match client.get(url).send().and_then(|r| r.error_for_status()) {
            Ok(resp) => match resp.json::<ReleaseResponse>() {
                Ok(release) => {
                    let latest = release.tag_name.trim_start_matches('v');
                    let installed = ctx.installed_version.trim_start_matches('v');
                    if latest > installed {
                        CheckResult::warning(
                            "version",
                            format!("update available: {installed} -> {latest}"),
                            format!("https://github.com/releases/tag/{}", release.tag_name),
                        )
                    } else {
                        CheckResult::pass("version", format!("running {installed} (latest)"))
                    }
                }
                Err(e) => CheckResult::pass(
                    "version",
                    format!("running {} (check_error: {e})", ctx.installed_version),
                ),
            },
            Err(e) => CheckResult::pass(
                "version",
                format!("running {} (check_error: {e})", ctx.installed_version),
            ),
        }
    }
}

/// Stats the vault path: missing is an error, group/other-readable modes
/// are a warning.
pub struct VaultFileChecker;

impl Checker for VaultFileChecker {
    fn name(&self) -> &'static str {
        "vault_file"
    }

    fn run(&self, ctx: &CheckContext) -> CheckResult {
        match ctx.fs.stat(&ctx.vault_path) {
            Err(_) => CheckResult::error(
                "vault_file",
                format!("no vault at {}", ctx.vault_path.display()),
                "initialize",
            ),
            Ok(stat) => {
                if stat.mode & 0o077 != 0 {
                    CheckResult::warning(
                        "vault_file",
                        format!("vault mode {:o} permits group/other access", stat.mode),
                        "chmod 0600",
                    )
                } else {
                    CheckResult::pass("vault_file", "vault file present with owner-only mode")
                }
            }
        }
    }
}

/// Parses the config file if present; absence is pass. Unknown keys and
/// out-of-range values warn.
pub struct ConfigChecker;

impl Checker for ConfigChecker {
    fn name(&self) -> &'static str {
        "config"
    }

    fn run(&self, ctx: &CheckContext) -> CheckResult {
        let config = match Config::load(&ctx.config_path) {
            Ok(c) => c,
            Err(e) => {
                return CheckResult::warning("config", format!("failed to parse config: {e}"), "fix the config file's TOML syntax")
            }
        };

        let mut warnings = Vec::new();
        if !config.unknown_keys.is_empty() {
            warnings.push(format!("unknown keys: {}", config.unknown_keys.join(", ")));
        }
        if config.clipboard_timeout_out_of_range() {
            warnings.push(format!(
                "clipboard_timeout_secs {} outside 5-300",
                config.clipboard_timeout_secs
            ));
        }

        if warnings.is_empty() {
            CheckResult::pass("config", "config valid")
        } else {
            CheckResult::warning("config", warnings.join("; "), "review config.toml").with_details(warnings)
        }
    }
}

/// Determines the keyring backend from the platform, attempts a `get`, and
/// (only when `list` is supported — the mock backend in tests) cross
/// references listed entries against the vault path to detect orphans.
pub struct KeychainChecker;

impl Checker for KeychainChecker {
    fn name(&self) -> &'static str {
        "keychain"
    }

    fn run(&self, ctx: &CheckContext) -> CheckResult {
        let account = ctx.vault_path.to_string_lossy().to_string();
        match ctx.keyring.get(&ctx.keyring_service, &account) {
            Ok(_) | Err(KeyringError::NotFound { .. }) => {}
            Err(e) => return CheckResult::warning("keychain", format!("keychain access error: {e}"), "check OS keychain permissions"),
        }

        match ctx.keyring.list(&ctx.keyring_service) {
            Err(KeyringError::EnumerationUnsupported) => {
                CheckResult::pass("keychain", "keychain accessible (enumeration unsupported by this backend)")
            }
            Err(e) => CheckResult::warning("keychain", format!("keychain access error: {e}"), "check OS keychain permissions"),
            Ok(entries) => {
                // `account` is the vault path the entry was stored under
                // (see the `get` call above); `_secret` is the keychain
                // payload itself and says nothing about path existence.
                let orphans: Vec<String> = entries
                    .into_iter()
                    .filter(|(account, _secret)| !ctx.fs.exists(Path::new(account)))
                    .map(|(account, secret)| format!("{account} -> {secret}"))
                    .collect();
                if orphans.is_empty() {
                    CheckResult::pass("keychain", "no orphaned keychain entries")
                } else {
                    CheckResult::error(
                        "keychain",
                        format!("{} orphaned keychain entr{} referencing missing vault files", orphans.len(), if orphans.len() == 1 { "y" } else { "ies" }),
                        "remove the stale keychain entries",
                    )
                    .with_details(orphans)
                }
            }
        }
    }
}

/// Globs backup files in the vault directory and classifies each by age.
pub struct BackupChecker;

impl Checker for BackupChecker {
    fn name(&self) -> &'static str {
        "backup"
    }

    fn run(&self, ctx: &CheckContext) -> CheckResult {
        let manager = BackupManager::new(ctx.vault_path.clone(), ctx.fs.clone());
        let backups = match manager.list_backups() {
            Ok(b) => b,
            Err(e) => return CheckResult::warning("backup", format!("failed to list backups: {e}"), "check vault directory permissions"),
        };

        if backups.is_empty() {
            return CheckResult::warning("backup", "no backups found", "run a save or create a manual backup");
        }

        let now = std::time::SystemTime::now();
        let mut stale = Vec::new();
        for b in &backups {
            let age = now.duration_since(b.modified).unwrap_or_default();
            let label = if age < Duration::from_secs(24 * 3600) {
                "recent"
            } else if age < Duration::from_secs(7 * 24 * 3600) {
                "old"
            } else {
                "abandoned"
            };
            if label != "recent" {
                stale.push(format!("{} ({label})", b.path.display()));
            }
        }

        if stale.is_empty() {
            CheckResult::pass("backup", format!("{} backup(s), most recent is current", backups.len()))
        } else {
            CheckResult::warning("backup", format!("{} stale backup(s)", stale.len()), "create a fresh backup").with_details(stale)
        }
    }
}

/// Reads sync config; disabled is pass, enabled-without-remote warns,
/// enabled-with-remote checks for `rclone` on PATH.
pub struct SyncChecker;

impl Checker for SyncChecker {
    fn name(&self) -> &'static str {
        "sync"
    }

    fn run(&self, ctx: &CheckContext) -> CheckResult {
        let config = Config::load(&ctx.config_path).unwrap_or_default();
        if !config.sync.enabled {
            return CheckResult::pass("sync", "sync disabled");
        }
        if config.sync.remote.is_none() {
            return CheckResult::warning("sync", "sync enabled but no remote configured", "set sync.remote in config.toml");
        }
        match which_rclone() {
            Some(version) => CheckResult::pass("sync", format!("rclone available ({version})")),
            None => CheckResult::warning("sync", "rclone not found on PATH", "install rclone"),
        }
    }
}

fn which_rclone() -> Option<String> {
    let output = std::process::Command::new("rclone").arg("version").output();
    match output {
        Ok(o) if o.status.success() => {
            let text = String::from_utf8_lossy(&o.stdout);
            Some(text.lines().next().unwrap_or("unknown").to_string())
        }
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "rclone not resolvable on PATH");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::OsFilesystem;
    use crate::keyring_backend::MockKeyringBackend;
    use tempfile::tempdir;

    fn ctx(dir: &Path, keyring: Arc<dyn KeyringBackend>) -> CheckContext {
        CheckContext {
            vault_path: dir.join("vault.dat"),
            config_path: dir.join("config.toml"),
            fs: Arc::new(OsFilesystem),
            keyring,
            keyring_service: "securevault".into(),
            installed_version: "1.2.0".into(),
            release_api_url: None,
        }
    }

    #[test]
    fn all_pass_when_vault_present_and_recent_backup() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("vault.dat"), vec![0u8; 200]).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir.path().join("vault.dat"), std::fs::Permissions::from_mode(0o600)).unwrap();
        }
        std::fs::write(dir.path().join("vault.dat.backup"), vec![0u8; 200]).unwrap();

        let context = ctx(dir.path(), Arc::new(MockKeyringBackend::new()));
        let report = run_all(&default_checkers(), &context);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.results.len(), 6);
        assert!(report.results.iter().all(|r| r.status == CheckStatus::Pass));
    }

    #[test]
    fn missing_vault_is_error_and_exit_code_two() {
        let dir = tempdir().unwrap();
        let context = ctx(dir.path(), Arc::new(MockKeyringBackend::new()));
        let report = run_all(&default_checkers(), &context);
        assert_eq!(report.exit_code(), 2);
        let vault_check = report.results.iter().find(|r| r.name == "vault_file").unwrap();
        assert_eq!(vault_check.status, CheckStatus::Error);
    }

    #[test]
    fn orphaned_keychain_entries_are_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("vault.dat"), vec![0u8; 200]).unwrap();
        let mock = Arc::new(MockKeyringBackend::new());
        mock.insert("securevault", "/nonexistent/one.dat", "secret1");
        mock.insert("securevault", "/nonexistent/two.dat", "secret2");
        let context = ctx(dir.path(), mock);

        let checker = KeychainChecker;
        let result = checker.run(&context);
        assert_eq!(result.status, CheckStatus::Error);
        assert_eq!(result.details.len(), 2);
    }

    #[test]
    fn exit_code_is_max_of_statuses() {
        let results = vec![
            CheckResult::pass("a", "ok"),
            CheckResult::warning("b", "meh", "fix it"),
        ];
        let report = HealthReport {
            generated_at: Utc::now(),
            pass_count: 1,
            warning_count: 1,
            error_count: 0,
            results,
        };
        assert_eq!(report.exit_code(), 1);
    }
}

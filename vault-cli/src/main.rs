//! Thin CLI front end exercising the vault storage engine, backup manager
//! and health check engine end to end. Argument wiring only — all hard
//! engineering lives in `vault-core`.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use vault_core::backup::BackupManager;
use vault_core::fs::{Filesystem, OsFilesystem};
use vault_core::health::{self, CheckContext, CheckStatus};
use vault_core::keyring_backend::OsKeyringBackend;
use vault_core::vault::{ProgressEvent, Vault};
use vault_core::VaultError;

const KEYRING_SERVICE: &str = "securevault";
const INSTALLED_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "vault-cli")]
#[command(about = "Offline encrypted secrets vault", long_about = None)]
struct Cli {
    /// Path to the vault file. Defaults to the platform data directory.
    #[arg(long, global = true)]
    vault: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new v1 vault.
    Init,
    /// Decrypt and print the vault payload to stdout.
    Load,
    /// Replace the vault payload with JSON read from a file (or stdin with `-`).
    Save {
        #[arg(long, default_value = "-")]
        file: String,
    },
    /// Change the master password of a v2 vault.
    ChangePassword,
    /// Migrate a v1 vault to the wrapped-DEK v2 format.
    MigrateToV2,
    /// Raise the Argon2 work factor (time cost) on an existing vault.
    Rekey {
        #[arg(long)]
        iterations: u32,
    },
    /// Backup lifecycle operations.
    #[command(subcommand)]
    Backup(BackupCommands),
    /// Run health checks and print a report.
    Doctor {
        /// Optional release API URL for the version check; omitted by default.
        #[arg(long)]
        release_api_url: Option<String>,
    },
}

#[derive(Subcommand)]
enum BackupCommands {
    /// Create a timestamped manual backup.
    Create,
    /// List all discovered backups, newest first.
    List,
    /// Restore the vault from a backup (auto-picks when no path is given).
    Restore {
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        if let Some(vault_err) = e.downcast_ref::<VaultError>() {
            eprintln!("{}", vault_err.user_message());
            std::process::exit(vault_err.exit_code());
        } else {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

fn resolve_vault_path(cli_path: &Option<PathBuf>) -> Result<PathBuf> {
    match cli_path {
        Some(p) => Ok(p.clone()),
        None => vault_core::paths::default_vault_path(),
    }
}

fn prompt_password(prompt: &str) -> Result<Vec<u8>> {
    let text = rpassword::prompt_password(prompt).context("reading password from terminal")?;
    Ok(text.into_bytes())
}

fn progress_logger(event: ProgressEvent) {
    tracing::info!(event = event.name(), "atomic save progress");
}

fn run(cli: Cli) -> Result<()> {
    let vault_path = resolve_vault_path(&cli.vault)?;
    let fs: Arc<dyn Filesystem> = Arc::new(OsFilesystem);

    match cli.command {
        Commands::Init => {
            if let Some(parent) = vault_path.parent() {
                fs.mkdir_all(parent)?;
            }
            let password = prompt_password("New master password: ")?;
            let confirm = prompt_password("Confirm master password: ")?;
            if password != confirm {
                return Err(anyhow!("passwords did not match"));
            }
            let vault = Vault::new(&vault_path, fs);
            vault
                .initialize(&password, br#"{"credentials":[]}"#)
                .map_err(anyhow::Error::from)?;
            println!("vault initialized at {}", vault_path.display());
            Ok(())
        }
        Commands::Load => {
            let password = prompt_password("Master password: ")?;
            let vault = Vault::new(&vault_path, fs);
            let payload = vault.load(&password).map_err(anyhow::Error::from)?;
            println!("{}", String::from_utf8_lossy(&payload));
            Ok(())
        }
        Commands::Save { file } => {
            let payload = read_payload(&file)?;
            let password = prompt_password("Master password: ")?;
            let vault = Vault::new(&vault_path, fs);
            let cb = progress_logger;
            vault
                .save(&payload, &password, Some(&cb))
                .map_err(anyhow::Error::from)?;
            println!("vault saved");
            Ok(())
        }
        Commands::ChangePassword => {
            let old_password = prompt_password("Current master password: ")?;
            let new_password = prompt_password("New master password: ")?;
            let vault = Vault::new(&vault_path, fs);
            let payload = vault.load(&old_password).map_err(anyhow::Error::from)?;
            let cb = progress_logger;
            vault
                .change_password_v2(&payload, &old_password, &new_password, Some(&cb))
                .map_err(anyhow::Error::from)?;
            println!("master password changed");
            Ok(())
        }
        Commands::MigrateToV2 => {
            let password = prompt_password("Master password: ")?;
            let vault = Vault::new(&vault_path, fs);
            let payload = vault.load(&password).map_err(anyhow::Error::from)?;
            let info = vault.get_vault_info().map_err(anyhow::Error::from)?;
            let salt = vault_core::crypto::generate_salt();
            let dek = vault_core::crypto::generate_dek();
            let kek = vault_core::crypto::derive_key(&password, &salt, info.iterations)
                .map_err(anyhow::Error::from)?;
            let wrapped =
                vault_core::crypto::wrap_key(&dek, &kek).map_err(anyhow::Error::from)?;
            let cb = progress_logger;
            vault
                .migrate_to_v2(&payload, &dek, wrapped, salt, info.iterations, Some(&cb))
                .map_err(anyhow::Error::from)?;
            println!("vault migrated to v2");
            Ok(())
        }
        Commands::Rekey { iterations } => {
            let password = prompt_password("Master password: ")?;
            let vault = Vault::new(&vault_path, fs);
            let payload = vault.load(&password).map_err(anyhow::Error::from)?;
            let cb = progress_logger;
            vault
                .save_with_iterations(&payload, &password, iterations, Some(&cb))
                .map_err(anyhow::Error::from)?;
            println!("work factor updated to {iterations} iterations");
            Ok(())
        }
        Commands::Backup(sub) => run_backup(sub, &vault_path, fs),
        Commands::Doctor { release_api_url } => run_doctor(&vault_path, fs, release_api_url),
    }
}

fn read_payload(file: &str) -> Result<Vec<u8>> {
    if file == "-" {
        use std::io::Read;
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("reading payload from stdin")?;
        Ok(buf)
    } else {
        std::fs::read(file).with_context(|| format!("reading payload file {file}"))
    }
}

fn run_backup(sub: BackupCommands, vault_path: &PathBuf, fs: Arc<dyn Filesystem>) -> Result<()> {
    let manager = BackupManager::new(vault_path.clone(), fs);
    match sub {
        BackupCommands::Create => {
            let path = manager.create_manual_backup().map_err(anyhow::Error::from)?;
            println!("created {}", path.display());
        }
        BackupCommands::List => {
            let backups = manager.list_backups().map_err(anyhow::Error::from)?;
            for b in backups {
                println!(
                    "{} [{:?}] {} bytes {}",
                    b.path.display(),
                    b.kind,
                    b.size,
                    if b.is_corrupted { "CORRUPTED" } else { "ok" }
                );
            }
        }
        BackupCommands::Restore { path } => {
            let chosen = manager
                .restore_from_backup(path.as_deref())
                .map_err(anyhow::Error::from)?;
            println!("restored from {}", chosen.display());
        }
    }
    Ok(())
}

fn run_doctor(vault_path: &PathBuf, fs: Arc<dyn Filesystem>, release_api_url: Option<String>) -> Result<()> {
    let config_path = vault_core::paths::default_config_path()?;
    let context = CheckContext {
        vault_path: vault_path.clone(),
        config_path,
        fs,
        keyring: Arc::new(OsKeyringBackend),
        keyring_service: KEYRING_SERVICE.to_string(),
        installed_version: INSTALLED_VERSION.to_string(),
        release_api_url,
    };
    let report = health::run_all(&health::default_checkers(), &context);
    for result in &report.results {
        let marker = match result.status {
            CheckStatus::Pass => "PASS",
            CheckStatus::Warning => "WARN",
            CheckStatus::Error => "FAIL",
        };
        println!("[{marker}] {}: {}", result.name, result.message);
        if let Some(rec) = &result.recommendation {
            println!("         -> {rec}");
        }
        for detail in &result.details {
            println!("         - {detail}");
        }
    }
    println!(
        "\n{} pass, {} warning, {} error",
        report.pass_count, report.warning_count, report.error_count
    );
    std::process::exit(report.exit_code());
}

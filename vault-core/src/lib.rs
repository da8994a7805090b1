//! Encrypted secrets vault: storage engine, backup lifecycle and
//! doctor-style health checks.
//!
//! Covers the versioned on-disk format, the atomic save protocol,
//! KDF/format migration, backup lifecycle, health checks, and the
//! progress/audit callback stream emitted during a save. CLI wiring lives
//! in the sibling `vault-cli` binary crate.

pub mod backup;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod health;
pub mod keyring_backend;
pub mod paths;
pub mod vault;

pub use error::{Result, VaultError};
pub use vault::{ProgressCallback, ProgressEvent, Vault, VaultInfo};

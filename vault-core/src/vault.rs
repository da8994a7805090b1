//! Vault storage engine: versioned encrypted file format, atomic save
//! protocol, and version-aware load path.
//!
//! Every write routes through a temp file, a mandatory decrypt read-back,
//! and a two-phase rename with rollback: never a direct write to the vault
//! path, so a crash mid-save can't leave a half-written vault in place.

use crate::crypto;
use crate::error::{VaultError, DEFAULT_ITERATIONS, MIN_ITERATIONS};
use crate::fs::Filesystem;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use zeroize::Zeroizing;

/// `iterations == 0` on disk is interpreted as this legacy work factor.
pub const LEGACY_ITERATIONS: u32 = 100_000;

const SALT_LEN: usize = crypto::SALT_LEN;
const WRAPPED_DEK_LEN: usize = crypto::KEY_LEN + crypto::TAG_LEN;
const NONCE_LEN: usize = crypto::NONCE_LEN;

/// Stable progress event names. `#[non_exhaustive]` so a future event can
/// be added without breaking callers that already match on this.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ProgressEvent {
    AtomicSaveStarted { vault_path: PathBuf },
    TempFileCreated { temp_path: PathBuf },
    VerificationStarted,
    VerificationPassed,
    VerificationFailed { reason: String },
    AtomicRenameStarted { from: PathBuf, to: PathBuf },
    RollbackStarted,
    RollbackCompleted,
    AtomicSaveCompleted,
}

impl ProgressEvent {
    /// The stable event name spec.md §6 fixes, independent of the variant's
    /// payload — callers building an audit trail match on this string.
    pub fn name(&self) -> &'static str {
        match self {
            ProgressEvent::AtomicSaveStarted { .. } => "atomic_save_started",
            ProgressEvent::TempFileCreated { .. } => "temp_file_created",
            ProgressEvent::VerificationStarted => "verification_started",
            ProgressEvent::VerificationPassed => "verification_passed",
            ProgressEvent::VerificationFailed { .. } => "verification_failed",
            ProgressEvent::AtomicRenameStarted { .. } => "atomic_rename_started",
            ProgressEvent::RollbackStarted => "rollback_started",
            ProgressEvent::RollbackCompleted => "rollback_completed",
            ProgressEvent::AtomicSaveCompleted => "atomic_save_completed",
        }
    }
}

pub type ProgressCallback<'a> = &'a dyn Fn(ProgressEvent);

fn emit(callback: Option<ProgressCallback>, event: ProgressEvent) {
    if let Some(cb) = callback {
        cb(event);
    }
}

/// On-disk document. `metadata` is authoritative for decryption; `data` is
/// an opaque application payload (base64 of the AEAD envelope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultDocument {
    pub metadata: VaultMetadata,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultMetadata {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(with = "b64_bytes")]
    pub salt: Vec<u8>,
    pub iterations: u32,
    #[serde(default, with = "b64_bytes_opt")]
    pub wrapped_dek: Option<Vec<u8>>,
    #[serde(default, with = "b64_bytes_opt")]
    pub wrapped_dek_nonce: Option<Vec<u8>>,
}

mod b64_bytes {
    use super::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

mod b64_bytes_opt {
    use super::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(d)?;
        match text {
            Some(t) => STANDARD
                .decode(t.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Non-secret metadata summary returned by `get_vault_info`. Never exposes
/// `salt` outside the engine (spec.md §4.3.1).
#[derive(Debug, Clone, Serialize)]
pub struct VaultInfo {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub iterations: u32,
}

/// A single key derivation plus AEAD operation resolved for a save/load: the
/// concrete key bytes used to encrypt/decrypt `data`, kept only for the
/// caller's stack lifetime and cleared on drop via `Zeroizing`.
enum ResolvedKey {
    /// v1: `data` is encrypted directly under the password-derived key.
    Direct(Zeroizing<Vec<u8>>),
    /// v2: `data` is encrypted under the DEK, which is wrapped by the
    /// password-derived KEK.
    Wrapped { dek: Zeroizing<Vec<u8>> },
}

impl ResolvedKey {
    fn data_key(&self) -> &[u8] {
        match self {
            ResolvedKey::Direct(k) => k,
            ResolvedKey::Wrapped { dek } => dek,
        }
    }
}

/// Owns the vault path and its derivatives (temp files, automatic backup).
/// Holds no decrypted payload or key material across calls.
pub struct Vault {
    path: PathBuf,
    fs: Arc<dyn Filesystem>,
}

impl Vault {
    pub fn new(path: impl Into<PathBuf>, fs: Arc<dyn Filesystem>) -> Self {
        Self {
            path: path.into(),
            fs,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self) -> PathBuf {
        let mut p = self.path.clone().into_os_string();
        p.push(".backup");
        PathBuf::from(p)
    }

    fn temp_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn temp_prefix(&self) -> String {
        format!(
            "{}.tmp.",
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        )
    }

    fn new_temp_path(&self) -> PathBuf {
        let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
        let suffix = crypto::random_hex(3);
        let name = format!(
            "{}{}.{}",
            self.temp_prefix(),
            timestamp,
            suffix
        );
        self.temp_dir().join(name)
    }

    fn read_document(&self) -> Result<VaultDocument, VaultError> {
        if !self.fs.exists(&self.path) {
            return Err(VaultError::VaultNotFound(self.path.clone()));
        }
        let bytes = self.fs.read_file(&self.path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| VaultError::VaultCorrupted(format!("parse vault document: {e}")))
    }

    fn normalized_iterations(iterations: u32) -> u32 {
        if iterations == 0 {
            LEGACY_ITERATIONS
        } else {
            iterations
        }
    }

    /// Structural checks only (P7): version > 0, salt length 32, non-empty
    /// data, `updated_at >= created_at`, iterations within range (0 is
    /// legacy and always valid), v2 wrap-field lengths.
    pub fn validate_document(doc: &VaultDocument) -> Result<(), VaultError> {
        if doc.metadata.version == 0 {
            return Err(VaultError::VaultCorrupted("version must be >= 1".into()));
        }
        if doc.metadata.salt.len() != SALT_LEN {
            return Err(VaultError::VaultCorrupted(format!(
                "salt length {} != {SALT_LEN}",
                doc.metadata.salt.len()
            )));
        }
        if doc.data.is_empty() {
            return Err(VaultError::VaultCorrupted("data is empty".into()));
        }
        if doc.metadata.updated_at < doc.metadata.created_at {
            return Err(VaultError::VaultCorrupted(
                "updated_at precedes created_at".into(),
            ));
        }
        if doc.metadata.iterations != 0 && doc.metadata.iterations < MIN_ITERATIONS {
            return Err(VaultError::VaultCorrupted(format!(
                "iterations {} below minimum {MIN_ITERATIONS}",
                doc.metadata.iterations
            )));
        }
        if doc.metadata.version == 2 {
            let wrapped = doc
                .metadata
                .wrapped_dek
                .as_ref()
                .ok_or_else(|| VaultError::VaultCorrupted("v2 vault missing wrapped_dek".into()))?;
            let nonce = doc.metadata.wrapped_dek_nonce.as_ref().ok_or_else(|| {
                VaultError::VaultCorrupted("v2 vault missing wrapped_dek_nonce".into())
            })?;
            if wrapped.len() != WRAPPED_DEK_LEN {
                return Err(VaultError::VaultCorrupted(format!(
                    "wrapped_dek length {} != {WRAPPED_DEK_LEN}",
                    wrapped.len()
                )));
            }
            if nonce.len() != NONCE_LEN {
                return Err(VaultError::VaultCorrupted(format!(
                    "wrapped_dek_nonce length {} != {NONCE_LEN}",
                    nonce.len()
                )));
            }
        }
        Ok(())
    }

    /// Re-reads and structurally validates the on-disk vault.
    pub fn validate_vault(&self) -> Result<(), VaultError> {
        let doc = self.read_document()?;
        Self::validate_document(&doc)
    }

    fn resolve_key_for_load(
        doc: &VaultDocument,
        password: &[u8],
    ) -> Result<ResolvedKey, VaultError> {
        Self::validate_document(doc)?;
        let iterations = Self::normalized_iterations(doc.metadata.iterations);
        let kek = crypto::derive_key(password, &doc.metadata.salt, iterations)?;
        match doc.metadata.version {
            1 => Ok(ResolvedKey::Direct(kek)),
            2 => {
                // `validate_document` above already confirmed both wrap
                // fields are present with the right lengths for version 2.
                let ciphertext = doc
                    .metadata
                    .wrapped_dek
                    .clone()
                    .ok_or_else(|| VaultError::VaultCorrupted("v2 vault missing wrapped_dek".into()))?;
                let nonce_bytes = doc
                    .metadata
                    .wrapped_dek_nonce
                    .clone()
                    .ok_or_else(|| VaultError::VaultCorrupted("v2 vault missing wrapped_dek_nonce".into()))?;
                let nonce = nonce_bytes
                    .try_into()
                    .map_err(|_| VaultError::VaultCorrupted("bad wrap nonce length".into()))?;
                let wrapped = crypto::WrappedKey { ciphertext, nonce };
                let dek = crypto::unwrap_key(&wrapped, &kek)?;
                Ok(ResolvedKey::Wrapped { dek })
            }
            other => Err(VaultError::VaultCorrupted(format!(
                "unsupported version {other}"
            ))),
        }
    }

    fn decrypt_data(doc: &VaultDocument, key: &ResolvedKey) -> Result<Vec<u8>, VaultError> {
        let envelope = STANDARD
            .decode(doc.data.as_bytes())
            .map_err(|e| VaultError::VaultCorrupted(format!("base64 data: {e}")))?;
        crypto::decrypt(&envelope, key.data_key())
    }

    /// Loads with a password, deriving (and, for v2, unwrapping) the key.
    /// Never mutates disk.
    pub fn load(&self, password: &[u8]) -> Result<Vec<u8>, VaultError> {
        let doc = self.read_document()?;
        let key = Self::resolve_key_for_load(&doc, password)?;
        Self::decrypt_data(&doc, &key)
    }

    /// Recovery path: bypasses the KDF and decrypts directly with `key`
    /// (the raw data key for v1, or the DEK for v2).
    pub fn load_with_key(&self, key: &[u8]) -> Result<Vec<u8>, VaultError> {
        let doc = self.read_document()?;
        Self::validate_document(&doc)?;
        let envelope = STANDARD
            .decode(doc.data.as_bytes())
            .map_err(|e| VaultError::VaultCorrupted(format!("base64 data: {e}")))?;
        crypto::decrypt(&envelope, key).map_err(|_| VaultError::VaultCorrupted("auth failure".into()))
    }

    pub fn get_version(&self) -> Result<u32, VaultError> {
        Ok(self.read_document()?.metadata.version)
    }

    pub fn get_iterations(&self) -> Result<u32, VaultError> {
        Ok(Self::normalized_iterations(
            self.read_document()?.metadata.iterations,
        ))
    }

    pub fn get_vault_info(&self) -> Result<VaultInfo, VaultError> {
        let doc = self.read_document()?;
        Ok(VaultInfo {
            version: doc.metadata.version,
            created_at: doc.metadata.created_at,
            updated_at: doc.metadata.updated_at,
            iterations: Self::normalized_iterations(doc.metadata.iterations),
        })
    }

    /// Creates a fresh v1 vault. Refuses if one already exists. The initial
    /// write still goes through the atomic save protocol's temp-write and
    /// verify steps, but since there is no prior generation, no automatic
    /// backup is produced and the two-phase rename degenerates to a single
    /// rename (there is nothing at `vault_path` to rename out of the way).
    pub fn initialize(&self, password: &[u8], data: &[u8]) -> Result<(), VaultError> {
        if self.fs.exists(&self.path) {
            return Err(VaultError::VaultExists(self.path.clone()));
        }
        let salt = crypto::generate_salt();
        let iterations = DEFAULT_ITERATIONS;
        let key = crypto::derive_key(password, &salt, iterations)?;
        let now = Utc::now();
        let doc = VaultDocument {
            metadata: VaultMetadata {
                version: 1,
                created_at: now,
                updated_at: now,
                salt: salt.to_vec(),
                iterations,
                wrapped_dek: None,
                wrapped_dek_nonce: None,
            },
            data: String::new(),
        };
        self.initialize_with(doc, data, key.as_slice())
    }

    /// Creates a fresh v2 vault from caller-supplied key material (used by
    /// callers that want to start wrapped-DEK from day one rather than
    /// migrating later).
    pub fn initialize_v2(
        &self,
        dek: &[u8],
        wrapped_dek: crypto::WrappedKey,
        salt: [u8; SALT_LEN],
        iterations: u32,
        data: &[u8],
    ) -> Result<(), VaultError> {
        if self.fs.exists(&self.path) {
            return Err(VaultError::VaultExists(self.path.clone()));
        }
        let now = Utc::now();
        let doc = VaultDocument {
            metadata: VaultMetadata {
                version: 2,
                created_at: now,
                updated_at: now,
                salt: salt.to_vec(),
                iterations,
                wrapped_dek: Some(wrapped_dek.ciphertext),
                wrapped_dek_nonce: Some(wrapped_dek.nonce.to_vec()),
            },
            data: String::new(),
        };
        self.initialize_with(doc, data, dek)
    }

    fn initialize_with(
        &self,
        mut doc: VaultDocument,
        data: &[u8],
        data_key: &[u8],
    ) -> Result<(), VaultError> {
        let envelope = crypto::encrypt(data, data_key)?;
        doc.data = STANDARD.encode(envelope);
        let bytes = serde_json::to_vec(&doc)
            .map_err(|e| VaultError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        let temp_path = self.new_temp_path();
        self.fs.write_file(&temp_path, &bytes)?;
        // Verify before committing, same discipline as a save.
        let reread = self.fs.read_file(&temp_path)?;
        let reparsed: VaultDocument = serde_json::from_slice(&reread)
            .map_err(|e| VaultError::VerificationFailed(format!("parse: {e}")))?;
        Self::decrypt_data(&reparsed, &ResolvedKey::Direct(Zeroizing::new(data_key.to_vec())))
            .map_err(|e| VaultError::VerificationFailed(e.to_string()))?;
        let rename_result = self.fs.rename(&temp_path, &self.path);
        if rename_result.is_err() {
            let _ = self.fs.remove(&temp_path);
        }
        rename_result?;
        info!(path = %self.path.display(), "vault initialized");
        Ok(())
    }

    /// The six-step atomic save protocol (spec.md §4.3.2), parameterized
    /// over the key resolution for the five public `save_*` operations.
    fn save_internal(
        &self,
        new_metadata: VaultMetadata,
        data: &[u8],
        data_key: &[u8],
        callback: Option<ProgressCallback>,
    ) -> Result<(), VaultError> {
        emit(callback, ProgressEvent::AtomicSaveStarted {
            vault_path: self.path.clone(),
        });

        // Step 2: encrypt under the resolved key.
        let envelope = crypto::encrypt(data, data_key)?;
        let mut doc = VaultDocument {
            metadata: new_metadata,
            data: String::new(),
        };
        doc.data = STANDARD.encode(envelope);
        let bytes = serde_json::to_vec(&doc)
            .map_err(|e| VaultError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        // Step 3: orphan sweep. Best-effort, never fatal.
        self.sweep_orphans();

        // Step 4: temp write + fsync.
        let temp_path = self.new_temp_path();
        let cleanup_guard = TempCleanup {
            fs: &*self.fs,
            path: temp_path.clone(),
            armed: true,
        };
        let mut cleanup_guard = cleanup_guard;
        self.fs.write_file(&temp_path, &bytes)?;
        emit(callback, ProgressEvent::TempFileCreated {
            temp_path: temp_path.clone(),
        });

        // Step 5: mandatory verification.
        emit(callback, ProgressEvent::VerificationStarted);
        let verify_result = self.verify_temp(&temp_path, data_key);
        if let Err(e) = verify_result {
            emit(callback, ProgressEvent::VerificationFailed {
                reason: e.to_string(),
            });
            return Err(VaultError::VerificationFailed(e.to_string()));
        }
        emit(callback, ProgressEvent::VerificationPassed);

        // Step 6: two-phase commit.
        let backup_path = self.backup_path();
        let vault_existed = self.fs.exists(&self.path);
        if vault_existed {
            emit(callback, ProgressEvent::AtomicRenameStarted {
                from: self.path.clone(),
                to: backup_path.clone(),
            });
            self.fs.rename(&self.path, &backup_path)?;
        }

        emit(callback, ProgressEvent::AtomicRenameStarted {
            from: temp_path.clone(),
            to: self.path.clone(),
        });
        if let Err(e) = self.fs.rename(&temp_path, &self.path) {
            if vault_existed {
                emit(callback, ProgressEvent::RollbackStarted);
                match self.fs.rename(&backup_path, &self.path) {
                    Ok(()) => {
                        emit(callback, ProgressEvent::RollbackCompleted);
                        return Err(VaultError::CriticalCommitFailure(format!(
                            "second rename failed, rollback succeeded: {e}"
                        )));
                    }
                    Err(rollback_err) => {
                        warn!(
                            backup = %backup_path.display(),
                            "rollback failed after critical commit failure; manual restore required"
                        );
                        return Err(VaultError::CriticalCommitFailure(format!(
                            "second rename failed ({e}) and rollback failed ({rollback_err}); restore manually from {}",
                            backup_path.display()
                        )));
                    }
                }
            }
            return Err(VaultError::CriticalCommitFailure(e.to_string()));
        }

        cleanup_guard.armed = false;
        info!(path = %self.path.display(), "atomic save committed");
        emit(callback, ProgressEvent::AtomicSaveCompleted);
        Ok(())
    }

    fn verify_temp(&self, temp_path: &Path, data_key: &[u8]) -> Result<(), VaultError> {
        let reread = self.fs.read_file(temp_path)?;
        let reparsed: VaultDocument = serde_json::from_slice(&reread)
            .map_err(|e| VaultError::VaultCorrupted(format!("parse temp: {e}")))?;
        let mut plaintext = Self::decrypt_data(
            &reparsed,
            &ResolvedKey::Direct(Zeroizing::new(data_key.to_vec())),
        )?;
        crypto::clear_bytes(&mut plaintext);
        Ok(())
    }

    /// Removes every `<vault>.tmp.*` file in the vault directory. Best
    /// effort: failures are logged, never fatal (spec.md §4.3.2 step 3).
    fn sweep_orphans(&self) {
        let prefix = self.temp_prefix();
        match self.fs.glob(&self.temp_dir(), &prefix) {
            Ok(matches) => {
                for path in matches {
                    if let Err(e) = self.fs.remove(&path) {
                        warn!(path = %path.display(), error = %e, "failed to remove orphaned temp file");
                    } else {
                        warn!(path = %path.display(), "removed orphaned temp file");
                    }
                }
            }
            Err(e) => warn!(error = %e, "orphan sweep glob failed"),
        }
    }

    /// Password-based save, dispatching on the vault's version (spec.md
    /// §4.3.2 step 2): v1 derives the key directly and encrypts under it;
    /// v2 derives the KEK, unwraps the DEK, and encrypts under the DEK.
    pub fn save(
        &self,
        data: &[u8],
        password: &[u8],
        callback: Option<ProgressCallback>,
    ) -> Result<(), VaultError> {
        let mut current = self.read_document()?;
        let iterations = Self::normalized_iterations(current.metadata.iterations);
        current.metadata.updated_at = Utc::now();
        current.metadata.iterations = iterations;
        match current.metadata.version {
            1 => {
                let key = crypto::derive_key(password, &current.metadata.salt, iterations)?;
                self.save_internal(current.metadata, data, key.as_slice(), callback)
            }
            2 => {
                let resolved = Self::resolve_key_for_load(&current, password)?;
                let dek = match resolved {
                    ResolvedKey::Wrapped { dek } => dek,
                    ResolvedKey::Direct(_) => unreachable!("validated version == 2 above"),
                };
                self.save_internal(current.metadata, data, dek.as_slice(), callback)
            }
            other => Err(VaultError::VaultCorrupted(format!(
                "unsupported version {other}"
            ))),
        }
    }

    /// v2 save: derive KEK, unwrap DEK, encrypt data with DEK, clear KEK and
    /// DEK on exit (dropped at end of scope via `Zeroizing`).
    pub fn save_with_dek(
        &self,
        data: &[u8],
        dek: &[u8],
        callback: Option<ProgressCallback>,
    ) -> Result<(), VaultError> {
        let mut current = self.read_document()?;
        if current.metadata.version != 2 {
            return Err(VaultError::InvalidArgument(
                "save_with_dek() requires a v2 vault".into(),
            ));
        }
        current.metadata.updated_at = Utc::now();
        current.metadata.iterations = Self::normalized_iterations(current.metadata.iterations);
        self.save_internal(current.metadata, data, dek, callback)
    }

    /// Re-wraps the DEK under a freshly derived KEK (new salt + iterations),
    /// re-encrypting `data` under the same DEK. Fails with `WrongPassword`
    /// if unwrapping under `old_password` fails.
    pub fn change_password_v2(
        &self,
        data: &[u8],
        old_password: &[u8],
        new_password: &[u8],
        callback: Option<ProgressCallback>,
    ) -> Result<(), VaultError> {
        let current = self.read_document()?;
        if current.metadata.version != 2 {
            return Err(VaultError::InvalidArgument(
                "change_password_v2() requires a v2 vault".into(),
            ));
        }
        let key = Self::resolve_key_for_load(&current, old_password)?;
        let dek = match key {
            ResolvedKey::Wrapped { dek } => dek,
            ResolvedKey::Direct(_) => unreachable!("validated version == 2 above"),
        };

        let new_salt = crypto::generate_salt();
        let iterations = Self::normalized_iterations(current.metadata.iterations);
        let new_kek = crypto::derive_key(new_password, &new_salt, iterations)?;
        let wrapped = crypto::wrap_key(&dek, &new_kek)?;

        let mut metadata = current.metadata;
        metadata.salt = new_salt.to_vec();
        metadata.wrapped_dek = Some(wrapped.ciphertext);
        metadata.wrapped_dek_nonce = Some(wrapped.nonce.to_vec());
        metadata.updated_at = Utc::now();

        self.save_internal(metadata, data, dek.as_slice(), callback)
    }

    /// Migrates a v1 vault to v2 in one atomic commit: the caller supplies a
    /// fresh DEK already wrapped under the password-derived KEK. Refuses
    /// non-v1 vaults.
    #[allow(clippy::too_many_arguments)]
    pub fn migrate_to_v2(
        &self,
        data: &[u8],
        dek: &[u8],
        wrapped_dek: crypto::WrappedKey,
        salt: [u8; SALT_LEN],
        iterations: u32,
        callback: Option<ProgressCallback>,
    ) -> Result<(), VaultError> {
        let current = self.read_document()?;
        if current.metadata.version != 1 {
            return Err(VaultError::InvalidArgument(
                "migrate_to_v2() requires a v1 vault".into(),
            ));
        }
        let metadata = VaultMetadata {
            version: 2,
            created_at: current.metadata.created_at,
            updated_at: Utc::now(),
            salt: salt.to_vec(),
            iterations,
            wrapped_dek: Some(wrapped_dek.ciphertext),
            wrapped_dek_nonce: Some(wrapped_dek.nonce.to_vec()),
        };
        self.save_internal(metadata, data, dek, callback)
    }

    /// Updates the KDF work factor. Runs a pre-flight permission and
    /// (where available) free-space check before touching disk; aborts
    /// before any on-disk change if the pre-flight fails.
    pub fn save_with_iterations(
        &self,
        data: &[u8],
        password: &[u8],
        new_iterations: u32,
        callback: Option<ProgressCallback>,
    ) -> Result<(), VaultError> {
        if new_iterations < MIN_ITERATIONS {
            return Err(VaultError::InvalidArgument(format!(
                "iterations {new_iterations} below minimum {MIN_ITERATIONS}"
            )));
        }
        self.preflight_check()?;

        let mut current = self.read_document()?;
        match current.metadata.version {
            1 => {
                let old_iterations = Self::normalized_iterations(current.metadata.iterations);
                let old_key = crypto::derive_key(password, &current.metadata.salt, old_iterations)?;
                // Re-validate the password by attempting a decrypt before
                // committing to any metadata change.
                Self::decrypt_data(&current, &ResolvedKey::Direct(old_key))?;
                let new_key = crypto::derive_key(password, &current.metadata.salt, new_iterations)?;
                current.metadata.updated_at = Utc::now();
                current.metadata.iterations = new_iterations;
                self.save_internal(current.metadata, data, new_key.as_slice(), callback)
            }
            2 => {
                let old_iterations = Self::normalized_iterations(current.metadata.iterations);
                let old_kek = crypto::derive_key(password, &current.metadata.salt, old_iterations)?;
                let resolved = Self::resolve_key_for_load(&current, password)?;
                let dek = match resolved {
                    ResolvedKey::Wrapped { dek } => dek,
                    ResolvedKey::Direct(_) => unreachable!(),
                };
                let _ = old_kek;
                let new_kek = crypto::derive_key(password, &current.metadata.salt, new_iterations)?;
                let wrapped = crypto::wrap_key(&dek, &new_kek)?;
                current.metadata.wrapped_dek = Some(wrapped.ciphertext);
                current.metadata.wrapped_dek_nonce = Some(wrapped.nonce.to_vec());
                current.metadata.updated_at = Utc::now();
                current.metadata.iterations = new_iterations;
                self.save_internal(current.metadata, data, dek.as_slice(), callback)
            }
            other => Err(VaultError::VaultCorrupted(format!(
                "unsupported version {other}"
            ))),
        }
    }

    /// (a) write permission in the vault directory via a sentinel file, (b)
    /// free space >= 2x current vault size where the platform exposes it.
    fn preflight_check(&self) -> Result<(), VaultError> {
        let dir = self.temp_dir();
        let sentinel = dir.join(format!(".vault-preflight-{}", crypto::random_hex(4)));
        self.fs.write_file(&sentinel, b"preflight")?;
        let _ = self.fs.remove(&sentinel);

        if let Ok(stat) = self.fs.stat(&self.path) {
            match available_space(&dir) {
                Some(free) if free < stat.len.saturating_mul(2) => {
                    return Err(VaultError::DiskSpaceExhausted);
                }
                Some(_) => {}
                None => {
                    warn!("cannot determine free disk space; proceeding without the check");
                }
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn available_space(dir: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    let c_path = CString::new(dir.as_os_str().as_bytes()).ok()?;
    unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) == 0 {
            Some(stat.f_bavail as u64 * stat.f_frsize as u64)
        } else {
            None
        }
    }
}

#[cfg(not(unix))]
fn available_space(_dir: &Path) -> Option<u64> {
    None
}

/// Removes the temp file on drop unless disarmed, so every exit path of
/// `save_internal` (including `?` early returns) cleans up its own temp
/// file even on verification or rename failure.
struct TempCleanup<'a> {
    fs: &'a dyn Filesystem,
    path: PathBuf,
    armed: bool,
}

impl Drop for TempCleanup<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.fs.remove(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::fault::{FaultFilesystem, FaultKind, Op};
    use crate::fs::OsFilesystem;
    use tempfile::tempdir;

    fn make_vault(dir: &Path, fs: Arc<dyn Filesystem>) -> Vault {
        Vault::new(dir.join("vault.dat"), fs)
    }

    #[test]
    fn happy_save_round_trips_and_leaves_n1_backup() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn Filesystem> = Arc::new(OsFilesystem);
        let vault = make_vault(dir.path(), fs.clone());
        let password = b"TestPassword123!";

        vault
            .initialize(password, br#"{"credentials":[{"service":"initial"}]}"#)
            .unwrap();
        let mut events = Vec::new();
        let cb = |e: ProgressEvent| events.push(e.name());
        vault
            .save(
                br#"{"credentials":[{"service":"updated"}]}"#,
                password,
                Some(&cb),
            )
            .unwrap();

        let loaded = vault.load(password).unwrap();
        assert_eq!(loaded, br#"{"credentials":[{"service":"updated"}]}"#);

        let backup = Vault::new(dir.path().join("vault.dat.backup"), fs.clone());
        let prior = backup.load(password).unwrap();
        assert_eq!(prior, br#"{"credentials":[{"service":"initial"}]}"#);

        assert_eq!(
            events,
            vec![
                "atomic_save_started",
                "temp_file_created",
                "verification_started",
                "verification_passed",
                "atomic_rename_started",
                "atomic_rename_started",
                "atomic_save_completed",
            ]
        );

        let leftovers = fs.glob(dir.path(), "vault.dat.tmp.").unwrap();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn second_rename_failure_triggers_rollback_and_critical_error() {
        let dir = tempdir().unwrap();
        let fault_fs = Arc::new(FaultFilesystem::new());
        let fs: Arc<dyn Filesystem> = fault_fs.clone();
        let vault = make_vault(dir.path(), fs.clone());
        let password = b"TestPassword123!";
        vault
            .initialize(password, br#"{"credentials":[{"service":"initial"}]}"#)
            .unwrap();

        // Rename call #1 was initialize()'s commit rename, #2 is this
        // save's backup rename, #3 is the second (temp->vault) rename the
        // atomic protocol performs — that is the one spec.md P3 targets.
        fault_fs.fail_nth(Op::Rename, 3, FaultKind::NotAtomic);

        let mut events = Vec::new();
        let cb = |e: ProgressEvent| events.push(e.name());
        let result = vault.save(
            br#"{"credentials":[{"service":"updated"}]}"#,
            password,
            Some(&cb),
        );
        let err = result.unwrap_err();
        assert!(err.is_critical());
        assert!(events.contains(&"rollback_started"));
        assert!(events.contains(&"rollback_completed"));
        assert!(!events.contains(&"atomic_save_completed"));

        let reloaded = vault.load(password).unwrap();
        assert_eq!(reloaded, br#"{"credentials":[{"service":"initial"}]}"#);
    }

    #[test]
    fn double_rename_failure_leaves_backup_intact() {
        let dir = tempdir().unwrap();
        let fault_fs = Arc::new(FaultFilesystem::new());
        let fs: Arc<dyn Filesystem> = fault_fs.clone();
        let vault = make_vault(dir.path(), fs.clone());
        let password = b"TestPassword123!";
        vault
            .initialize(password, br#"{"credentials":[{"service":"initial"}]}"#)
            .unwrap();

        fault_fs.fail_nth(Op::Rename, 3, FaultKind::NotAtomic);
        fault_fs.fail_nth(Op::Rename, 4, FaultKind::NotAtomic);

        let result = vault.save(
            br#"{"credentials":[{"service":"updated"}]}"#,
            password,
            None,
        );
        let err = result.unwrap_err();
        assert!(err.is_critical());

        let backup = Vault::new(dir.path().join("vault.dat.backup"), fs.clone());
        let backup_payload = backup.load(password).unwrap();
        assert_eq!(
            backup_payload,
            br#"{"credentials":[{"service":"initial"}]}"#
        );
    }

    #[test]
    fn failure_before_second_rename_preserves_prior_payload_and_no_orphans() {
        let dir = tempdir().unwrap();
        let fault_fs = Arc::new(FaultFilesystem::new());
        let fs: Arc<dyn Filesystem> = fault_fs.clone();
        let vault = make_vault(dir.path(), fs.clone());
        let password = b"TestPassword123!";
        vault.initialize(password, br#"{"credentials":[{"service":"initial"}]}"#).unwrap();

        // WriteFile call #1 was initialize()'s temp write; #2 is this
        // save's own temp write.
        fault_fs.fail_nth(Op::WriteFile, 2, FaultKind::DiskFull);

        let result = vault.save(br#"{"credentials":[{"service":"updated"}]}"#, password, None);
        assert!(matches!(result, Err(VaultError::DiskSpaceExhausted)));

        let reloaded = vault.load(password).unwrap();
        assert_eq!(reloaded, br#"{"credentials":[{"service":"initial"}]}"#);
        let leftovers = fs.glob(dir.path(), "vault.dat.tmp.").unwrap();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn orphan_sweep_removes_stale_temp_files() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn Filesystem> = Arc::new(OsFilesystem);
        let vault = make_vault(dir.path(), fs.clone());
        let password = b"TestPassword123!";
        vault.initialize(password, b"initial").unwrap();

        for i in 0..3 {
            let stale = dir.path().join(format!("vault.dat.tmp.stale{i}"));
            fs.write_file(&stale, b"orphan").unwrap();
        }

        vault.save(b"updated", password, None).unwrap();
        let leftovers = fs.glob(dir.path(), "vault.dat.tmp.").unwrap();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn v1_to_v2_migration_preserves_payload_and_hides_salt() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn Filesystem> = Arc::new(OsFilesystem);
        let vault = make_vault(dir.path(), fs);
        let password = b"TestPassword123!";
        vault.initialize(password, b"payload").unwrap();

        let salt = crypto::generate_salt();
        let iterations = DEFAULT_ITERATIONS;
        let kek = crypto::derive_key(password, &salt, iterations).unwrap();
        let dek = crypto::generate_dek();
        let wrapped = crypto::wrap_key(&dek, &kek).unwrap();

        vault
            .migrate_to_v2(b"payload", &dek, wrapped, salt, iterations, None)
            .unwrap();

        assert_eq!(vault.get_version().unwrap(), 2);
        assert_eq!(vault.load(password).unwrap(), b"payload");
    }

    #[test]
    fn password_based_save_updates_a_v2_vault_without_a_retained_dek() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn Filesystem> = Arc::new(OsFilesystem);
        let vault = make_vault(dir.path(), fs.clone());
        let password = b"TestPassword123!";
        vault.initialize(password, b"initial").unwrap();

        let salt = crypto::generate_salt();
        let iterations = DEFAULT_ITERATIONS;
        let kek = crypto::derive_key(password, &salt, iterations).unwrap();
        let dek = crypto::generate_dek();
        let wrapped = crypto::wrap_key(&dek, &kek).unwrap();
        vault
            .migrate_to_v2(b"initial", &dek, wrapped, salt, iterations, None)
            .unwrap();

        // The caller holds only the password from here on, never the raw
        // DEK — `save` must derive the KEK, unwrap the DEK, and re-encrypt
        // under it on its own (spec.md §4.3.2 step 2's v2 branch).
        vault.save(b"updated", password, None).unwrap();
        assert_eq!(vault.get_version().unwrap(), 2);
        assert_eq!(vault.load(password).unwrap(), b"updated");

        let backup = Vault::new(dir.path().join("vault.dat.backup"), fs);
        assert_eq!(backup.load(password).unwrap(), b"initial");
    }

    #[test]
    fn iteration_upgrade_preserves_payload() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn Filesystem> = Arc::new(OsFilesystem);
        let vault = make_vault(dir.path(), fs);
        let password = b"TestPassword123!";
        vault.initialize(password, b"payload").unwrap();
        vault
            .save_with_iterations(b"payload", password, 700_000, None)
            .unwrap();
        assert_eq!(vault.get_iterations().unwrap(), 700_000);
        assert_eq!(vault.load(password).unwrap(), b"payload");
    }

    #[test]
    fn validate_vault_rejects_corrupt_timestamps() {
        let mut doc = VaultDocument {
            metadata: VaultMetadata {
                version: 1,
                created_at: Utc::now(),
                updated_at: Utc::now() - chrono::Duration::seconds(10),
                salt: vec![0u8; SALT_LEN],
                iterations: MIN_ITERATIONS,
                wrapped_dek: None,
                wrapped_dek_nonce: None,
            },
            data: STANDARD.encode(b"nonempty"),
        };
        assert!(Vault::validate_document(&doc).is_err());
        doc.metadata.updated_at = doc.metadata.created_at;
        assert!(Vault::validate_document(&doc).is_ok());
    }
}

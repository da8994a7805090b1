//! Crypto primitives: Argon2id key derivation, ChaCha20-Poly1305 AEAD,
//! key wrap/unwrap, and random material generation.
//!
//! Uses a 12-byte nonce uniformly for both bulk data encryption and DEK
//! wrap, since the on-disk format fixes that nonce length for both.

use crate::error::{VaultError, MIN_ITERATIONS};
use argon2::{Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use rand_core::OsRng;
use zeroize::Zeroizing;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const SALT_LEN: usize = 32;
pub const TAG_LEN: usize = 16;

/// Fixed Argon2 memory and parallelism costs; `iterations` maps onto the
/// time cost, the one knob `save_with_iterations` adjusts.
const KDF_MEMORY_COST_KIB: u32 = 64 * 1024;
const KDF_PARALLELISM: u32 = 4;

/// Derive a 32-byte key from a password, salt and Argon2 time cost.
/// Rejects `iterations < MIN_ITERATIONS`. Intentionally slow (50ms-1s).
pub fn derive_key(
    password: &[u8],
    salt: &[u8],
    iterations: u32,
) -> Result<Zeroizing<Vec<u8>>, VaultError> {
    if iterations < MIN_ITERATIONS {
        return Err(VaultError::InvalidArgument(format!(
            "iterations {iterations} below minimum {MIN_ITERATIONS}"
        )));
    }
    if salt.len() != SALT_LEN {
        return Err(VaultError::VaultCorrupted(format!(
            "salt length {} != {SALT_LEN}",
            salt.len()
        )));
    }
    let params = Params::new(KDF_MEMORY_COST_KIB, iterations, KDF_PARALLELISM, Some(KEY_LEN))
        .map_err(|e| VaultError::InvalidArgument(format!("argon2 params: {e}")))?;
    let argon = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, params);
    let mut key = Zeroizing::new(vec![0u8; KEY_LEN]);
    argon
        .hash_password_into(password, salt, &mut key)
        .map_err(|e| VaultError::InvalidArgument(format!("argon2 derive: {e}")))?;
    Ok(key)
}

/// Authenticated encryption with a fresh random 12-byte nonce, embedded as
/// a `nonce || ciphertext_with_tag` envelope in the return value.
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, VaultError> {
    if key.len() != KEY_LEN {
        return Err(VaultError::InvalidArgument("key length must be 32".into()));
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let mut ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| VaultError::InvalidArgument(format!("encrypt: {e}")))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.append(&mut ciphertext);
    Ok(out)
}

/// Inverse of [`encrypt`]: splits the embedded nonce from the envelope and
/// fails if authentication tag verification fails (wrong password or
/// tampered data — the two are indistinguishable).
pub fn decrypt(envelope: &[u8], key: &[u8]) -> Result<Vec<u8>, VaultError> {
    if key.len() != KEY_LEN {
        return Err(VaultError::InvalidArgument("key length must be 32".into()));
    }
    if envelope.len() < NONCE_LEN {
        return Err(VaultError::VaultCorrupted("ciphertext too short".into()));
    }
    let (nonce_bytes, ciphertext) = envelope.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| VaultError::WrongPassword)
}

/// A wrapped key: ciphertext (key + tag, 48 bytes) plus its 12-byte nonce.
#[derive(Debug, Clone)]
pub struct WrappedKey {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
}

/// Encrypt `dek` (exactly 32 bytes) under `kek`, returning ciphertext+tag
/// (48 bytes) and the nonce used. Nonce reuse under the same key never
/// happens: a fresh nonce is drawn from the OS RNG for every wrap.
pub fn wrap_key(dek: &[u8], kek: &[u8]) -> Result<WrappedKey, VaultError> {
    if dek.len() != KEY_LEN {
        return Err(VaultError::InvalidArgument("dek length must be 32".into()));
    }
    if kek.len() != KEY_LEN {
        return Err(VaultError::InvalidArgument("kek length must be 32".into()));
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(kek));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, dek)
        .map_err(|e| VaultError::InvalidArgument(format!("wrap_key: {e}")))?;
    Ok(WrappedKey {
        ciphertext,
        nonce: nonce_bytes,
    })
}

/// Inverse of [`wrap_key`]. An authentication failure here is reported as
/// wrong-password, exactly as a direct `decrypt` failure would be.
pub fn unwrap_key(wrapped: &WrappedKey, kek: &[u8]) -> Result<Zeroizing<Vec<u8>>, VaultError> {
    if wrapped.ciphertext.len() != KEY_LEN + TAG_LEN {
        return Err(VaultError::VaultCorrupted(format!(
            "wrapped_dek length {} != {}",
            wrapped.ciphertext.len(),
            KEY_LEN + TAG_LEN
        )));
    }
    if kek.len() != KEY_LEN {
        return Err(VaultError::InvalidArgument("kek length must be 32".into()));
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(kek));
    let nonce = Nonce::from_slice(&wrapped.nonce);
    let dek = cipher
        .decrypt(nonce, wrapped.ciphertext.as_slice())
        .map_err(|_| VaultError::WrongPassword)?;
    Ok(Zeroizing::new(dek))
}

/// 32 random bytes from a cryptographic RNG.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// 32 random bytes suitable for use as a fresh DEK.
pub fn generate_dek() -> Zeroizing<Vec<u8>> {
    let mut dek = Zeroizing::new(vec![0u8; KEY_LEN]);
    OsRng.fill_bytes(&mut dek);
    dek
}

/// `n` random bytes rendered as lowercase hex, for temp-file suffixes.
pub fn random_hex(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Best-effort overwrite of `buf` with zero bytes. Under a managed runtime
/// (and even here, behind a possibly-moved/copied `Vec`) this is a
/// non-guarantee: it hygienically clears the buffer the caller still holds,
/// but cannot reach copies the allocator or swap may have made earlier.
pub fn clear_bytes(buf: &mut [u8]) {
    use zeroize::Zeroize;
    buf.zeroize();
}

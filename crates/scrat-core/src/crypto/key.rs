use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, ScratError};

pub const SALT_LEN: usize = 32;
pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Constant plaintext sealed into the passphrase verifier.
const VERIFIER_INPUT: &[u8] = b"scrat-passphrase-verifier";

/// The master key for one backup — derived, never stored.
/// Zeroized on drop so key material does not linger in memory.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; KEY_LEN],
}

impl MasterKey {
    /// Derive the 256-bit master key from a passphrase and per-backup salt
    /// with PBKDF2-HMAC-SHA256.
    pub fn derive(passphrase: &str, salt: &[u8; SALT_LEN]) -> Self {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
        Self { key }
    }

    pub fn generate_salt() -> [u8; SALT_LEN] {
        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        salt
    }

    pub(crate) fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key))
    }

    /// Hex verifier stored in the backup row. Encrypts a constant input with
    /// the reserved all-zero nonce; archive nonces never use a zero seed, so
    /// the nonce is unique within this key's lifetime.
    pub fn verifier(&self) -> Result<String> {
        let nonce = [0u8; NONCE_LEN];
        let sealed = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), VERIFIER_INPUT)
            .map_err(|e| ScratError::Internal(format!("verifier encrypt: {e}")))?;
        Ok(hex::encode(sealed))
    }

    /// Check a stored verifier against this key without touching archives.
    pub fn matches_verifier(&self, stored: &str) -> bool {
        match self.verifier() {
            Ok(v) => constant_time_eq(v.as_bytes(), stored.as_bytes()),
            Err(_) => false,
        }
    }
}

/// Byte comparison without an early exit on the first mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Generate a random 96-bit nonce seed for one archive segment.
/// The all-zero value is reserved for the verifier and never returned.
pub fn generate_iv_seed() -> [u8; NONCE_LEN] {
    loop {
        let mut seed = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        if seed != [0u8; NONCE_LEN] {
            return seed;
        }
    }
}

/// Minimal passphrase strength gate applied before a new backup chain starts.
pub fn validate_passphrase_strength(passphrase: &str) -> Result<()> {
    const MIN_LENGTH: usize = 12;

    if passphrase.chars().count() < MIN_LENGTH {
        return Err(ScratError::Validation(format!(
            "passphrase must be at least {MIN_LENGTH} characters"
        )));
    }
    Ok(())
}

/// Generate a random passphrase (base64 over `length` random bytes).
pub fn generate_passphrase(length: usize) -> String {
    use base64::Engine as _;

    let mut raw = vec![0u8; length];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    let pass = base64::engine::general_purpose::STANDARD.encode(&raw);
    raw.zeroize();
    pass
}

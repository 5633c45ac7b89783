pub mod memory;

pub use memory::SecretBuf;

use std::fmt;

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{Error, Result};

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
pub const FINGERPRINT_LEN: usize = 16;

const MIN_SECRET_LEN: usize = 12;

/// Derived key material for the encrypted store. The key itself is held only
/// in process memory; persistence is limited to the salt and fingerprint
/// (see `keystore`).
#[derive(Clone)]
pub struct KeySet {
    key: SecretBuf,
    pub salt: [u8; SALT_LEN],
    pub fingerprint: String,
}

impl KeySet {
    /// Rebuild a `KeySet` from already-derived material (recovery unwrap).
    pub(crate) fn from_raw(key: SecretBuf, salt: [u8; SALT_LEN], fingerprint: String) -> Self {
        Self {
            key,
            salt,
            fingerprint,
        }
    }

    pub fn expose_key(&self) -> &[u8] {
        self.key.expose_secret()
    }

    /// SQLCipher raw-key pragma value, `x'<hex>'`. Wrapped in `Zeroizing` so
    /// the hex copy is cleared once the pragma has been applied.
    pub fn key_pragma_value(&self) -> Zeroizing<String> {
        Zeroizing::new(format!("x'{}'", hex_encode(self.key.expose_secret())))
    }
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySet")
            .field("key", &"[REDACTED]")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Derive a fresh `KeySet` from a user secret with a random salt.
/// The secret must pass the strength policy first.
pub fn derive_key(secret: &SecretBuf) -> Result<KeySet> {
    validate_secret_strength(secret)?;

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    derive_key_with_salt(secret, salt)
}

/// Re-derive key material against a known salt (recovery, re-open flows).
pub fn derive_key_with_salt(secret: &SecretBuf, salt: [u8; SALT_LEN]) -> Result<KeySet> {
    let mut output = [0u8; KEY_LEN];

    let params = Params::new(65536, 3, 4, None)
        .map_err(|err| Error::DerivationFailure(format!("invalid Argon2 params: {err}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    argon2
        .hash_password_into(secret.expose_secret(), &salt, &mut output)
        .map_err(|err| Error::DerivationFailure(format!("Argon2 error: {err}")))?;

    let fingerprint = key_fingerprint(&output);
    let key = SecretBuf::new(output.to_vec());
    output.zeroize();

    Ok(KeySet {
        key,
        salt,
        fingerprint,
    })
}

/// Short stable identifier for a derived key. Safe to persist and log.
pub fn key_fingerprint(key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key);
    let digest = hasher.finalize();
    let mut hex = hex_encode(&digest);
    hex.truncate(FINGERPRINT_LEN);
    hex
}

/// Minimum-entropy policy: length, character classes, and a reject list of
/// common weak patterns.
pub fn validate_secret_strength(secret: &SecretBuf) -> Result<()> {
    let text = std::str::from_utf8(secret.expose_secret())
        .map_err(|_| Error::WeakSecret("secret must be valid UTF-8".to_string()))?;

    if text.len() < MIN_SECRET_LEN {
        return Err(Error::WeakSecret(format!(
            "must be at least {MIN_SECRET_LEN} characters"
        )));
    }

    let has_upper = text.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = text.chars().any(|c| c.is_ascii_lowercase());
    let has_digit = text.chars().any(|c| c.is_ascii_digit());
    let has_special = text
        .chars()
        .any(|c| "!@#$%^&*()_+-=[]{}|;:,.<>?".contains(c));

    if !has_upper || !has_lower || !has_digit {
        return Err(Error::WeakSecret(
            "must contain uppercase, lowercase, and digits".to_string(),
        ));
    }
    if !has_special {
        return Err(Error::WeakSecret(
            "must contain at least one special character".to_string(),
        ));
    }

    const COMMON_PATTERNS: &[&str] = &[
        "password", "123456", "qwerty", "letmein", "welcome", "admin", "monkey", "dragon",
        "master", "abc123", "iloveyou", "trustno1", "sunshine", "princess", "football",
        "baseball", "superman", "batman", "starwars", "passw0rd", "shadow", "freedom",
        "whatever", "zaq12wsx", "qazwsx", "zxcvbn",
    ];
    let lowered = text.to_lowercase();
    if COMMON_PATTERNS.iter().any(|weak| lowered.contains(weak)) {
        return Err(Error::WeakSecret(
            "contains a common weak pattern".to_string(),
        ));
    }

    Ok(())
}

pub fn hex_encode(bytes: &[u8]) -> String {
    const LUT: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(LUT[(b >> 4) as usize] as char);
        out.push(LUT[(b & 0x0f) as usize] as char);
    }
    out
}

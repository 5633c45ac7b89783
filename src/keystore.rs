use std::fmt;
use std::fs;
use std::path::Path;

use base64::{Engine as _, engine::general_purpose::STANDARD_NO_PAD};
use bip39::{Language, Mnemonic};
use chacha20poly1305::{
    Key, XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::security::{self, KEY_LEN, KeySet, SALT_LEN, SecretBuf};

const VERSION: u8 = 1;
const NONCE_LEN: usize = 24;
const RECOVERY_WORDS: usize = 24;

/// 24-word BIP-39 mnemonic that can re-derive the store key if the primary
/// secret is lost. Never persisted; shown to the user exactly once.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RecoveryCode {
    phrase: String,
}

impl RecoveryCode {
    pub fn reveal(&self) -> &str {
        &self.phrase
    }
}

impl fmt::Debug for RecoveryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecoveryCode([REDACTED])")
    }
}

/// Durable companion of a `KeySet`: salt and fingerprint, plus the store key
/// wrapped under the recovery mnemonic. The key itself is never written here.
#[derive(Debug, Serialize, Deserialize)]
pub struct Keystore {
    pub version: u8,
    pub salt: String,
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<WrappedRecovery>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WrappedRecovery {
    pub salt: String,
    pub nonce: String,
    pub wrapped_key: String,
}

impl Keystore {
    pub fn from_key_set(keys: &KeySet) -> Self {
        Self {
            version: VERSION,
            salt: STANDARD_NO_PAD.encode(keys.salt),
            fingerprint: keys.fingerprint.clone(),
            recovery: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        let store: Keystore = serde_json::from_str(&data)?;
        if store.version != VERSION {
            return Err(Error::CryptoFailure(format!(
                "unsupported keystore version {}",
                store.version
            )));
        }
        Ok(store)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data)?;
        #[cfg(unix)]
        {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(path, Permissions::from_mode(0o600));
        }
        Ok(())
    }

    /// Re-derive the key set from the primary secret and confirm it against
    /// the stored fingerprint.
    pub fn unlock_with_secret(&self, secret: &SecretBuf) -> Result<KeySet> {
        let salt = decode_fixed(&self.salt, SALT_LEN, "salt")?;
        let mut salt_arr = [0u8; SALT_LEN];
        salt_arr.copy_from_slice(&salt);

        let keys = security::derive_key_with_salt(secret, salt_arr)?;
        if keys.fingerprint != self.fingerprint {
            return Err(Error::CryptoFailure(
                "secret does not match the keystore fingerprint".to_string(),
            ));
        }
        Ok(keys)
    }

    /// Generate a recovery mnemonic and wrap the store key under it.
    /// Returns the mnemonic for one-time display.
    pub fn attach_recovery(&mut self, keys: &KeySet) -> Result<RecoveryCode> {
        let mnemonic = Mnemonic::generate_in(Language::English, RECOVERY_WORDS)
            .map_err(|err| Error::CryptoFailure(format!("mnemonic generation: {err}")))?;
        let phrase = mnemonic.to_string();

        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);

        let recovery_secret = SecretBuf::from_str(&normalize_recovery_code(&phrase));
        let wrap_keys = security::derive_key_with_salt(&recovery_secret, salt)?;

        let cipher = XChaCha20Poly1305::new(Key::from_slice(wrap_keys.expose_key()));
        let mut wrapped = cipher
            .encrypt(XNonce::from_slice(&nonce), keys.expose_key())
            .map_err(|_| Error::CryptoFailure("failed to wrap store key".to_string()))?;

        self.recovery = Some(WrappedRecovery {
            salt: STANDARD_NO_PAD.encode(salt),
            nonce: STANDARD_NO_PAD.encode(nonce),
            wrapped_key: STANDARD_NO_PAD.encode(&wrapped),
        });
        wrapped.zeroize();

        Ok(RecoveryCode { phrase })
    }

    /// Re-derive equivalent key material from a recovery mnemonic.
    pub fn unwrap_with_recovery(&self, code: &str) -> Result<KeySet> {
        let recovery = self.recovery.as_ref().ok_or(Error::RecoveryUnavailable)?;

        let salt = decode_fixed(&recovery.salt, SALT_LEN, "salt")?;
        let nonce = decode_fixed(&recovery.nonce, NONCE_LEN, "nonce")?;
        let wrapped = STANDARD_NO_PAD
            .decode(&recovery.wrapped_key)
            .map_err(|_| Error::CryptoFailure("invalid wrapped key data".to_string()))?;

        let mut salt_arr = [0u8; SALT_LEN];
        salt_arr.copy_from_slice(&salt);

        let recovery_secret = SecretBuf::from_str(&normalize_recovery_code(code));
        let wrap_keys = security::derive_key_with_salt(&recovery_secret, salt_arr)?;

        let cipher = XChaCha20Poly1305::new(Key::from_slice(wrap_keys.expose_key()));
        let mut plaintext = cipher
            .decrypt(XNonce::from_slice(&nonce), wrapped.as_ref())
            .map_err(|_| Error::CryptoFailure("invalid recovery code".to_string()))?;

        if plaintext.len() != KEY_LEN {
            plaintext.zeroize();
            return Err(Error::CryptoFailure("invalid store key length".to_string()));
        }

        let fingerprint = security::key_fingerprint(&plaintext);
        if fingerprint != self.fingerprint {
            plaintext.zeroize();
            return Err(Error::CryptoFailure(
                "recovered key does not match keystore fingerprint".to_string(),
            ));
        }

        let primary_salt = decode_fixed(&self.salt, SALT_LEN, "salt")?;
        let mut primary_salt_arr = [0u8; SALT_LEN];
        primary_salt_arr.copy_from_slice(&primary_salt);

        let keys = KeySet::from_raw(SecretBuf::new(plaintext), primary_salt_arr, fingerprint);
        Ok(keys)
    }
}

fn decode_fixed(encoded: &str, expected_len: usize, label: &str) -> Result<Vec<u8>> {
    let decoded = STANDARD_NO_PAD
        .decode(encoded)
        .map_err(|_| Error::CryptoFailure(format!("invalid {label} encoding")))?;
    if decoded.len() != expected_len {
        return Err(Error::CryptoFailure(format!("invalid {label} length")));
    }
    Ok(decoded)
}

fn normalize_recovery_code(code: &str) -> String {
    code.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

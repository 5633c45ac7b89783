use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Secret byte buffer with zeroization on drop and a redacted Debug
/// representation. The user secret and derived key material only ever live
/// inside this type while in memory.
#[derive(Clone)]
pub struct SecretBuf {
    bytes: Vec<u8>,
}

impl Zeroize for SecretBuf {
    fn zeroize(&mut self) {
        self.bytes.zeroize();
    }
}

impl ZeroizeOnDrop for SecretBuf {}

impl SecretBuf {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn from_str(secret: &str) -> Self {
        Self {
            bytes: secret.as_bytes().to_vec(),
        }
    }

    /// Deliberately named: every call site that reads the raw bytes is
    /// grep-able.
    pub fn expose_secret(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for SecretBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretBuf([REDACTED])")
    }
}

/// Constant-time comparison to prevent timing attacks on secret confirmation.
/// Inputs are padded to equal length so the length difference itself does not
/// short-circuit the byte comparison.
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    let max_len = std::cmp::max(a.len(), b.len());
    let mut a_padded = Vec::with_capacity(max_len);
    let mut b_padded = Vec::with_capacity(max_len);

    a_padded.extend_from_slice(a);
    a_padded.resize(max_len, 0u8);

    b_padded.extend_from_slice(b);
    b_padded.resize(max_len, 0u8);

    use subtle::ConstantTimeEq;
    let equal: bool = a_padded.as_slice().ct_eq(b_padded.as_slice()).into();
    equal && a.len() == b.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretBuf::from_str("hunter2hunter2");
        let rendered = format!("{:?}", secret);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare(b"same", b"same"));
        assert!(!constant_time_compare(b"same", b"different"));
        assert!(!constant_time_compare(b"same", b"sam"));
        assert!(constant_time_compare(b"", b""));
    }

    #[test]
    fn test_expose_secret_roundtrip() {
        let secret = SecretBuf::from_str("pass");
        assert_eq!(secret.expose_secret(), b"pass");
        assert_eq!(secret.len(), 4);
        assert!(!secret.is_empty());
    }
}

use std::fmt;

use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// AES-128 key length in bytes.
pub const KEY_LEN: usize = 16;

/// Symmetric key owned by exactly one transfer session. Wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Derive the transfer key from a password: SHA-256(utf8(password))[..16].
///
/// Deterministic and unsalted so both peers reach the same key independently.
/// See the crate docs for why this is weak.
pub fn derive_key(password: &str) -> SymmetricKey {
    let mut digest = Sha256::digest(password.as_bytes());
    let mut key = SymmetricKey([0u8; KEY_LEN]);
    key.0.copy_from_slice(&digest[..KEY_LEN]);
    digest.as_mut_slice().zeroize();
    key
}

#[derive(Debug, thiserror::Error)]
#[error("password must not be empty")]
pub struct EmptyCredential;

/// A password typed by a human for one connection attempt. Never persisted.
pub struct Credential(Zeroizing<String>);

impl Credential {
    pub fn new(password: impl Into<String>) -> Result<Self, EmptyCredential> {
        let password = Zeroizing::new(password.into());
        if password.is_empty() {
            return Err(EmptyCredential);
        }
        Ok(Self(password))
    }

    pub fn derive_key(&self) -> SymmetricKey {
        derive_key(&self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_truncated_sha256() {
        // sha256("secret123") = fcf730b6d95236ecd3c9fc2d92d7b6b2 bb06...
        let key = derive_key("secret123");
        assert_eq!(
            key.as_bytes(),
            &[
                0xfc, 0xf7, 0x30, 0xb6, 0xd9, 0x52, 0x36, 0xec, 0xd3, 0xc9, 0xfc, 0x2d, 0x92, 0xd7,
                0xb6, 0xb2
            ]
        );
    }

    #[test]
    fn derivation_is_deterministic() {
        assert_eq!(derive_key("hunter2"), derive_key("hunter2"));
        assert_ne!(derive_key("hunter2"), derive_key("hunter3"));
    }

    #[test]
    fn empty_credential_rejected() {
        assert!(Credential::new("").is_err());
        assert!(Credential::new(" ").is_ok());
    }

    #[test]
    fn debug_output_is_redacted() {
        let cred = Credential::new("topsecret").unwrap();
        assert!(!format!("{:?}", cred).contains("topsecret"));
        let key = cred.derive_key();
        assert_eq!(format!("{:?}", key), "SymmetricKey(..)");
    }
}

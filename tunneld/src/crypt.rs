//! Symmetric encryption of the tunneled segments.
//!
//! Each client-facing TCP payload is one `encrypt` output; `decrypt` is its
//! inverse. The AES-GCM form carries `nonce(12) || ciphertext || tag` with
//! the key derived from the shared passphrase by SHA-256.

use std::sync::Arc;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use sha2::{Digest, Sha256};

pub const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptError {
    #[error("ciphertext too short")]
    TooShort,
    #[error("cipher failure")]
    Cipher,
}

pub trait Crypt: Send + Sync {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CryptError>;
    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, CryptError>;
}

/// No encryption; for tests and trusted links.
pub struct Plain;

impl Crypt for Plain {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CryptError> {
        Ok(plain.to_vec())
    }

    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, CryptError> {
        Ok(cipher.to_vec())
    }
}

pub struct AesGcm {
    cipher: Aes256Gcm,
}

impl AesGcm {
    pub fn with_password(password: &str) -> Self {
        let key: [u8; 32] = Sha256::digest(password.as_bytes()).into();
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }
}

impl Crypt for AesGcm {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CryptError> {
        let nonce: [u8; NONCE_LEN] = rand::random();
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| CryptError::Cipher)?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, CryptError> {
        if cipher.len() < NONCE_LEN {
            return Err(CryptError::TooShort);
        }
        let (nonce, sealed) = cipher.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CryptError::Cipher)
    }
}

/// Resolve a method name from the CLI/config into a cipher.
pub fn from_method(method: &str, password: &str) -> anyhow::Result<Arc<dyn Crypt>> {
    match method {
        "plain" => Ok(Arc::new(Plain)),
        "aes-gcm" => {
            anyhow::ensure!(!password.is_empty(), "method aes-gcm requires a password");
            Ok(Arc::new(AesGcm::with_password(password)))
        }
        other => anyhow::bail!("unknown encryption method {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_is_identity() {
        let c = Plain;
        let sealed = c.encrypt(b"packet").unwrap();
        assert_eq!(sealed, b"packet");
        assert_eq!(c.decrypt(&sealed).unwrap(), b"packet");
    }

    #[test]
    fn test_aes_gcm_round_trip() {
        let c = AesGcm::with_password("secret");
        let sealed = c.encrypt(b"inner ip packet").unwrap();
        assert_ne!(sealed, b"inner ip packet");
        assert_eq!(c.decrypt(&sealed).unwrap(), b"inner ip packet");
    }

    #[test]
    fn test_aes_gcm_rejects_wrong_key() {
        let sealed = AesGcm::with_password("secret").encrypt(b"data").unwrap();
        assert!(AesGcm::with_password("other").decrypt(&sealed).is_err());
    }

    #[test]
    fn test_aes_gcm_rejects_truncated() {
        let c = AesGcm::with_password("secret");
        assert!(matches!(c.decrypt(&[0u8; 4]), Err(CryptError::TooShort)));
        let sealed = c.encrypt(b"data").unwrap();
        assert!(c.decrypt(&sealed[..sealed.len() - 1]).is_err());
    }

    #[test]
    fn test_from_method() {
        assert!(from_method("plain", "").is_ok());
        assert!(from_method("aes-gcm", "pw").is_ok());
        assert!(from_method("aes-gcm", "").is_err());
        assert!(from_method("rot13", "pw").is_err());
    }
}

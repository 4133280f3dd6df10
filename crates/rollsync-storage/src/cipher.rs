use aes_gcm::aead::Aead;
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use base64::{engine::general_purpose, Engine as _};
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_LEN: usize = 12;

/// Failures never carry plaintext or key material.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("sealed credential is not valid base64")]
    Encoding,
    #[error("sealed credential is too short")]
    Truncated,
    #[error("credential encryption failed")]
    Encrypt,
    #[error("credential could not be decrypted with the configured key")]
    Decrypt,
    #[error("decrypted credential is not valid UTF-8")]
    Utf8,
}

/// AES-256-GCM sealing for portal passwords stored at rest.
///
/// Sealed form is `base64(nonce || ciphertext)`; the AES key is the SHA-256 of
/// the configured secret.
pub struct CredentialCipher {
    key: SecretString,
}

impl CredentialCipher {
    pub fn new(key: SecretString) -> Self {
        Self { key }
    }

    fn cipher(&self) -> Aes256Gcm {
        let mut hasher = Sha256::new();
        hasher.update(self.key.expose_secret().as_bytes());
        let key_bytes = hasher.finalize();
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes))
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, CipherError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::Encrypt)?;

        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(sealed))
    }

    pub fn open(&self, sealed: &str) -> Result<SecretString, CipherError> {
        let data = general_purpose::STANDARD
            .decode(sealed.trim())
            .map_err(|_| CipherError::Encoding)?;
        if data.len() <= NONCE_LEN {
            return Err(CipherError::Truncated);
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CipherError::Decrypt)?;
        String::from_utf8(plaintext)
            .map(SecretString::new)
            .map_err(|_| CipherError::Utf8)
    }
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher(key: &str) -> CredentialCipher {
        CredentialCipher::new(SecretString::new(key.to_string()))
    }

    #[test]
    fn sealed_value_opens_with_same_key_only() {
        let sealed = cipher("district-key").seal("hunter2").expect("seal");
        assert!(!sealed.contains("hunter2"));

        let opened = cipher("district-key").open(&sealed).expect("open");
        assert_eq!(opened.expose_secret(), "hunter2");

        assert_eq!(cipher("other-key").open(&sealed).unwrap_err(), CipherError::Decrypt);
    }

    #[test]
    fn nonces_differ_between_seals() {
        let c = cipher("district-key");
        assert_ne!(c.seal("same").expect("seal"), c.seal("same").expect("seal"));
    }

    #[test]
    fn malformed_input_is_classified() {
        let c = cipher("district-key");
        assert_eq!(c.open("not base64!").unwrap_err(), CipherError::Encoding);
        assert_eq!(
            c.open(&general_purpose::STANDARD.encode([0u8; 8])).unwrap_err(),
            CipherError::Truncated
        );
    }
}

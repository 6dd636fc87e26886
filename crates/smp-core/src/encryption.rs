//! KMS-backed AES-256-GCM payload encryption.
//!
//! The key management service is consumed through a capability trait; the
//! encrypter only sees the generated data key. The 64-byte key splits into
//! two halves used asymmetrically: the lower 32 bytes decrypt what the peer
//! sends, the upper 32 bytes encrypt what we send, and the peer uses the
//! opposite halves.

use std::collections::HashMap;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use rand::RngCore;

use crate::error::{Error, Result};

/// Nonce prefix length of every ciphertext.
const NONCE_SIZE: usize = 12;

/// Bytes requested from the key management service.
pub const DATA_KEY_SIZE: u32 = 64;

/// A data key generated by the key management service.
#[derive(Debug, Clone)]
pub struct GeneratedDataKey {
    /// Encrypted copy of the key, returned to the peer in the handshake.
    pub ciphertext_blob: Vec<u8>,
    /// Plaintext key material.
    pub plaintext: Vec<u8>,
}

/// Capability to generate data keys.
#[async_trait]
pub trait KmsKeyProvider: Send + Sync {
    /// Generate a data key of `num_bytes` bytes under `key_id`.
    async fn generate_data_key(
        &self,
        key_id: &str,
        context: &HashMap<String, String>,
        num_bytes: u32,
    ) -> Result<GeneratedDataKey>;
}

/// AES-256-GCM encrypter over a split KMS data key.
pub struct Encrypter {
    kms_key_id: String,
    cipher_text_key: Vec<u8>,
    encryption_cipher: Aes256Gcm,
    decryption_cipher: Aes256Gcm,
}

impl std::fmt::Debug for Encrypter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encrypter")
            .field("kms_key_id", &self.kms_key_id)
            .finish_non_exhaustive()
    }
}

impl Encrypter {
    /// Generate a data key and build the cipher pair.
    pub async fn new(
        kms: &dyn KmsKeyProvider,
        kms_key_id: &str,
        context: HashMap<String, String>,
    ) -> Result<Self> {
        let key = kms
            .generate_data_key(kms_key_id, &context, DATA_KEY_SIZE)
            .await?;
        Self::from_data_key(kms_key_id, key)
    }

    /// Build the cipher pair from an already generated data key.
    pub fn from_data_key(kms_key_id: &str, key: GeneratedDataKey) -> Result<Self> {
        if key.plaintext.len() != DATA_KEY_SIZE as usize {
            return Err(Error::Encryption {
                message: format!(
                    "unexpected data key size: {} bytes (want {})",
                    key.plaintext.len(),
                    DATA_KEY_SIZE
                ),
            });
        }

        let half = key.plaintext.len() / 2;
        let decryption_cipher =
            Aes256Gcm::new_from_slice(&key.plaintext[..half]).map_err(|e| Error::Encryption {
                message: format!("invalid decryption key: {e}"),
            })?;
        let encryption_cipher =
            Aes256Gcm::new_from_slice(&key.plaintext[half..]).map_err(|e| Error::Encryption {
                message: format!("invalid encryption key: {e}"),
            })?;

        Ok(Self {
            kms_key_id: kms_key_id.to_string(),
            cipher_text_key: key.ciphertext_blob,
            encryption_cipher,
            decryption_cipher,
        })
    }

    /// The encrypted data key blob for the handshake response.
    pub fn encrypted_data_key(&self) -> &[u8] {
        &self.cipher_text_key
    }

    /// The KMS key id the data key was generated under.
    pub fn kms_key_id(&self) -> &str {
        &self.kms_key_id
    }

    /// Encrypt a payload; output is `nonce || ciphertext || tag`.
    pub fn encrypt(&self, plain_text: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let cipher_text = self
            .encryption_cipher
            .encrypt(Nonce::from_slice(&nonce), plain_text)
            .map_err(|_| Error::Encryption {
                message: "encryption failed".to_string(),
            })?;

        let mut output = Vec::with_capacity(NONCE_SIZE + cipher_text.len());
        output.extend_from_slice(&nonce);
        output.extend_from_slice(&cipher_text);
        Ok(output)
    }

    /// Decrypt a `nonce || ciphertext || tag` payload.
    pub fn decrypt(&self, cipher_text: &[u8]) -> Result<Vec<u8>> {
        if cipher_text.len() < NONCE_SIZE {
            return Err(Error::Encryption {
                message: format!("ciphertext too short: {} bytes", cipher_text.len()),
            });
        }
        let (nonce, body) = cipher_text.split_at(NONCE_SIZE);
        self.decryption_cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| Error::Encryption {
                message: "decryption failed".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedKms {
        key: Vec<u8>,
    }

    #[async_trait]
    impl KmsKeyProvider for FixedKms {
        async fn generate_data_key(
            &self,
            _key_id: &str,
            _context: &HashMap<String, String>,
            _num_bytes: u32,
        ) -> Result<GeneratedDataKey> {
            Ok(GeneratedDataKey {
                ciphertext_blob: b"encrypted-key-blob".to_vec(),
                plaintext: self.key.clone(),
            })
        }
    }

    fn data_key() -> Vec<u8> {
        (0u8..64).collect()
    }

    fn swapped(key: &[u8]) -> Vec<u8> {
        let mut out = key[32..].to_vec();
        out.extend_from_slice(&key[..32]);
        out
    }

    async fn encrypter_for(key: Vec<u8>) -> Encrypter {
        let kms = FixedKms { key };
        Encrypter::new(&kms, "alias/test", HashMap::new()).await.unwrap()
    }

    #[tokio::test]
    async fn peer_with_swapped_halves_can_decrypt() {
        let ours = encrypter_for(data_key()).await;
        let peer = encrypter_for(swapped(&data_key())).await;

        let cipher = ours.encrypt(b"terminal output").unwrap();
        let plain = peer.decrypt(&cipher).unwrap();
        assert_eq!(plain, b"terminal output");
    }

    #[tokio::test]
    async fn own_halves_do_not_decrypt_own_output() {
        let ours = encrypter_for(data_key()).await;
        let cipher = ours.encrypt(b"secret").unwrap();
        assert!(ours.decrypt(&cipher).is_err());
    }

    #[tokio::test]
    async fn nonce_is_fresh_per_encryption() {
        let ours = encrypter_for(data_key()).await;
        let a = ours.encrypt(b"same plaintext").unwrap();
        let b = ours.encrypt(b"same plaintext").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn rejects_short_ciphertext() {
        let ours = encrypter_for(data_key()).await;
        assert!(ours.decrypt(&[0u8; 4]).is_err());
    }

    #[tokio::test]
    async fn rejects_wrong_size_data_key() {
        let kms = FixedKms { key: vec![0u8; 32] };
        let err = Encrypter::new(&kms, "alias/test", HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Encryption { .. }));
    }

    #[tokio::test]
    async fn exposes_cipher_text_blob() {
        let ours = encrypter_for(data_key()).await;
        assert_eq!(ours.encrypted_data_key(), b"encrypted-key-blob");
        assert_eq!(ours.kms_key_id(), "alias/test");
    }
}

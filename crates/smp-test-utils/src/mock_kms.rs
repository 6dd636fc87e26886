//! Fixed-key provider standing in for the key management service.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use smp_core::encryption::{GeneratedDataKey, KmsKeyProvider};
use smp_core::error::Result;

/// Key provider returning a fixed data key and recording the request.
pub struct MockKms {
    plaintext_key: Vec<u8>,
    ciphertext_blob: Vec<u8>,
    requests: Mutex<Vec<(String, HashMap<String, String>)>>,
}

impl MockKms {
    /// Provider with a deterministic 64-byte key.
    pub fn new() -> Self {
        Self::with_key((0u8..64).collect())
    }

    /// Provider with an explicit plaintext key.
    pub fn with_key(plaintext_key: Vec<u8>) -> Self {
        Self {
            plaintext_key,
            ciphertext_blob: b"mock-cipher-text-key".to_vec(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// The plaintext key with its halves swapped, as the peer would use it.
    pub fn peer_key(&self) -> Vec<u8> {
        let half = self.plaintext_key.len() / 2;
        let mut swapped = self.plaintext_key[half..].to_vec();
        swapped.extend_from_slice(&self.plaintext_key[..half]);
        swapped
    }

    /// Key ids and encryption contexts of all requests served.
    pub fn requests(&self) -> Vec<(String, HashMap<String, String>)> {
        self.requests.lock().unwrap().clone()
    }
}

impl Default for MockKms {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KmsKeyProvider for MockKms {
    async fn generate_data_key(
        &self,
        key_id: &str,
        context: &HashMap<String, String>,
        _num_bytes: u32,
    ) -> Result<GeneratedDataKey> {
        self.requests
            .lock()
            .unwrap()
            .push((key_id.to_string(), context.clone()));
        Ok(GeneratedDataKey {
            ciphertext_blob: self.ciphertext_blob.clone(),
            plaintext: self.plaintext_key.clone(),
        })
    }
}

// Subtitle payload decryption: key cache, AES-128-CBC decrypter and decrypt jobs.

use crate::error::SubtitleStreamError;
use crate::events::SubtitleEvent;
use crate::fragment::Fragment;
use aes::Aes128;
use async_trait::async_trait;
use bytes::Bytes;
use cbc::cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Decryption primitive for delivered fragment payloads.
#[async_trait]
pub trait PayloadDecrypter: Send + Sync {
    async fn decrypt(
        &self,
        data: Bytes,
        key: &[u8; 16],
        iv: &[u8; 16],
    ) -> Result<Bytes, SubtitleStreamError>;
}

/// AES-128-CBC with PKCS#7 padding, optionally offloaded to the blocking pool.
#[derive(Debug, Clone, Copy)]
pub struct Aes128Decrypter {
    offload: bool,
}

impl Aes128Decrypter {
    pub fn new(offload: bool) -> Self {
        Self { offload }
    }

    pub fn decrypt_sync(
        data: &[u8],
        key: &[u8; 16],
        iv: &[u8; 16],
    ) -> Result<Bytes, SubtitleStreamError> {
        let mut buffer = data.to_vec();
        let cipher = Aes128CbcDec::new_from_slices(key, iv).map_err(|e| {
            SubtitleStreamError::DecryptionError(format!("Failed to initialize AES decryptor: {e}"))
        })?;

        let decrypted_len = cipher
            .decrypt_padded_mut::<Pkcs7>(&mut buffer)
            .map_err(|e| SubtitleStreamError::DecryptionError(format!("Decryption failed: {e}")))?
            .len();

        buffer.truncate(decrypted_len);
        Ok(Bytes::from(buffer))
    }
}

impl Default for Aes128Decrypter {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl PayloadDecrypter for Aes128Decrypter {
    async fn decrypt(
        &self,
        data: Bytes,
        key: &[u8; 16],
        iv: &[u8; 16],
    ) -> Result<Bytes, SubtitleStreamError> {
        if !self.offload {
            return Self::decrypt_sync(&data, key, iv);
        }

        let key = *key;
        let iv = *iv;
        tokio::task::spawn_blocking(move || Self::decrypt_sync(&data, &key, &iv))
            .await
            .map_err(|e| SubtitleStreamError::Internal {
                reason: format!("Decryption offload task failed: {e}"),
            })?
    }
}

/// Delivered AES-128 keys, by key URI.
#[derive(Debug, Default)]
pub struct KeyCache {
    keys: HashMap<String, [u8; 16]>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, uri: &str, key: &[u8]) -> Result<(), SubtitleStreamError> {
        let key: [u8; 16] = key.try_into().map_err(|_| {
            SubtitleStreamError::invalid_key(
                uri,
                format!("expected 16 bytes, got {}", key.len()),
            )
        })?;
        self.keys.insert(uri.to_string(), key);
        Ok(())
    }

    /// Key for the fragment, from its decrypt data or from the cache.
    pub fn key_for(&self, fragment: &Fragment) -> Option<[u8; 16]> {
        let decrypt_data = fragment.decrypt_data.as_ref()?;
        if let Some(key) = decrypt_data.key.as_deref()
            && let Ok(key) = <[u8; 16]>::try_from(key)
        {
            return Some(key);
        }
        decrypt_data
            .uri
            .as_deref()
            .and_then(|uri| self.keys.get(uri))
            .copied()
    }

    pub fn is_ready(&self, fragment: &Fragment) -> bool {
        self.key_for(fragment).is_some()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecryptStats {
    pub started: Instant,
    pub finished: Instant,
}

impl DecryptStats {
    pub fn duration(&self) -> Duration {
        self.finished.saturating_duration_since(self.started)
    }
}

/// Decryption of one loaded payload, detached from the controller.
#[derive(Debug, Clone)]
pub struct DecryptJob {
    pub fragment: Fragment,
    pub payload: Bytes,
    pub key: [u8; 16],
    pub iv: [u8; 16],
    pub token: CancellationToken,
}

impl DecryptJob {
    /// Run the job and build the completion event, or `None` if it was cancelled.
    pub async fn run(self, decrypter: Arc<dyn PayloadDecrypter>) -> Option<SubtitleEvent> {
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                debug!(sn = self.fragment.sn, "Subtitle decryption cancelled");
                return None;
            }
            result = decrypter.decrypt(self.payload, &self.key, &self.iv) => result,
        };
        let stats = DecryptStats {
            started,
            finished: Instant::now(),
        };
        trace!(
            sn = self.fragment.sn,
            elapsed_ms = stats.duration().as_millis() as u64,
            ok = result.is_ok(),
            "Subtitle decryption finished"
        );
        Some(SubtitleEvent::FragDecrypted {
            fragment: self.fragment,
            result,
            stats,
        })
    }
}

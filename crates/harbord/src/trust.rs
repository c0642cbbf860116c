//! Trust-on-first-use host-key store.
//!
//! Pins the SHA-256 fingerprint of each remote host's key on first contact
//! and rejects any later contact that presents a different key. Pins are
//! cached in memory and persisted in the store so they survive a daemon
//! restart. A pin is released when the node behind the address is torn
//! down, since cloud addresses get recycled.

use anyhow::Result;
use chrono::Utc;
use harbor_common::model::TrustedHostKey;
use harbor_common::HarborError;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::store::Store;

/// Hex-encoded SHA-256 fingerprint of a presented host key.
pub fn fingerprint(key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hex::encode(hasher.finalize())
}

pub struct TrustStore {
    store: Arc<Store>,
    cache: RwLock<HashMap<String, String>>,
}

impl TrustStore {
    /// Load persisted pins into the cache.
    pub fn open(store: Arc<Store>) -> Result<Self> {
        let mut cache = HashMap::new();
        for key in store.list_trusted_keys()? {
            cache.insert(key.host, key.fingerprint);
        }
        info!("Trust store loaded with {} pinned hosts", cache.len());
        Ok(Self {
            store,
            cache: RwLock::new(cache),
        })
    }

    /// Verify a presented host key against the pin for `host`.
    ///
    /// First contact pins the fingerprint and accepts. A mismatch on any
    /// later contact is rejected as a possible key rotation or
    /// interception; the remote channel must not proceed.
    pub async fn verify(&self, host: &str, presented_key: &[u8]) -> Result<(), HarborError> {
        let presented = fingerprint(presented_key);

        let pinned = { self.cache.read().await.get(host).cloned() };
        match pinned {
            None => {
                let now = Utc::now();
                let entry = TrustedHostKey {
                    host: host.to_string(),
                    fingerprint: presented.clone(),
                    first_seen: now,
                    last_verified: now,
                };
                self.store
                    .upsert_trusted_key(&entry)
                    .map_err(|e| HarborError::Storage(e.to_string()))?;
                self.cache
                    .write()
                    .await
                    .insert(host.to_string(), presented.clone());
                info!("Pinned host key for {} on first use ({})", host, &presented[..12]);
                Ok(())
            }
            Some(pinned) if pinned == presented => {
                self.store
                    .touch_trusted_key(host, Utc::now())
                    .map_err(|e| HarborError::Storage(e.to_string()))?;
                Ok(())
            }
            Some(pinned) => {
                warn!(
                    "Host key mismatch for {}: pinned {} presented {}",
                    host,
                    &pinned[..12],
                    &presented[..12]
                );
                Err(HarborError::HostKeyMismatch {
                    host: host.to_string(),
                    pinned,
                    presented,
                })
            }
        }
    }

    /// Release the pin for a torn-down host.
    pub async fn release(&self, host: &str) -> Result<()> {
        self.cache.write().await.remove(host);
        self.store.delete_trusted_key(host)?;
        info!("Released host key pin for {}", host);
        Ok(())
    }

    pub async fn is_pinned(&self, host: &str) -> bool {
        self.cache.read().await.contains_key(host)
    }
}

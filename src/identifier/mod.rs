//! Deterministic capability identifiers
//!
//! Tier and announcement records are addressable by a `d` tag derived
//! from the capability name, image and signing pubkey. The derivation
//! is a pure function; derived values are memoized in a [`KvStore`] so
//! an identifier survives restarts instead of being minted twice.

mod store;

pub use store::{FileKvStore, KvStore, MemoryKvStore, StoreError};

use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Derive the 16-character d tag for a capability
///
/// `truncate16hex(sha256(name ++ image ++ pubkey))`; lowercase hex,
/// stable across processes and restarts.
pub fn derive_dtag(name: &str, image: &str, pubkey: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(image.as_bytes());
    hasher.update(pubkey.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Memoized identifiers backed by a persistent key-value store
///
/// Lookups and mints go through one internal lock, so concurrent jobs
/// asking for the same identifier see a single writer.
#[derive(Clone)]
pub struct IdentifierStore {
    store: Arc<dyn KvStore>,
    write_lock: Arc<Mutex<()>>,
}

impl IdentifierStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Return the memoized d tag for `identifier`, deriving and
    /// persisting it on first use
    pub async fn ensure_dtag(
        &self,
        identifier: &str,
        name: &str,
        image: &str,
        pubkey: &str,
    ) -> Result<String, StoreError> {
        let _guard = self.write_lock.lock().await;
        let key = format!("dtag/{identifier}");
        if let Some(dtag) = self.store.get(&key).await? {
            return Ok(dtag);
        }
        let dtag = derive_dtag(name, image, pubkey);
        self.store.put(&key, &dtag).await?;
        tracing::debug!(identifier, %dtag, "minted new d tag");
        Ok(dtag)
    }

    /// The recorded tier event id for `identifier`, if one was announced
    pub async fn tier_event_id(&self, identifier: &str) -> Result<Option<String>, StoreError> {
        self.store.get(&format!("tier-event/{identifier}")).await
    }

    /// Record the event id of an announced tier
    pub async fn record_tier_event(
        &self,
        identifier: &str,
        event_id: &str,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.store
            .put(&format!("tier-event/{identifier}"), event_id)
            .await
    }

    /// Arbitrary scoped value, used for per-processor bookkeeping
    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.store.get(key).await
    }

    /// Store an arbitrary scoped value
    pub async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.store.put(key, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUBKEY: &str = "3bf0c63fcb93463407af97a5e5ee64fa883d107ef9e558472c4eb9aaaefa459d";

    #[test]
    fn test_derive_dtag_deterministic() {
        let a = derive_dtag("Unstable Diffusion", "https://img.example/a.jpg", PUBKEY);
        let b = derive_dtag("Unstable Diffusion", "https://img.example/a.jpg", PUBKEY);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_derive_dtag_input_sensitivity() {
        let base = derive_dtag("name", "image", PUBKEY);
        assert_ne!(base, derive_dtag("name2", "image", PUBKEY));
        assert_ne!(base, derive_dtag("name", "image2", PUBKEY));
        assert_ne!(base, derive_dtag("name", "image", "other"));
    }

    #[tokio::test]
    async fn test_ensure_dtag_memoizes() {
        let ids = IdentifierStore::new(Arc::new(MemoryKvStore::new()));

        let first = ids
            .ensure_dtag("sdxl", "Unstable Diffusion", "img", PUBKEY)
            .await
            .unwrap();
        let second = ids
            .ensure_dtag("sdxl", "Unstable Diffusion", "img", PUBKEY)
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_ensure_dtag_prefers_stored_value() {
        let store = Arc::new(MemoryKvStore::new());
        store.put("dtag/sdxl", "cafebabecafebabe").await.unwrap();

        let ids = IdentifierStore::new(store);
        let dtag = ids
            .ensure_dtag("sdxl", "Unstable Diffusion", "img", PUBKEY)
            .await
            .unwrap();
        // the persisted identifier wins over recomputation
        assert_eq!(dtag, "cafebabecafebabe");
    }

    #[tokio::test]
    async fn test_tier_event_roundtrip() {
        let ids = IdentifierStore::new(Arc::new(MemoryKvStore::new()));
        assert_eq!(ids.tier_event_id("sdxl").await.unwrap(), None);

        ids.record_tier_event("sdxl", "ev123").await.unwrap();
        assert_eq!(
            ids.tier_event_id("sdxl").await.unwrap(),
            Some("ev123".to_string())
        );
    }
}

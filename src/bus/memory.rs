//! In-memory event bus
//!
//! Backs tests and single-process setups. Several [`MemoryBus`]
//! instances can share one store, each publishing under its own
//! identity, which models multiple actors on the same network.

use super::{BusError, Event, EventBus, EventTemplate, Filter};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

struct Subscriber {
    id: Uuid,
    filter: Filter,
    tx: mpsc::Sender<Event>,
}

/// Shared storage behind one or more [`MemoryBus`] instances
#[derive(Default)]
pub struct MemoryStore {
    events: Mutex<Vec<Event>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// An event bus that never leaves the process
pub struct MemoryBus {
    store: Arc<MemoryStore>,
    identity: String,
}

impl MemoryBus {
    /// A bus with a private store
    pub fn new(identity: impl Into<String>) -> Self {
        Self::with_store(MemoryStore::new(), identity)
    }

    /// A bus publishing into a shared store
    pub fn with_store(store: Arc<MemoryStore>, identity: impl Into<String>) -> Self {
        Self {
            store,
            identity: identity.into(),
        }
    }

    /// The store backing this bus, for sharing with other instances
    pub fn store(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }
}

/// Event id over the canonical serialization, as the network does it
fn event_id(pubkey: &str, created_at: u64, kind: u16, tags: &[Vec<String>], content: &str) -> String {
    let serialized =
        serde_json::to_string(&(0, pubkey, created_at, kind, tags, content)).unwrap_or_default();
    hex::encode(Sha256::digest(serialized.as_bytes()))
}

#[async_trait]
impl EventBus for MemoryBus {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn publish(&self, template: EventTemplate) -> Result<String, BusError> {
        let created_at = chrono::Utc::now().timestamp() as u64;
        let id = event_id(
            &self.identity,
            created_at,
            template.kind,
            &template.tags,
            &template.content,
        );
        let event = Event {
            id: id.clone(),
            pubkey: self.identity.clone(),
            created_at,
            kind: template.kind,
            tags: template.tags,
            content: template.content,
        };

        self.store.events.lock().await.push(event.clone());

        let mut subscribers = self.store.subscribers.lock().await;
        let mut closed = Vec::new();
        for sub in subscribers.iter() {
            if sub.filter.matches(&event) && sub.tx.send(event.clone()).await.is_err() {
                closed.push(sub.id);
            }
        }
        subscribers.retain(|sub| !closed.contains(&sub.id));

        Ok(id)
    }

    async fn query(&self, filter: Filter) -> Result<Vec<Event>, BusError> {
        let events = self.store.events.lock().await;
        let mut matched: Vec<Event> = events
            .iter()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect();
        matched.sort_by(|a, b| match b.created_at.cmp(&a.created_at) {
            std::cmp::Ordering::Equal => a.id.cmp(&b.id),
            other => other,
        });
        if let Some(limit) = filter.limit {
            matched.truncate(limit as usize);
        }
        Ok(matched)
    }

    async fn subscribe(&self, filter: Filter) -> Result<mpsc::Receiver<Event>, BusError> {
        let (tx, rx) = mpsc::channel(64);
        self.store.subscribers.lock().await.push(Subscriber {
            id: Uuid::new_v4(),
            filter,
            tx,
        });
        Ok(rx)
    }
}

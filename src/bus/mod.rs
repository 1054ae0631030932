//! Event bus abstraction over the signed-event network
//!
//! The network itself (key handling, Schnorr signatures, relay
//! connections) lives outside this crate. Implementations of
//! [`EventBus`] are expected to sign outgoing templates with the
//! identity they were constructed with and to verify signatures before
//! delivering inbound events, so everything surfaced here is already
//! authenticated.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from event bus operations
#[derive(Debug, Error)]
pub enum BusError {
    #[error("publish failed: {0}")]
    Publish(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

/// An authenticated event as delivered by the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-byte lowercase hex event id
    pub id: String,
    /// 32-byte lowercase hex public key of the author
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
}

impl Event {
    /// Get the second element of the first tag with the given name
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(|s| s.as_str()) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(|s| s.as_str())
    }

    /// All tags with the given name
    pub fn tags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Vec<String>> {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(|s| s.as_str()) == Some(name))
    }
}

/// An event before the transport stamps timestamp, author and signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
}

impl EventTemplate {
    pub fn new(kind: u16, tags: Vec<Vec<String>>, content: impl Into<String>) -> Self {
        Self {
            kind,
            tags,
            content: content.into(),
        }
    }
}

/// Filter for event queries and subscriptions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filter {
    /// Event IDs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Authors (pubkeys)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// Event kinds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Events since timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Maximum number of events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Generic tag queries; key is the tag name, value the accepted values
    #[serde(flatten, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, Vec<String>>,
}

impl Filter {
    /// Create a new empty filter
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by event IDs
    pub fn ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Filter by authors
    pub fn authors(mut self, authors: Vec<String>) -> Self {
        self.authors = Some(authors);
        self
    }

    /// Filter by kinds
    pub fn kinds(mut self, kinds: Vec<u16>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    /// Filter by events since timestamp
    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    /// Limit number of results
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Add a tag filter. The key is the tag name (e.g. "p", "P", "d")
    pub fn tag(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.tags.insert(key.into(), values);
        self
    }

    /// Check whether an event matches this filter (limit excluded)
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        for (name, values) in &self.tags {
            let hit = event
                .tags_named(name)
                .filter_map(|tag| tag.get(1))
                .any(|v| values.contains(v));
            if !hit {
                return false;
            }
        }
        true
    }
}

/// Publish, query and subscribe on the signed-event network
///
/// One bus instance is bound to one signing identity; every task
/// processor owns its own bus.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Hex public key that events published through this bus carry
    fn identity(&self) -> &str;

    /// Sign and publish a template, returning the event id
    async fn publish(&self, template: EventTemplate) -> Result<String, BusError>;

    /// Fetch stored events matching the filter, newest first
    async fn query(&self, filter: Filter) -> Result<Vec<Event>, BusError>;

    /// Stream events matching the filter as they arrive
    async fn subscribe(&self, filter: Filter) -> Result<mpsc::Receiver<Event>, BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_with_tags(tags: Vec<Vec<String>>) -> Event {
        Event {
            id: "0".repeat(64),
            pubkey: "a".repeat(64),
            created_at: 1_700_000_000,
            kind: 5100,
            tags,
            content: String::new(),
        }
    }

    #[test]
    fn test_tag_value_first_match() {
        let event = event_with_tags(vec![
            vec!["d".to_string(), "first".to_string()],
            vec!["d".to_string(), "second".to_string()],
        ]);
        assert_eq!(event.tag_value("d"), Some("first"));
        assert_eq!(event.tag_value("missing"), None);
    }

    #[test]
    fn test_filter_matches_kind_and_author() {
        let event = event_with_tags(vec![]);

        assert!(Filter::new().kinds(vec![5100]).matches(&event));
        assert!(!Filter::new().kinds(vec![5002]).matches(&event));
        assert!(Filter::new().authors(vec!["a".repeat(64)]).matches(&event));
        assert!(!Filter::new().authors(vec!["b".repeat(64)]).matches(&event));
    }

    #[test]
    fn test_filter_matches_tags() {
        let event = event_with_tags(vec![vec!["p".to_string(), "abc".to_string()]]);

        assert!(Filter::new().tag("p", vec!["abc".to_string()]).matches(&event));
        assert!(!Filter::new().tag("p", vec!["def".to_string()]).matches(&event));
        assert!(!Filter::new().tag("P", vec!["abc".to_string()]).matches(&event));
    }

    #[test]
    fn test_filter_since() {
        let event = event_with_tags(vec![]);
        assert!(Filter::new().since(1_600_000_000).matches(&event));
        assert!(!Filter::new().since(1_800_000_000).matches(&event));
    }
}

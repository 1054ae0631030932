//! Subscription tier management
//!
//! Builds and announces paid-tier records, verifies payment receipts
//! to gate access, and deletes tiers. Tier records are addressable by
//! `kind:pubkey:dtag`; the dtag comes from the persistent identifier
//! store so re-announcing a tier never mints a second identity.

use crate::bus::{BusError, EventBus, EventTemplate, Filter};
use crate::domain::{
    SubscriptionStatus, TierDescriptor, KIND_DELETION, KIND_PAYMENT_RECEIPT, KIND_TIER_EVENT,
};
use crate::identifier::{IdentifierStore, StoreError};
use std::sync::Arc;
use thiserror::Error;

/// Relay advertised in tier zap tags
const ZAP_RELAY: &str = "wss://damus.io";

/// Errors from tier management
#[derive(Debug, Error)]
pub enum TierError {
    #[error("tier event {0} not found")]
    NotFound(String),

    #[error("tier event {0} has no d tag")]
    MissingDTag(String),

    #[error("tier event {0} is owned by another identity")]
    OwnershipMismatch(String),

    #[error("event bus error: {0}")]
    Bus(#[from] BusError),

    #[error("identifier store error: {0}")]
    Store(#[from] StoreError),
}

/// Announces, verifies and deletes subscription tiers for one
/// processor identity
pub struct TierManager {
    bus: Arc<dyn EventBus>,
    identifiers: IdentifierStore,
    /// Stable slug keying persisted identifiers
    identifier: String,
}

impl TierManager {
    pub fn new(
        bus: Arc<dyn EventBus>,
        identifiers: IdentifierStore,
        identifier: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            identifiers,
            identifier: identifier.into(),
        }
    }

    /// The memoized dtag for a tier, minting it on first use
    ///
    /// Namespaced apart from the capability announcement's dtag, which
    /// shares the identifier slug.
    pub async fn tier_dtag(&self, tier: &TierDescriptor) -> Result<String, TierError> {
        Ok(self
            .identifiers
            .ensure_dtag(
                &format!("tier/{}", self.identifier),
                &tier.title,
                &tier.image,
                self.bus.identity(),
            )
            .await?)
    }

    /// Publish the tier record and return its event id
    ///
    /// Only fields present in the descriptor are emitted; a missing
    /// billing period produces no `amount` tag at all.
    pub async fn announce(&self, tier: &TierDescriptor) -> Result<String, TierError> {
        let dtag = match &tier.dtag {
            Some(dtag) => dtag.clone(),
            None => self.tier_dtag(tier).await?,
        };

        let mut tags = vec![
            vec!["title".to_string(), tier.title.clone()],
            vec!["image".to_string(), tier.image.clone()],
            vec![
                "zap".to_string(),
                self.bus.identity().to_string(),
                ZAP_RELAY.to_string(),
                "19".to_string(),
            ],
            vec![
                "zap".to_string(),
                String::new(),
                ZAP_RELAY.to_string(),
                "1".to_string(),
            ],
            vec!["d".to_string(), dtag],
            vec!["p".to_string(), tier.payment_verifier.clone()],
        ];

        for (period, amount_msats) in &tier.pricing {
            tags.push(vec![
                "amount".to_string(),
                amount_msats.to_string(),
                "msats".to_string(),
                period.as_str().to_string(),
            ]);
        }
        for perk in &tier.perks {
            tags.push(vec!["perk".to_string(), perk.clone()]);
        }

        let event_id = self
            .bus
            .publish(EventTemplate::new(KIND_TIER_EVENT, tags, tier.content.clone()))
            .await?;
        self.identifiers
            .record_tier_event(&self.identifier, &event_id)
            .await?;

        tracing::info!(title = %tier.title, %event_id, "subscription tier announced");
        Ok(event_id)
    }

    /// Check whether `user` holds an active subscription to the tier
    ///
    /// Active iff the latest payment receipt addressed to this
    /// processor and tagged with the user is still valid AND names the
    /// requested dtag; both conditions are required.
    pub async fn check_subscription(
        &self,
        user: &str,
        tier_dtag: &str,
    ) -> Result<SubscriptionStatus, TierError> {
        let filter = Filter::new()
            .kinds(vec![KIND_PAYMENT_RECEIPT])
            .tag("p", vec![self.bus.identity().to_string()])
            .tag("P", vec![user.to_string()])
            .limit(1);
        let receipts = self.bus.query(filter).await?;

        let mut status = SubscriptionStatus::default();
        let Some(receipt) = receipts.first() else {
            tracing::debug!(%user, "no payment receipt found");
            return Ok(status);
        };

        let mut tier_matches = false;
        for tag in &receipt.tags {
            match tag.first().map(|s| s.as_str()) {
                Some("valid") => {
                    // ["valid", <since>, <until>]
                    if let Some(until) = tag.get(2) {
                        status.valid_until = until.parse().unwrap_or(0);
                    }
                }
                Some("e") => {
                    if let Some(id) = tag.get(1) {
                        status.subscription_id = id.clone();
                    }
                }
                Some("tier") => {
                    tier_matches = tag.get(1).map(|s| s.as_str()) == Some(tier_dtag);
                }
                _ => {}
            }
        }

        let now = chrono::Utc::now().timestamp() as u64;
        status.is_active = status.valid_until > now && tier_matches;
        Ok(status)
    }

    /// Delete an announced tier
    ///
    /// The ownership check fails closed: if the record was signed by a
    /// different identity nothing is published.
    pub async fn delete(&self, tier_event_id: &str) -> Result<String, TierError> {
        let events = self
            .bus
            .query(Filter::new().ids(vec![tier_event_id.to_string()]).limit(1))
            .await?;
        let Some(event) = events.first() else {
            tracing::warn!(%tier_event_id, "tier event not found, potentially gone");
            return Err(TierError::NotFound(tier_event_id.to_string()));
        };

        let dtag = event
            .tag_value("d")
            .ok_or_else(|| TierError::MissingDTag(tier_event_id.to_string()))?
            .to_string();

        if event.pubkey != self.bus.identity() {
            tracing::warn!(%tier_event_id, "deletion rejected, signer does not own the tier");
            return Err(TierError::OwnershipMismatch(tier_event_id.to_string()));
        }

        let coordinate = format!("{}:{}:{}", KIND_TIER_EVENT, event.pubkey, dtag);
        let deletion_id = self
            .bus
            .publish(EventTemplate::new(
                KIND_DELETION,
                vec![
                    vec!["e".to_string(), tier_event_id.to_string()],
                    vec!["a".to_string(), coordinate],
                ],
                String::new(),
            ))
            .await?;

        tracing::info!(%tier_event_id, %deletion_id, "tier deleted from known relays");
        Ok(deletion_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::{MemoryBus, MemoryStore};
    use crate::domain::BillingPeriod;
    use crate::identifier::MemoryKvStore;

    fn pubkey(c: char) -> String {
        std::iter::repeat(c).take(64).collect()
    }

    fn manager(bus: Arc<MemoryBus>) -> TierManager {
        TierManager::new(
            bus,
            IdentifierStore::new(Arc::new(MemoryKvStore::new())),
            "unstable_diffusion",
        )
    }

    fn tier() -> TierDescriptor {
        TierDescriptor::new("Gold", "https://img.example/tier.jpg", pubkey('f'))
            .with_content("All you can render")
            .with_amount(BillingPeriod::Monthly, 100_000)
            .with_perk("Priority queue")
    }

    async fn publish_receipt(
        store: Arc<MemoryStore>,
        dvm: &str,
        user: &str,
        valid_until: u64,
        tier_dtag: &str,
    ) {
        let verifier = MemoryBus::with_store(store, pubkey('f'));
        verifier
            .publish(EventTemplate::new(
                KIND_PAYMENT_RECEIPT,
                vec![
                    vec!["p".to_string(), dvm.to_string()],
                    vec!["P".to_string(), user.to_string()],
                    vec![
                        "valid".to_string(),
                        "0".to_string(),
                        valid_until.to_string(),
                    ],
                    vec!["e".to_string(), "sub-evt-1".to_string()],
                    vec!["tier".to_string(), tier_dtag.to_string()],
                ],
                String::new(),
            ))
            .await
            .unwrap();
    }

    fn hour_from_now() -> u64 {
        chrono::Utc::now().timestamp() as u64 + 3600
    }

    fn hour_ago() -> u64 {
        chrono::Utc::now().timestamp() as u64 - 3600
    }

    #[tokio::test]
    async fn test_announce_emits_present_fields_only() {
        let bus = Arc::new(MemoryBus::new(pubkey('a')));
        let manager = manager(bus.clone());

        let event_id = manager.announce(&tier()).await.unwrap();
        let events = bus
            .query(Filter::new().ids(vec![event_id]))
            .await
            .unwrap();
        let tags = &events[0].tags;

        assert!(tags.contains(&vec!["title".to_string(), "Gold".to_string()]));
        assert!(tags.contains(&vec![
            "amount".to_string(),
            "100000".to_string(),
            "msats".to_string(),
            "monthly".to_string()
        ]));
        assert!(tags.contains(&vec!["perk".to_string(), "Priority queue".to_string()]));
        assert!(tags.contains(&vec!["p".to_string(), pubkey('f')]));
        // absent periods are omitted, never emitted as zero
        assert!(!tags
            .iter()
            .any(|t| t[0] == "amount" && t.last().map(|s| s.as_str()) == Some("daily")));
        assert_eq!(tags.iter().filter(|t| t[0] == "zap").count(), 2);
        assert_eq!(events[0].content, "All you can render");
    }

    #[tokio::test]
    async fn test_reannouncement_reuses_one_dtag() {
        let bus = Arc::new(MemoryBus::new(pubkey('a')));
        let manager = manager(bus.clone());
        let tier = tier();

        let first = manager.announce(&tier).await.unwrap();
        let second = manager.announce(&tier).await.unwrap();

        let dtag_of = |id: &str| {
            let bus = bus.clone();
            let id = id.to_string();
            async move {
                let events = bus.query(Filter::new().ids(vec![id])).await.unwrap();
                events[0].tag_value("d").unwrap().to_string()
            }
        };
        assert_eq!(dtag_of(&first).await, dtag_of(&second).await);
    }

    #[tokio::test]
    async fn test_active_subscription() {
        let bus = Arc::new(MemoryBus::new(pubkey('a')));
        let manager = manager(bus.clone());
        let dtag = manager.tier_dtag(&tier()).await.unwrap();

        publish_receipt(bus.store(), &pubkey('a'), &pubkey('c'), hour_from_now(), &dtag).await;

        let status = manager
            .check_subscription(&pubkey('c'), &dtag)
            .await
            .unwrap();
        assert!(status.is_active);
        assert_eq!(status.subscription_id, "sub-evt-1");
    }

    #[tokio::test]
    async fn test_expired_subscription_inactive() {
        let bus = Arc::new(MemoryBus::new(pubkey('a')));
        let manager = manager(bus.clone());
        let dtag = manager.tier_dtag(&tier()).await.unwrap();

        publish_receipt(bus.store(), &pubkey('a'), &pubkey('c'), hour_ago(), &dtag).await;

        let status = manager
            .check_subscription(&pubkey('c'), &dtag)
            .await
            .unwrap();
        assert!(!status.is_active);
        // the receipt was still found and parsed
        assert_eq!(status.subscription_id, "sub-evt-1");
    }

    #[tokio::test]
    async fn test_wrong_tier_inactive_despite_validity() {
        let bus = Arc::new(MemoryBus::new(pubkey('a')));
        let manager = manager(bus.clone());
        let dtag = manager.tier_dtag(&tier()).await.unwrap();

        publish_receipt(
            bus.store(),
            &pubkey('a'),
            &pubkey('c'),
            hour_from_now(),
            "someotherdtag0000",
        )
        .await;

        let status = manager
            .check_subscription(&pubkey('c'), &dtag)
            .await
            .unwrap();
        assert!(!status.is_active);
    }

    #[tokio::test]
    async fn test_no_receipt_inactive() {
        let bus = Arc::new(MemoryBus::new(pubkey('a')));
        let manager = manager(bus);

        let status = manager
            .check_subscription(&pubkey('c'), "deadbeefdeadbeef")
            .await
            .unwrap();
        assert_eq!(status, SubscriptionStatus::default());
    }

    #[tokio::test]
    async fn test_owner_can_delete() {
        let bus = Arc::new(MemoryBus::new(pubkey('a')));
        let manager = manager(bus.clone());

        let tier_id = manager.announce(&tier()).await.unwrap();
        manager.delete(&tier_id).await.unwrap();

        let deletions = bus
            .query(Filter::new().kinds(vec![KIND_DELETION]))
            .await
            .unwrap();
        assert_eq!(deletions.len(), 1);
        assert!(deletions[0]
            .tags
            .contains(&vec!["e".to_string(), tier_id.clone()]));
        let coordinate = deletions[0].tag_value("a").unwrap();
        assert!(coordinate.starts_with(&format!("{}:{}:", KIND_TIER_EVENT, pubkey('a'))));
    }

    #[tokio::test]
    async fn test_foreign_tier_deletion_fails_closed() {
        let owner_bus = Arc::new(MemoryBus::new(pubkey('a')));
        let owner = manager(owner_bus.clone());
        let tier_id = owner.announce(&tier()).await.unwrap();

        let intruder_bus = Arc::new(MemoryBus::with_store(owner_bus.store(), pubkey('b')));
        let intruder = TierManager::new(
            intruder_bus.clone(),
            IdentifierStore::new(Arc::new(MemoryKvStore::new())),
            "intruder",
        );

        let result = intruder.delete(&tier_id).await;
        assert!(matches!(result, Err(TierError::OwnershipMismatch(_))));

        // nothing was published
        let deletions = intruder_bus
            .query(Filter::new().kinds(vec![KIND_DELETION]))
            .await
            .unwrap();
        assert!(deletions.is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_tier() {
        let bus = Arc::new(MemoryBus::new(pubkey('a')));
        let manager = manager(bus);

        let result = manager.delete(&"0".repeat(64)).await;
        assert!(matches!(result, Err(TierError::NotFound(_))));
    }
}

//! Subscription tier types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Billing period for a tier price
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingPeriod {
    Daily,
    Monthly,
    Yearly,
}

impl BillingPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingPeriod::Daily => "daily",
            BillingPeriod::Monthly => "monthly",
            BillingPeriod::Yearly => "yearly",
        }
    }
}

/// Maximum number of perk lines a tier record carries
pub const MAX_PERKS: usize = 4;

/// A paid subscription tier gating a capability
///
/// Pricing entries are optional per period; absent periods are left
/// out of the announcement entirely. The `dtag` is assigned by the
/// tier manager from the persistent identifier store, so repeated
/// announcements of the same tier reuse one identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierDescriptor {
    pub title: String,
    pub content: String,
    pub image: String,
    pub perks: Vec<String>,
    /// Price per billing period in millisats
    pub pricing: BTreeMap<BillingPeriod, u64>,
    /// Hex public key of the payment verifier
    pub payment_verifier: String,
    /// Derived identifier, filled in when the tier is announced
    pub dtag: Option<String>,
}

impl TierDescriptor {
    pub fn new(
        title: impl Into<String>,
        image: impl Into<String>,
        payment_verifier: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            content: String::new(),
            image: image.into(),
            perks: Vec::new(),
            pricing: BTreeMap::new(),
            payment_verifier: payment_verifier.into(),
            dtag: None,
        }
    }

    /// Set the record content (free-form description)
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Add a perk line; capped at [`MAX_PERKS`], extra lines are dropped
    pub fn with_perk(mut self, perk: impl Into<String>) -> Self {
        if self.perks.len() < MAX_PERKS {
            self.perks.push(perk.into());
        }
        self
    }

    /// Set the price for one billing period in millisats
    pub fn with_amount(mut self, period: BillingPeriod, amount_msats: u64) -> Self {
        self.pricing.insert(period, amount_msats);
        self
    }
}

/// Outcome of a subscription check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionStatus {
    pub is_active: bool,
    pub valid_until: u64,
    pub subscription_id: String,
}

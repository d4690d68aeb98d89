//! Versioned product catalog.
//!
//! A product is an immutable snapshot identified by `(id, version)`: its prices
//! and entitlements never change once a customer has been attached to it.
//! Editing a product produces a new version (copy-on-write), so in-flight
//! subscriptions keep billing against the configuration they were sold.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Feature allowance amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Allowance {
    /// A finite included amount, in feature units.
    Finite(i64),
    /// No limit; deductions always succeed and track usage only.
    Unlimited,
}

impl Allowance {
    /// The finite amount, or 0 for unlimited (unlimited balances are not stored).
    #[must_use]
    pub fn amount(&self) -> i64 {
        match self {
            Self::Finite(n) => *n,
            Self::Unlimited => 0,
        }
    }

    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }
}

/// How often an entitlement's balance resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetInterval {
    Day,
    Week,
    Month,
    Year,
    /// The balance never resets (lifetime grant).
    Never,
}

impl ResetInterval {
    /// Advance a Unix timestamp by one interval.
    ///
    /// Month and year arithmetic is calendar-aware; a Jan 31 anchor resets on
    /// the last day of shorter months.
    #[must_use]
    pub fn advance(&self, from: u64) -> Option<u64> {
        use chrono::{DateTime, Days, Months, Utc};

        let dt = DateTime::<Utc>::from_timestamp(from as i64, 0)?;
        let next = match self {
            Self::Day => dt.checked_add_days(Days::new(1))?,
            Self::Week => dt.checked_add_days(Days::new(7))?,
            Self::Month => dt.checked_add_months(Months::new(1))?,
            Self::Year => dt.checked_add_months(Months::new(12))?,
            Self::Never => return None,
        };
        Some(next.timestamp() as u64)
    }
}

/// Policy for carrying unused balance into the next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloverPolicy {
    /// Cap on the total rolled-over balance, in feature units.
    pub max: i64,
    /// How many reset intervals a rollover bucket survives before expiring.
    pub length: u32,
}

/// Whether feature usage resets each cycle or persists across plan changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageModel {
    /// Pay-per-use style: balance resets each cycle.
    Consumable,
    /// Seat style: quantity and usage persist across switches.
    Allocated,
}

/// Feature allowance attached to a product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entitlement {
    pub feature_id: String,
    pub included: Allowance,
    pub interval: ResetInterval,
    pub rollover: Option<RolloverPolicy>,
    /// When set, balances for this feature are tracked per entity (seat)
    /// rather than at the customer level.
    pub entity_feature_id: Option<String>,
    pub usage_model: UsageModel,
}

impl Entitlement {
    /// A consumable entitlement with a finite monthly allowance.
    #[must_use]
    pub fn metered(feature_id: impl Into<String>, included: i64) -> Self {
        Self {
            feature_id: feature_id.into(),
            included: Allowance::Finite(included),
            interval: ResetInterval::Month,
            rollover: None,
            entity_feature_id: None,
            usage_model: UsageModel::Consumable,
        }
    }

    #[must_use]
    pub fn with_rollover(mut self, max: i64, length: u32) -> Self {
        self.rollover = Some(RolloverPolicy { max, length });
        self
    }

    #[must_use]
    pub fn per_entity(mut self, entity_feature_id: impl Into<String>) -> Self {
        self.entity_feature_id = Some(entity_feature_id.into());
        self
    }

    #[must_use]
    pub fn allocated(mut self) -> Self {
        self.usage_model = UsageModel::Allocated;
        self.interval = ResetInterval::Never;
        self
    }
}

/// Billing interval for recurring prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Month,
    Year,
}

/// Upper bound of a pricing tier, in billing-unit packs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierBound {
    /// Tier covers quantities up to and including this many packs.
    Packs(i64),
    /// Final tier; covers everything above the previous bound.
    Infinite,
}

/// One pricing tier: cost per pack within the tier's span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub up_to: TierBound,
    /// Price per billing-unit pack, in minor currency units (cents).
    pub unit_amount: i64,
}

/// How tiered prices combine across tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierMode {
    /// Sum per-tier cost across the quantity span.
    Graduated,
    /// Entire quantity billed at the single tier it falls into.
    Volume,
}

/// A price item on a product.
///
/// Usage prices reference a feature and a billing-unit size: quantities are
/// bought and billed in whole packs of `billing_units` feature units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Price {
    FixedRecurring {
        provider_price_id: String,
        amount: i64,
        interval: BillingInterval,
    },
    FixedOneOff {
        provider_price_id: String,
        amount: i64,
    },
    /// Consumable usage billed after the fact, optionally tiered.
    UsageInArrear {
        provider_price_id: String,
        feature_id: String,
        billing_units: i64,
        tiers: Vec<Tier>,
        mode: TierMode,
    },
    /// Quantity purchased up front, one-off or recurring.
    UsagePrepaid {
        provider_price_id: String,
        feature_id: String,
        billing_units: i64,
        tiers: Vec<Tier>,
        mode: TierMode,
        recurring: bool,
    },
}

impl Price {
    #[must_use]
    pub fn provider_price_id(&self) -> &str {
        match self {
            Self::FixedRecurring { provider_price_id, .. }
            | Self::FixedOneOff { provider_price_id, .. }
            | Self::UsageInArrear { provider_price_id, .. }
            | Self::UsagePrepaid { provider_price_id, .. } => provider_price_id,
        }
    }

    /// The feature this price meters, if it is a usage price.
    #[must_use]
    pub fn feature_id(&self) -> Option<&str> {
        match self {
            Self::UsageInArrear { feature_id, .. } | Self::UsagePrepaid { feature_id, .. } => {
                Some(feature_id)
            }
            _ => None,
        }
    }

    /// Whether this price renews each cycle.
    #[must_use]
    pub fn is_recurring(&self) -> bool {
        match self {
            Self::FixedRecurring { .. } | Self::UsageInArrear { .. } => true,
            Self::FixedOneOff { .. } => false,
            Self::UsagePrepaid { recurring, .. } => *recurring,
        }
    }

    /// One-off prices are never prorated.
    #[must_use]
    pub fn is_one_off(&self) -> bool {
        !self.is_recurring()
    }
}

/// An immutable, versioned product snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub version: u32,
    /// Slot key: at most one non-add-on product per (customer, group, entity).
    pub group: String,
    pub name: String,
    /// Add-ons attach alongside the slot's main product instead of replacing it.
    pub is_add_on: bool,
    pub trial_days: Option<u32>,
    pub prices: Vec<Price>,
    pub entitlements: Vec<Entitlement>,
}

impl Product {
    /// A product with no prices grants entitlements without any provider
    /// subscription.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.prices.is_empty()
    }

    /// Sum of fixed recurring amounts; the basis for upgrade/downgrade ordering.
    #[must_use]
    pub fn base_recurring_amount(&self) -> i64 {
        self.prices
            .iter()
            .map(|p| match p {
                Price::FixedRecurring { amount, .. } => *amount,
                _ => 0,
            })
            .sum()
    }

    /// Whether any price renews (a product with only one-off prices is one-off).
    #[must_use]
    pub fn is_recurring(&self) -> bool {
        self.prices.iter().any(Price::is_recurring)
    }

    /// The prepaid price for a feature, if the product has one.
    #[must_use]
    pub fn prepaid_price_for(&self, feature_id: &str) -> Option<&Price> {
        self.prices.iter().find(|p| {
            matches!(p, Price::UsagePrepaid { feature_id: f, .. } if f == feature_id)
        })
    }

    #[must_use]
    pub fn entitlement_for(&self, feature_id: &str) -> Option<&Entitlement> {
        self.entitlements.iter().find(|e| e.feature_id == feature_id)
    }

    #[must_use]
    pub fn price_by_provider_id(&self, provider_price_id: &str) -> Option<&Price> {
        self.prices
            .iter()
            .find(|p| p.provider_price_id() == provider_price_id)
    }
}

/// Read access to the versioned catalog.
///
/// Versions are immutable once any customer is attached; the engine only ever
/// reads snapshots.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Fetch a product version. `None` for `version` means the latest.
    async fn get_product_version(
        &self,
        product_id: &str,
        version: Option<u32>,
    ) -> Result<Option<Product>>;
}

/// Resolve a product version, mapping absence to `NotFound`.
pub async fn resolve_product<C: CatalogStore>(
    catalog: &C,
    product_id: &str,
    version: Option<u32>,
) -> Result<Product> {
    catalog
        .get_product_version(product_id, version)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("product {product_id}")))
}

/// In-memory catalog for testing.
#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, RwLock};

    /// In-memory catalog keyed by `(product_id, version)`.
    #[derive(Default, Clone)]
    pub struct InMemoryCatalog {
        products: Arc<RwLock<HashMap<(String, u32), Product>>>,
    }

    impl InMemoryCatalog {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Insert a product snapshot.
        pub fn insert(&self, product: Product) {
            self.products
                .write()
                .unwrap()
                .insert((product.id.clone(), product.version), product);
        }
    }

    #[async_trait]
    impl CatalogStore for InMemoryCatalog {
        async fn get_product_version(
            &self,
            product_id: &str,
            version: Option<u32>,
        ) -> Result<Option<Product>> {
            let products = self.products.read().unwrap();
            match version {
                Some(v) => Ok(products.get(&(product_id.to_string(), v)).cloned()),
                None => Ok(products
                    .values()
                    .filter(|p| p.id == product_id)
                    .max_by_key(|p| p.version)
                    .cloned()),
            }
        }
    }
}

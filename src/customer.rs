//! Customer and customer-product records.
//!
//! A `CustomerProduct` joins a customer (optionally a single entity/seat) with
//! an immutable product version. The store enforces the slot invariant: at most
//! one non-scheduled product and at most one scheduled successor per
//! `(customer, product group, entity)` slot.

use crate::discount::ResolvedDiscount;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Current Unix timestamp in seconds.
pub(crate) fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A billing identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    /// Provider-side customer id, once connected.
    pub provider_customer_id: Option<String>,
    /// Whether a payment method is on file with the provider.
    pub has_payment_method: bool,
    /// Invoice-only customers are billed by invoice and never sent to checkout.
    pub invoice_only: bool,
    /// Entity (seat) ids owned by this customer.
    pub entities: Vec<String>,
}

impl Customer {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider_customer_id: None,
            has_payment_method: false,
            invoice_only: false,
            entities: Vec::new(),
        }
    }

    #[must_use]
    pub fn has_entity(&self, entity_id: &str) -> bool {
        self.entities.iter().any(|e| e == entity_id)
    }
}

/// Lifecycle status of a customer product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    Trialing,
    Active,
    /// Awaiting first payment (checkout or SCA); the grant is deferred and the
    /// record does not occupy its slot.
    Incomplete,
    /// A renewal charge failed; entitlements are held until a retry settles.
    PastDue,
    /// Queued successor; starts at the current product's period end.
    Scheduled,
    Expired,
}

/// Purchased prepaid quantity for a feature, in billing-unit packs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureOptions {
    pub feature_id: String,
    pub quantity: i64,
}

/// The slot a product occupies: one main product per slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub customer_id: String,
    pub group: String,
    pub entity_id: Option<String>,
}

impl std::fmt::Display for SlotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.entity_id {
            Some(e) => write!(f, "{}/{}/{}", self.customer_id, self.group, e),
            None => write!(f, "{}/{}", self.customer_id, self.group),
        }
    }
}

/// The join of a customer (optionally an entity) with a product version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerProduct {
    pub id: String,
    pub customer_id: String,
    pub entity_id: Option<String>,
    pub product_id: String,
    pub product_version: u32,
    pub group: String,
    pub is_add_on: bool,
    pub status: ProductStatus,
    /// Fully canceled (terminal).
    pub canceled: bool,
    /// Cancels at period end but still active until then.
    pub canceling: bool,
    pub starts_at: u64,
    pub ended_at: Option<u64>,
    pub trial_ends_at: Option<u64>,
    pub current_period_start: u64,
    pub current_period_end: Option<u64>,
    pub provider_subscription_id: Option<String>,
    pub provider_schedule_id: Option<String>,
    pub options: Vec<FeatureOptions>,
    pub discounts: Vec<ResolvedDiscount>,
    /// Version for optimistic concurrency.
    pub updated_at: u64,
}

impl CustomerProduct {
    /// Create a new record in `Active` status starting now.
    #[must_use]
    pub fn new(
        customer_id: impl Into<String>,
        entity_id: Option<String>,
        product_id: impl Into<String>,
        product_version: u32,
        group: impl Into<String>,
        now: u64,
    ) -> Self {
        Self {
            id: format!("cp_{}", uuid::Uuid::new_v4()),
            customer_id: customer_id.into(),
            entity_id,
            product_id: product_id.into(),
            product_version,
            group: group.into(),
            is_add_on: false,
            status: ProductStatus::Active,
            canceled: false,
            canceling: false,
            starts_at: now,
            ended_at: None,
            trial_ends_at: None,
            current_period_start: now,
            current_period_end: None,
            provider_subscription_id: None,
            provider_schedule_id: None,
            options: Vec::new(),
            discounts: Vec::new(),
            updated_at: now,
        }
    }

    #[must_use]
    pub fn slot(&self) -> SlotKey {
        SlotKey {
            customer_id: self.customer_id.clone(),
            group: self.group.clone(),
            entity_id: self.entity_id.clone(),
        }
    }

    /// Active includes trialing; past-due products keep their entitlements
    /// until resolved, but are not "active" for slot occupancy decisions.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.status, ProductStatus::Active | ProductStatus::Trialing)
    }

    #[must_use]
    pub fn is_trialing(&self) -> bool {
        self.status == ProductStatus::Trialing
    }

    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        self.status == ProductStatus::Scheduled
    }

    /// Occupies its slot: live or delinquent, not parked, queued, or ended.
    #[must_use]
    pub fn occupies_slot(&self) -> bool {
        !matches!(
            self.status,
            ProductStatus::Incomplete | ProductStatus::Scheduled | ProductStatus::Expired
        )
    }

    #[must_use]
    pub fn option_quantity(&self, feature_id: &str) -> Option<i64> {
        self.options
            .iter()
            .find(|o| o.feature_id == feature_id)
            .map(|o| o.quantity)
    }
}

/// Persistence for customers and their products.
#[async_trait]
pub trait CustomerStore: Send + Sync {
    async fn get_customer(&self, customer_id: &str) -> Result<Option<Customer>>;

    async fn save_customer(&self, customer: &Customer) -> Result<()>;

    /// The non-scheduled, non-expired product occupying a slot, excluding
    /// add-ons (they share the slot without occupying it).
    async fn get_slot_occupant(&self, slot: &SlotKey) -> Result<Option<CustomerProduct>>;

    /// The scheduled successor for a slot, if any.
    async fn get_scheduled(&self, slot: &SlotKey) -> Result<Option<CustomerProduct>>;

    /// Add-on products sharing a slot.
    async fn list_slot_add_ons(&self, slot: &SlotKey) -> Result<Vec<CustomerProduct>>;

    async fn list_products(&self, customer_id: &str) -> Result<Vec<CustomerProduct>>;

    async fn get_product(&self, customer_product_id: &str) -> Result<Option<CustomerProduct>>;

    async fn get_by_provider_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> Result<Vec<CustomerProduct>>;

    /// Insert or update a record. Implementations must reject an insert that
    /// would put a second non-scheduled occupant or a second scheduled
    /// successor into a slot (`Conflict`).
    async fn save_product(&self, product: &CustomerProduct) -> Result<()>;

    async fn delete_product(&self, customer_product_id: &str) -> Result<()>;
}

/// In-memory customer store for testing.
#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use super::*;
    use crate::error::EngineError;
    use std::collections::HashMap;
    use std::sync::{Arc, RwLock};

    #[derive(Default)]
    struct Inner {
        customers: RwLock<HashMap<String, Customer>>,
        products: RwLock<HashMap<String, CustomerProduct>>,
    }

    /// In-memory customer store; cheap to clone.
    #[derive(Default, Clone)]
    pub struct InMemoryCustomerStore {
        inner: Arc<Inner>,
    }

    impl InMemoryCustomerStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// All stored products (for test assertions).
        pub fn all_products(&self) -> Vec<CustomerProduct> {
            self.inner.products.read().unwrap().values().cloned().collect()
        }
    }

    #[async_trait]
    impl CustomerStore for InMemoryCustomerStore {
        async fn get_customer(&self, customer_id: &str) -> Result<Option<Customer>> {
            Ok(self.inner.customers.read().unwrap().get(customer_id).cloned())
        }

        async fn save_customer(&self, customer: &Customer) -> Result<()> {
            self.inner
                .customers
                .write()
                .unwrap()
                .insert(customer.id.clone(), customer.clone());
            Ok(())
        }

        async fn get_slot_occupant(&self, slot: &SlotKey) -> Result<Option<CustomerProduct>> {
            let products = self.inner.products.read().unwrap();
            Ok(products
                .values()
                .find(|p| p.slot() == *slot && p.occupies_slot() && !p.is_add_on)
                .cloned())
        }

        async fn get_scheduled(&self, slot: &SlotKey) -> Result<Option<CustomerProduct>> {
            let products = self.inner.products.read().unwrap();
            Ok(products
                .values()
                .find(|p| p.slot() == *slot && p.is_scheduled())
                .cloned())
        }

        async fn list_slot_add_ons(&self, slot: &SlotKey) -> Result<Vec<CustomerProduct>> {
            let products = self.inner.products.read().unwrap();
            Ok(products
                .values()
                .filter(|p| p.slot() == *slot && p.is_add_on && p.occupies_slot())
                .cloned()
                .collect())
        }

        async fn list_products(&self, customer_id: &str) -> Result<Vec<CustomerProduct>> {
            let products = self.inner.products.read().unwrap();
            let mut list: Vec<CustomerProduct> = products
                .values()
                .filter(|p| p.customer_id == customer_id)
                .cloned()
                .collect();
            list.sort_by_key(|p| p.starts_at);
            Ok(list)
        }

        async fn get_product(&self, customer_product_id: &str) -> Result<Option<CustomerProduct>> {
            Ok(self
                .inner
                .products
                .read()
                .unwrap()
                .get(customer_product_id)
                .cloned())
        }

        async fn get_by_provider_subscription(
            &self,
            provider_subscription_id: &str,
        ) -> Result<Vec<CustomerProduct>> {
            let products = self.inner.products.read().unwrap();
            Ok(products
                .values()
                .filter(|p| {
                    p.provider_subscription_id.as_deref() == Some(provider_subscription_id)
                })
                .cloned()
                .collect())
        }

        async fn save_product(&self, product: &CustomerProduct) -> Result<()> {
            let mut products = self.inner.products.write().unwrap();

            if !product.is_add_on && product.occupies_slot() {
                let occupied = products.values().any(|p| {
                    p.id != product.id
                        && p.slot() == product.slot()
                        && p.occupies_slot()
                        && !p.is_add_on
                });
                if occupied {
                    return Err(EngineError::Conflict(format!(
                        "slot {} already occupied",
                        product.slot()
                    )));
                }
            }
            if product.is_scheduled() {
                let scheduled = products
                    .values()
                    .any(|p| p.id != product.id && p.slot() == product.slot() && p.is_scheduled());
                if scheduled {
                    return Err(EngineError::Conflict(format!(
                        "slot {} already has a scheduled successor",
                        product.slot()
                    )));
                }
            }

            products.insert(product.id.clone(), product.clone());
            Ok(())
        }

        async fn delete_product(&self, customer_product_id: &str) -> Result<()> {
            self.inner.products.write().unwrap().remove(customer_product_id);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test::InMemoryCustomerStore;
    use super::*;
    use crate::error::EngineError;

    fn record(customer: &str, group: &str, status: ProductStatus) -> CustomerProduct {
        let mut p = CustomerProduct::new(customer, None, "pro", 1, group, 1_700_000_000);
        p.status = status;
        p
    }

    #[tokio::test]
    async fn slot_allows_one_occupant() {
        let store = InMemoryCustomerStore::new();
        let first = record("cus_1", "main", ProductStatus::Active);
        store.save_product(&first).await.unwrap();

        let second = record("cus_1", "main", ProductStatus::Active);
        let err = store.save_product(&second).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        // A different group is a different slot.
        let other = record("cus_1", "addons", ProductStatus::Active);
        store.save_product(&other).await.unwrap();
    }

    #[tokio::test]
    async fn slot_allows_one_scheduled_successor() {
        let store = InMemoryCustomerStore::new();
        store
            .save_product(&record("cus_1", "main", ProductStatus::Active))
            .await
            .unwrap();
        store
            .save_product(&record("cus_1", "main", ProductStatus::Scheduled))
            .await
            .unwrap();

        let another = record("cus_1", "main", ProductStatus::Scheduled);
        let err = store.save_product(&another).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn entity_slots_are_independent() {
        let store = InMemoryCustomerStore::new();
        let mut seat_a = record("cus_1", "main", ProductStatus::Active);
        seat_a.entity_id = Some("seat_a".to_string());
        let mut seat_b = record("cus_1", "main", ProductStatus::Active);
        seat_b.entity_id = Some("seat_b".to_string());

        store.save_product(&seat_a).await.unwrap();
        store.save_product(&seat_b).await.unwrap();

        let found = store.get_slot_occupant(&seat_a.slot()).await.unwrap().unwrap();
        assert_eq!(found.entity_id.as_deref(), Some("seat_a"));
    }

    #[tokio::test]
    async fn add_ons_share_the_slot() {
        let store = InMemoryCustomerStore::new();
        let main = record("cus_1", "main", ProductStatus::Active);
        store.save_product(&main).await.unwrap();

        let mut addon = record("cus_1", "main", ProductStatus::Active);
        addon.is_add_on = true;
        store.save_product(&addon).await.unwrap();

        let add_ons = store.list_slot_add_ons(&main.slot()).await.unwrap();
        assert_eq!(add_ons.len(), 1);

        let occupant = store.get_slot_occupant(&main.slot()).await.unwrap().unwrap();
        assert_eq!(occupant.id, main.id);
    }

    #[tokio::test]
    async fn lookup_by_provider_subscription() {
        let store = InMemoryCustomerStore::new();
        let mut p = record("cus_1", "main", ProductStatus::Active);
        p.provider_subscription_id = Some("sub_42".to_string());
        store.save_product(&p).await.unwrap();

        let found = store.get_by_provider_subscription("sub_42").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, p.id);
    }
}

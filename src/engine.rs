//! The billing engine facade.
//!
//! Ties the catalog, customer records, entitlement ledger, slot locks, and
//! the provider adapter into the public lifecycle operations: attach,
//! update, cancel, usage tracking, and balance reads. Generic over its ports
//! so tests run entirely in memory against the mock provider.

use crate::attach::{classify, validate_options, AttachPreview, AttachRequest, AttachScenario};
use crate::cache::{CacheMode, CachedBalances};
use crate::catalog::{resolve_product, CatalogStore, Product};
use crate::customer::{
    current_timestamp, Customer, CustomerProduct, CustomerStore, ProductStatus, SlotKey,
};
use crate::discount::{self, DiscountInput, ResolvedDiscount};
use crate::error::{EngineError, Result};
use crate::ledger::{BalanceKey, FeatureBalance, LedgerManager, LedgerStore, OverageBehavior};
use crate::lock::{acquire_slot, SlotLock, DEFAULT_LOCK_TTL};
use crate::outcome::RequiredAction;
use crate::provider::{
    BillingProviderClient, CheckoutRequest, ProviderAdapter, ProviderInvoice, ProviderSubscription,
    ScheduleRequest, SubscriptionRequest, DEFAULT_PROVIDER_TIMEOUT,
};
use crate::proration::{compute_diff, BillingPlan, CycleWindow, DiffOptions, ProductConfig};
use crate::schedule::{
    carry_balances, classify_switch, inherited_trial_end, SwitchKind, SwitchOptions,
};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Engine-wide tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// TTL on per-slot operation locks.
    pub lock_ttl: Duration,
    /// Bound on any single provider call.
    pub provider_timeout: Duration,
    /// How long cached balance reads stay fresh.
    pub balance_cache_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_ttl: DEFAULT_LOCK_TTL,
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
            balance_cache_ttl: Duration::from_secs(10),
        }
    }
}

/// What an attach (or update) produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttachOutcome {
    /// The product is live and its entitlements are granted.
    Attached {
        customer_product_id: String,
        invoice: Option<ProviderInvoice>,
    },
    /// A downgrade parked until the current period ends.
    Scheduled {
        customer_product_id: String,
        starts_at: u64,
    },
    /// The customer must complete hosted checkout; the grant is deferred.
    CheckoutCreated {
        customer_product_id: String,
        url: String,
    },
    /// The provider needs the customer to act before payment settles.
    RequiresAction {
        customer_product_id: Option<String>,
        action: RequiredAction,
    },
}

/// One usage event against a feature balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub customer_id: String,
    pub feature_id: String,
    pub value: i64,
    pub entity_id: Option<String>,
    /// Dedupe key; a repeat of a recorded key is dropped.
    pub idempotency_key: Option<String>,
    /// Override the feature's default overage behaviour.
    pub overage: Option<OverageBehavior>,
}

impl UsageEvent {
    #[must_use]
    pub fn new(customer_id: impl Into<String>, feature_id: impl Into<String>, value: i64) -> Self {
        Self {
            customer_id: customer_id.into(),
            feature_id: feature_id.into(),
            value,
            entity_id: None,
            idempotency_key: None,
            overage: None,
        }
    }
}

pub(crate) struct PreparedAttach {
    pub(crate) customer: Customer,
    pub(crate) product: Product,
    pub(crate) slot: SlotKey,
    pub(crate) occupant: Option<CustomerProduct>,
    pub(crate) current_product: Option<Product>,
    pub(crate) plan: BillingPlan,
    pub(crate) scenario: AttachScenario,
    pub(crate) discounts: Vec<ResolvedDiscount>,
    pub(crate) trial_end: Option<u64>,
    pub(crate) now: u64,
}

/// The engine. Cheap to clone when its ports are.
#[derive(Debug, Clone)]
pub struct BillingEngine<C, S, L, K, P> {
    pub(crate) catalog: C,
    pub(crate) customers: S,
    pub(crate) balances: CachedBalances<L>,
    pub(crate) lock: K,
    pub(crate) provider: ProviderAdapter<P>,
    pub(crate) config: EngineConfig,
}

impl<C, S, L, K, P> BillingEngine<C, S, L, K, P>
where
    C: CatalogStore,
    S: CustomerStore,
    L: LedgerStore,
    K: SlotLock + Clone + Send + 'static,
    P: BillingProviderClient,
{
    pub fn new(catalog: C, customers: S, ledger_store: L, lock: K, provider: P) -> Self {
        let config = EngineConfig::default();
        Self {
            catalog,
            customers,
            balances: CachedBalances::new(
                LedgerManager::new(ledger_store),
                config.balance_cache_ttl,
            ),
            lock,
            provider: ProviderAdapter::new(provider).with_timeout(config.provider_timeout),
            config,
        }
    }

    pub(crate) fn ledger(&self) -> &LedgerManager<L> {
        self.balances.ledger()
    }

    // ---- attach -------------------------------------------------------

    /// Plan an attach without executing it. Same classification, same
    /// amounts, no writes, no charges.
    pub async fn preview_attach(&self, req: &AttachRequest) -> Result<AttachPreview> {
        let prepared = self.prepare(req).await?;
        Ok(AttachPreview {
            scenario: prepared.scenario,
            due_now: prepared.plan.due_now,
            next_cycle: prepared.plan.next_cycle,
            plan: prepared.plan,
        })
    }

    /// Attach a product to the customer (or an entity of the customer).
    ///
    /// The slot lock covers planning as well as execution, so the slot state
    /// read while planning cannot go stale before the writes land.
    pub async fn attach(&self, req: AttachRequest) -> Result<AttachOutcome> {
        let product = resolve_product(&self.catalog, &req.product_id, req.product_version).await?;
        let slot = SlotKey {
            customer_id: req.customer_id.clone(),
            group: product.group.clone(),
            entity_id: req.entity_id.clone(),
        };
        let guard = acquire_slot(&self.lock, &slot, self.config.lock_ttl).await?;
        let result = self.attach_locked(&req).await;
        guard.release().await?;
        self.balances.invalidate(&req.customer_id);
        result
    }

    async fn attach_locked(&self, req: &AttachRequest) -> Result<AttachOutcome> {
        let prepared = self.prepare(req).await?;

        info!(
            target: "tollgate::engine",
            customer_id = %req.customer_id,
            product_id = %req.product_id,
            scenario = ?prepared.scenario,
            due_now = prepared.plan.due_now,
            "attaching product",
        );

        self.execute_attach(req, prepared).await
    }

    /// Change quantities or terms of an already-attached product. This is an
    /// attach of the same product with new options, diffed against the
    /// current configuration.
    pub async fn update_subscription(&self, req: AttachRequest) -> Result<AttachOutcome> {
        self.attach(req).await
    }

    /// Preview what [`BillingEngine::update_subscription`] would charge.
    pub async fn preview_update(&self, req: &AttachRequest) -> Result<AttachPreview> {
        self.preview_attach(req).await
    }

    async fn prepare(&self, req: &AttachRequest) -> Result<PreparedAttach> {
        let customer = self
            .customers
            .get_customer(&req.customer_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("customer {}", req.customer_id)))?;
        if let Some(entity_id) = &req.entity_id {
            if !customer.has_entity(entity_id) {
                return Err(EngineError::NotFound(format!(
                    "entity {entity_id} of customer {}",
                    customer.id
                )));
            }
        }

        let product = resolve_product(&self.catalog, &req.product_id, req.product_version).await?;
        let may_checkout = !customer.invoice_only
            && (req.force_checkout || !customer.has_payment_method);
        validate_options(&product, &req.options, may_checkout)?;

        let slot = SlotKey {
            customer_id: customer.id.clone(),
            group: product.group.clone(),
            entity_id: req.entity_id.clone(),
        };
        let occupant = self.customers.get_slot_occupant(&slot).await?;

        let discounts = self.resolve_discounts(&req.discounts).await?;
        let now = current_timestamp();

        // Add-ons diff against nothing: they bill on top of the occupant.
        let current_product = match (&occupant, product.is_add_on) {
            (Some(cp), false) => {
                Some(resolve_product(&self.catalog, &cp.product_id, Some(cp.product_version)).await?)
            }
            _ => None,
        };
        let current_config = match (&occupant, &current_product) {
            (Some(cp), Some(prod)) => {
                Some(ProductConfig::new(prod.clone(), cp.options.clone()))
            }
            _ => None,
        };

        let next_cycle_only = match (&current_product, &occupant) {
            (Some(cur), Some(_)) => matches!(
                classify_switch(
                    cur,
                    &product,
                    SwitchOptions {
                        force_immediate: req.force_immediate,
                        next_cycle: req.next_cycle,
                    },
                ),
                SwitchKind::Scheduled
            ),
            _ => req.next_cycle,
        };

        let cycle = occupant.as_ref().and_then(|cp| {
            cp.current_period_end.map(|end| CycleWindow {
                start: cp.current_period_start,
                end,
            })
        });

        let target = ProductConfig::new(product.clone(), req.options.clone());
        let mut plan = compute_diff(
            current_config.as_ref(),
            &target,
            &DiffOptions {
                next_cycle_only,
                force_invoice: req.invoice,
                now,
                cycle,
                discounts: discounts.clone(),
            },
        )?;

        let trial_end = if req.skip_trial {
            None
        } else {
            inherited_trial_end(occupant.as_ref(), product.trial_days, now)
        };
        plan.trial_end = trial_end;
        if trial_end.is_some_and(|t| t > now) {
            // Nothing is due while the trial runs; billing starts at trial end.
            plan.due_now = 0;
        }

        let scenario =
            classify(&customer, &product, occupant.as_ref(), plan.due_now, req.force_checkout);

        Ok(PreparedAttach {
            customer,
            product,
            slot,
            occupant,
            current_product,
            plan,
            scenario,
            discounts,
            trial_end,
            now,
        })
    }

    async fn resolve_discounts(&self, inputs: &[DiscountInput]) -> Result<Vec<ResolvedDiscount>> {
        let mut resolved = Vec::with_capacity(inputs.len());
        for input in inputs {
            let discount = match input {
                DiscountInput::CouponId { id } => self.provider.resolve_coupon(id).await?,
                DiscountInput::PromotionCode { code } => {
                    self.provider.resolve_promotion_code(code).await?
                }
            };
            resolved.push(discount);
        }
        Ok(discount::dedupe(resolved))
    }

    async fn execute_attach(
        &self,
        req: &AttachRequest,
        prepared: PreparedAttach,
    ) -> Result<AttachOutcome> {
        match prepared.scenario.clone() {
            AttachScenario::Free => self.attach_free(req, prepared).await,
            AttachScenario::CheckoutRequired => self.attach_via_checkout(req, prepared).await,
            AttachScenario::AddOn => self.attach_add_on(req, prepared).await,
            AttachScenario::NewSubscription => self.attach_new_subscription(req, prepared).await,
            AttachScenario::Switch { from_customer_product_id } => {
                self.attach_switch(req, prepared, &from_customer_product_id).await
            }
        }
    }

    fn new_record(&self, req: &AttachRequest, prepared: &PreparedAttach) -> CustomerProduct {
        let mut cp = CustomerProduct::new(
            prepared.customer.id.clone(),
            req.entity_id.clone(),
            prepared.product.id.clone(),
            prepared.product.version,
            prepared.product.group.clone(),
            prepared.now,
        );
        cp.is_add_on = prepared.product.is_add_on;
        cp.options = req.options.clone();
        cp.discounts = prepared.discounts.clone();
        cp.trial_ends_at = prepared.trial_end;
        if prepared.trial_end.is_some_and(|t| t > prepared.now) {
            cp.status = ProductStatus::Trialing;
        }
        cp
    }

    /// Grant a record's balances from scratch, carrying nothing over.
    async fn grant_fresh(
        &self,
        cp: &CustomerProduct,
        product: &Product,
        entities: &[String],
    ) -> Result<()> {
        let rows = carry_balances(
            &[],
            product,
            &cp.id,
            &cp.customer_id,
            &cp.options,
            entities,
            cp.entity_id.as_deref(),
            cp.starts_at,
        );
        self.ledger().grant(rows).await
    }

    async fn attach_free(
        &self,
        req: &AttachRequest,
        prepared: PreparedAttach,
    ) -> Result<AttachOutcome> {
        // Free products in an occupied slot replace the occupant, ending its
        // subscription at the provider.
        self.drop_scheduled(&prepared.slot).await?;
        if let Some(old) = &prepared.occupant {
            if let Some(sub_id) = &old.provider_subscription_id {
                self.provider.cancel_subscription(sub_id, false).await?;
            }
            self.retire_product(old, prepared.now).await?;
        }
        let cp = self.new_record(req, &prepared);
        self.customers.save_product(&cp).await?;
        self.grant_fresh(&cp, &prepared.product, &prepared.customer.entities).await?;
        Ok(AttachOutcome::Attached { customer_product_id: cp.id, invoice: None })
    }

    async fn attach_via_checkout(
        &self,
        req: &AttachRequest,
        prepared: PreparedAttach,
    ) -> Result<AttachOutcome> {
        let provider_customer_id = self.provider_customer_id(&prepared.customer)?;
        let session = self
            .provider
            .create_checkout(CheckoutRequest {
                provider_customer_id,
                plan: prepared.plan.clone(),
                success_url: req.success_url.clone(),
                idempotency_key: idempotency_key(req),
            })
            .await?;

        // Park the record; the payment confirmation callback activates it.
        let mut cp = self.new_record(req, &prepared);
        cp.status = ProductStatus::Incomplete;
        self.customers.save_product(&cp).await?;

        Ok(AttachOutcome::CheckoutCreated { customer_product_id: cp.id, url: session.url })
    }

    async fn attach_add_on(
        &self,
        req: &AttachRequest,
        prepared: PreparedAttach,
    ) -> Result<AttachOutcome> {
        let provider_customer_id = self.provider_customer_id(&prepared.customer)?;
        let invoice = if prepared.plan.due_now != 0 || req.invoice {
            let invoice = self
                .provider
                .create_invoice(&provider_customer_id, &prepared.plan, &idempotency_key(req))
                .await?;
            if let Some(action) = invoice.payment.required_action() {
                // Charged but unsettled: no grant until confirmation.
                let mut cp = self.new_record(req, &prepared);
                cp.status = ProductStatus::Incomplete;
                self.customers.save_product(&cp).await?;
                return Ok(AttachOutcome::RequiresAction {
                    customer_product_id: Some(cp.id),
                    action,
                });
            }
            Some(invoice)
        } else {
            None
        };

        let mut cp = self.new_record(req, &prepared);
        // Add-ons ride the occupant's subscription for recurring billing.
        if let Some(main) = &prepared.occupant {
            cp.provider_subscription_id = main.provider_subscription_id.clone();
            cp.current_period_start = main.current_period_start;
            cp.current_period_end = main.current_period_end;
        }
        self.customers.save_product(&cp).await?;
        self.grant_fresh(&cp, &prepared.product, &prepared.customer.entities).await?;
        Ok(AttachOutcome::Attached { customer_product_id: cp.id, invoice })
    }

    async fn attach_new_subscription(
        &self,
        req: &AttachRequest,
        prepared: PreparedAttach,
    ) -> Result<AttachOutcome> {
        let provider_customer_id = self.provider_customer_id(&prepared.customer)?;
        let sub = self
            .provider
            .create_subscription(SubscriptionRequest {
                provider_customer_id,
                plan: prepared.plan.clone(),
                idempotency_key: idempotency_key(req),
            })
            .await?;

        let mut cp = self.new_record(req, &prepared);
        apply_subscription(&mut cp, &sub);

        if let Some(action) = sub.payment.required_action() {
            cp.status = ProductStatus::Incomplete;
            self.customers.save_product(&cp).await?;
            return Ok(AttachOutcome::RequiresAction {
                customer_product_id: Some(cp.id),
                action,
            });
        }

        self.customers.save_product(&cp).await?;
        self.grant_fresh(&cp, &prepared.product, &prepared.customer.entities).await?;
        Ok(AttachOutcome::Attached { customer_product_id: cp.id, invoice: None })
    }

    async fn attach_switch(
        &self,
        req: &AttachRequest,
        prepared: PreparedAttach,
        from_id: &str,
    ) -> Result<AttachOutcome> {
        let old = self
            .customers
            .get_product(from_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("customer product {from_id}")))?;
        let current_product = prepared
            .current_product
            .as_ref()
            .ok_or_else(|| EngineError::Internal("switch without current product".to_string()))?;

        let kind = classify_switch(
            current_product,
            &prepared.product,
            SwitchOptions {
                force_immediate: req.force_immediate,
                next_cycle: req.next_cycle,
            },
        );

        // Either path replaces any successor already queued for the slot.
        self.drop_scheduled(&prepared.slot).await?;

        match kind {
            SwitchKind::Scheduled => self.schedule_switch(req, prepared, &old).await,
            SwitchKind::Immediate => self.switch_now(req, prepared, old).await,
        }
    }

    async fn schedule_switch(
        &self,
        req: &AttachRequest,
        prepared: PreparedAttach,
        old: &CustomerProduct,
    ) -> Result<AttachOutcome> {
        let subscription_id = old.provider_subscription_id.clone().ok_or_else(|| {
            EngineError::InvalidRequest("cannot schedule a switch without a subscription".into())
        })?;
        let starts_at = old
            .current_period_end
            .ok_or_else(|| EngineError::Internal("occupant has no period end".to_string()))?;

        // The running phase ends when the scheduled one starts.
        let mut plan = prepared.plan.clone();
        plan.cancel_at = Some(starts_at);

        let schedule_id = self
            .provider
            .upsert_schedule(ScheduleRequest {
                subscription_id,
                starts_at,
                plan,
                idempotency_key: idempotency_key(req),
            })
            .await?;

        let mut cp = self.new_record(req, &prepared);
        cp.status = ProductStatus::Scheduled;
        cp.starts_at = starts_at;
        cp.provider_subscription_id = old.provider_subscription_id.clone();
        cp.provider_schedule_id = Some(schedule_id);
        self.customers.save_product(&cp).await?;

        Ok(AttachOutcome::Scheduled { customer_product_id: cp.id, starts_at })
    }

    async fn switch_now(
        &self,
        req: &AttachRequest,
        prepared: PreparedAttach,
        old: CustomerProduct,
    ) -> Result<AttachOutcome> {
        let provider_customer_id = self.provider_customer_id(&prepared.customer)?;

        let (sub, invoice) = match &old.provider_subscription_id {
            Some(sub_id) => {
                let sub = self
                    .provider
                    .update_subscription(
                        sub_id,
                        SubscriptionRequest {
                            provider_customer_id,
                            plan: prepared.plan.clone(),
                            idempotency_key: idempotency_key(req),
                        },
                    )
                    .await?;
                (Some(sub), None)
            }
            None if prepared.plan.due_now != 0 => {
                let invoice = self
                    .provider
                    .create_invoice(&provider_customer_id, &prepared.plan, &idempotency_key(req))
                    .await?;
                (None, Some(invoice))
            }
            None => (None, None),
        };

        // A declined charge leaves the old product in place; nothing below
        // runs, so the switch simply did not happen.
        let payment = sub
            .as_ref()
            .map(|s| s.payment.clone())
            .or_else(|| invoice.as_ref().map(|i| i.payment.clone()));
        if let Some(action) = payment.as_ref().and_then(|p| p.required_action()) {
            return Ok(AttachOutcome::RequiresAction { customer_product_id: None, action });
        }

        let mut cp = self.new_record(req, &prepared);
        cp.provider_subscription_id = old.provider_subscription_id.clone();
        if let Some(sub) = &sub {
            apply_subscription(&mut cp, sub);
        }

        let old_rows = self.ledger().store().list_for_product(&old.id).await?;
        self.retire_product(&old, prepared.now).await?;
        self.customers.save_product(&cp).await?;

        let rows = carry_balances(
            &old_rows,
            &prepared.product,
            &cp.id,
            &cp.customer_id,
            &cp.options,
            &prepared.customer.entities,
            cp.entity_id.as_deref(),
            prepared.now,
        );
        self.ledger().grant(rows).await?;

        Ok(AttachOutcome::Attached { customer_product_id: cp.id, invoice })
    }

    /// Expire a record and drop its balances.
    pub(crate) async fn retire_product(&self, cp: &CustomerProduct, now: u64) -> Result<()> {
        let mut old = cp.clone();
        old.status = ProductStatus::Expired;
        old.ended_at = Some(now);
        old.updated_at = now;
        self.customers.save_product(&old).await?;
        self.ledger().store().delete_for_product(&old.id).await
    }

    /// Remove any scheduled successor for the slot, releasing its provider
    /// schedule.
    pub(crate) async fn drop_scheduled(&self, slot: &SlotKey) -> Result<()> {
        if let Some(scheduled) = self.customers.get_scheduled(slot).await? {
            if let Some(schedule_id) = &scheduled.provider_schedule_id {
                self.provider.release_schedule(schedule_id).await?;
            }
            self.customers.delete_product(&scheduled.id).await?;
        }
        Ok(())
    }

    fn provider_customer_id(&self, customer: &Customer) -> Result<String> {
        customer.provider_customer_id.clone().ok_or_else(|| {
            EngineError::ProviderConfigMissing(format!(
                "customer {} has no provider customer",
                customer.id
            ))
        })
    }

    // ---- cancel -------------------------------------------------------

    /// Cancel the slot's occupant. `at_period_end` keeps entitlements alive
    /// until the paid-for period runs out; otherwise everything ends now.
    pub async fn cancel(
        &self,
        customer_id: &str,
        group: &str,
        entity_id: Option<&str>,
        at_period_end: bool,
    ) -> Result<()> {
        let slot = SlotKey {
            customer_id: customer_id.to_string(),
            group: group.to_string(),
            entity_id: entity_id.map(str::to_string),
        };
        let guard = acquire_slot(&self.lock, &slot, self.config.lock_ttl).await?;
        let result = self.cancel_inner(&slot, at_period_end).await;
        guard.release().await?;
        self.balances.invalidate(customer_id);
        result
    }

    async fn cancel_inner(&self, slot: &SlotKey, at_period_end: bool) -> Result<()> {
        let occupant = self
            .customers
            .get_slot_occupant(slot)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("no product in slot {slot}")))?;

        // A cancel always clears the queued successor too.
        self.drop_scheduled(slot).await?;

        if let Some(sub_id) = &occupant.provider_subscription_id {
            self.provider.cancel_subscription(sub_id, at_period_end).await?;
        }

        let now = current_timestamp();
        info!(
            target: "tollgate::engine",
            slot = %slot,
            customer_product_id = %occupant.id,
            at_period_end,
            "canceling product",
        );

        if at_period_end {
            let mut cp = occupant;
            cp.canceling = true;
            cp.updated_at = now;
            self.customers.save_product(&cp).await
        } else {
            let mut cp = occupant;
            cp.canceled = true;
            self.retire_product(&cp, now).await
        }
    }

    /// Finalize records whose time has come: expire canceled products past
    /// their period end, land scheduled successors whose phase has started,
    /// and reset balances past their cycle boundary. Returns how many records
    /// changed.
    pub async fn expire_due(&self, customer_id: &str, now: u64) -> Result<usize> {
        let mut changed = 0;
        for cp in self.customers.list_products(customer_id).await? {
            let period_over = cp.current_period_end.is_some_and(|end| end <= now);
            if !period_over || !cp.occupies_slot() {
                continue;
            }
            if cp.canceling && !cp.canceled {
                let mut cp = cp;
                cp.canceled = true;
                self.retire_product(&cp, now).await?;
                changed += 1;
            } else if !cp.is_add_on
                && self.customers.get_scheduled(&cp.slot()).await?.is_some()
            {
                // The sweep lands queued successors even when the provider
                // callback never arrives.
                self.on_scheduled_phase_reached(&cp.slot()).await?;
                changed += 1;
            }
        }
        changed += self.ledger().reset_due(customer_id, now).await?;
        if changed > 0 {
            self.balances.invalidate(customer_id);
        }
        Ok(changed)
    }

    // ---- usage --------------------------------------------------------

    /// Record metered usage: a relative deduction against the feature's
    /// balance.
    pub async fn track_usage(&self, event: UsageEvent) -> Result<FeatureBalance> {
        let key = balance_key(&event);
        let row = match &event.idempotency_key {
            Some(idem) => {
                self.ledger()
                    .consume_once(&key, event.value, event.overage, idem)
                    .await?
            }
            None => self.ledger().consume(&key, event.value, event.overage).await?,
        };
        self.balances.invalidate(&event.customer_id);
        Ok(row)
    }

    /// Record an absolute usage reading (storage-style features). Safe to
    /// repeat.
    pub async fn set_usage(&self, event: UsageEvent) -> Result<FeatureBalance> {
        let key = balance_key(&event);
        let row = self.ledger().set_usage(&key, event.value).await?;
        self.balances.invalidate(&event.customer_id);
        Ok(row)
    }

    /// Record a batch of usage events concurrently.
    pub async fn track_usage_batch(&self, events: Vec<UsageEvent>) -> Result<Vec<FeatureBalance>> {
        try_join_all(events.into_iter().map(|event| self.track_usage(event))).await
    }

    // ---- reads --------------------------------------------------------

    /// All balance rows for a customer.
    pub async fn balances(
        &self,
        customer_id: &str,
        mode: CacheMode,
    ) -> Result<Vec<FeatureBalance>> {
        self.balances.balances(customer_id, mode).await
    }

    /// One feature's balance, bypassing the cache.
    pub async fn balance(&self, key: &BalanceKey) -> Result<FeatureBalance> {
        self.ledger().get(key).await
    }

    /// Customer-level total for a feature, summed across per-entity rows.
    /// Never stored; always derived from the rows.
    pub async fn balance_total(&self, customer_id: &str, feature_id: &str) -> Result<i64> {
        let rows = self.ledger().store().list_for_customer(customer_id).await?;
        Ok(rows
            .iter()
            .filter(|row| row.feature_id == feature_id)
            .map(|row| row.balance)
            .sum())
    }

    /// A customer's product records, newest last.
    pub async fn products(&self, customer_id: &str) -> Result<Vec<CustomerProduct>> {
        self.customers.list_products(customer_id).await
    }
}

fn balance_key(event: &UsageEvent) -> BalanceKey {
    BalanceKey {
        customer_id: event.customer_id.clone(),
        feature_id: event.feature_id.clone(),
        entity_id: event.entity_id.clone(),
    }
}

fn apply_subscription(cp: &mut CustomerProduct, sub: &ProviderSubscription) {
    cp.provider_subscription_id = Some(sub.id.clone());
    cp.current_period_start = sub.current_period_start;
    cp.current_period_end = Some(sub.current_period_end);
}

fn idempotency_key(req: &AttachRequest) -> String {
    req.idempotency_key
        .clone()
        .unwrap_or_else(|| format!("attach_{}", uuid::Uuid::new_v4()))
}

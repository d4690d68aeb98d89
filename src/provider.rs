//! Billing provider port.
//!
//! All money movement is delegated through [`BillingProviderClient`]. The
//! engine computes the plan; the provider executes it. Every mutating call
//! carries an idempotency key so a retried request cannot double-charge, and
//! every call runs under a bounded timeout via [`ProviderAdapter`].

use crate::discount::ResolvedDiscount;
use crate::error::{EngineError, Result};
use crate::outcome::PaymentState;
use crate::proration::BillingPlan;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

/// Default bound on any single provider call.
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

/// Provider-side view of a subscription after a mutating call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSubscription {
    pub id: String,
    pub current_period_start: u64,
    pub current_period_end: u64,
    pub payment: PaymentState,
    pub schedule_id: Option<String>,
}

/// A hosted checkout session for collecting a payment method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

/// A one-off invoice issued outside a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInvoice {
    pub id: String,
    pub total: i64,
    pub payment: PaymentState,
    pub hosted_url: Option<String>,
}

/// Request to create a subscription from a billing plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub provider_customer_id: String,
    pub plan: BillingPlan,
    pub idempotency_key: String,
}

/// Request to replace a scheduled phase (deferred downgrade).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub subscription_id: String,
    /// When the scheduled phase takes effect (current period end).
    pub starts_at: u64,
    pub plan: BillingPlan,
    pub idempotency_key: String,
}

/// Request for a hosted checkout session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub provider_customer_id: String,
    pub plan: BillingPlan,
    pub success_url: Option<String>,
    pub idempotency_key: String,
}

/// The provider client surface the engine needs. Implementations translate
/// these calls into the provider's API; the engine never sees provider wire
/// types.
#[allow(async_fn_in_trait)]
pub trait BillingProviderClient {
    async fn create_subscription(&self, req: SubscriptionRequest) -> Result<ProviderSubscription>;

    /// Apply a plan to an existing subscription in place.
    async fn update_subscription(
        &self,
        subscription_id: &str,
        req: SubscriptionRequest,
    ) -> Result<ProviderSubscription>;

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> Result<()>;

    /// Create or replace the scheduled phase on a subscription. Returns the
    /// schedule id.
    async fn upsert_schedule(&self, req: ScheduleRequest) -> Result<String>;

    /// Drop a scheduled phase, leaving the current phase running.
    async fn release_schedule(&self, schedule_id: &str) -> Result<()>;

    async fn get_subscription(&self, subscription_id: &str) -> Result<ProviderSubscription>;

    async fn resolve_coupon(&self, coupon_id: &str) -> Result<ResolvedDiscount>;

    async fn resolve_promotion_code(&self, code: &str) -> Result<ResolvedDiscount>;

    /// Invoice a one-off amount immediately.
    async fn create_invoice(
        &self,
        provider_customer_id: &str,
        plan: &BillingPlan,
        idempotency_key: &str,
    ) -> Result<ProviderInvoice>;

    async fn create_checkout(&self, req: CheckoutRequest) -> Result<CheckoutSession>;
}

/// Wraps a client with the engine's call policy: bounded timeouts and call
/// logging. No retries; retrying a charge is the caller's decision, made with
/// the same idempotency key.
#[derive(Debug, Clone)]
pub struct ProviderAdapter<C> {
    client: C,
    timeout: Duration,
}

impl<C: BillingProviderClient> ProviderAdapter<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            timeout: DEFAULT_PROVIDER_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        debug!(target: "tollgate::provider", operation, "provider call");
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => {
                if let Err(err) = &result {
                    error!(target: "tollgate::provider", operation, %err, "provider call failed");
                }
                result
            }
            Err(_) => {
                error!(target: "tollgate::provider", operation, "provider call timed out");
                Err(EngineError::Timeout {
                    operation: operation.to_string(),
                })
            }
        }
    }

    pub async fn create_subscription(
        &self,
        req: SubscriptionRequest,
    ) -> Result<ProviderSubscription> {
        self.bounded("create_subscription", self.client.create_subscription(req))
            .await
    }

    pub async fn update_subscription(
        &self,
        subscription_id: &str,
        req: SubscriptionRequest,
    ) -> Result<ProviderSubscription> {
        self.bounded(
            "update_subscription",
            self.client.update_subscription(subscription_id, req),
        )
        .await
    }

    pub async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> Result<()> {
        self.bounded(
            "cancel_subscription",
            self.client.cancel_subscription(subscription_id, at_period_end),
        )
        .await
    }

    pub async fn upsert_schedule(&self, req: ScheduleRequest) -> Result<String> {
        self.bounded("upsert_schedule", self.client.upsert_schedule(req))
            .await
    }

    pub async fn release_schedule(&self, schedule_id: &str) -> Result<()> {
        self.bounded("release_schedule", self.client.release_schedule(schedule_id))
            .await
    }

    pub async fn get_subscription(&self, subscription_id: &str) -> Result<ProviderSubscription> {
        self.bounded("get_subscription", self.client.get_subscription(subscription_id))
            .await
    }

    pub async fn resolve_coupon(&self, coupon_id: &str) -> Result<ResolvedDiscount> {
        self.bounded("resolve_coupon", self.client.resolve_coupon(coupon_id))
            .await
    }

    pub async fn resolve_promotion_code(&self, code: &str) -> Result<ResolvedDiscount> {
        self.bounded(
            "resolve_promotion_code",
            self.client.resolve_promotion_code(code),
        )
        .await
    }

    pub async fn create_invoice(
        &self,
        provider_customer_id: &str,
        plan: &BillingPlan,
        idempotency_key: &str,
    ) -> Result<ProviderInvoice> {
        self.bounded(
            "create_invoice",
            self.client
                .create_invoice(provider_customer_id, plan, idempotency_key),
        )
        .await
    }

    pub async fn create_checkout(&self, req: CheckoutRequest) -> Result<CheckoutSession> {
        self.bounded("create_checkout", self.client.create_checkout(req))
            .await
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use super::*;
    use crate::discount::DiscountScope;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    const MONTH_SECS: u64 = 30 * 24 * 3600;

    #[derive(Debug, Default)]
    struct MockState {
        subscriptions: HashMap<String, ProviderSubscription>,
        /// Idempotency key -> subscription id already created for it.
        idempotent_creates: HashMap<String, String>,
        coupons: HashMap<String, ResolvedDiscount>,
        promotion_codes: HashMap<String, ResolvedDiscount>,
        calls: Vec<String>,
        last_schedule: Option<ScheduleRequest>,
        next_payment: Option<PaymentState>,
        now: u64,
        counter: u64,
    }

    /// Scriptable in-process provider. Charges settle immediately unless a
    /// payment state override is queued.
    #[derive(Debug, Clone, Default)]
    pub struct MockProviderClient {
        state: Arc<Mutex<MockState>>,
    }

    impl MockProviderClient {
        #[must_use]
        pub fn new(now: u64) -> Self {
            let mock = Self::default();
            mock.state.lock().unwrap().now = now;
            mock
        }

        /// Queue the payment state returned by the next charging call.
        pub fn queue_payment_state(&self, state: PaymentState) {
            self.state.lock().unwrap().next_payment = Some(state);
        }

        pub fn seed_coupon(&self, discount: ResolvedDiscount) {
            let mut state = self.state.lock().unwrap();
            state.coupons.insert(discount.coupon_id.clone(), discount);
        }

        pub fn seed_promotion_code(&self, code: &str, discount: ResolvedDiscount) {
            let mut state = self.state.lock().unwrap();
            state.promotion_codes.insert(code.to_string(), discount);
        }

        #[must_use]
        pub fn calls(&self) -> Vec<String> {
            self.state.lock().unwrap().calls.clone()
        }

        #[must_use]
        pub fn subscription(&self, id: &str) -> Option<ProviderSubscription> {
            self.state.lock().unwrap().subscriptions.get(id).cloned()
        }

        /// The most recent schedule upsert, as the engine sent it.
        #[must_use]
        pub fn last_schedule_request(&self) -> Option<ScheduleRequest> {
            self.state.lock().unwrap().last_schedule.clone()
        }

        fn take_payment_state(state: &mut MockState) -> PaymentState {
            state.next_payment.take().unwrap_or(PaymentState::Paid)
        }

        fn next_id(state: &mut MockState, prefix: &str) -> String {
            state.counter += 1;
            format!("{prefix}_{}", state.counter)
        }
    }

    impl BillingProviderClient for MockProviderClient {
        async fn create_subscription(
            &self,
            req: SubscriptionRequest,
        ) -> Result<ProviderSubscription> {
            let mut state = self.state.lock().unwrap();
            state.calls.push("create_subscription".to_string());

            if let Some(existing) = state.idempotent_creates.get(&req.idempotency_key) {
                let existing = existing.clone();
                return Ok(state.subscriptions[&existing].clone());
            }

            let id = Self::next_id(&mut state, "sub");
            let payment = if req.plan.due_now == 0 {
                PaymentState::NoPaymentRequired
            } else {
                Self::take_payment_state(&mut state)
            };
            let sub = ProviderSubscription {
                id: id.clone(),
                current_period_start: state.now,
                current_period_end: state.now + MONTH_SECS,
                payment,
                schedule_id: None,
            };
            state.idempotent_creates.insert(req.idempotency_key, id.clone());
            state.subscriptions.insert(id, sub.clone());
            Ok(sub)
        }

        async fn update_subscription(
            &self,
            subscription_id: &str,
            req: SubscriptionRequest,
        ) -> Result<ProviderSubscription> {
            let mut state = self.state.lock().unwrap();
            state.calls.push("update_subscription".to_string());
            let payment = if req.plan.due_now == 0 {
                PaymentState::NoPaymentRequired
            } else {
                Self::take_payment_state(&mut state)
            };
            let sub = state
                .subscriptions
                .get_mut(subscription_id)
                .ok_or_else(|| EngineError::provider("update_subscription", "no such subscription"))?;
            sub.payment = payment;
            Ok(sub.clone())
        }

        async fn cancel_subscription(
            &self,
            subscription_id: &str,
            _at_period_end: bool,
        ) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.calls.push("cancel_subscription".to_string());
            if !state.subscriptions.contains_key(subscription_id) {
                return Err(EngineError::provider("cancel_subscription", "no such subscription"));
            }
            Ok(())
        }

        async fn upsert_schedule(&self, req: ScheduleRequest) -> Result<String> {
            let mut state = self.state.lock().unwrap();
            state.calls.push("upsert_schedule".to_string());
            let schedule_id = Self::next_id(&mut state, "sched");
            let sub = state
                .subscriptions
                .get_mut(&req.subscription_id)
                .ok_or_else(|| EngineError::provider("upsert_schedule", "no such subscription"))?;
            sub.schedule_id = Some(schedule_id.clone());
            state.last_schedule = Some(req);
            Ok(schedule_id)
        }

        async fn release_schedule(&self, schedule_id: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.calls.push("release_schedule".to_string());
            for sub in state.subscriptions.values_mut() {
                if sub.schedule_id.as_deref() == Some(schedule_id) {
                    sub.schedule_id = None;
                }
            }
            Ok(())
        }

        async fn get_subscription(&self, subscription_id: &str) -> Result<ProviderSubscription> {
            let state = self.state.lock().unwrap();
            state
                .subscriptions
                .get(subscription_id)
                .cloned()
                .ok_or_else(|| EngineError::provider("get_subscription", "no such subscription"))
        }

        async fn resolve_coupon(&self, coupon_id: &str) -> Result<ResolvedDiscount> {
            let state = self.state.lock().unwrap();
            state
                .coupons
                .get(coupon_id)
                .cloned()
                .ok_or_else(|| EngineError::NotFound(format!("coupon '{coupon_id}'")))
        }

        async fn resolve_promotion_code(&self, code: &str) -> Result<ResolvedDiscount> {
            let state = self.state.lock().unwrap();
            state
                .promotion_codes
                .get(code)
                .cloned()
                .ok_or_else(|| EngineError::NotFound(format!("promotion code '{code}'")))
        }

        async fn create_invoice(
            &self,
            _provider_customer_id: &str,
            plan: &BillingPlan,
            _idempotency_key: &str,
        ) -> Result<ProviderInvoice> {
            let mut state = self.state.lock().unwrap();
            state.calls.push("create_invoice".to_string());
            let payment = if plan.due_now == 0 {
                PaymentState::NoPaymentRequired
            } else {
                Self::take_payment_state(&mut state)
            };
            let id = Self::next_id(&mut state, "inv");
            Ok(ProviderInvoice {
                hosted_url: Some(format!("https://pay.example/invoice/{id}")),
                id,
                // The invoiced total is exactly the plan's due-now amount, so
                // an executed preview can never drift from what was shown.
                total: plan.due_now,
                payment,
            })
        }

        async fn create_checkout(&self, req: CheckoutRequest) -> Result<CheckoutSession> {
            let mut state = self.state.lock().unwrap();
            state.calls.push("create_checkout".to_string());
            let id = Self::next_id(&mut state, "cs");
            let _ = req;
            Ok(CheckoutSession {
                url: format!("https://pay.example/checkout/{id}"),
                id,
            })
        }
    }

    /// A 50%-off coupon usable across mock scenarios.
    #[must_use]
    pub fn half_off_coupon() -> ResolvedDiscount {
        ResolvedDiscount {
            coupon_id: "HALF".to_string(),
            percent_off: Some(50),
            amount_off: None,
            applies_to: DiscountScope::All,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test::{half_off_coupon, MockProviderClient};
    use super::*;
    use crate::proration::{PlanAction, PlanItem, ProrationBehavior};

    fn plan(due_now: i64) -> BillingPlan {
        BillingPlan {
            items: vec![PlanItem {
                provider_price_id: "price_pro".to_string(),
                action: PlanAction::Add { quantity: 1 },
                prorate: false,
                amount: due_now,
            }],
            proration: ProrationBehavior::CreateProrations,
            trial_end: None,
            cancel_at: None,
            discounts: Vec::new(),
            due_now,
            next_cycle: due_now,
        }
    }

    #[tokio::test]
    async fn repeated_idempotency_key_returns_same_subscription() {
        let adapter = ProviderAdapter::new(MockProviderClient::new(1_000_000));
        let req = SubscriptionRequest {
            provider_customer_id: "pcus_1".to_string(),
            plan: plan(3000),
            idempotency_key: "attach-1".to_string(),
        };

        let first = adapter.create_subscription(req.clone()).await.unwrap();
        let second = adapter.create_subscription(req).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn slow_call_maps_to_timeout_error() {
        struct SlowClient;
        impl BillingProviderClient for SlowClient {
            async fn create_subscription(
                &self,
                _req: SubscriptionRequest,
            ) -> Result<ProviderSubscription> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!()
            }
            async fn update_subscription(
                &self,
                _id: &str,
                _req: SubscriptionRequest,
            ) -> Result<ProviderSubscription> {
                unimplemented!()
            }
            async fn cancel_subscription(&self, _id: &str, _at_period_end: bool) -> Result<()> {
                unimplemented!()
            }
            async fn upsert_schedule(&self, _req: ScheduleRequest) -> Result<String> {
                unimplemented!()
            }
            async fn release_schedule(&self, _schedule_id: &str) -> Result<()> {
                unimplemented!()
            }
            async fn get_subscription(&self, _id: &str) -> Result<ProviderSubscription> {
                unimplemented!()
            }
            async fn resolve_coupon(&self, _id: &str) -> Result<ResolvedDiscount> {
                unimplemented!()
            }
            async fn resolve_promotion_code(&self, _code: &str) -> Result<ResolvedDiscount> {
                unimplemented!()
            }
            async fn create_invoice(
                &self,
                _customer: &str,
                _plan: &BillingPlan,
                _key: &str,
            ) -> Result<ProviderInvoice> {
                unimplemented!()
            }
            async fn create_checkout(&self, _req: CheckoutRequest) -> Result<CheckoutSession> {
                unimplemented!()
            }
        }

        tokio::time::pause();
        let adapter = ProviderAdapter::new(SlowClient).with_timeout(Duration::from_millis(50));
        let result = adapter
            .create_subscription(SubscriptionRequest {
                provider_customer_id: "pcus_1".to_string(),
                plan: plan(100),
                idempotency_key: "slow".to_string(),
            })
            .await;
        assert!(matches!(result, Err(EngineError::Timeout { .. })));
    }

    #[tokio::test]
    async fn invoice_total_matches_plan_due_now() {
        let adapter = ProviderAdapter::new(MockProviderClient::new(1_000_000));
        let invoice = adapter
            .create_invoice("pcus_1", &plan(4500), "inv-1")
            .await
            .unwrap();
        assert_eq!(invoice.total, 4500);
        assert!(invoice.payment.is_settled());
    }

    #[tokio::test]
    async fn coupon_resolution_round_trips() {
        let mock = MockProviderClient::new(1_000_000);
        mock.seed_coupon(half_off_coupon());
        let adapter = ProviderAdapter::new(mock);

        let discount = adapter.resolve_coupon("HALF").await.unwrap();
        assert_eq!(discount.percent_off, Some(50));
        assert!(matches!(
            adapter.resolve_coupon("NOPE").await,
            Err(EngineError::NotFound(_))
        ));
    }
}

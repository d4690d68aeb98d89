//! Provider callback handlers.
//!
//! The provider reports payment results and phase transitions asynchronously.
//! These handlers finalize what the lifecycle operations deferred: activating
//! parked records once payment settles, marking delinquency, and landing
//! scheduled switches when the period turns over. All of them are idempotent;
//! providers redeliver.

use crate::catalog::{resolve_product, CatalogStore};
use crate::customer::{current_timestamp, CustomerProduct, CustomerStore, ProductStatus, SlotKey};
use crate::engine::BillingEngine;
use crate::error::{EngineError, Result};
use crate::ledger::LedgerStore;
use crate::lock::{acquire_slot, SlotLock};
use crate::provider::BillingProviderClient;
use crate::schedule::carry_balances;
use serde::{Deserialize, Serialize};
use tracing::info;

/// A provider callback, decoded from the delivery payload. Transport and
/// signature verification happen upstream; the engine only consumes the
/// verified event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallbackEvent {
    PaymentConfirmed { customer_product_id: String },
    PaymentFailed { customer_product_id: String },
    ScheduledPhaseReached { slot: SlotKey },
}

/// Decode a callback payload.
pub fn parse_callback(payload: &str) -> Result<CallbackEvent> {
    serde_json::from_str(payload)
        .map_err(|err| EngineError::InvalidRequest(format!("malformed callback payload: {err}")))
}

impl<C, S, L, K, P> BillingEngine<C, S, L, K, P>
where
    C: CatalogStore,
    S: CustomerStore,
    L: LedgerStore,
    K: SlotLock + Clone + Send + 'static,
    P: BillingProviderClient,
{
    /// Route a decoded callback to its handler.
    pub async fn handle_callback(&self, event: CallbackEvent) -> Result<()> {
        match event {
            CallbackEvent::PaymentConfirmed { customer_product_id } => {
                self.on_payment_confirmed(&customer_product_id).await
            }
            CallbackEvent::PaymentFailed { customer_product_id } => {
                self.on_payment_failed(&customer_product_id).await
            }
            CallbackEvent::ScheduledPhaseReached { slot } => {
                self.on_scheduled_phase_reached(&slot).await
            }
        }
    }

    /// Payment settled for a parked record (checkout completed, 3DS passed,
    /// or a retried invoice went through). Activates it and grants its
    /// entitlements; a parked record landing in an occupied slot completes
    /// as a switch, retiring the occupant and carrying its balances.
    /// Redelivery is a no-op.
    pub async fn on_payment_confirmed(&self, customer_product_id: &str) -> Result<()> {
        let cp = self
            .customers
            .get_product(customer_product_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("customer product {customer_product_id}"))
            })?;
        if !matches!(cp.status, ProductStatus::Incomplete | ProductStatus::PastDue) {
            return Ok(());
        }

        let slot = cp.slot();
        let guard = acquire_slot(&self.lock, &slot, self.config.lock_ttl).await?;
        let result = self.activate_parked(cp).await;
        guard.release().await?;
        self.balances.invalidate(&slot.customer_id);
        result
    }

    async fn activate_parked(&self, mut cp: CustomerProduct) -> Result<()> {
        let now = current_timestamp();
        let product =
            resolve_product(&self.catalog, &cp.product_id, Some(cp.product_version)).await?;
        let entities = self
            .customers
            .get_customer(&cp.customer_id)
            .await?
            .map(|c| c.entities)
            .unwrap_or_default();

        let mut old_rows = Vec::new();
        if !cp.is_add_on {
            if let Some(old) = self.customers.get_slot_occupant(&cp.slot()).await? {
                if old.id != cp.id {
                    if let Some(sub_id) = &old.provider_subscription_id {
                        self.provider.cancel_subscription(sub_id, false).await?;
                    }
                    old_rows = self.ledger().store().list_for_product(&old.id).await?;
                    self.retire_product(&old, now).await?;
                }
            }
        }

        cp.status = if cp.trial_ends_at.is_some_and(|t| t > now) {
            ProductStatus::Trialing
        } else {
            ProductStatus::Active
        };
        cp.updated_at = now;
        self.customers.save_product(&cp).await?;

        // Balances may already exist if the first delivery got through the
        // grant before failing; don't double-grant.
        if self.ledger().store().list_for_product(&cp.id).await?.is_empty() {
            let rows = carry_balances(
                &old_rows,
                &product,
                &cp.id,
                &cp.customer_id,
                &cp.options,
                &entities,
                cp.entity_id.as_deref(),
                now,
            );
            self.ledger().grant(rows).await?;
        }

        info!(
            target: "tollgate::webhook",
            customer_product_id = %cp.id,
            customer_id = %cp.customer_id,
            "deferred attach activated",
        );
        Ok(())
    }

    /// A charge for this record failed. A record still waiting on its first
    /// payment is abandoned; a live record drops into past-due until a retry
    /// succeeds.
    pub async fn on_payment_failed(&self, customer_product_id: &str) -> Result<()> {
        let Some(mut cp) = self.customers.get_product(customer_product_id).await? else {
            return Ok(());
        };

        let now = current_timestamp();
        match cp.status {
            ProductStatus::Incomplete => {
                // Never activated: the attach simply never happened.
                self.customers.delete_product(&cp.id).await?;
            }
            ProductStatus::Active | ProductStatus::Trialing => {
                cp.status = ProductStatus::PastDue;
                cp.updated_at = now;
                self.customers.save_product(&cp).await?;
                info!(
                    target: "tollgate::webhook",
                    customer_product_id,
                    customer_id = %cp.customer_id,
                    "product moved to past due",
                );
            }
            ProductStatus::PastDue | ProductStatus::Scheduled | ProductStatus::Expired => {}
        }
        Ok(())
    }

    /// The current period ended and the provider rolled the subscription into
    /// its scheduled phase. Lands the queued successor: the old occupant
    /// expires and the successor activates with balances carried per its
    /// entitlements.
    pub async fn on_scheduled_phase_reached(&self, slot: &SlotKey) -> Result<()> {
        let guard = acquire_slot(&self.lock, slot, self.config.lock_ttl).await?;
        let result = self.land_scheduled(slot).await;
        guard.release().await?;
        self.balances.invalidate(&slot.customer_id);
        result
    }

    async fn land_scheduled(&self, slot: &SlotKey) -> Result<()> {
        let Some(mut successor) = self.customers.get_scheduled(slot).await? else {
            return Ok(());
        };
        let now = current_timestamp();
        let product = resolve_product(
            &self.catalog,
            &successor.product_id,
            Some(successor.product_version),
        )
        .await?;

        let old_rows = match self.customers.get_slot_occupant(slot).await? {
            Some(old) => {
                let rows = self.ledger().store().list_for_product(&old.id).await?;
                self.retire_product(&old, now).await?;
                rows
            }
            None => Vec::new(),
        };

        successor.status = ProductStatus::Active;
        successor.provider_schedule_id = None;
        successor.current_period_start = now;
        if let Some(sub_id) = &successor.provider_subscription_id {
            let sub = self.provider.get_subscription(sub_id).await?;
            successor.current_period_start = sub.current_period_start;
            successor.current_period_end = Some(sub.current_period_end);
        }
        successor.updated_at = now;
        self.customers.save_product(&successor).await?;

        let entities = self
            .customers
            .get_customer(&successor.customer_id)
            .await?
            .map(|c| c.entities)
            .unwrap_or_default();
        let rows = carry_balances(
            &old_rows,
            &product,
            &successor.id,
            &successor.customer_id,
            &successor.options,
            &entities,
            successor.entity_id.as_deref(),
            now,
        );
        self.ledger().grant(rows).await?;

        info!(
            target: "tollgate::webhook",
            slot = %slot,
            customer_product_id = %successor.id,
            "scheduled switch landed",
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_payloads_decode_by_type_tag() {
        let event = parse_callback(
            r#"{"type":"payment_confirmed","customer_product_id":"cp_1"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            CallbackEvent::PaymentConfirmed { customer_product_id: "cp_1".to_string() }
        );

        let event = parse_callback(
            r#"{"type":"scheduled_phase_reached","slot":{"customer_id":"cus_1","group":"main","entity_id":null}}"#,
        )
        .unwrap();
        let CallbackEvent::ScheduledPhaseReached { slot } = event else {
            panic!("wrong variant");
        };
        assert_eq!(slot.customer_id, "cus_1");

        assert!(parse_callback("not json").is_err());
    }
}

//! Attach planning.
//!
//! Attaching a product to a customer resolves to exactly one scenario before
//! anything is charged or written. The scenario decides the execution path;
//! the amounts come from the proration diff. Classification is pure, so a
//! preview and the later execution see the same decision.

use crate::catalog::{Price, Product};
use crate::customer::{Customer, CustomerProduct, FeatureOptions};
use crate::discount::DiscountInput;
use crate::error::{EngineError, Result};
use crate::proration::BillingPlan;
use serde::{Deserialize, Serialize};

/// A request to attach a product to a customer, optionally scoped to an
/// entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttachRequest {
    pub customer_id: String,
    pub product_id: String,
    /// Pin a catalog version; `None` takes the latest.
    pub product_version: Option<u32>,
    pub entity_id: Option<String>,
    pub options: Vec<FeatureOptions>,
    pub discounts: Vec<DiscountInput>,
    /// Skip the product's trial.
    pub skip_trial: bool,
    /// Apply a same-group switch now even if it is a downgrade.
    pub force_immediate: bool,
    /// Defer a same-group switch to the next cycle even if it is an upgrade.
    pub next_cycle: bool,
    /// Invoice immediately instead of folding into the subscription.
    pub invoice: bool,
    /// Collect payment through hosted checkout even when a method is on file.
    pub force_checkout: bool,
    /// Where checkout redirects after success.
    pub success_url: Option<String>,
    /// Caller-supplied idempotency key; generated when absent.
    pub idempotency_key: Option<String>,
}

impl AttachRequest {
    #[must_use]
    pub fn new(customer_id: impl Into<String>, product_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            product_id: product_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: Vec<FeatureOptions>) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn for_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }
}

/// Every attach lands in exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scenario", rename_all = "snake_case")]
pub enum AttachScenario {
    /// No prices: activate immediately, no provider involvement.
    Free,
    /// Money is due without a payment method on file, or checkout was
    /// forced: hosted checkout collects payment first.
    CheckoutRequired,
    /// Add-on products stack alongside the slot occupant.
    AddOn,
    /// Slot already occupied by another paid product in the group.
    Switch { from_customer_product_id: String },
    /// Empty slot, paid product, payment method on file.
    NewSubscription,
}

/// Decide the attach scenario for this customer, product, and slot state.
///
/// A customer flagged invoice-only never goes through checkout: charges land
/// on invoices to be settled out of band.
#[must_use]
pub fn classify(
    customer: &Customer,
    product: &Product,
    occupant: Option<&CustomerProduct>,
    due_now: i64,
    force_checkout: bool,
) -> AttachScenario {
    if product.is_free() {
        return AttachScenario::Free;
    }
    if product.is_add_on {
        if needs_checkout(customer, due_now, force_checkout) {
            return AttachScenario::CheckoutRequired;
        }
        return AttachScenario::AddOn;
    }
    // Checkout wins over the occupied slot: a cardless or forced switch
    // parks until payment confirms, then lands as a switch.
    if needs_checkout(customer, due_now, force_checkout) {
        return AttachScenario::CheckoutRequired;
    }
    if let Some(occupant) = occupant {
        // Re-attaching the same product is still a switch: the quantity
        // options diff against the current configuration.
        return AttachScenario::Switch {
            from_customer_product_id: occupant.id.clone(),
        };
    }
    AttachScenario::NewSubscription
}

fn needs_checkout(customer: &Customer, due_now: i64, force: bool) -> bool {
    if customer.invoice_only {
        return false;
    }
    force || (due_now > 0 && !customer.has_payment_method)
}

/// Validate purchased quantities against the product's prepaid prices.
///
/// Outside checkout, every prepaid price needs an explicit quantity; checkout
/// collects quantities on the hosted page, so absent ones are tolerated
/// there. A product whose only price is prepaid must sell at least one pack.
pub fn validate_options(
    product: &Product,
    options: &[FeatureOptions],
    via_checkout: bool,
) -> Result<()> {
    for opt in options {
        if opt.quantity < 0 {
            return Err(EngineError::InvalidOptions(format!(
                "negative quantity for feature '{}'",
                opt.feature_id
            )));
        }
        if product.prepaid_price_for(&opt.feature_id).is_none() {
            return Err(EngineError::InvalidOptions(format!(
                "feature '{}' has no prepaid price on product '{}'",
                opt.feature_id, product.id
            )));
        }
    }

    let prepaid_prices: Vec<&Price> = product
        .prices
        .iter()
        .filter(|p| matches!(p, Price::UsagePrepaid { .. }))
        .collect();

    for price in &prepaid_prices {
        let Some(feature_id) = price.feature_id() else {
            continue;
        };
        let quantity = options
            .iter()
            .find(|o| o.feature_id == feature_id)
            .map(|o| o.quantity);
        match quantity {
            None if !via_checkout => {
                return Err(EngineError::InvalidOptions(format!(
                    "missing quantity for prepaid feature '{feature_id}'"
                )));
            }
            Some(0) if prepaid_prices.len() == product.prices.len() => {
                return Err(EngineError::InvalidOptions(format!(
                    "quantity for '{feature_id}' must be at least 1"
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// The outcome of planning (but not executing) an attach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachPreview {
    pub scenario: AttachScenario,
    pub plan: BillingPlan,
    pub due_now: i64,
    pub next_cycle: i64,
}

//! Proration and line-item diffing.
//!
//! Given a customer's current product configuration and a requested target
//! configuration, computes the per-price delta and the amount due now. The
//! total is always resolved here, client-side, and the resulting
//! [`BillingPlan`] is replayed verbatim against the provider, so a preview and
//! its execution cannot diverge.

use crate::catalog::{Price, Product, Tier, TierBound, TierMode};
use crate::customer::FeatureOptions;
use crate::discount::ResolvedDiscount;
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// How the provider should handle prorations for this plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProrationBehavior {
    /// Create prorations for any changes (default).
    #[default]
    CreateProrations,
    /// Don't create prorations; changes apply at the next cycle.
    None,
    /// Always invoice the difference immediately.
    AlwaysInvoice,
}

impl ProrationBehavior {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateProrations => "create_prorations",
            Self::None => "none",
            Self::AlwaysInvoice => "always_invoice",
        }
    }
}

/// The current billing cycle window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleWindow {
    pub start: u64,
    pub end: u64,
}

impl CycleWindow {
    /// The prorated share of `amount` for the remainder of the cycle.
    #[must_use]
    pub fn remainder(&self, amount: i64, now: u64) -> i64 {
        if self.end <= self.start {
            return amount;
        }
        let now = now.clamp(self.start, self.end);
        let remaining = (self.end - now) as i128;
        let total = (self.end - self.start) as i128;
        (i128::from(amount) * remaining / total) as i64
    }
}

/// What to do with one provider-side price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlanAction {
    Add { quantity: i64 },
    Remove,
    SetQuantity { quantity: i64 },
}

/// One line of a billing plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanItem {
    pub provider_price_id: String,
    pub action: PlanAction,
    pub prorate: bool,
    /// Signed due-now contribution in minor units (credits are negative).
    pub amount: i64,
}

/// Ephemeral, request-scoped billing instruction set.
///
/// Owns nothing persistent; discarded after the provider call completes or
/// fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingPlan {
    pub items: Vec<PlanItem>,
    pub proration: ProrationBehavior,
    pub trial_end: Option<u64>,
    pub cancel_at: Option<u64>,
    pub discounts: Vec<ResolvedDiscount>,
    /// Total due now, after discounts. Σ(add deltas) − Σ(remove credits).
    pub due_now: i64,
    /// What the recurring total will be from the next cycle on.
    pub next_cycle: i64,
}

impl BillingPlan {
    /// A plan with no line items (nothing to bill).
    #[must_use]
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            proration: ProrationBehavior::None,
            trial_end: None,
            cancel_at: None,
            discounts: Vec::new(),
            due_now: 0,
            next_cycle: 0,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Convert feature units into whole billing-unit packs, rounding up.
#[must_use]
pub fn packs_for_units(units: i64, billing_units: i64) -> i64 {
    if billing_units <= 0 {
        return units.max(0);
    }
    (units.max(0) + billing_units - 1) / billing_units
}

fn tier_span(tiers: &[Tier], index: usize) -> i64 {
    let lower = if index == 0 {
        0
    } else {
        match tiers[index - 1].up_to {
            TierBound::Packs(p) => p,
            TierBound::Infinite => i64::MAX,
        }
    };
    match tiers[index].up_to {
        TierBound::Packs(p) => p - lower,
        TierBound::Infinite => i64::MAX,
    }
}

/// Graduated pricing: sum per-tier cost across the quantity span.
#[must_use]
pub fn graduated_amount(tiers: &[Tier], packs: i64) -> i64 {
    let mut remaining = packs.max(0);
    let mut total = 0i64;
    for (i, tier) in tiers.iter().enumerate() {
        if remaining == 0 {
            break;
        }
        let span = tier_span(tiers, i);
        let in_tier = remaining.min(span);
        total += in_tier * tier.unit_amount;
        remaining -= in_tier;
    }
    total
}

/// Volume pricing: the entire quantity billed at the single tier it falls into.
#[must_use]
pub fn volume_amount(tiers: &[Tier], packs: i64) -> i64 {
    let packs = packs.max(0);
    if packs == 0 {
        return 0;
    }
    for tier in tiers {
        match tier.up_to {
            TierBound::Packs(p) if packs > p => {}
            _ => return packs * tier.unit_amount,
        }
    }
    // Quantity above the last finite bound: bill at the last tier.
    tiers.last().map_or(0, |t| packs * t.unit_amount)
}

/// Total cost of `packs` under the given tier mode.
#[must_use]
pub fn tier_amount(tiers: &[Tier], mode: TierMode, packs: i64) -> i64 {
    match mode {
        TierMode::Graduated => graduated_amount(tiers, packs),
        TierMode::Volume => volume_amount(tiers, packs),
    }
}

/// Charge (or credit) for moving a prepaid quantity from `old_packs` to
/// `new_packs`.
///
/// Graduated: the per-tier sum across the delta span. Volume: the entire new
/// quantity at its single tier, net of the entire old quantity's volume cost.
#[must_use]
pub fn prepaid_delta_amount(tiers: &[Tier], mode: TierMode, old_packs: i64, new_packs: i64) -> i64 {
    tier_amount(tiers, mode, new_packs) - tier_amount(tiers, mode, old_packs)
}

/// A product snapshot plus the purchased prepaid quantities.
#[derive(Debug, Clone)]
pub struct ProductConfig {
    pub product: Product,
    pub options: Vec<FeatureOptions>,
}

impl ProductConfig {
    #[must_use]
    pub fn new(product: Product, options: Vec<FeatureOptions>) -> Self {
        Self { product, options }
    }

    fn option_quantity(&self, feature_id: &str) -> i64 {
        self.options
            .iter()
            .find(|o| o.feature_id == feature_id)
            .map_or(0, |o| o.quantity)
    }

    /// Recurring total per cycle for this configuration.
    #[must_use]
    pub fn recurring_total(&self) -> i64 {
        self.product
            .prices
            .iter()
            .map(|p| match p {
                Price::FixedRecurring { amount, .. } => *amount,
                Price::UsagePrepaid {
                    feature_id,
                    tiers,
                    mode,
                    recurring: true,
                    ..
                } => tier_amount(tiers, *mode, self.option_quantity(feature_id)),
                _ => 0,
            })
            .sum()
    }
}

/// Options controlling a diff computation.
#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    /// Defer the change to the next cycle; nothing is charged now.
    pub next_cycle_only: bool,
    /// The caller demands an immediate invoice; a no-op diff is an error.
    pub force_invoice: bool,
    pub now: u64,
    /// Current cycle window, when an active subscription exists.
    pub cycle: Option<CycleWindow>,
    pub discounts: Vec<ResolvedDiscount>,
}

/// Compute the billing plan that moves `current` to `target`.
///
/// Fixed recurring prices prorate by default (credit the unused remainder of
/// the current cycle, charge the remainder of the new price). One-off prices
/// are never prorated. Prepaid prices charge only the pack delta, at full
/// price.
pub fn compute_diff(
    current: Option<&ProductConfig>,
    target: &ProductConfig,
    opts: &DiffOptions,
) -> Result<BillingPlan> {
    if let Some(cur) = current {
        // A recurring product cannot silently become one-off, or vice versa.
        // Free targets are exempt: dropping to free is always allowed.
        if !target.product.is_free() && cur.product.is_recurring() != target.product.is_recurring()
        {
            return Err(EngineError::InvalidRequest(
                "cannot switch between recurring and one-off products".to_string(),
            ));
        }
    }

    // Every quantity option must correspond to a prepaid price on the target.
    for opt in &target.options {
        if target.product.prepaid_price_for(&opt.feature_id).is_none() {
            return Err(EngineError::InvalidOptions(format!(
                "feature '{}' has no prepaid price on product '{}'",
                opt.feature_id, target.product.id
            )));
        }
        if opt.quantity < 0 {
            return Err(EngineError::InvalidOptions(format!(
                "negative quantity for feature '{}'",
                opt.feature_id
            )));
        }
    }

    let mut items = Vec::new();
    let mut due_now = 0i64;

    let current_price = |provider_price_id: &str| -> Option<&Price> {
        current.and_then(|c| c.product.price_by_provider_id(provider_price_id))
    };

    for price in &target.product.prices {
        let price_id = price.provider_price_id();
        match (current_price(price_id), price) {
            // Price unchanged between configurations; quantity may differ.
            (Some(_), Price::UsagePrepaid { feature_id, tiers, mode, .. }) => {
                let old_packs = current.map_or(0, |c| c.option_quantity(feature_id));
                let new_packs = target.option_quantity(feature_id);
                if old_packs != new_packs {
                    // Prepaid packs are charged at full price, never prorated.
                    let amount = prepaid_delta_amount(tiers, *mode, old_packs, new_packs);
                    items.push(PlanItem {
                        provider_price_id: price_id.to_string(),
                        action: PlanAction::SetQuantity { quantity: new_packs },
                        prorate: false,
                        amount,
                    });
                    due_now += amount;
                }
            }
            (Some(_), _) => {} // carried over unchanged
            (None, _) => {
                let (amount, prorate) = added_price_amount(price, target, opts);
                let quantity = match price {
                    Price::UsagePrepaid { feature_id, .. } => target.option_quantity(feature_id),
                    _ => 1,
                };
                items.push(PlanItem {
                    provider_price_id: price_id.to_string(),
                    action: PlanAction::Add { quantity },
                    prorate,
                    amount,
                });
                due_now += amount;
            }
        }
    }

    if let Some(cur) = current {
        for price in &cur.product.prices {
            let price_id = price.provider_price_id();
            if target.product.price_by_provider_id(price_id).is_some() {
                continue;
            }
            let (credit, prorate) = removed_price_credit(price, opts);
            items.push(PlanItem {
                provider_price_id: price_id.to_string(),
                action: PlanAction::Remove,
                prorate,
                amount: -credit,
            });
            due_now -= credit;
        }
    }

    if opts.force_invoice && items.is_empty() {
        return Err(EngineError::InvalidRequest(
            "no billing difference to invoice".to_string(),
        ));
    }

    let (proration, due_now) = if opts.next_cycle_only {
        // Deferred change: nothing is charged now.
        for item in &mut items {
            item.prorate = false;
            item.amount = 0;
        }
        (ProrationBehavior::None, 0)
    } else if opts.force_invoice {
        (ProrationBehavior::AlwaysInvoice, due_now)
    } else {
        (ProrationBehavior::CreateProrations, due_now)
    };

    // Discounts see the per-price charges so scoped coupons only reduce
    // their own lines; credits pass through undiscounted.
    let charges: Vec<(&str, i64)> = items
        .iter()
        .map(|i| (i.provider_price_id.as_str(), i.amount))
        .collect();
    let due_now = crate::discount::apply_scoped(due_now.max(0), &charges, &opts.discounts)
        + due_now.min(0);

    Ok(BillingPlan {
        items,
        proration,
        trial_end: None,
        cancel_at: None,
        discounts: opts.discounts.clone(),
        due_now,
        next_cycle: target.recurring_total(),
    })
}

fn added_price_amount(price: &Price, target: &ProductConfig, opts: &DiffOptions) -> (i64, bool) {
    match price {
        Price::FixedRecurring { amount, .. } => match opts.cycle {
            // Joining mid-cycle: charge the remainder only.
            Some(window) => (window.remainder(*amount, opts.now), true),
            None => (*amount, false),
        },
        // One-off prices always charge in full, regardless of cycle position.
        Price::FixedOneOff { amount, .. } => (*amount, false),
        Price::UsagePrepaid { feature_id, tiers, mode, .. } => {
            let packs = target.option_quantity(feature_id);
            (tier_amount(tiers, *mode, packs), false)
        }
        // In-arrear usage bills after the fact; nothing due at attach.
        Price::UsageInArrear { .. } => (0, false),
    }
}

fn removed_price_credit(price: &Price, opts: &DiffOptions) -> (i64, bool) {
    match price {
        Price::FixedRecurring { amount, .. } => match opts.cycle {
            // Credit the unused remainder of the current cycle.
            Some(window) => (window.remainder(*amount, opts.now), true),
            None => (0, false),
        },
        // One-offs were charged in full and are never credited back.
        Price::FixedOneOff { .. } => (0, false),
        // Prepaid packs already bought stay usable for the cycle, and
        // in-arrear usage is settled at cycle end; no immediate credit.
        Price::UsagePrepaid { .. } | Price::UsageInArrear { .. } => (0, false),
    }
}

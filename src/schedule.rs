//! Product switch planning.
//!
//! Switching products within a slot goes one of two ways: upgrades take
//! effect immediately with proration, downgrades are scheduled for the end of
//! the current period. A slot holds at most one scheduled successor; planning
//! a new one replaces the old.

use crate::catalog::{Allowance, Price, Product, UsageModel};
use crate::customer::{CustomerProduct, FeatureOptions, ProductStatus};
use crate::ledger::{FeatureBalance, Rollover};

/// How a switch is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchKind {
    /// Replace the product now, prorating the difference.
    Immediate,
    /// Park the target as a scheduled successor until the period ends.
    Scheduled,
}

/// Caller overrides for switch timing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwitchOptions {
    /// Apply now even if the comparison says downgrade.
    pub force_immediate: bool,
    /// Defer to the next cycle even if the comparison says upgrade.
    pub next_cycle: bool,
}

/// Decide upgrade versus downgrade by comparing fixed recurring totals.
/// Equal-priced targets (lateral moves, interval changes) count as upgrades
/// so the customer is never left waiting for a paid-for change.
#[must_use]
pub fn classify_switch(current: &Product, target: &Product, opts: SwitchOptions) -> SwitchKind {
    if opts.force_immediate {
        return SwitchKind::Immediate;
    }
    if opts.next_cycle {
        return SwitchKind::Scheduled;
    }
    if target.base_recurring_amount() >= current.base_recurring_amount() {
        SwitchKind::Immediate
    } else {
        SwitchKind::Scheduled
    }
}

/// Trial end for a product joining an occupied slot. Add-ons and per-entity
/// products attached while the slot's main product is trialing share its
/// trial clock rather than starting their own.
#[must_use]
pub fn inherited_trial_end(
    slot_main: Option<&CustomerProduct>,
    own_trial_days: Option<u32>,
    now: u64,
) -> Option<u64> {
    if let Some(main) = slot_main {
        if main.status == ProductStatus::Trialing {
            return main.trial_ends_at;
        }
    }
    own_trial_days.map(|days| now + u64::from(days) * 24 * 3600)
}

/// Prepaid units granted by the purchased options: packs times billing units,
/// per prepaid price on the product.
#[must_use]
pub fn prepaid_units(product: &Product, options: &[FeatureOptions], feature_id: &str) -> i64 {
    let packs = options
        .iter()
        .find(|o| o.feature_id == feature_id)
        .map_or(0, |o| o.quantity);
    if packs == 0 {
        return 0;
    }
    match product.prepaid_price_for(feature_id) {
        Some(Price::UsagePrepaid { billing_units, .. }) => packs * billing_units,
        _ => 0,
    }
}

/// Build the successor's balance rows when a switch lands.
///
/// Consumable features start from the successor's fresh grant; unused balance
/// survives only through the successor's rollover policy, capped at its max.
/// Allocated features carry their usage: seats already handed out stay handed
/// out against the new allowance.
///
/// Entitlements marked per-entity fan out to one row per registered entity
/// when the product attaches at the customer level; each row carries against
/// its own entity's old row only.
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn carry_balances(
    old_rows: &[FeatureBalance],
    new_product: &Product,
    new_customer_product_id: &str,
    customer_id: &str,
    options: &[FeatureOptions],
    entities: &[String],
    entity_id: Option<&str>,
    now: u64,
) -> Vec<FeatureBalance> {
    let mut rows = Vec::new();
    for ent in &new_product.entitlements {
        let prepaid = prepaid_units(new_product, options, &ent.feature_id);
        let targets: Vec<Option<&str>> = if ent.entity_feature_id.is_some() && entity_id.is_none() {
            entities.iter().map(String::as_str).map(Some).collect()
        } else {
            vec![entity_id]
        };

        for target in targets {
            let mut row = FeatureBalance::from_entitlement(
                new_customer_product_id,
                customer_id,
                ent,
                target.map(str::to_string),
                prepaid,
                now,
            );

            let old = old_rows
                .iter()
                .find(|r| r.feature_id == ent.feature_id && r.entity_id.as_deref() == target);
            if let Some(old) = old {
                match ent.usage_model {
                    UsageModel::Allocated => {
                        // Seats in use don't free up because the plan changed.
                        row.usage = old.usage;
                        if let Allowance::Finite(included) = ent.included {
                            row.balance = included + prepaid - old.usage;
                        }
                    }
                    UsageModel::Consumable => {
                        if let Some(policy) = ent.rollover {
                            let carried = old.balance.max(0).min(policy.max);
                            if carried > 0 {
                                row.rollovers.push(Rollover {
                                    id: format!("ro_{}", uuid::Uuid::new_v4()),
                                    balance: carried,
                                    expires_at: expiry(ent, now, policy.length),
                                });
                                row.balance += carried;
                            }
                        }
                    }
                }
            }
            rows.push(row);
        }
    }
    rows
}

fn expiry(ent: &crate::catalog::Entitlement, now: u64, lengths: u32) -> Option<u64> {
    if lengths == 0 {
        return None;
    }
    let mut at = now;
    for _ in 0..lengths {
        at = ent.interval.advance(at)?;
    }
    Some(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BillingInterval, Entitlement, Tier, TierBound, TierMode};

    fn product(id: &str, amount: i64, entitlements: Vec<Entitlement>) -> Product {
        Product {
            id: id.to_string(),
            version: 1,
            group: "main".to_string(),
            name: id.to_string(),
            is_add_on: false,
            trial_days: None,
            prices: vec![Price::FixedRecurring {
                provider_price_id: format!("price_{id}"),
                amount,
                interval: BillingInterval::Month,
            }],
            entitlements,
        }
    }

    #[test]
    fn higher_price_switch_is_immediate() {
        let basic = product("basic", 1000, vec![]);
        let pro = product("pro", 3000, vec![]);
        assert_eq!(
            classify_switch(&basic, &pro, SwitchOptions::default()),
            SwitchKind::Immediate
        );
        assert_eq!(
            classify_switch(&pro, &basic, SwitchOptions::default()),
            SwitchKind::Scheduled
        );
    }

    #[test]
    fn equal_price_counts_as_upgrade() {
        let a = product("monthly", 1000, vec![]);
        let b = product("alt", 1000, vec![]);
        assert_eq!(
            classify_switch(&a, &b, SwitchOptions::default()),
            SwitchKind::Immediate
        );
    }

    #[test]
    fn overrides_beat_the_comparison() {
        let basic = product("basic", 1000, vec![]);
        let pro = product("pro", 3000, vec![]);
        assert_eq!(
            classify_switch(&pro, &basic, SwitchOptions { force_immediate: true, next_cycle: false }),
            SwitchKind::Immediate
        );
        assert_eq!(
            classify_switch(&basic, &pro, SwitchOptions { force_immediate: false, next_cycle: true }),
            SwitchKind::Scheduled
        );
    }

    #[test]
    fn trialing_slot_shares_its_trial_clock() {
        let mut main = CustomerProduct::new("cus_1", None, "pro", 1, "main", 1_000_000);
        main.status = ProductStatus::Trialing;
        main.trial_ends_at = Some(1_600_000);

        assert_eq!(
            inherited_trial_end(Some(&main), Some(14), 1_100_000),
            Some(1_600_000)
        );
        // Empty slot: the product's own trial applies.
        assert_eq!(
            inherited_trial_end(None, Some(1), 1_100_000),
            Some(1_100_000 + 24 * 3600)
        );
        assert_eq!(inherited_trial_end(None, None, 1_100_000), None);
    }

    #[test]
    fn consumable_balance_resets_on_switch() {
        let old_product = product("basic", 1000, vec![Entitlement::metered("credits", 500)]);
        let old_row = FeatureBalance::from_entitlement(
            "cp_old",
            "cus_1",
            &old_product.entitlements[0],
            None,
            0,
            1_000_000,
        );
        // 350 unused, but the successor has no rollover policy.
        let mut old_row = old_row;
        old_row.balance = 350;
        old_row.usage = 150;

        let new_product = product("pro", 3000, vec![Entitlement::metered("credits", 2000)]);
        let rows = carry_balances(
            &[old_row],
            &new_product,
            "cp_new",
            "cus_1",
            &[],
            &[],
            None,
            2_000_000,
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].balance, 2000);
        assert_eq!(rows[0].usage, 0);
        assert!(rows[0].rollovers.is_empty());
    }

    #[test]
    fn rollover_carry_is_capped_at_successor_max() {
        let old = |balance: i64| {
            let product = product("basic", 1000, vec![Entitlement::metered("credits", 500)]);
            let mut row = FeatureBalance::from_entitlement(
                "cp_old",
                "cus_1",
                &product.entitlements[0],
                None,
                0,
                1_000_000,
            );
            row.balance = balance;
            row.usage = 500 - balance;
            row
        };

        let capped_target = product(
            "pro",
            3000,
            vec![Entitlement::metered("credits", 1000).with_rollover(200, 1)],
        );
        let rows = carry_balances(&[old(350)], &capped_target, "cp_new", "cus_1", &[], &[], None, 0);
        assert_eq!(rows[0].rollovers.len(), 1);
        assert_eq!(rows[0].rollovers[0].balance, 200);
        assert_eq!(rows[0].balance, 1200);

        let roomy_target = product(
            "pro",
            3000,
            vec![Entitlement::metered("credits", 1000).with_rollover(1000, 1)],
        );
        let rows = carry_balances(&[old(350)], &roomy_target, "cp_new", "cus_1", &[], &[], None, 0);
        assert_eq!(rows[0].rollovers[0].balance, 350);
        assert_eq!(rows[0].balance, 1350);
    }

    #[test]
    fn allocated_usage_carries_into_successor() {
        let old_product = product("basic", 1000, vec![Entitlement::metered("seats", 5).allocated()]);
        let mut old_row = FeatureBalance::from_entitlement(
            "cp_old",
            "cus_1",
            &old_product.entitlements[0],
            None,
            0,
            1_000_000,
        );
        // 3 of 5 seats handed out.
        old_row.usage = 3;
        old_row.balance = 2;

        let new_product = product("pro", 3000, vec![Entitlement::metered("seats", 10).allocated()]);
        let rows = carry_balances(
            &[old_row],
            &new_product,
            "cp_new",
            "cus_1",
            &[],
            &[],
            None,
            2_000_000,
        );
        assert_eq!(rows[0].usage, 3);
        assert_eq!(rows[0].balance, 7);
    }

    #[test]
    fn prepaid_options_convert_packs_to_units() {
        let mut target = product("pro", 3000, vec![Entitlement::metered("credits", 0)]);
        target.prices.push(Price::UsagePrepaid {
            provider_price_id: "price_credits".to_string(),
            feature_id: "credits".to_string(),
            billing_units: 100,
            tiers: vec![Tier { up_to: TierBound::Infinite, unit_amount: 500 }],
            mode: TierMode::Graduated,
            recurring: true,
        });

        let options = vec![FeatureOptions { feature_id: "credits".to_string(), quantity: 8 }];
        assert_eq!(prepaid_units(&target, &options, "credits"), 800);

        let rows = carry_balances(&[], &target, "cp_new", "cus_1", &options, &[], None, 0);
        assert_eq!(rows[0].balance, 800);
        assert_eq!(rows[0].prepaid, 800);
    }

    #[test]
    fn entity_rows_only_match_their_own_entity() {
        let ent = Entitlement::metered("messages", 100);
        let mut seat_row =
            FeatureBalance::from_entitlement("cp_old", "cus_1", &ent, Some("seat_1".into()), 0, 0);
        seat_row.balance = 80;
        seat_row.usage = 20;

        let target = product(
            "pro",
            3000,
            vec![Entitlement::metered("messages", 100).with_rollover(50, 1)],
        );
        // Planning for seat_2: seat_1's leftovers must not leak across.
        let rows = carry_balances(
            &[seat_row],
            &target,
            "cp_new",
            "cus_1",
            &[],
            &[],
            Some("seat_2"),
            0,
        );
        assert!(rows[0].rollovers.is_empty());
        assert_eq!(rows[0].balance, 100);
        assert_eq!(rows[0].entity_id.as_deref(), Some("seat_2"));
    }

    #[test]
    fn per_entity_entitlement_fans_out_across_entities() {
        let target = product(
            "team",
            3000,
            vec![
                Entitlement::metered("messages", 100).per_entity("seats"),
                Entitlement::metered("api_calls", 1000),
            ],
        );
        let entities = vec!["seat_1".to_string(), "seat_2".to_string()];

        let rows = carry_balances(&[], &target, "cp_new", "cus_1", &[], &entities, None, 0);
        assert_eq!(rows.len(), 3);
        let seats: Vec<_> = rows.iter().filter(|r| r.feature_id == "messages").collect();
        assert_eq!(seats.len(), 2);
        assert!(seats.iter().all(|r| r.balance == 100));
        assert_eq!(seats[0].entity_id.as_deref(), Some("seat_1"));
        assert_eq!(seats[1].entity_id.as_deref(), Some("seat_2"));
        // The unmarked entitlement stays a single customer-level row.
        let api = rows.iter().find(|r| r.feature_id == "api_calls").unwrap();
        assert!(api.entity_id.is_none());

        // Attaching for one entity keys every row to just that entity.
        let rows = carry_balances(&[], &target, "cp_new", "cus_1", &[], &entities, Some("seat_1"), 0);
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.entity_id.as_deref() == Some("seat_1")));
    }
}

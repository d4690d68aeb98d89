//! Discount resolution and merging.
//!
//! Callers may pass raw coupon ids or human-readable promotion codes; both are
//! resolved against the provider into the same internal reference type and
//! deduplicated by the underlying coupon id before any provider call.

use serde::{Deserialize, Serialize};

/// A discount as supplied by the caller, before provider resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiscountInput {
    CouponId { id: String },
    PromotionCode { code: String },
}

/// Which provider-side products a discount applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountScope {
    All,
    Products(Vec<String>),
}

/// A provider coupon resolved into internal form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedDiscount {
    /// The underlying provider coupon id; dedup key.
    pub coupon_id: String,
    /// Percentage off, in whole percent (0-100).
    pub percent_off: Option<u32>,
    /// Flat amount off, in minor currency units.
    pub amount_off: Option<i64>,
    pub applies_to: DiscountScope,
}

/// Drop duplicate discounts that resolved to the same coupon, keeping the
/// first occurrence. Passing the same coupon twice applies it exactly once.
#[must_use]
pub fn dedupe(discounts: Vec<ResolvedDiscount>) -> Vec<ResolvedDiscount> {
    let mut seen = std::collections::HashSet::new();
    discounts
        .into_iter()
        .filter(|d| seen.insert(d.coupon_id.clone()))
        .collect()
}

/// Apply stacked discounts to a total, percent-off before amount-off, matching
/// the provider's own application order. Never goes below zero.
///
/// Scope-unaware: product-restricted coupons reduce the whole total here. Use
/// [`apply_scoped`] when per-price charge amounts are known.
#[must_use]
pub fn apply(total: i64, discounts: &[ResolvedDiscount]) -> i64 {
    let mut result = total;
    for d in discounts {
        if let Some(pct) = d.percent_off {
            result -= result * i64::from(pct.min(100)) / 100;
        }
    }
    for d in discounts {
        if let Some(off) = d.amount_off {
            result -= off;
        }
    }
    result.max(0)
}

/// Apply stacked discounts honoring each coupon's scope.
///
/// `charges` pairs each provider price id with its signed due-now
/// contribution. A coupon scoped to specific prices discounts only the
/// positive charges on those prices; an amount-off coupon never takes more
/// than its scoped charges add up to.
#[must_use]
pub fn apply_scoped(
    total: i64,
    charges: &[(&str, i64)],
    discounts: &[ResolvedDiscount],
) -> i64 {
    let mut result = total;
    for d in discounts {
        if let Some(pct) = d.percent_off {
            let base = match &d.applies_to {
                DiscountScope::All => result,
                DiscountScope::Products(ids) => scoped_charges(charges, ids),
            };
            result -= base * i64::from(pct.min(100)) / 100;
        }
    }
    for d in discounts {
        if let Some(off) = d.amount_off {
            let cut = match &d.applies_to {
                DiscountScope::All => off,
                DiscountScope::Products(ids) => off.min(scoped_charges(charges, ids)),
            };
            result -= cut;
        }
    }
    result.max(0)
}

fn scoped_charges(charges: &[(&str, i64)], ids: &[String]) -> i64 {
    charges
        .iter()
        .filter(|(price_id, _)| ids.iter().any(|id| id == price_id))
        .map(|(_, amount)| (*amount).max(0))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn percent(coupon: &str, pct: u32) -> ResolvedDiscount {
        ResolvedDiscount {
            coupon_id: coupon.to_string(),
            percent_off: Some(pct),
            amount_off: None,
            applies_to: DiscountScope::All,
        }
    }

    fn amount(coupon: &str, off: i64) -> ResolvedDiscount {
        ResolvedDiscount {
            coupon_id: coupon.to_string(),
            percent_off: None,
            amount_off: Some(off),
            applies_to: DiscountScope::All,
        }
    }

    #[test]
    fn dedupes_by_coupon_id() {
        let deduped = dedupe(vec![
            percent("SAVE10", 10),
            amount("FLAT5", 500),
            percent("SAVE10", 10),
        ]);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].coupon_id, "SAVE10");
        assert_eq!(deduped[1].coupon_id, "FLAT5");
    }

    #[test]
    fn percent_applies_before_amount() {
        // 10000 -> 50% off = 5000 -> minus 500 = 4500.
        let total = apply(10_000, &[amount("FLAT", 500), percent("HALF", 50)]);
        assert_eq!(total, 4500);
    }

    #[test]
    fn never_negative() {
        assert_eq!(apply(300, &[amount("BIG", 1000)]), 0);
    }

    #[test]
    fn duplicate_coupon_applied_once() {
        let discounts = dedupe(vec![percent("HALF", 50), percent("HALF", 50)]);
        assert_eq!(apply(10_000, &discounts), 5000);
    }

    fn scoped_to(mut d: ResolvedDiscount, price_id: &str) -> ResolvedDiscount {
        d.applies_to = DiscountScope::Products(vec![price_id.to_string()]);
        d
    }

    #[test]
    fn scoped_percent_discounts_only_matching_charges() {
        let charges = [("price_pro", 3000), ("price_setup", 1000)];
        let d = scoped_to(percent("SETUP50", 50), "price_setup");
        assert_eq!(apply_scoped(4000, &charges, &[d]), 3500);
    }

    #[test]
    fn scoped_amount_capped_by_scoped_charges() {
        let charges = [("price_pro", 3000), ("price_setup", 1000)];
        let d = scoped_to(amount("SETUPFREE", 5000), "price_setup");
        assert_eq!(apply_scoped(4000, &charges, &[d]), 3000);
    }

    #[test]
    fn unscoped_behaves_like_apply() {
        let charges = [("price_pro", 3000)];
        let discounts = [percent("HALF", 50), amount("FLAT", 500)];
        assert_eq!(apply_scoped(3000, &charges, &discounts), apply(3000, &discounts));
    }
}

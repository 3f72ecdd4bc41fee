//! Commission math shared by the conversion pipeline and the billing
//! referral pipeline. Pure and deterministic so it is testable in isolation.

use crate::MIN_PAYOUT_THRESHOLD_MINOR;
use crate::types::{CommissionKind, LedgerStatus};

/// A single commission term as configured on a merchant.
#[derive(Debug, Clone)]
pub struct CommissionTerms {
    pub kind: CommissionKind,
    /// A whole percentage for `percent` terms, a minor-unit amount for `flat`.
    pub value: i64,
}

/// Computes one commission in minor currency units.
///
/// Percent terms apply `amount * value / 100`, rounded half-up to a minor
/// unit. Flat terms owe `value` regardless of the amount — a flat fee is
/// still owed on a zero-amount qualifying event such as a lead.
pub fn compute_commission(amount_minor: i64, terms: &CommissionTerms) -> i64 {
    match terms.kind {
        CommissionKind::Percent => {
            ((amount_minor as i128 * terms.value as i128 + 50) / 100) as i64
        }
        CommissionKind::Flat => terms.value,
    }
}

/// Decides the status of a newly computed ledger entry. Only the entry that
/// tips the beneficiary's running unpaid total over the payout threshold is
/// created as payable; earlier pending entries stay pending.
pub fn ledger_status_for(existing_unpaid_minor: i64, new_commission_minor: i64) -> LedgerStatus {
    if existing_unpaid_minor + new_commission_minor >= MIN_PAYOUT_THRESHOLD_MINOR {
        LedgerStatus::Payable
    } else {
        LedgerStatus::Pending
    }
}

/// Converts a decimal currency amount from the wire into minor units,
/// rounding half-up at the minor unit.
///
/// The amount is printed to a fixed three decimals before splitting so the
/// binary float representation cannot skew the rounding (a plain
/// `* 100.0` turns `0.145` into `14.499...` and loses a minor unit).
pub fn to_minor(amount: f64) -> i64 {
    let text = format!("{:.3}", amount.abs());
    let (whole, frac) = text.split_once('.').unwrap_or((text.as_str(), "000"));
    let whole: i64 = whole.parse().unwrap_or(0);
    let frac: i64 = frac.parse().unwrap_or(0);
    let minor = whole * 100 + frac / 10 + i64::from(frac % 10 >= 5);
    if amount.is_sign_negative() { -minor } else { minor }
}

/// Converts minor units back into the decimal currency amount for responses.
pub fn to_major(minor: i64) -> f64 {
    minor as f64 / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn percent(value: i64) -> CommissionTerms {
        CommissionTerms {
            kind: CommissionKind::Percent,
            value,
        }
    }

    fn flat(value: i64) -> CommissionTerms {
        CommissionTerms {
            kind: CommissionKind::Flat,
            value,
        }
    }

    #[test]
    fn percent_commission_is_amount_times_value_over_hundred() {
        assert_eq!(compute_commission(299_700, &percent(30)), 89_910);
        assert_eq!(compute_commission(299_700, &percent(10)), 29_970);
        assert_eq!(compute_commission(0, &percent(30)), 0);
    }

    #[test]
    fn percent_commission_rounds_half_up_to_a_minor_unit() {
        // 15% of 0.03 is 0.0045, which rounds down to zero minor units.
        assert_eq!(compute_commission(3, &percent(15)), 0);
        // 50% of 0.03 is 0.015, which rounds up.
        assert_eq!(compute_commission(3, &percent(50)), 2);
    }

    #[test]
    fn flat_commission_ignores_the_amount() {
        assert_eq!(compute_commission(299_700, &flat(1_500)), 1_500);
        assert_eq!(compute_commission(0, &flat(1_500)), 1_500);
    }

    #[test]
    fn threshold_is_evaluated_on_the_marginal_entry() {
        // 49.99 alone stays below the 50.00 threshold.
        assert_eq!(ledger_status_for(0, 4_999), LedgerStatus::Pending);
        // The entry that tips the cumulative total becomes payable.
        assert_eq!(ledger_status_for(4_999, 2), LedgerStatus::Payable);
        // Exactly at the threshold counts as payable.
        assert_eq!(ledger_status_for(0, 5_000), LedgerStatus::Payable);
        assert_eq!(ledger_status_for(2_500, 2_499), LedgerStatus::Pending);
    }

    #[test]
    fn wire_amounts_convert_through_minor_units_exactly() {
        assert_eq!(to_minor(2997.0), 299_700);
        assert_eq!(to_minor(49.99), 4_999);
        assert_eq!(to_minor(0.02), 2);
        assert_eq!(to_major(89_910), 899.10);
        assert_eq!(to_major(29_970), 299.70);
    }

    #[test]
    fn to_minor_rounds_half_up_despite_binary_representation() {
        // 0.145 is stored as 0.14499...; a float multiply would yield 14.
        assert_eq!(to_minor(0.145), 15);
        assert_eq!(to_minor(0.144), 14);
        assert_eq!(to_minor(0.005), 1);
        assert_eq!(to_minor(-1.25), -125);
    }
}

//! Delinquency enforcement: recomputes merchant cached aggregates from the
//! ledger and walks merchant accounts through the flag/suspend state machine.
//!
//! The cached fields on `merchants` are a materialized view over the ledger,
//! regenerated on every sweep. The ledger is the source of truth.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use crate::types::MerchantStanding;
use crate::{FLAG_AFTER_DAYS, SUSPEND_AFTER_DAYS};

/// Advisory lock key guarding the sweep against overlapping runs. Arbitrary
/// fixed value, outside the beneficiary-id key space used by ingestion.
const SWEEP_LOCK_KEY: i64 = 0x696E_615F_656E_66;

/// What one sweep did, returned to the job trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnforcementSummary {
    pub merchants_processed: u64,
    pub flagged: u64,
    pub suspended: u64,
    pub cleared: u64,
    /// True when a concurrent sweep held the lock and this run did nothing.
    pub skipped: bool,
}

/// One outstanding ledger entry, as loaded for the sweep.
#[derive(Debug, Clone)]
pub struct OutstandingEntry {
    pub merchant_id: i64,
    pub affiliate_amount_minor: i64,
    pub ina_amount_minor: i64,
    pub payable_at: DateTime<Utc>,
}

/// Per-merchant aggregate over the outstanding entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerchantRollup {
    pub unpaid_affiliate_minor: i64,
    pub unpaid_ina_minor: i64,
    pub max_days_overdue: i64,
}

impl MerchantRollup {
    pub fn standing(&self) -> MerchantStanding {
        standing_for(self.max_days_overdue)
    }
}

/// Classifies a merchant by the age of its oldest outstanding entry.
pub fn standing_for(days_overdue: i64) -> MerchantStanding {
    if days_overdue >= SUSPEND_AFTER_DAYS {
        MerchantStanding::Suspended
    } else if days_overdue >= FLAG_AFTER_DAYS {
        MerchantStanding::Flagged
    } else {
        MerchantStanding::Clear
    }
}

/// Whole days elapsed since an entry became eligible for payout.
pub fn days_overdue(payable_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - payable_at).num_days().max(0)
}

/// Groups outstanding entries by merchant and computes the cached aggregates.
pub fn rollup_by_merchant(
    entries: &[OutstandingEntry],
    now: DateTime<Utc>,
) -> HashMap<i64, MerchantRollup> {
    let mut rollups: HashMap<i64, MerchantRollup> = HashMap::new();
    for entry in entries {
        let rollup = rollups.entry(entry.merchant_id).or_insert(MerchantRollup {
            unpaid_affiliate_minor: 0,
            unpaid_ina_minor: 0,
            max_days_overdue: 0,
        });
        rollup.unpaid_affiliate_minor += entry.affiliate_amount_minor;
        rollup.unpaid_ina_minor += entry.ina_amount_minor;
        rollup.max_days_overdue = rollup
            .max_days_overdue
            .max(days_overdue(entry.payable_at, now));
    }
    rollups
}

/// Runs one delinquency sweep over the whole ledger.
///
/// Idempotent: running twice with unchanged ledger data writes the same
/// cached merchant fields both times. Overlapping runs are excluded with a
/// transaction-scoped advisory lock; a run that loses the lock is skipped.
pub async fn run_delinquency_sweep(pool: &PgPool) -> Result<EnforcementSummary> {
    let mut tx = pool.begin().await?;

    let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
        .bind(SWEEP_LOCK_KEY)
        .fetch_one(tx.as_mut())
        .await?;
    if !locked {
        warn!("delinquency sweep already running, skipping this run");
        tx.commit().await?;
        return Ok(EnforcementSummary {
            merchants_processed: 0,
            flagged: 0,
            suspended: 0,
            cleared: 0,
            skipped: true,
        });
    }

    let rows = sqlx::query(
        "SELECT merchant_id, affiliate_amount_minor, ina_amount_minor, payable_at \
         FROM commission_events \
         WHERE status IN ('pending', 'payable') \
           AND payable_at IS NOT NULL AND merchant_id IS NOT NULL",
    )
    .fetch_all(tx.as_mut())
    .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        entries.push(OutstandingEntry {
            merchant_id: row.try_get("merchant_id")?,
            affiliate_amount_minor: row.try_get("affiliate_amount_minor")?,
            ina_amount_minor: row.try_get("ina_amount_minor")?,
            payable_at: row.try_get("payable_at")?,
        });
    }

    let now = Utc::now();
    let rollups = rollup_by_merchant(&entries, now);

    let mut flagged = 0u64;
    let mut suspended = 0u64;
    for (merchant_id, rollup) in &rollups {
        let standing = rollup.standing();
        match standing {
            MerchantStanding::Flagged => flagged += 1,
            MerchantStanding::Suspended => suspended += 1,
            MerchantStanding::Clear => {}
        }
        let suspend_now = standing == MerchantStanding::Suspended;

        // The suspension timestamp is set once and never overwritten, and a
        // previously-set suspension is never cleared here.
        sqlx::query(
            "UPDATE merchants SET \
               unpaid_affiliate_minor = $2, \
               unpaid_ina_minor = $3, \
               max_days_overdue = $4, \
               is_delinquent = $5, \
               is_suspended = is_suspended OR $6, \
               is_live = is_live AND NOT $6, \
               suspended_at = CASE WHEN $6 AND suspended_at IS NULL THEN $7 ELSE suspended_at END \
             WHERE id = $1",
        )
        .bind(merchant_id)
        .bind(rollup.unpaid_affiliate_minor)
        .bind(rollup.unpaid_ina_minor)
        .bind(rollup.max_days_overdue)
        .bind(standing != MerchantStanding::Clear)
        .bind(suspend_now)
        .bind(now)
        .execute(tx.as_mut())
        .await?;
    }

    // Merchants with stale cached state but no outstanding liability: reset
    // the totals and the delinquency flag. Suspension is left alone; lifting
    // it is a manual action only.
    let with_debt: Vec<i64> = rollups.keys().copied().collect();
    let cleared = sqlx::query(
        "UPDATE merchants SET \
           unpaid_affiliate_minor = 0, \
           unpaid_ina_minor = 0, \
           max_days_overdue = 0, \
           is_delinquent = FALSE \
         WHERE (is_delinquent = TRUE \
                OR unpaid_affiliate_minor <> 0 \
                OR unpaid_ina_minor <> 0 \
                OR max_days_overdue <> 0) \
           AND NOT (id = ANY($1))",
    )
    .bind(with_debt)
    .execute(tx.as_mut())
    .await?
    .rows_affected();

    tx.commit().await?;

    info!(
        merchants = rollups.len(),
        flagged, suspended, cleared, "delinquency sweep finished"
    );

    Ok(EnforcementSummary {
        merchants_processed: rollups.len() as u64,
        flagged,
        suspended,
        cleared,
        skipped: false,
    })
}

/// Clears an active suspension and restores the merchant's visibility. This
/// is the only path out of the suspended state; the sweep never takes it.
pub async fn lift_suspension(pool: &PgPool, merchant_id: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE merchants SET is_suspended = FALSE, suspended_at = NULL, is_live = TRUE \
         WHERE id = $1 AND is_suspended = TRUE",
    )
    .bind(merchant_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(
        merchant_id: i64,
        affiliate: i64,
        ina: i64,
        days_ago: i64,
        now: DateTime<Utc>,
    ) -> OutstandingEntry {
        OutstandingEntry {
            merchant_id,
            affiliate_amount_minor: affiliate,
            ina_amount_minor: ina,
            payable_at: now - Duration::days(days_ago),
        }
    }

    #[test]
    fn standing_thresholds() {
        assert_eq!(standing_for(0), MerchantStanding::Clear);
        assert_eq!(standing_for(44), MerchantStanding::Clear);
        assert_eq!(standing_for(45), MerchantStanding::Flagged);
        assert_eq!(standing_for(69), MerchantStanding::Flagged);
        assert_eq!(standing_for(70), MerchantStanding::Suspended);
    }

    #[test]
    fn fifty_days_late_flags_without_suspending() {
        let now = Utc::now();
        let rollups = rollup_by_merchant(&[entry(7, 1_000, 100, 50, now)], now);
        assert_eq!(rollups[&7].max_days_overdue, 50);
        assert_eq!(rollups[&7].standing(), MerchantStanding::Flagged);
    }

    #[test]
    fn seventy_one_days_late_suspends() {
        let now = Utc::now();
        let rollups = rollup_by_merchant(&[entry(7, 1_000, 100, 71, now)], now);
        assert_eq!(rollups[&7].max_days_overdue, 71);
        assert_eq!(rollups[&7].standing(), MerchantStanding::Suspended);
    }

    #[test]
    fn rollup_sums_amounts_and_takes_the_oldest_age() {
        let now = Utc::now();
        let entries = vec![
            entry(1, 1_000, 100, 10, now),
            entry(1, 2_500, 250, 48, now),
            entry(2, 400, 40, 0, now),
        ];
        let rollups = rollup_by_merchant(&entries, now);

        assert_eq!(rollups.len(), 2);
        assert_eq!(rollups[&1].unpaid_affiliate_minor, 3_500);
        assert_eq!(rollups[&1].unpaid_ina_minor, 350);
        assert_eq!(rollups[&1].max_days_overdue, 48);
        assert_eq!(rollups[&1].standing(), MerchantStanding::Flagged);
        assert_eq!(rollups[&2].standing(), MerchantStanding::Clear);
    }

    #[test]
    fn rollup_is_deterministic_for_unchanged_input() {
        let now = Utc::now();
        let entries = vec![entry(1, 1_000, 100, 46, now), entry(1, 2_000, 200, 71, now)];
        assert_eq!(
            rollup_by_merchant(&entries, now),
            rollup_by_merchant(&entries, now)
        );
    }

    #[test]
    fn entries_eligible_in_the_future_count_as_zero_days() {
        let now = Utc::now();
        assert_eq!(days_overdue(now + Duration::days(3), now), 0);
        assert_eq!(days_overdue(now - Duration::days(3), now), 3);
    }
}

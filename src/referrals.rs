//! Billing referral boundary: the payment processor's invoice stream feeds a
//! structurally identical commission computation for platform self-referrals.
//! Beneficiary resolution goes through the paying account's referrer relation
//! instead of a tracked link; the ledger shape and threshold rule are shared.

use anyhow::Result;
use chrono::Utc;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::REFERRAL_PERCENTAGE;
use crate::commission::{CommissionTerms, compute_commission, ledger_status_for, to_minor};
use crate::conversions::unpaid_total;
use crate::types::{CommissionKind, LedgerStatus};

// const INVOICE_STATUS_AUTHORIZED: &str = "authorized";
const INVOICE_STATUS_CAPTURED: &str = "captured";
const INVOICE_STATUS_PAID: &str = "paid";

/// A subscription/invoice event from the payment processor's webhook stream.
#[derive(Debug)]
pub struct BillingInvoice {
    pub customer_id: i64,
    pub amount: f64,
    pub currency: String,
    pub invoice_id: String,
    pub status: String,
}

/// The ledger entry written for a commissionable invoice.
#[derive(Debug)]
pub struct ReferralOutcome {
    pub commission_event_id: Uuid,
    pub beneficiary_id: i64,
    pub amount_minor: i64,
    pub status: LedgerStatus,
}

/// Applies the platform self-referral commission for a billing invoice.
///
/// Returns `None` when the invoice is not commissionable: not captured/paid,
/// no active referrer on the paying account, a zero commission, or a
/// redelivered invoice that was already processed.
pub async fn apply_referral_commission(
    pool: &PgPool,
    invoice: &BillingInvoice,
) -> Result<Option<ReferralOutcome>> {
    if invoice.status != INVOICE_STATUS_CAPTURED && invoice.status != INVOICE_STATUS_PAID {
        return Ok(None);
    }

    let mut tx = pool.begin().await?;

    let Some(beneficiary_id) = active_referrer(&mut tx, invoice.customer_id).await? else {
        tx.commit().await?;
        return Ok(None);
    };

    // Same serialization rule as conversion ingestion: one beneficiary's
    // aggregate-then-insert sequence at a time.
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(beneficiary_id)
        .execute(tx.as_mut())
        .await?;

    let amount_minor = to_minor(invoice.amount);
    let terms = CommissionTerms {
        kind: CommissionKind::Percent,
        value: REFERRAL_PERCENTAGE,
    };
    let commission_minor = compute_commission(amount_minor, &terms);
    if commission_minor <= 0 {
        tx.commit().await?;
        return Ok(None);
    }

    let unpaid = unpaid_total(&mut tx, beneficiary_id).await?;
    let status = ledger_status_for(unpaid, commission_minor);
    let now = Utc::now();
    let payable_at = matches!(status, LedgerStatus::Payable).then_some(now);

    let commission_event_id = Uuid::new_v4();
    let res = sqlx::query(
        "INSERT INTO commission_events (id, affiliate_id, affiliate_amount_minor, \
         ina_amount_minor, currency, status, payable_at, invoice_ref, created_at) \
         VALUES ($1, $2, $3, 0, $4, $5, $6, $7, $8) \
         ON CONFLICT (affiliate_id, invoice_ref) DO NOTHING",
    )
    .bind(commission_event_id)
    .bind(beneficiary_id)
    .bind(commission_minor)
    .bind(&invoice.currency)
    .bind(status.as_str())
    .bind(payable_at)
    .bind(&invoice.invoice_id)
    .bind(now)
    .execute(tx.as_mut())
    .await?;

    tx.commit().await?;

    if res.rows_affected() == 0 {
        // Redelivered invoice; the first delivery already wrote the entry.
        return Ok(None);
    }

    Ok(Some(ReferralOutcome {
        commission_event_id,
        beneficiary_id,
        amount_minor: commission_minor,
        status,
    }))
}

async fn active_referrer(
    tx: &mut Transaction<'_, Postgres>,
    account_id: i64,
) -> Result<Option<i64>> {
    let row = sqlx::query("SELECT referred_by FROM accounts WHERE id = $1")
        .bind(account_id)
        .fetch_optional(tx.as_mut())
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let referred_by: Option<i64> = row.try_get("referred_by")?;
    if let Some(rid) = referred_by {
        if let Some(r2) = sqlx::query("SELECT is_active FROM accounts WHERE id = $1")
            .bind(rid)
            .fetch_optional(tx.as_mut())
            .await?
        {
            if r2.try_get::<bool, _>("is_active").unwrap_or(false) {
                return Ok(Some(rid));
            }
        }
    }
    Ok(None)
}

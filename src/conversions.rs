//! Conversion ingestion: correlates reported conversion events back to their
//! originating clicks and writes the commission ledger.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::commission::{CommissionTerms, compute_commission, ledger_status_for, to_minor};
use crate::types::{CommissionKind, EventType, LedgerStatus};

/// A conversion event as reported by the webhook caller, already validated.
#[derive(Debug)]
pub struct ConversionInput {
    pub click_id: Uuid,
    pub event_type: EventType,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub order_id: Option<String>,
    pub booking_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

/// The persisted result of one ingestion: the lead and its ledger entry.
#[derive(Debug)]
pub struct IngestOutcome {
    pub lead_id: Uuid,
    pub commission_event_id: Uuid,
    pub affiliate_amount_minor: i64,
    pub ina_amount_minor: i64,
    pub currency: String,
    pub status: LedgerStatus,
    /// True when a redelivered webhook matched an already-recorded lead.
    pub duplicate: bool,
}

#[derive(Debug)]
pub enum IngestError {
    /// The click identifier does not resolve to a recorded click.
    UnknownClick,
    /// Store failure; the whole ingestion rolled back and is safe to retry.
    Internal(anyhow::Error),
}

impl From<sqlx::Error> for IngestError {
    fn from(e: sqlx::Error) -> Self {
        Self::Internal(e.into())
    }
}

impl From<anyhow::Error> for IngestError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}

struct ClickOrigin {
    click_id: Uuid,
    affiliate_id: i64,
    merchant_id: i64,
}

struct MerchantTerms {
    affiliate: CommissionTerms,
    ina: CommissionTerms,
    default_currency: String,
}

/// Ingests a conversion: resolves the click, persists the lead, computes both
/// commissions and writes the ledger entry, all in one transaction.
pub async fn ingest_conversion(
    pool: &PgPool,
    input: ConversionInput,
) -> Result<IngestOutcome, IngestError> {
    let mut tx = pool.begin().await?;

    let origin = click_origin(&mut tx, input.click_id)
        .await?
        .ok_or(IngestError::UnknownClick)?;

    // Serialize the aggregate-then-insert sequence per beneficiary so two
    // near-threshold conversions cannot both read a stale unpaid total.
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(origin.affiliate_id)
        .execute(tx.as_mut())
        .await?;

    if let Some(order_id) = input.order_id.as_deref() {
        if let Some(existing) = existing_outcome(&mut tx, origin.click_id, order_id).await? {
            tx.commit().await?;
            return Ok(existing);
        }
    }

    let terms = merchant_terms(&mut tx, origin.merchant_id).await?;
    let currency = input
        .currency
        .clone()
        .unwrap_or_else(|| terms.default_currency.clone());
    let amount_minor = conversion_amount_minor(input.event_type, input.amount)
        .ok_or_else(|| anyhow!("purchase conversion without an amount"))?;

    let now = Utc::now();
    let lead_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO leads (id, click_id, event_type, amount_minor, currency, email, \
         first_name, last_name, phone, order_id, booking_at, metadata, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
    )
    .bind(lead_id)
    .bind(origin.click_id)
    .bind(input.event_type.as_str())
    .bind(amount_minor)
    .bind(&currency)
    .bind(&input.email)
    .bind(&input.first_name)
    .bind(&input.last_name)
    .bind(&input.phone)
    .bind(&input.order_id)
    .bind(input.booking_at)
    .bind(&input.metadata)
    .bind(now)
    .execute(tx.as_mut())
    .await?;

    let affiliate_amount_minor = compute_commission(amount_minor, &terms.affiliate);
    let ina_amount_minor = compute_commission(amount_minor, &terms.ina);

    let unpaid = unpaid_total(&mut tx, origin.affiliate_id).await?;
    let status = ledger_status_for(unpaid, affiliate_amount_minor);
    let payable_at = matches!(status, LedgerStatus::Payable).then_some(now);

    let commission_event_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO commission_events (id, lead_id, affiliate_id, merchant_id, \
         affiliate_amount_minor, ina_amount_minor, currency, status, payable_at, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(commission_event_id)
    .bind(lead_id)
    .bind(origin.affiliate_id)
    .bind(origin.merchant_id)
    .bind(affiliate_amount_minor)
    .bind(ina_amount_minor)
    .bind(&currency)
    .bind(status.as_str())
    .bind(payable_at)
    .bind(now)
    .execute(tx.as_mut())
    .await?;

    tx.commit().await?;

    Ok(IngestOutcome {
        lead_id,
        commission_event_id,
        affiliate_amount_minor,
        ina_amount_minor,
        currency,
        status,
        duplicate: false,
    })
}

/// Resolves the monetary amount for a conversion event. Purchases must carry
/// an amount; non-purchase kinds never do.
pub fn conversion_amount_minor(event_type: EventType, amount: Option<f64>) -> Option<i64> {
    match event_type {
        EventType::Purchase => amount.map(to_minor),
        _ => Some(0),
    }
}

/// Sums the beneficiary's outstanding (pending or payable) ledger entries.
pub(crate) async fn unpaid_total(
    tx: &mut Transaction<'_, Postgres>,
    affiliate_id: i64,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT CAST(COALESCE(SUM(affiliate_amount_minor), 0) AS BIGINT) \
         FROM commission_events \
         WHERE affiliate_id = $1 AND status IN ('pending', 'payable')",
    )
    .bind(affiliate_id)
    .fetch_one(tx.as_mut())
    .await
}

async fn click_origin(
    tx: &mut Transaction<'_, Postgres>,
    click_id: Uuid,
) -> Result<Option<ClickOrigin>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT c.id AS click_id, l.affiliate_id, l.merchant_id \
         FROM clicks c JOIN tracked_links l ON l.id = c.link_id \
         WHERE c.id = $1",
    )
    .bind(click_id)
    .fetch_optional(tx.as_mut())
    .await?;

    match row {
        Some(r) => Ok(Some(ClickOrigin {
            click_id: r.try_get("click_id")?,
            affiliate_id: r.try_get("affiliate_id")?,
            merchant_id: r.try_get("merchant_id")?,
        })),
        None => Ok(None),
    }
}

async fn merchant_terms(
    tx: &mut Transaction<'_, Postgres>,
    merchant_id: i64,
) -> Result<MerchantTerms, IngestError> {
    let row = sqlx::query(
        "SELECT affiliate_commission_kind, affiliate_commission_value, \
         ina_commission_kind, ina_commission_value, default_currency \
         FROM merchants WHERE id = $1",
    )
    .bind(merchant_id)
    .fetch_one(tx.as_mut())
    .await?;

    let affiliate_kind: String = row.try_get("affiliate_commission_kind")?;
    let ina_kind: String = row.try_get("ina_commission_kind")?;
    Ok(MerchantTerms {
        affiliate: CommissionTerms {
            kind: CommissionKind::parse(&affiliate_kind)
                .ok_or_else(|| anyhow!("unknown commission kind: {affiliate_kind}"))?,
            value: row.try_get("affiliate_commission_value")?,
        },
        ina: CommissionTerms {
            kind: CommissionKind::parse(&ina_kind)
                .ok_or_else(|| anyhow!("unknown commission kind: {ina_kind}"))?,
            value: row.try_get("ina_commission_value")?,
        },
        default_currency: row.try_get("default_currency")?,
    })
}

/// Looks up an already-recorded lead for the same (click, external order)
/// pair so a redelivered webhook does not mint a second ledger entry.
async fn existing_outcome(
    tx: &mut Transaction<'_, Postgres>,
    click_id: Uuid,
    order_id: &str,
) -> Result<Option<IngestOutcome>, IngestError> {
    let row = sqlx::query(
        "SELECT e.id AS commission_event_id, e.lead_id, e.affiliate_amount_minor, \
         e.ina_amount_minor, e.currency, e.status \
         FROM leads d JOIN commission_events e ON e.lead_id = d.id \
         WHERE d.click_id = $1 AND d.order_id = $2",
    )
    .bind(click_id)
    .bind(order_id)
    .fetch_optional(tx.as_mut())
    .await?;

    let Some(r) = row else {
        return Ok(None);
    };

    let status_text: String = r.try_get("status")?;
    let status = LedgerStatus::parse(&status_text)
        .ok_or_else(|| anyhow!("unknown ledger status: {status_text}"))?;

    Ok(Some(IngestOutcome {
        lead_id: r.try_get("lead_id")?,
        commission_event_id: r.try_get("commission_event_id")?,
        affiliate_amount_minor: r.try_get("affiliate_amount_minor")?,
        ina_amount_minor: r.try_get("ina_amount_minor")?,
        currency: r.try_get("currency")?,
        status,
        duplicate: true,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purchase_without_an_amount_is_not_defaulted_to_zero() {
        assert_eq!(conversion_amount_minor(EventType::Purchase, None), None);
        assert_eq!(
            conversion_amount_minor(EventType::Purchase, Some(2997.0)),
            Some(299_700)
        );
    }

    #[test]
    fn non_purchase_kinds_carry_no_monetary_amount() {
        assert_eq!(conversion_amount_minor(EventType::Lead, None), Some(0));
        assert_eq!(conversion_amount_minor(EventType::Lead, Some(50.0)), Some(0));
        assert_eq!(
            conversion_amount_minor(EventType::BookedCall, Some(25.0)),
            Some(0)
        );
    }
}

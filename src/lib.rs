//! Affiliate attribution and commission ledger service.
//!
//! Correlates tracked-link clicks with asynchronously reported conversion
//! events, computes affiliate-side and platform-side commissions, and runs
//! the payout-delinquency state machine over merchant accounts.

mod api;
mod clicks;
mod commission;
mod config;
mod conversions;
mod enforcement;
mod error;
mod referrals;
mod responses;
mod types;

use anyhow::Context;
use anyhow::Result;
use sqlx::{PgPool, postgres::PgPoolOptions};

pub use api::{AppState, init_router};
pub use commission::{CommissionTerms, compute_commission, ledger_status_for};
pub use config::Config;
pub use conversions::{ConversionInput, IngestError, IngestOutcome, ingest_conversion};
pub use enforcement::{EnforcementSummary, lift_suspension, run_delinquency_sweep};
pub use referrals::{BillingInvoice, ReferralOutcome, apply_referral_commission};
pub use types::{CommissionKind, EventType, LedgerStatus, MerchantStanding, TrackedLink};

/// Minimum accumulated unpaid affiliate commission, in minor currency units,
/// at which a newly created ledger entry becomes payable.
pub const MIN_PAYOUT_THRESHOLD_MINOR: i64 = 5_000;

/// Days an eligible entry may sit unpaid before its merchant is flagged delinquent.
pub const FLAG_AFTER_DAYS: i64 = 45;

/// Days an eligible entry may sit unpaid before its merchant is suspended and delisted.
pub const SUSPEND_AFTER_DAYS: i64 = 70;

/// Commission percentage for platform self-referrals on captured invoices.
pub const REFERRAL_PERCENTAGE: i64 = 10;

/// Initializes the database pool.
pub async fn init_pool(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(database_url)
        .await
        .context("Failed to connect to Postgres")?;
    Ok(pool)
}

use serde::{Deserialize, Serialize};

/// A tracked affiliate link: one (merchant, offer, affiliate) triple behind an
/// opaque public code. Created by the link-generation flow and immutable here.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TrackedLink {
    /// The ID of the link.
    pub id: i64,
    /// The opaque, case-sensitive public code resolved by the redirect endpoint.
    pub code: String,
    /// The merchant destination the visitor is redirected to.
    pub destination_url: String,
    /// The ID of the affiliate who owns the link.
    pub affiliate_id: i64,
    /// The ID of the merchant the link points at.
    pub merchant_id: i64,
    /// The ID of the offer being promoted.
    pub offer_id: i64,
}

/// The kind of conversion reported against a click.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Lead,
    BookedCall,
    Purchase,
}

impl EventType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lead" => Some(Self::Lead),
            "booked_call" => Some(Self::BookedCall),
            "purchase" => Some(Self::Purchase),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lead => "lead",
            Self::BookedCall => "booked_call",
            Self::Purchase => "purchase",
        }
    }
}

/// How a commission term is applied to a conversion amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionKind {
    /// `amount * value / 100`.
    Percent,
    /// `value`, regardless of the conversion amount.
    Flat,
}

impl CommissionKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "percent" => Some(Self::Percent),
            "flat" => Some(Self::Flat),
            _ => None,
        }
    }
}

/// The lifecycle of a commission ledger entry. Entries never move backward;
/// `paid` and `void` are written by the external payout-execution process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Pending,
    Payable,
    Paid,
    Void,
}

impl LedgerStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "payable" => Some(Self::Payable),
            "paid" => Some(Self::Paid),
            "void" => Some(Self::Void),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Payable => "payable",
            Self::Paid => "paid",
            Self::Void => "void",
        }
    }
}

/// Where a merchant stands in the delinquency state machine. Suspended is
/// only ever left through a manual lift, never through the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MerchantStanding {
    Clear,
    Flagged,
    Suspended,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_rejects_unknown_kinds() {
        assert_eq!(EventType::parse("purchase"), Some(EventType::Purchase));
        assert_eq!(EventType::parse("booked_call"), Some(EventType::BookedCall));
        assert_eq!(EventType::parse("refund"), None);
        assert_eq!(EventType::parse("Lead"), None);
    }

    #[test]
    fn ledger_status_round_trips_through_storage_text() {
        for status in [
            LedgerStatus::Pending,
            LedgerStatus::Payable,
            LedgerStatus::Paid,
            LedgerStatus::Void,
        ] {
            assert_eq!(LedgerStatus::parse(status.as_str()), Some(status));
        }
    }
}

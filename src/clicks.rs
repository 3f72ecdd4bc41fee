//! Link resolution and click recording behind the redirect endpoint.

use std::collections::HashMap;

use anyhow::Result;
use chrono::Utc;
use sqlx::PgPool;
use tracing::error;
use url::Url;
use uuid::Uuid;

use crate::types::TrackedLink;

/// Query parameter carrying the click identifier to the merchant destination.
pub const CLICK_ID_PARAM: &str = "ina_click_id";

/// Request metadata captured alongside a click.
#[derive(Debug, Clone, Default)]
pub struct ClickMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    pub utm: HashMap<String, String>,
}

/// Resolves an opaque public code to its tracked link. Read-only.
pub async fn resolve_link(pool: &PgPool, code: &str) -> Result<Option<TrackedLink>> {
    let link = sqlx::query_as::<_, TrackedLink>(
        "SELECT id, code, destination_url, affiliate_id, merchant_id, offer_id \
         FROM tracked_links WHERE code = $1",
    )
    .bind(code)
    .fetch_optional(pool)
    .await?;
    Ok(link)
}

/// Records a click against a resolved link and returns the redirect target.
///
/// A failed insert is logged and swallowed: losing a click record degrades
/// reporting, but it must never block the visitor's navigation.
pub async fn record_click(pool: &PgPool, link: &TrackedLink, meta: &ClickMeta) -> String {
    let click_id = Uuid::new_v4();
    let target = destination_with_tracking(&link.destination_url, click_id, &meta.utm);

    let utm_json = serde_json::to_value(&meta.utm).unwrap_or_else(|_| serde_json::json!({}));
    let res = sqlx::query(
        "INSERT INTO clicks (id, link_id, ip, user_agent, referrer, utm, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(click_id)
    .bind(link.id)
    .bind(&meta.ip)
    .bind(&meta.user_agent)
    .bind(&meta.referrer)
    .bind(&utm_json)
    .bind(Utc::now())
    .execute(pool)
    .await;

    if let Err(e) = res {
        error!(code = %link.code, click_id = %click_id, "failed to persist click: {:?}", e);
    }

    target
}

/// Extracts the pass-through `utm_*` parameters from the request query.
pub fn utm_params(query: &HashMap<String, String>) -> HashMap<String, String> {
    query
        .iter()
        .filter(|(k, _)| k.starts_with("utm_"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Appends the click identifier and pass-through UTM parameters to the
/// destination URL. UTM keys are appended in sorted order so the output is
/// deterministic.
fn destination_with_tracking(
    destination: &str,
    click_id: Uuid,
    utm: &HashMap<String, String>,
) -> String {
    match Url::parse(destination) {
        Ok(mut url) => {
            {
                let mut pairs = url.query_pairs_mut();
                pairs.append_pair(CLICK_ID_PARAM, &click_id.to_string());
                let mut keys: Vec<&String> = utm.keys().collect();
                keys.sort();
                for key in keys {
                    pairs.append_pair(key, &utm[key]);
                }
            }
            url.into()
        }
        Err(_) => {
            // Destination stored without a scheme or otherwise unparseable;
            // still deliver the click identifier.
            let sep = if destination.contains('?') { '&' } else { '?' };
            format!("{destination}{sep}{CLICK_ID_PARAM}={click_id}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn click_id() -> Uuid {
        Uuid::parse_str("0193a1f2-1111-7abc-8def-0123456789ab").unwrap()
    }

    #[test]
    fn appends_click_id_to_a_bare_destination() {
        let target =
            destination_with_tracking("https://merchant.example/offer", click_id(), &HashMap::new());
        assert_eq!(
            target,
            format!("https://merchant.example/offer?{CLICK_ID_PARAM}={}", click_id())
        );
    }

    #[test]
    fn preserves_existing_query_parameters() {
        let target = destination_with_tracking(
            "https://merchant.example/offer?ref=home",
            click_id(),
            &HashMap::new(),
        );
        assert!(target.contains("ref=home"));
        assert!(target.contains(&format!("{CLICK_ID_PARAM}={}", click_id())));
    }

    #[test]
    fn passes_utm_parameters_through_in_sorted_order() {
        let utm = HashMap::from([
            ("utm_source".to_string(), "newsletter".to_string()),
            ("utm_campaign".to_string(), "spring".to_string()),
        ]);
        let target = destination_with_tracking("https://merchant.example/", click_id(), &utm);
        let campaign = target.find("utm_campaign=spring").unwrap();
        let source = target.find("utm_source=newsletter").unwrap();
        assert!(campaign < source);
    }

    #[test]
    fn falls_back_to_plain_append_for_unparseable_destinations() {
        let target = destination_with_tracking("merchant.example/offer", click_id(), &HashMap::new());
        assert_eq!(
            target,
            format!("merchant.example/offer?{CLICK_ID_PARAM}={}", click_id())
        );
    }

    #[test]
    fn utm_params_only_keeps_utm_keys() {
        let query = HashMap::from([
            ("utm_medium".to_string(), "email".to_string()),
            ("gclid".to_string(), "abc".to_string()),
            ("code".to_string(), "xyz".to_string()),
        ]);
        let utm = utm_params(&query);
        assert_eq!(utm.len(), 1);
        assert_eq!(utm.get("utm_medium").map(String::as_str), Some("email"));
    }
}

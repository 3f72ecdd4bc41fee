use std::collections::HashMap;

use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;
use uuid::Uuid;

use crate::clicks::{self, ClickMeta};
use crate::commission::to_major;
use crate::config::Config;
use crate::conversions::{self, ConversionInput, IngestError};
use crate::enforcement::{self, EnforcementSummary};
use crate::error::{
    ApiError, ApiErrorWithMeta, E_BAD_AMOUNT, E_BAD_CLICK_ID, E_BAD_EVENT_TYPE, E_BILLING_FAILURE,
    E_DB_FAILURE, E_ENFORCE_FAILURE, E_INGEST_FAILURE, E_NOT_SUSPENDED, E_UNKNOWN_CLICK,
    E_UNKNOWN_LINK,
};
use crate::referrals::{self, BillingInvoice};
use crate::responses::{ApiOk, RequestMeta, meta_middleware};
use crate::types::EventType;

/// The application state.
#[derive(Clone)]
pub struct AppState {
    /// The database pool.
    pub pool: PgPool,
    /// The application configuration.
    pub config: Config,
}

/// The conversion webhook payload. Fields are validated by hand so that a
/// missing or malformed field comes back as a 400 with a stable error code.
#[derive(Deserialize)]
pub struct ConversionRequest {
    pub ina_click_id: Option<String>,
    pub event_type: Option<String>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub order_id: Option<String>,
    pub booking_datetime: Option<chrono::DateTime<chrono::Utc>>,
    pub metadata: Option<serde_json::Value>,
}

/// The conversion webhook response: the commission breakdown for the entry
/// that was written (or found, on a redelivered order).
#[derive(Serialize)]
pub struct ConversionResponse {
    pub success: bool,
    pub lead_id: Uuid,
    pub commission_event_id: Uuid,
    pub affiliate_commission_amount: f64,
    pub ina_commission_amount: f64,
    pub currency: String,
    pub status: String,
    pub message: String,
}

/// An invoice event from the payment processor.
#[derive(Deserialize)]
pub struct BillingWebhookRequest {
    pub customer_id: i64,
    pub amount: f64,
    pub currency: Option<String>,
    pub invoice_id: String,
    pub status: String,
}

/// The outcome of a billing invoice, commissioned or not.
#[derive(Serialize)]
pub struct BillingReferralResponse {
    pub commissioned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commission_event_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beneficiary_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commission_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// The response after manually lifting a merchant's suspension.
#[derive(Serialize)]
pub struct LiftSuspensionResponse {
    /// The ID of the merchant whose suspension was lifted.
    pub merchant_id: i64,
}

pub fn init_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/r/{code}", get(redirect_handler))
        .route("/conversions", post(conversion_handler))
        .route("/webhooks/billing", post(billing_webhook_handler))
        .route("/jobs/enforce-delinquency", post(enforce_delinquency_handler))
        .route("/merchants/{id}/lift-suspension", post(lift_suspension_handler))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(middleware::from_fn(meta_middleware))
}

async fn redirect_handler(
    State(st): State<AppState>,
    Path(code): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Extension(meta): Extension<RequestMeta>,
) -> Result<Response, ApiErrorWithMeta> {
    let link = clicks::resolve_link(&st.pool, &code).await.map_err(|e| {
        ApiError::Internal(e)
            .with_meta(meta.clone())
            .with_code(E_DB_FAILURE)
    })?;

    let Some(link) = link else {
        return Err(ApiError::NotFound("unknown tracking code".into())
            .with_meta(meta)
            .with_code(E_UNKNOWN_LINK));
    };

    let click_meta = ClickMeta {
        ip: header_value(&headers, "x-forwarded-for")
            .map(|v| v.split(',').next().unwrap_or_default().trim().to_string()),
        user_agent: header_value(&headers, header::USER_AGENT.as_str()),
        referrer: header_value(&headers, header::REFERER.as_str()),
        utm: clicks::utm_params(&query),
    };
    let target = clicks::record_click(&st.pool, &link, &click_meta).await;

    Ok((StatusCode::FOUND, [(header::LOCATION, target)]).into_response())
}

async fn conversion_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<ConversionRequest>,
) -> Result<Json<ConversionResponse>, ApiErrorWithMeta> {
    let click_raw = req.ina_click_id.as_deref().ok_or_else(|| {
        ApiError::BadRequest("ina_click_id is required".into())
            .with_meta(meta.clone())
            .with_code(E_BAD_CLICK_ID)
    })?;
    let click_id = Uuid::parse_str(click_raw).map_err(|_| {
        ApiError::BadRequest("ina_click_id is not a valid click identifier".into())
            .with_meta(meta.clone())
            .with_code(E_BAD_CLICK_ID)
    })?;

    let event_raw = req.event_type.as_deref().ok_or_else(|| {
        ApiError::BadRequest("event_type is required".into())
            .with_meta(meta.clone())
            .with_code(E_BAD_EVENT_TYPE)
    })?;
    let event_type = EventType::parse(event_raw).ok_or_else(|| {
        ApiError::BadRequest(format!("unsupported event_type: {event_raw}"))
            .with_meta(meta.clone())
            .with_code(E_BAD_EVENT_TYPE)
    })?;

    if req.amount.is_some_and(|a| a < 0.0) {
        return Err(ApiError::BadRequest("amount must be >= 0".into())
            .with_meta(meta)
            .with_code(E_BAD_AMOUNT));
    }
    if event_type == EventType::Purchase && req.amount.is_none() {
        return Err(ApiError::BadRequest("amount is required for purchase events".into())
            .with_meta(meta)
            .with_code(E_BAD_AMOUNT));
    }

    let input = ConversionInput {
        click_id,
        event_type,
        amount: req.amount,
        currency: req.currency,
        email: req.email,
        first_name: req.first_name,
        last_name: req.last_name,
        phone: req.phone,
        order_id: req.order_id,
        booking_at: req.booking_datetime,
        metadata: req.metadata,
    };

    let outcome = conversions::ingest_conversion(&st.pool, input)
        .await
        .map_err(|e| match e {
            IngestError::UnknownClick => ApiError::NotFound("unknown click".into())
                .with_meta(meta.clone())
                .with_code(E_UNKNOWN_CLICK),
            IngestError::Internal(err) => ApiError::Internal(err)
                .with_meta(meta.clone())
                .with_code(E_INGEST_FAILURE),
        })?;

    let message = if outcome.duplicate {
        "duplicate delivery, existing commission returned"
    } else {
        "conversion recorded"
    };

    Ok(Json(ConversionResponse {
        success: true,
        lead_id: outcome.lead_id,
        commission_event_id: outcome.commission_event_id,
        affiliate_commission_amount: to_major(outcome.affiliate_amount_minor),
        ina_commission_amount: to_major(outcome.ina_amount_minor),
        currency: outcome.currency,
        status: outcome.status.as_str().to_string(),
        message: message.to_string(),
    }))
}

async fn billing_webhook_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<BillingWebhookRequest>,
) -> Result<ApiOk<BillingReferralResponse>, ApiErrorWithMeta> {
    if req.amount < 0.0 {
        return Err(ApiError::BadRequest("amount must be >= 0".into())
            .with_meta(meta)
            .with_code(E_BAD_AMOUNT));
    }

    let invoice = BillingInvoice {
        customer_id: req.customer_id,
        amount: req.amount,
        currency: req.currency.unwrap_or_else(|| "USD".to_string()),
        invoice_id: req.invoice_id,
        status: req.status,
    };

    let outcome = referrals::apply_referral_commission(&st.pool, &invoice)
        .await
        .map_err(|e| {
            ApiError::Internal(e)
                .with_meta(meta.clone())
                .with_code(E_BILLING_FAILURE)
        })?;

    let body = match outcome {
        Some(o) => BillingReferralResponse {
            commissioned: true,
            commission_event_id: Some(o.commission_event_id),
            beneficiary_id: Some(o.beneficiary_id),
            commission_amount: Some(to_major(o.amount_minor)),
            status: Some(o.status.as_str().to_string()),
        },
        None => BillingReferralResponse {
            commissioned: false,
            commission_event_id: None,
            beneficiary_id: None,
            commission_amount: None,
            status: None,
        },
    };

    Ok(ApiOk::ok("billing invoice processed", body, meta))
}

async fn enforce_delinquency_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<EnforcementSummary>, ApiErrorWithMeta> {
    let summary = enforcement::run_delinquency_sweep(&st.pool)
        .await
        .map_err(|e| {
            ApiError::Internal(e)
                .with_meta(meta.clone())
                .with_code(E_ENFORCE_FAILURE)
        })?;

    Ok(ApiOk::ok("delinquency sweep finished", summary, meta))
}

async fn lift_suspension_handler(
    State(st): State<AppState>,
    Path(merchant_id): Path<i64>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<LiftSuspensionResponse>, ApiErrorWithMeta> {
    let lifted = enforcement::lift_suspension(&st.pool, merchant_id)
        .await
        .map_err(|e| {
            ApiError::Internal(e)
                .with_meta(meta.clone())
                .with_code(E_DB_FAILURE)
        })?;

    if !lifted {
        return Err(ApiError::NotFound("merchant is not suspended".into())
            .with_meta(meta)
            .with_code(E_NOT_SUSPENDED));
    }

    Ok(ApiOk::ok(
        "suspension lifted",
        LiftSuspensionResponse { merchant_id },
        meta,
    ))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

//! Axum HTTP server for the collections gateway.
//!
//! Three route groups: provider webhooks (signature-verified by the ingestor),
//! debtor pages keyed by opaque token, and the bearer-protected dashboard API.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode, Uri, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use secrecy::SecretString;
use tokio::sync::oneshot;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::channels::web::auth::{AuthState, auth_middleware};
use crate::channels::web::types::*;
use crate::collections::dispatch::{Dispatched, LinkDispatched};
use crate::collections::ingest::IngestOutcome;
use crate::collections::ledger::LedgerKind;
use crate::collections::{
    Dispatcher, EventLedger, OutboundContent, StatusService, TokenService, WebhookIngestor,
    reconcile,
};
use crate::db::{Channel, CommunicationRecord, CreateDebtorParams, Database, NewPageView, PaymentRecord};
use crate::error::{ChannelError, DispatchError, IngestError, TokenError};

const EMAIL_SIGNATURE_HEADER: &str = "x-webhook-signature";
const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";
const TWILIO_SIGNATURE_HEADER: &str = "x-twilio-signature";

const NOT_FOUND_BODY: &str = "not found";
const MAX_PAGE_VIEW_PATH: usize = 512;
/// One year; larger windows are clamped.
const MAX_SWEEP_MINUTES: i64 = 60 * 24 * 366;

/// Shared state for all gateway handlers.
pub struct GatewayState {
    pub db: Arc<dyn Database>,
    pub tokens: TokenService,
    pub ledger: EventLedger,
    pub ingestor: WebhookIngestor,
    pub status: StatusService,
    pub dispatcher: Dispatcher,
    /// Externally reachable origin for debtor page links.
    pub public_base_url: String,
    /// Shutdown signal sender.
    pub shutdown_tx: tokio::sync::RwLock<Option<oneshot::Sender<()>>>,
    /// Server startup time for uptime calculation.
    pub startup_time: std::time::Instant,
}

const CONTENT_SECURITY_POLICY: &str =
    "default-src 'none'; frame-ancestors 'none'; base-uri 'none'; form-action 'self'";

/// Start the gateway HTTP server.
///
/// Returns the actual bound `SocketAddr` (useful when binding to port 0).
pub async fn start_server(
    addr: SocketAddr,
    state: Arc<GatewayState>,
    api_token: Option<SecretString>,
) -> Result<SocketAddr, ChannelError> {
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        ChannelError::StartupFailed {
            name: "gateway".to_string(),
            reason: format!("Failed to bind to {}: {}", addr, e),
        }
    })?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| ChannelError::StartupFailed {
            name: "gateway".to_string(),
            reason: format!("Failed to get local addr: {}", e),
        })?;

    if api_token.is_none() {
        tracing::warn!("API_AUTH_TOKEN is not set; dashboard API will refuse every request");
    }

    // Public routes (no auth)
    let public = Router::new()
        .route("/api/health", get(health_handler))
        .route("/webhook/email", post(email_webhook_handler))
        .route("/webhook/stripe", post(stripe_webhook_handler))
        .route("/webhook/twilio", post(twilio_webhook_handler))
        .route("/debtor/{token}", get(debtor_page_handler))
        .route("/pay/{token}", get(pay_page_handler))
        .route("/info/{token}", get(info_page_handler))
        .route("/track/page-view", post(track_page_view_handler));

    // Protected routes (require auth)
    let auth_state = AuthState::new(api_token);
    let protected = Router::new()
        .route("/api/debtors", post(create_debtor_handler))
        .route(
            "/api/debtors/{debtor}",
            get(get_debtor_handler).put(update_debtor_handler),
        )
        .route("/api/debtors/{debtor}/rotate-token", post(rotate_token_handler))
        .route("/api/emails/send", post(send_email_handler))
        .route("/api/sms/send", post(send_sms_handler))
        .route("/api/calls/outbound", post(outbound_call_handler))
        .route("/api/communications/{debtor_id}", get(list_communications_handler))
        .route("/api/payments/{debtor_id}", get(list_payments_handler))
        .route("/api/payment-links", post(create_payment_link_handler))
        .route("/api/reconcile", get(reconcile_handler))
        .route_layer(middleware::from_fn_with_state(auth_state, auth_middleware));

    let app = Router::new()
        .merge(public)
        .merge(protected)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB max request body
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CONTENT_SECURITY_POLICY,
            header::HeaderValue::from_static(CONTENT_SECURITY_POLICY),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            header::HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            header::HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::REFERRER_POLICY,
            header::HeaderValue::from_static("no-referrer"),
        ))
        .with_state(state.clone());

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    *state.shutdown_tx.write().await = Some(shutdown_tx);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Gateway shutting down");
            })
            .await
        {
            tracing::error!("Gateway server error: {}", e);
        }
    });

    tracing::info!(addr = %bound_addr, "Gateway listening");
    Ok(bound_addr)
}

// --- Health ---

async fn health_handler(State(state): State<Arc<GatewayState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        uptime_secs: state.startup_time.elapsed().as_secs(),
    })
}

// --- Webhooks ---

fn signature_header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Uniform provider-facing answer; rejection bodies never say which check failed.
fn webhook_response(result: Result<IngestOutcome, IngestError>) -> Response {
    match result {
        Ok(outcome) => (
            StatusCode::OK,
            Json(WebhookAck {
                status: "recorded",
                duplicate: Some(outcome.duplicate),
            }),
        )
            .into_response(),
        Err(IngestError::Verification { .. } | IngestError::Malformed { .. }) => {
            (StatusCode::BAD_REQUEST, "rejected").into_response()
        }
        Err(IngestError::UnknownDebtor { .. }) => (
            StatusCode::OK,
            Json(WebhookAck {
                status: "acknowledged",
                duplicate: None,
            }),
        )
            .into_response(),
        Err(e @ IngestError::Persistence { .. }) => {
            tracing::error!(error = %e, "Webhook could not be persisted");
            (StatusCode::INTERNAL_SERVER_ERROR, "retry later").into_response()
        }
    }
}

async fn email_webhook_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = signature_header(&headers, EMAIL_SIGNATURE_HEADER);
    webhook_response(state.ingestor.ingest_email(signature, &body).await)
}

async fn stripe_webhook_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = signature_header(&headers, STRIPE_SIGNATURE_HEADER);
    webhook_response(state.ingestor.ingest_payment(signature, &body).await)
}

async fn twilio_webhook_handler(
    State(state): State<Arc<GatewayState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = signature_header(&headers, TWILIO_SIGNATURE_HEADER);
    let target = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    webhook_response(state.ingestor.ingest_telephony(signature, target, &body).await)
}

// --- Debtor pages ---

async fn render_page(
    state: &GatewayState,
    page: &'static str,
    token: &str,
) -> Result<Json<PageResponse>, (StatusCode, &'static str)> {
    let not_found = (StatusCode::NOT_FOUND, NOT_FOUND_BODY);
    let debtor = state.tokens.validate(token).await.map_err(|e| {
        if let TokenError::Database(db) = &e {
            tracing::error!(page, error = %db, "Token lookup failed");
        }
        not_found
    })?;
    let snapshot = state.status.status(&debtor).await.map_err(|e| {
        tracing::error!(page, debtor_id = %debtor.id, error = %e, "Status derivation failed");
        not_found
    })?;
    Ok(Json(PageResponse {
        page,
        first_name: debtor.first_name,
        status: snapshot.status,
        last_engagement_at: snapshot.last_engagement_at,
    }))
}

async fn debtor_page_handler(
    State(state): State<Arc<GatewayState>>,
    Path(token): Path<String>,
) -> Result<Json<PageResponse>, (StatusCode, &'static str)> {
    render_page(&state, "debtor", &token).await
}

async fn pay_page_handler(
    State(state): State<Arc<GatewayState>>,
    Path(token): Path<String>,
) -> Result<Json<PageResponse>, (StatusCode, &'static str)> {
    render_page(&state, "pay", &token).await
}

async fn info_page_handler(
    State(state): State<Arc<GatewayState>>,
    Path(token): Path<String>,
) -> Result<Json<PageResponse>, (StatusCode, &'static str)> {
    render_page(&state, "info", &token).await
}

/// Always 202: unknown tokens and malformed bodies are silently dropped.
async fn track_page_view_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Ok(request) = serde_json::from_slice::<PageViewRequest>(&body) else {
        return StatusCode::ACCEPTED;
    };
    if request.path.len() > MAX_PAGE_VIEW_PATH {
        return StatusCode::ACCEPTED;
    }
    let Ok(debtor) = state.tokens.validate(&request.token).await else {
        return StatusCode::ACCEPTED;
    };
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|ua| ua.chars().take(256).collect::<String>());

    if let Err(e) = state
        .ledger
        .append_page_view(&NewPageView {
            debtor_id: debtor.id,
            token: request.token,
            path: request.path,
            event: request.event.filter(|e| !e.trim().is_empty()),
            user_agent,
            occurred_at: Utc::now(),
        })
        .await
    {
        tracing::warn!(debtor_id = %debtor.id, error = %e, "Failed to record page view");
    }
    StatusCode::ACCEPTED
}

// --- Debtor API ---

fn page_url(state: &GatewayState, token: &str) -> String {
    format!("{}/debtor/{}", state.public_base_url, token)
}

fn internal(e: impl std::fmt::Display) -> (StatusCode, String) {
    tracing::error!(error = %e, "API request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal error".to_string(),
    )
}

fn token_error(e: TokenError) -> (StatusCode, String) {
    match e {
        TokenError::NotFound => (StatusCode::NOT_FOUND, NOT_FOUND_BODY.to_string()),
        other => internal(other),
    }
}

fn dispatch_error(e: DispatchError) -> (StatusCode, String) {
    let status = match &e {
        DispatchError::UnknownDebtor(_) => StatusCode::NOT_FOUND,
        DispatchError::MissingContact { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        DispatchError::ChannelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        DispatchError::InvalidAmount(_) => StatusCode::BAD_REQUEST,
        DispatchError::Persistence(_) => return internal(e),
    };
    (status, e.to_string())
}

async fn create_debtor_handler(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<CreateDebtorRequest>,
) -> Result<(StatusCode, Json<CreateDebtorResponse>), (StatusCode, String)> {
    if req.first_name.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "first_name is required".to_string(),
        ));
    }
    let (debtor, token) = state
        .tokens
        .create_debtor(&CreateDebtorParams {
            first_name: req.first_name,
            last_name: req.last_name,
            email: req.email,
            phone: req.phone,
        })
        .await
        .map_err(token_error)?;
    tracing::info!(debtor_id = %debtor.id, "Debtor created");

    Ok((
        StatusCode::CREATED,
        Json(CreateDebtorResponse {
            page_url: page_url(&state, &token),
            debtor,
            token,
        }),
    ))
}

async fn get_debtor_handler(
    State(state): State<Arc<GatewayState>>,
    Path(token): Path<String>,
) -> Result<Json<DebtorResponse>, (StatusCode, String)> {
    let debtor = state.tokens.validate(&token).await.map_err(token_error)?;
    let status = state.status.status(&debtor).await.map_err(internal)?;
    Ok(Json(DebtorResponse { debtor, status }))
}

async fn update_debtor_handler(
    State(state): State<Arc<GatewayState>>,
    Path(token): Path<String>,
    Json(req): Json<UpdateDebtorRequest>,
) -> Result<Json<DebtorResponse>, (StatusCode, String)> {
    let debtor = state.tokens.validate(&token).await.map_err(token_error)?;
    if req.first_name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        return Err((
            StatusCode::BAD_REQUEST,
            "first_name cannot be empty".to_string(),
        ));
    }
    let updated = state
        .db
        .update_debtor(debtor.id, &req.into_params())
        .await
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, NOT_FOUND_BODY.to_string()))?;
    let status = state.status.status(&updated).await.map_err(internal)?;
    Ok(Json(DebtorResponse {
        debtor: updated,
        status,
    }))
}

async fn rotate_token_handler(
    State(state): State<Arc<GatewayState>>,
    Path(debtor_id): Path<Uuid>,
) -> Result<Json<RotateTokenResponse>, (StatusCode, String)> {
    let token = state.tokens.rotate(debtor_id).await.map_err(token_error)?;
    Ok(Json(RotateTokenResponse { debtor_id, token }))
}

// --- Outbound ---

async fn send_email_handler(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<SendEmailRequest>,
) -> Result<(StatusCode, Json<Dispatched>), (StatusCode, String)> {
    let content = OutboundContent {
        subject: Some(req.subject),
        body: req.body,
    };
    send(&state.dispatcher, req.debtor_id, Channel::Email, content).await
}

async fn send_sms_handler(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<SendSmsRequest>,
) -> Result<(StatusCode, Json<Dispatched>), (StatusCode, String)> {
    let content = OutboundContent {
        subject: None,
        body: req.body,
    };
    send(&state.dispatcher, req.debtor_id, Channel::Sms, content).await
}

async fn outbound_call_handler(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<OutboundCallRequest>,
) -> Result<(StatusCode, Json<Dispatched>), (StatusCode, String)> {
    let content = OutboundContent {
        subject: None,
        body: req.script.unwrap_or_default(),
    };
    send(&state.dispatcher, req.debtor_id, Channel::Voice, content).await
}

async fn send(
    dispatcher: &Dispatcher,
    debtor_id: Uuid,
    channel: Channel,
    content: OutboundContent,
) -> Result<(StatusCode, Json<Dispatched>), (StatusCode, String)> {
    let dispatched = dispatcher
        .send_communication(debtor_id, channel, content)
        .await
        .map_err(dispatch_error)?;
    Ok((StatusCode::ACCEPTED, Json(dispatched)))
}

async fn create_payment_link_handler(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<CreatePaymentLinkRequest>,
) -> Result<(StatusCode, Json<LinkDispatched>), (StatusCode, String)> {
    let link = state
        .dispatcher
        .create_payment_link(req.debtor_id, req.amount, req.currency.as_deref())
        .await
        .map_err(dispatch_error)?;
    Ok((StatusCode::CREATED, Json(link)))
}

// --- Ledger reads ---

async fn list_communications_handler(
    State(state): State<Arc<GatewayState>>,
    Path(debtor_id): Path<Uuid>,
) -> Result<Json<Vec<CommunicationRecord>>, (StatusCode, String)> {
    let ledger = state
        .ledger
        .list(debtor_id, Some(LedgerKind::Communication))
        .await
        .map_err(internal)?;
    Ok(Json(ledger.communications().cloned().collect()))
}

async fn list_payments_handler(
    State(state): State<Arc<GatewayState>>,
    Path(debtor_id): Path<Uuid>,
) -> Result<Json<Vec<PaymentRecord>>, (StatusCode, String)> {
    let ledger = state
        .ledger
        .list(debtor_id, Some(LedgerKind::Payment))
        .await
        .map_err(internal)?;
    Ok(Json(ledger.payments().cloned().collect()))
}

async fn reconcile_handler(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<ReconcileQuery>,
) -> Result<Json<reconcile::ReconcileReport>, (StatusCode, String)> {
    let minutes = query.older_than_minutes.unwrap_or(60).min(MAX_SWEEP_MINUTES);
    if minutes < 0 {
        return Err((
            StatusCode::BAD_REQUEST,
            "older_than_minutes must not be negative".to_string(),
        ));
    }
    let report = reconcile::sweep(&state.db, chrono::Duration::minutes(minutes))
        .await
        .map_err(internal)?;
    Ok(Json(report))
}

//! HTTP API for reply audio.
//!
//! `GET /audio` serves (and if needed regenerates) an artifact,
//! `POST /speech` synthesizes a fresh one, `DELETE /speech/{file}` drops its
//! cached text. These three sit behind the rate limiter and accept internal
//! callers only. `GET /status` is open.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{middleware, Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DeploymentMode;
use crate::delivery::{AudioDelivery, AUDIO_CONTENT_TYPE};
use crate::error::DeliveryError;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};

const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";

#[derive(Clone)]
pub struct ApiState {
    pub delivery: Arc<AudioDelivery>,
    /// `None` when rate limiting is disabled.
    pub limiter: Option<Arc<RateLimiter>>,
    /// Shared secret for internal callers. Empty means loopback-only.
    pub internal_token: Arc<str>,
    pub mode: DeploymentMode,
}

/// Who is calling: transport peer plus any presented token.
struct Caller {
    peer: Option<SocketAddr>,
    token: Option<String>,
}

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(Self {
            peer,
            token: presented_token(&parts.headers),
        })
    }
}

fn presented_token(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let internal = headers
        .get(INTERNAL_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    bearer
        .or(internal)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

impl ApiState {
    fn ensure_internal(&self, caller: &Caller) -> Result<(), DeliveryError> {
        let allowed = if self.internal_token.is_empty() {
            caller.peer.is_some_and(|addr| addr.ip().is_loopback())
        } else {
            caller.token.as_deref() == Some(&*self.internal_token)
        };
        if allowed {
            return Ok(());
        }
        warn!(
            peer = ?caller.peer,
            token_presented = caller.token.is_some(),
            "Rejected non-internal caller"
        );
        Err(DeliveryError::Unauthorized)
    }
}

// --- Request/Response types ---

#[derive(Deserialize)]
struct AudioQuery {
    file: Option<String>,
    text: Option<String>,
}

#[derive(Deserialize)]
struct SpeechRequest {
    file: String,
    text: String,
}

#[derive(Serialize)]
struct SpeechResponse {
    file: String,
    bytes: usize,
}

#[derive(Serialize)]
struct ForgetResponse {
    file: String,
    status: &'static str,
}

#[derive(Serialize)]
struct RateLimitStatus {
    limit: u32,
    tracked_keys: usize,
}

#[derive(Serialize)]
struct StatusResponse {
    mode: &'static str,
    cache_backend: &'static str,
    completion_configured: bool,
    synthesis_configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    rate_limit: Option<RateLimitStatus>,
}

/// Build the axum router.
pub fn router(state: ApiState) -> Router {
    let gated = Router::new()
        .route("/audio", get(handle_audio))
        .route("/speech", post(handle_create_speech))
        .route("/speech/{file}", delete(handle_forget_speech));
    let gated = match &state.limiter {
        Some(limiter) => gated.layer(middleware::from_fn_with_state(
            limiter.clone(),
            rate_limit_middleware,
        )),
        None => gated,
    };

    Router::new()
        .route("/status", get(handle_status))
        .merge(gated)
        .with_state(state)
}

/// Serve the API until `shutdown` fires.
pub async fn serve(state: ApiState, addr: &str, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Reply audio API listening on {}", listener.local_addr()?);

    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

// --- Handlers ---

async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        mode: state.mode.as_str(),
        cache_backend: state.delivery.cache_backend(),
        completion_configured: state.delivery.completion_configured(),
        synthesis_configured: state.delivery.synthesis_configured(),
        rate_limit: state.limiter.as_ref().map(|limiter| RateLimitStatus {
            limit: limiter.limit(),
            tracked_keys: limiter.tracked_keys(),
        }),
    })
}

async fn handle_audio(
    State(state): State<ApiState>,
    caller: Caller,
    Query(query): Query<AudioQuery>,
) -> Result<Response, DeliveryError> {
    let name = state
        .delivery
        .store()
        .sanitize(query.file.as_deref().unwrap_or_default())?;
    state.ensure_internal(&caller)?;

    let payload = state
        .delivery
        .resolve(Some(&name), query.text.as_deref())
        .await?;
    info!(
        artifact = %payload.name,
        tier = payload.tier.as_str(),
        bytes = payload.bytes.len(),
        "HTTP /audio served"
    );
    Ok(([(header::CONTENT_TYPE, AUDIO_CONTENT_TYPE)], payload.bytes).into_response())
}

async fn handle_create_speech(
    State(state): State<ApiState>,
    caller: Caller,
    Json(req): Json<SpeechRequest>,
) -> Result<(StatusCode, Json<SpeechResponse>), DeliveryError> {
    state.ensure_internal(&caller)?;

    let preview: String = req.text.chars().take(80).collect();
    info!(
        "HTTP /speech [{}]: \"{}{}\" ({} chars)",
        req.file,
        preview.replace('\n', " "),
        if req.text.chars().count() > 80 { "..." } else { "" },
        req.text.len(),
    );

    let created = state.delivery.create(&req.file, &req.text).await?;
    Ok((
        StatusCode::CREATED,
        Json(SpeechResponse {
            file: created.name,
            bytes: created.bytes,
        }),
    ))
}

async fn handle_forget_speech(
    State(state): State<ApiState>,
    caller: Caller,
    Path(file): Path<String>,
) -> Result<Json<ForgetResponse>, DeliveryError> {
    state.ensure_internal(&caller)?;
    let file = state.delivery.forget(&file)?;
    Ok(Json(ForgetResponse {
        file,
        status: "deleted",
    }))
}

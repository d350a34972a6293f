//! Admin HTTP surface
//!
//! | Method | Path              | Action           |
//! |--------|-------------------|------------------|
//! | GET    | `/healthz`        | liveness (open)  |
//! | GET    | `/pool`           | snapshot         |
//! | POST   | `/pool`           | configure        |
//! | POST   | `/pool/terminate` | force terminate  |
//! | GET    | `/logs`           | audit query      |
//! | GET    | `/usage`          | usage query      |
//!
//! Everything except `/healthz` requires the admin key in `x-admin-key`
//! (or `x-admin-api-key`). A missing or wrong key is answered with 403 before
//! the body or query is even parsed, and the refusal is audited.

use std::future::Future;
use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::audit::{fingerprint, AuditLogEntry, AuditLogger, LogFilter, Outcome};
use crate::error::ControllerError;
use crate::pool::PoolController;

/// Primary admin credential header
pub const ADMIN_KEY_HEADER: &str = "x-admin-key";
/// Accepted alias
pub const ADMIN_KEY_HEADER_ALIAS: &str = "x-admin-api-key";

/// Handler state
#[derive(Clone)]
pub struct ApiState {
    controller: PoolController,
    audit: AuditLogger,
    salt: String,
    expected: Option<String>,
}

impl ApiState {
    /// State for a controller; the admin key comes from its config
    #[must_use]
    pub fn new(controller: PoolController) -> Self {
        let admin = &controller.config().admin;
        let salt = admin.audit_salt.clone();
        let expected = admin.api_key.as_deref().map(|key| fingerprint(&salt, key));
        let audit = controller.audit().clone();
        Self {
            controller,
            audit,
            salt,
            expected,
        }
    }
}

/// Who is calling
struct Caller {
    actor: Option<String>,
    ip: Option<String>,
}

/// Error response
#[derive(Debug)]
pub enum ApiError {
    /// Control plane error, mapped by taxonomy code
    Controller(ControllerError),
    /// Malformed body or query
    BadRequest(String),
}

impl From<ControllerError> for ApiError {
    fn from(err: ControllerError) -> Self {
        Self::Controller(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    details: serde_json::Value,
}

fn status_for(err: &ControllerError) -> StatusCode {
    match err {
        ControllerError::NoGpuAvailable { .. } | ControllerError::ProvisioningTimeout(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ControllerError::ValidationFailed(_)
        | ControllerError::ModelNotFound { .. }
        | ControllerError::InvalidParameter { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ControllerError::TemplateNotFound(_) => StatusCode::NOT_FOUND,
        ControllerError::Forbidden => StatusCode::FORBIDDEN,
        ControllerError::StateStoreIo(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ControllerError::Engine(_) => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: "BAD_REQUEST",
                    message,
                    details: serde_json::json!({}),
                }),
            )
                .into_response(),
            Self::Controller(err) => {
                let status = status_for(&err);
                let retry_after = err.retry_after();
                let body = ErrorBody {
                    error: err.code(),
                    message: err.to_string(),
                    details: err.details(),
                };
                let mut response = (status, Json(body)).into_response();
                if let Some(after) = retry_after {
                    if let Ok(value) = HeaderValue::from_str(&after.as_secs().to_string()) {
                        response.headers_mut().insert(header::RETRY_AFTER, value);
                    }
                }
                response
            }
        }
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

impl ApiState {
    fn fail(&self, err: ControllerError) -> ApiError {
        self.controller.escalate(&err);
        ApiError::Controller(err)
    }

    /// Check the admin header; audit and refuse on mismatch
    fn authorize(
        &self,
        headers: &HeaderMap,
        addr: Option<SocketAddr>,
        action: &'static str,
        route: &'static str,
    ) -> Result<Caller, ApiError> {
        let presented = headers
            .get(ADMIN_KEY_HEADER)
            .or_else(|| headers.get(ADMIN_KEY_HEADER_ALIAS))
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty());
        let actor = presented.map(|key| fingerprint(&self.salt, key));
        let ip = addr.map(|a| a.ip().to_string());

        let allowed = matches!((&self.expected, &actor), (Some(expected), Some(actor)) if expected == actor);
        if allowed {
            return Ok(Caller { actor, ip });
        }

        tracing::warn!(action, route, ip = ?ip, "Rejected admin credential");
        self.audit
            .append(
                AuditLogEntry::new(action, Outcome::Denied)
                    .with_route(route)
                    .with_actor(actor)
                    .with_ip(ip)
                    .with_details(serde_json::json!({
                        "reason": if presented.is_some() { "invalid credential" } else { "missing credential" },
                    })),
            )
            .map_err(|err| self.fail(err))?;
        Err(ApiError::Controller(ControllerError::Forbidden))
    }

    /// Audit the result of an admin action
    fn record<T>(
        &self,
        caller: &Caller,
        action: &'static str,
        route: &'static str,
        result: &Result<T, ControllerError>,
        details: serde_json::Value,
    ) -> Result<(), ApiError> {
        let (outcome, details) = match result {
            Ok(_) => (Outcome::Success, details),
            Err(err) if err.is_fatal() => return Ok(()),
            Err(err) => (
                Outcome::Error,
                serde_json::json!({ "request": details, "error": err.code() }),
            ),
        };
        self.audit
            .append(
                AuditLogEntry::new(action, outcome)
                    .with_route(route)
                    .with_actor(caller.actor.clone())
                    .with_ip(caller.ip.clone())
                    .with_details(details),
            )
            .map_err(|err| self.fail(err))
    }
}

fn peer(connect: Option<ConnectInfo<SocketAddr>>) -> Option<SocketAddr> {
    connect.map(|ConnectInfo(addr)| addr)
}

// ============================================================================
// Handlers
// ============================================================================

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn get_pool(
    State(state): State<ApiState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> ApiResult<crate::pool::PoolRecord> {
    state.authorize(&headers, peer(connect), "view_pool", "GET /pool")?;
    let record = state.controller.status().map_err(|err| state.fail(err))?;
    Ok(Json(record))
}

/// Body of `POST /pool`
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureBody {
    /// Desired pool size
    pub desired_size: u32,
    /// Safe mode flag
    pub safe_mode: bool,
}

async fn configure_pool(
    State(state): State<ApiState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<crate::pool::PoolRecord> {
    const ROUTE: &str = "POST /pool";
    let caller = state.authorize(&headers, peer(connect), "configure_pool", ROUTE)?;
    let request: ConfigureBody = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid body: {e}")))?;

    let result = state
        .controller
        .configure(request.desired_size, request.safe_mode);
    state.record(
        &caller,
        "configure_pool",
        ROUTE,
        &result,
        serde_json::json!({ "desiredSize": request.desired_size, "safeMode": request.safe_mode }),
    )?;
    Ok(Json(result.map_err(|err| state.fail(err))?))
}

async fn terminate_pool(
    State(state): State<ApiState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> ApiResult<serde_json::Value> {
    const ROUTE: &str = "POST /pool/terminate";
    let caller = state.authorize(&headers, peer(connect), "terminate_pool", ROUTE)?;

    let result = state.controller.terminate(true).await;
    let details = match &result {
        Ok(outcome) => serde_json::to_value(outcome).unwrap_or_default(),
        Err(_) => serde_json::json!({}),
    };
    state.record(&caller, "terminate_pool", ROUTE, &result, details)?;
    let outcome = result.map_err(|err| state.fail(err))?;
    let pool = state.controller.status().map_err(|err| state.fail(err))?;
    Ok(Json(serde_json::json!({ "outcome": outcome, "pool": pool })))
}

fn parse_filter(uri: &Uri) -> Result<LogFilter, ApiError> {
    Query::<LogFilter>::try_from_uri(uri)
        .map(|Query(filter)| filter)
        .map_err(|e| ApiError::BadRequest(format!("invalid query: {e}")))
}

async fn get_logs(
    State(state): State<ApiState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    uri: Uri,
) -> ApiResult<crate::audit::Page<AuditLogEntry>> {
    const ROUTE: &str = "GET /logs";
    let caller = state.authorize(&headers, peer(connect), "view_logs", ROUTE)?;
    let filter = parse_filter(&uri)?;

    let page = state.audit.query(&filter);
    state.record(
        &caller,
        "view_logs",
        ROUTE,
        &page,
        serde_json::to_value(&filter).unwrap_or_default(),
    )?;
    Ok(Json(page.map_err(|err| state.fail(err))?))
}

async fn get_usage(
    State(state): State<ApiState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    uri: Uri,
) -> ApiResult<crate::audit::Page<crate::audit::UsageEvent>> {
    state.authorize(&headers, peer(connect), "view_usage", "GET /usage")?;
    let filter = parse_filter(&uri)?;
    let page = state.audit.query_usage(&filter).map_err(|err| state.fail(err))?;
    Ok(Json(page))
}

/// All routes
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/pool", get(get_pool).post(configure_pool))
        .route("/pool/terminate", post(terminate_pool))
        .route("/logs", get(get_logs))
        .route("/usage", get(get_usage))
        .with_state(state)
}

/// Serve on `listener` until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: ApiState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Admin API listening");
    }
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&ControllerError::no_gpu("x")),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&ControllerError::ValidationFailed(vec![])),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status_for(&ControllerError::Forbidden), StatusCode::FORBIDDEN);
        assert_eq!(
            status_for(&ControllerError::Engine(EngineError::Unreachable("x".into()))),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_retry_after_header() {
        let response = ApiError::from(ControllerError::no_gpu("busy")).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "120");
    }
}

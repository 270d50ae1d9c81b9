use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Extension, Query},
    http::{HeaderMap, HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use gsm_core::Activity;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, error, info_span, warn};
use uuid::Uuid;

use crate::{
    manager::{ActivityHandler, ActivityOutcome, ManagerError},
    oauth::{OAuthCallback, decode_state},
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Seconds a platform is asked to wait before redelivering.
const RETRY_AFTER_SECS: u64 = 5;

#[derive(Clone)]
pub struct GatewayState {
    pub handler: Arc<dyn ActivityHandler>,
    /// Every activity task runs on this tracker so shutdown can wait for it.
    pub tracker: TaskTracker,
    /// Cancelled when shutdown begins; new work is refused from then on.
    pub intake: CancellationToken,
}

impl GatewayState {
    pub fn new(handler: Arc<dyn ActivityHandler>) -> Self {
        Self {
            handler,
            tracker: TaskTracker::new(),
            intake: CancellationToken::new(),
        }
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/api/messages", post(receive_activity))
        .route("/oauth/callback", get(oauth_callback))
        .route("/healthz", get(healthz))
        .layer(Extension(Arc::new(state)))
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("gateway is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error("activity task failed")]
    Internal,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Manager(
                ManagerError::InvalidActivity(_) | ManagerError::MissingAuthorizationCode,
            ) => StatusCode::BAD_REQUEST,
            GatewayError::Manager(ManagerError::TokenExchange(_)) => StatusCode::BAD_GATEWAY,
            GatewayError::Manager(ManagerError::Publish(err)) if err.is_retryable() => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Manager(ManagerError::Publish(_)) | GatewayError::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn message(&self) -> String {
        match self {
            GatewayError::Manager(ManagerError::Publish(err)) => err.to_string(),
            GatewayError::Manager(ManagerError::TokenExchange(_)) => {
                "identity provider rejected the authorization code".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({ "ok": false, "error": self.message() }));
        let mut response = (status, body).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
        }
        response
    }
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

fn outcome_response(outcome: ActivityOutcome, request_id: &str) -> Response {
    let (status, body): (StatusCode, Value) = match outcome {
        ActivityOutcome::Accepted {
            subject,
            event_id,
            attempts,
            state_cached,
        } => (
            StatusCode::ACCEPTED,
            json!({
                "ok": true,
                "status": "accepted",
                "request_id": request_id,
                "subject": subject,
                "event_id": event_id,
                "attempts": attempts,
                "state_cached": state_cached,
            }),
        ),
        ActivityOutcome::Rejected { .. } => (
            StatusCode::OK,
            json!({ "ok": true, "status": "ignored", "request_id": request_id }),
        ),
        ActivityOutcome::SignedIn {
            credential,
            state_cached,
        } => (
            StatusCode::OK,
            json!({
                "ok": true,
                "status": "signed_in",
                "request_id": request_id,
                "provider": credential.provider,
                "state_cached": state_cached,
            }),
        ),
    };
    (status, Json(body)).into_response()
}

/// Runs `work` on the tracker so a dropped connection does not cancel it mid-publish.
async fn run_tracked<F>(state: &GatewayState, work: F) -> Result<ActivityOutcome, GatewayError>
where
    F: Future<Output = Result<ActivityOutcome, ManagerError>> + Send + 'static,
{
    if state.intake.is_cancelled() {
        return Err(GatewayError::ShuttingDown);
    }
    match state.tracker.spawn(work).await {
        Ok(result) => result.map_err(GatewayError::from),
        Err(err) => {
            error!(error = %err, "activity task aborted");
            Err(GatewayError::Internal)
        }
    }
}

async fn receive_activity(
    Extension(state): Extension<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = request_id(&headers);
    let span = info_span!("http.activity", request_id = %request_id);
    let result = async {
        let activity: Activity = serde_json::from_slice(&body)
            .map_err(|err| GatewayError::BadRequest(format!("malformed activity: {err}")))?;
        let handler = state.handler.clone();
        run_tracked(&state, async move { handler.handle_activity(activity).await }).await
    }
    .instrument(span)
    .await;
    let response = match result {
        Ok(outcome) => outcome_response(outcome, &request_id),
        Err(err) => {
            warn!(request_id = %request_id, status = %err.status(), error = %err, "activity not accepted");
            err.into_response()
        }
    };
    with_request_id(response, &request_id)
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn oauth_callback(
    Extension(state): Extension<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let request_id = request_id(&headers);
    let result = async {
        if let Some(error) = query.error {
            return Err(GatewayError::BadRequest(format!("authorization denied: {error}")));
        }
        let code = query
            .code
            .filter(|code| !code.trim().is_empty())
            .ok_or_else(|| GatewayError::BadRequest("missing code".into()))?;
        let raw_state = query
            .state
            .ok_or_else(|| GatewayError::BadRequest("missing state".into()))?;
        let (tenant, conversation_id) = decode_state(&raw_state)
            .map_err(|err| GatewayError::BadRequest(err.to_string()))?;
        let callback = OAuthCallback {
            tenant,
            conversation_id,
            code,
        };
        let handler = state.handler.clone();
        run_tracked(&state, async move {
            handler.handle_oauth_callback(callback).await
        })
        .await
    }
    .instrument(info_span!("http.oauth_callback", request_id = %request_id))
    .await;
    let response = match result {
        Ok(outcome) => outcome_response(outcome, &request_id),
        Err(err) => {
            warn!(request_id = %request_id, status = %err.status(), error = %err, "oauth callback failed");
            err.into_response()
        }
    };
    with_request_id(response, &request_id)
}

async fn healthz(Extension(state): Extension<Arc<GatewayState>>) -> Response {
    if state.intake.is_cancelled() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "draining" })),
        )
            .into_response()
    } else {
        (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
    }
}

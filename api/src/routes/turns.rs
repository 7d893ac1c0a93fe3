use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use twin_core::actions::ActionStatus;
use twin_core::context::ContextSignals;
use twin_core::error::{ApiError, TurnError};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::CallerPrincipal;
use crate::error::AppError;
use crate::extract::AppJson;
use crate::state::AppState;
use crate::turn::{TurnRequest, TurnResponse};

pub const SHARE_TOKEN_HEADER: &str = "x-share-token";
pub const TRAINING_SESSION_HEADER: &str = "x-training-session-id";
pub const ORIGIN_HEADER: &str = "x-twin-origin";

const MAX_QUERY_CHARS: usize = 4000;

pub fn router() -> Router<AppState> {
    Router::new().route("/v1/twins/{twin_id}/turns", post(create_turn))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateTurnRequest {
    pub query: String,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    /// Context the caller already knows (e.g. `goal`, `timeframe`)
    #[serde(default)]
    pub pinned_context: BTreeMap<String, String>,
    /// Metadata filters applied to evidence retrieval
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    /// Advisory only; the server resolves the context itself
    #[serde(default)]
    pub mode: Option<String>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn signals_from(headers: &HeaderMap, mode: Option<String>) -> Result<ContextSignals, AppError> {
    let training_session_id = match header_str(headers, TRAINING_SESSION_HEADER) {
        Some(raw) => Some(raw.parse::<Uuid>().map_err(|_| AppError::Validation {
            message: "Training session id must be a UUID".to_string(),
            field: Some(TRAINING_SESSION_HEADER.to_string()),
            received: Some(serde_json::Value::String(raw.to_string())),
            docs_hint: None,
        })?),
        None => None,
    };
    Ok(ContextSignals {
        origin_endpoint: header_str(headers, ORIGIN_HEADER)
            .unwrap_or("chat")
            .to_string(),
        training_session_id,
        share_token: header_str(headers, SHARE_TOKEN_HEADER).map(str::to_string),
        requested_mode: mode,
    })
}

fn validate(body: &CreateTurnRequest) -> Result<(), AppError> {
    let chars = body.query.trim().chars().count();
    if chars == 0 {
        return Err(AppError::Validation {
            message: "query must not be empty".to_string(),
            field: Some("query".to_string()),
            received: None,
            docs_hint: None,
        });
    }
    if chars > MAX_QUERY_CHARS {
        return Err(AppError::Validation {
            message: format!("query must be at most {MAX_QUERY_CHARS} characters"),
            field: Some("query".to_string()),
            received: Some(serde_json::json!(chars)),
            docs_hint: None,
        });
    }
    Ok(())
}

/// Run one conversational turn against a twin
///
/// The interaction context is resolved server-side from the caller's key,
/// the `x-share-token` header and the `x-training-session-id` header.
/// Routing, audit and debug details are only included for the twin's owner.
#[utoipa::path(
    post,
    path = "/v1/twins/{twin_id}/turns",
    params(
        ("twin_id" = Uuid, Path, description = "Twin to talk to"),
        ("x-share-token" = Option<String>, Header, description = "Share link token"),
        ("x-training-session-id" = Option<Uuid>, Header, description = "Owner training session"),
        ("x-twin-origin" = Option<String>, Header, description = "Calling surface, e.g. chat or training"),
    ),
    request_body = CreateTurnRequest,
    responses(
        (status = 200, description = "Turn completed", body = TurnResponse),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 401, description = "Unknown API key", body = ApiError),
        (status = 403, description = "Context refused or action forbidden in this context", body = ApiError),
    ),
    security((), ("bearer_auth" = [])),
    tag = "turns"
)]
pub async fn create_turn(
    State(state): State<AppState>,
    Path(twin_id): Path<Uuid>,
    CallerPrincipal(principal): CallerPrincipal,
    headers: HeaderMap,
    AppJson(body): AppJson<CreateTurnRequest>,
) -> Result<Json<TurnResponse>, AppError> {
    validate(&body)?;
    let signals = signals_from(&headers, body.mode)?;
    let request = TurnRequest {
        query: body.query,
        conversation_id: body.conversation_id,
        signals,
        pinned_context: body.pinned_context,
        filters: body.filters,
    };
    let response = state.engine.run_turn(twin_id, request, &principal).await?;
    if response
        .action
        .as_ref()
        .is_some_and(|action| action.status == ActionStatus::Forbidden)
    {
        return Err(TurnError::ActionForbidden.into());
    }
    Ok(Json(response))
}

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use twin_core::error::ApiError;

use crate::auth::OwnerPrincipal;
use crate::state::AppState;
use crate::turn::telemetry::TelemetrySnapshot;

pub fn router() -> Router<AppState> {
    Router::new().route("/v1/telemetry/turns", get(turn_telemetry))
}

/// Per-process turn counters
///
/// Route rates are shares of routed turns; action rates are shares of
/// action-lane turns. Counters reset on restart.
#[utoipa::path(
    get,
    path = "/v1/telemetry/turns",
    responses(
        (status = 200, description = "Counter snapshot", body = TelemetrySnapshot),
        (status = 401, description = "Not authenticated", body = ApiError),
        (status = 403, description = "Owner credentials required", body = ApiError),
    ),
    security(("bearer_auth" = [])),
    tag = "system"
)]
pub async fn turn_telemetry(
    State(state): State<AppState>,
    _owner: OwnerPrincipal,
) -> Json<TelemetrySnapshot> {
    Json(state.engine.telemetry().snapshot())
}

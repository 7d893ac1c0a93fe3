use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use twin_core::actions::ActionPlan;
use twin_core::error::ApiError;
use uuid::Uuid;

use crate::auth::OwnerPrincipal;
use crate::error::AppError;
use crate::state::AppState;
use crate::turn::actions::ApprovalError;

pub fn router() -> Router<AppState> {
    Router::new().route(
        "/v1/twins/{twin_id}/actions/{action_id}/approve",
        post(approve_action),
    )
}

impl From<ApprovalError> for AppError {
    fn from(err: ApprovalError) -> Self {
        match err {
            ApprovalError::NotFound => AppError::NotFound {
                resource: "action".to_string(),
            },
            ApprovalError::NotOwner => AppError::forbidden("Only the twin owner can approve actions"),
            ApprovalError::InvalidState(status) => AppError::Conflict {
                message: format!("Action is {status} and cannot be approved"),
            },
            ApprovalError::Store(err) => err.into(),
        }
    }
}

/// Approve a pending action and run it
///
/// Only drafts in `needs_approval` can be approved. Execution runs inline
/// under the configured step budget and timeout; the returned plan carries
/// the terminal status (`executed` or `failed` with an `error_code`).
#[utoipa::path(
    post,
    path = "/v1/twins/{twin_id}/actions/{action_id}/approve",
    params(
        ("twin_id" = Uuid, Path, description = "Twin owning the action"),
        ("action_id" = Uuid, Path, description = "Action draft to approve"),
    ),
    responses(
        (status = 200, description = "Action approved and executed (or failed)", body = ActionPlan),
        (status = 401, description = "Not authenticated", body = ApiError),
        (status = 403, description = "Not the twin owner", body = ApiError),
        (status = 404, description = "Action not found", body = ApiError),
        (status = 409, description = "Action is not awaiting approval", body = ApiError),
    ),
    security(("bearer_auth" = [])),
    tag = "actions"
)]
pub async fn approve_action(
    State(state): State<AppState>,
    Path((twin_id, action_id)): Path<(Uuid, Uuid)>,
    OwnerPrincipal(principal): OwnerPrincipal,
) -> Result<Json<ActionPlan>, AppError> {
    let plan = state
        .engine
        .approve_action(&principal, twin_id, action_id)
        .await?;
    Ok(Json(plan))
}

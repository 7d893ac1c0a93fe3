use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::put;
use axum::{Json, Router};
use serde::Serialize;
use twin_core::context::{ContextSignals, InteractionContextKind};
use twin_core::error::ApiError;
use twin_core::persona::ProceduralModule;
use twin_core::routing::Workflow;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::OwnerPrincipal;
use crate::error::AppError;
use crate::extract::AppJson;
use crate::routes::turns::TRAINING_SESSION_HEADER;
use crate::state::AppState;
use crate::turn::ModuleWriteError;

pub fn router() -> Router<AppState> {
    Router::new().route("/v1/twins/{twin_id}/persona/modules", put(upsert_module))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ModuleUpsertResponse {
    pub module_id: String,
    pub context: InteractionContextKind,
}

impl From<ModuleWriteError> for AppError {
    fn from(err: ModuleWriteError) -> Self {
        match err {
            ModuleWriteError::Turn(err) => err.into(),
            ModuleWriteError::Store(err) => err.into(),
        }
    }
}

fn validate_module(module: &ProceduralModule) -> Result<(), AppError> {
    if module.id.trim().is_empty() {
        return Err(AppError::Validation {
            message: "module id must not be empty".to_string(),
            field: Some("id".to_string()),
            received: None,
            docs_hint: None,
        });
    }
    if let Some(label) = module
        .intent_labels
        .iter()
        .find(|label| Workflow::parse(label).is_none())
    {
        return Err(AppError::Validation {
            message: format!("unknown intent label '{label}'"),
            field: Some("intent_labels".to_string()),
            received: Some(serde_json::Value::String(label.clone())),
            docs_hint: Some(format!(
                "Valid labels: {}",
                Workflow::ALL
                    .iter()
                    .map(|workflow| workflow.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
        });
    }
    if module.max_chars == Some(0) {
        return Err(AppError::Validation {
            message: "max_chars must be positive".to_string(),
            field: Some("max_chars".to_string()),
            received: Some(serde_json::json!(0)),
            docs_hint: None,
        });
    }
    Ok(())
}

/// Upsert a runtime-learned procedural module
///
/// Training write: requires an active training session
/// (`x-training-session-id`) owned by the caller for this twin. Idempotent
/// by module id.
#[utoipa::path(
    put,
    path = "/v1/twins/{twin_id}/persona/modules",
    params(
        ("twin_id" = Uuid, Path, description = "Twin being trained"),
        ("x-training-session-id" = Uuid, Header, description = "Active training session"),
    ),
    request_body = ProceduralModule,
    responses(
        (status = 200, description = "Module stored", body = ModuleUpsertResponse),
        (status = 400, description = "Invalid module", body = ApiError),
        (status = 401, description = "Not authenticated", body = ApiError),
        (status = 403, description = "Not in an owner training context", body = ApiError),
    ),
    security(("bearer_auth" = [])),
    tag = "persona"
)]
pub async fn upsert_module(
    State(state): State<AppState>,
    Path(twin_id): Path<Uuid>,
    OwnerPrincipal(principal): OwnerPrincipal,
    headers: HeaderMap,
    AppJson(module): AppJson<ProceduralModule>,
) -> Result<Json<ModuleUpsertResponse>, AppError> {
    validate_module(&module)?;
    let training_session_id = headers
        .get(TRAINING_SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<Uuid>().ok());
    let signals = ContextSignals {
        origin_endpoint: "training".to_string(),
        training_session_id,
        ..ContextSignals::default()
    };
    let context = state
        .engine
        .upsert_runtime_module(&signals, &principal, twin_id, &module)
        .await?;
    Ok(Json(ModuleUpsertResponse {
        module_id: module.id,
        context: context.kind,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::compiler::fixtures::module;

    #[test]
    fn module_validation_rejects_unknown_intents_and_blank_ids() {
        assert!(validate_module(&module("m1", &["plan"], 1)).is_ok());
        assert!(validate_module(&module("m1", &["juggle"], 1)).is_err());
        assert!(validate_module(&module(" ", &["plan"], 1)).is_err());
    }
}

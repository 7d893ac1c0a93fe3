use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use twin_core::error::{self, ApiError, TurnError};

use crate::stores::StoreError;

/// Internal error type that converts to structured API responses
#[derive(Debug)]
pub enum AppError {
    /// Validation error (400)
    Validation {
        message: String,
        field: Option<String>,
        received: Option<serde_json::Value>,
        docs_hint: Option<String>,
    },
    /// Missing or invalid credentials (401)
    Unauthorized {
        message: String,
        docs_hint: Option<String>,
    },
    /// Caller is known but the context does not allow the operation (403)
    Forbidden {
        message: String,
        error_code: Option<String>,
        docs_hint: Option<String>,
    },
    /// Resource not found (404)
    NotFound { resource: String },
    /// State conflict, e.g. approving an action that is not pending (409)
    Conflict { message: String },
    /// Database error (500)
    Database(sqlx::Error),
    /// Internal error (500)
    Internal(String),
}

impl AppError {
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
            error_code: None,
            docs_hint: None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::now_v7().to_string();

        let (status, api_error) = match self {
            AppError::Validation {
                message,
                field,
                received,
                docs_hint,
            } => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: error::codes::VALIDATION_FAILED.to_string(),
                    error_code: None,
                    message,
                    field,
                    received,
                    request_id,
                    docs_hint,
                },
            ),
            AppError::Unauthorized { message, docs_hint } => (
                StatusCode::UNAUTHORIZED,
                ApiError {
                    error: error::codes::UNAUTHORIZED.to_string(),
                    error_code: None,
                    message,
                    field: None,
                    received: None,
                    request_id,
                    docs_hint,
                },
            ),
            AppError::Forbidden {
                message,
                error_code,
                docs_hint,
            } => (
                StatusCode::FORBIDDEN,
                ApiError {
                    error: error::codes::FORBIDDEN.to_string(),
                    error_code,
                    message,
                    field: None,
                    received: None,
                    request_id,
                    docs_hint,
                },
            ),
            AppError::NotFound { resource } => (
                StatusCode::NOT_FOUND,
                ApiError {
                    error: error::codes::NOT_FOUND.to_string(),
                    error_code: None,
                    message: format!("{resource} not found"),
                    field: None,
                    received: None,
                    request_id,
                    docs_hint: None,
                },
            ),
            AppError::Conflict { message } => (
                StatusCode::CONFLICT,
                ApiError {
                    error: error::codes::CONFLICT.to_string(),
                    error_code: None,
                    message,
                    field: None,
                    received: None,
                    request_id,
                    docs_hint: None,
                },
            ),
            AppError::Database(err) => {
                tracing::error!("Database error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    internal_error_body(request_id),
                )
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    internal_error_body(request_id),
                )
            }
        };

        (status, Json(api_error)).into_response()
    }
}

fn internal_error_body(request_id: String) -> ApiError {
    ApiError {
        error: error::codes::INTERNAL_ERROR.to_string(),
        error_code: None,
        message: "An internal error occurred".to_string(),
        field: None,
        received: None,
        request_id,
        docs_hint: None,
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err)
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(err) => AppError::Database(err),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<TurnError> for AppError {
    fn from(err: TurnError) -> Self {
        match err {
            // The reason stays in the logs; callers only learn that access was refused.
            TurnError::Authorization(reason) => {
                tracing::warn!(reason = %reason, "turn refused");
                AppError::Forbidden {
                    message: "This conversation is not available with the supplied credentials."
                        .to_string(),
                    error_code: None,
                    docs_hint: None,
                }
            }
            TurnError::ActionForbidden => AppError::Forbidden {
                message: "Actions are not available in this conversation.".to_string(),
                error_code: Some(error::codes::ACTION_FORBIDDEN.to_string()),
                docs_hint: None,
            },
            TurnError::ActionMissingParams { .. } => AppError::Validation {
                message: "The action needs more details before it can run.".to_string(),
                field: None,
                received: None,
                docs_hint: None,
            },
            other => AppError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_failures_map_to_forbidden_without_reason() {
        let err: AppError = TurnError::Authorization("session belongs to other owner".into()).into();
        match err {
            AppError::Forbidden { message, .. } => assert!(!message.contains("owner")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn forbidden_action_carries_domain_code() {
        let response = AppError::from(TurnError::ActionForbidden).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}

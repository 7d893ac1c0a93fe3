//! JSON body extractor whose rejections render as structured `AppError`s
//! instead of axum's plain-text 422.

use axum::{
    Json,
    extract::{FromRequest, Request, rejection::JsonRejection},
};

use crate::error::AppError;

pub struct AppJson<T>(pub T);

impl<S, T> FromRequest<S> for AppJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(AppJson(value)),
            Err(rejection) => Err(map_json_rejection(&rejection.body_text())),
        }
    }
}

fn map_json_rejection(body_text: &str) -> AppError {
    AppError::Validation {
        message: format!("Invalid request body: {body_text}"),
        field: Some(field_from_serde_message(body_text).unwrap_or_else(|| "body".to_string())),
        received: None,
        docs_hint: Some(
            "Check the request body against the schema at /api-doc/openapi.json.".to_string(),
        ),
    }
}

/// Field name from serde's "missing field `x`" / "unknown field `x`" messages.
fn field_from_serde_message(msg: &str) -> Option<String> {
    ["missing field `", "unknown field `"]
        .iter()
        .find_map(|pattern| {
            let start = msg.find(pattern)? + pattern.len();
            let rest = &msg[start..];
            rest.find('`').map(|end| rest[..end].to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_missing_field_name() {
        let msg = "Failed to deserialize the JSON body: missing field `query` at line 1 column 2";
        assert_eq!(field_from_serde_message(msg), Some("query".to_string()));
    }

    #[test]
    fn extracts_unknown_field_name() {
        let msg = "unknown field `mode`, expected one of `query`, `conversation_id`";
        assert_eq!(field_from_serde_message(msg), Some("mode".to_string()));
    }

    #[test]
    fn generic_errors_point_at_body() {
        match map_json_rejection("invalid type: string, expected u64") {
            AppError::Validation { field, .. } => assert_eq!(field.as_deref(), Some("body")),
            other => panic!("unexpected {other:?}"),
        }
    }
}

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::{FromRequestParts, Request};
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use tower::{Layer, Service, ServiceExt};
use twin_core::auth::{OWNER_KEY_PREFIX, WIDGET_KEY_PREFIX, hash_token, key_prefix};
use twin_core::context::{Principal, Role};

use crate::error::AppError;
use crate::stores::{SessionDirectory, with_timeout};

/// Principal resolved by [`InjectPrincipalLayer`] and read by handlers.
///
/// Requests without credentials resolve to [`Principal::anonymous`]; requests
/// with a bearer token that does not resolve are rejected with 401 so a
/// mistyped key never silently downgrades to a public conversation.
#[derive(Debug, Clone)]
pub struct CallerPrincipal(pub Principal);

/// Marker inserted when a bearer token was presented but did not resolve.
#[derive(Debug, Clone, Copy)]
struct RejectedCredentials;

// --- Tower Layer/Service for principal injection ---

#[derive(Clone)]
pub struct InjectPrincipalLayer {
    sessions: Arc<dyn SessionDirectory>,
    timeout: Duration,
}

impl InjectPrincipalLayer {
    pub fn new(sessions: Arc<dyn SessionDirectory>, timeout: Duration) -> Self {
        Self { sessions, timeout }
    }
}

impl<S> Layer<S> for InjectPrincipalLayer {
    type Service = InjectPrincipalService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InjectPrincipalService {
            inner,
            sessions: self.sessions.clone(),
            timeout: self.timeout,
        }
    }
}

#[derive(Clone)]
pub struct InjectPrincipalService<S> {
    inner: S,
    sessions: Arc<dyn SessionDirectory>,
    timeout: Duration,
}

impl<S> Service<Request> for InjectPrincipalService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let not_ready = self.inner.clone();
        let ready = std::mem::replace(&mut self.inner, not_ready);
        let sessions = self.sessions.clone();
        let timeout = self.timeout;

        // Headers are Send-safe, the body is not.
        let token = extract_bearer_token(&req);

        Box::pin(async move {
            if let Some(token) = token {
                match authenticate_token(&token, sessions.as_ref(), timeout).await {
                    Some(principal) => {
                        req.extensions_mut().insert(CallerPrincipal(principal));
                    }
                    None => {
                        req.extensions_mut().insert(RejectedCredentials);
                    }
                }
            }
            Ok(ready.oneshot(req).await.into_response())
        })
    }
}

fn extract_bearer_token(req: &Request) -> Option<String> {
    let header = req.headers().get("authorization")?.to_str().ok()?;
    header
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_owned())
        .filter(|token| !token.is_empty())
}

/// Resolve a bearer token. Returns None on unknown format, unknown key, or
/// directory failure.
async fn authenticate_token(
    token: &str,
    sessions: &dyn SessionDirectory,
    timeout: Duration,
) -> Option<Principal> {
    if !token.starts_with(OWNER_KEY_PREFIX) && !token.starts_with(WIDGET_KEY_PREFIX) {
        tracing::info!("bearer token with unknown prefix rejected");
        return None;
    }
    match with_timeout(
        timeout,
        "session directory",
        sessions.principal_for_token_hash(&hash_token(token)),
    )
    .await
    {
        Ok(Some(principal)) => Some(principal),
        Ok(None) => {
            tracing::info!(key_prefix = %key_prefix(token), "unknown api key");
            None
        }
        Err(err) => {
            tracing::warn!(key_prefix = %key_prefix(token), error = %err, "api key lookup failed");
            None
        }
    }
}

fn rejected() -> AppError {
    AppError::Unauthorized {
        message: "Invalid or unknown API key".to_string(),
        docs_hint: Some(format!(
            "Use 'Authorization: Bearer <key>' with an owner key ({OWNER_KEY_PREFIX}...) \
             or widget key ({WIDGET_KEY_PREFIX}...), or omit the header for anonymous access."
        )),
    }
}

// --- Extractors (used by handlers) ---

impl<S> FromRequestParts<S> for CallerPrincipal
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if parts.extensions.get::<RejectedCredentials>().is_some() {
            return Err(rejected());
        }
        Ok(parts
            .extensions
            .get::<CallerPrincipal>()
            .cloned()
            .unwrap_or_else(|| CallerPrincipal(Principal::anonymous())))
    }
}

/// An authenticated owner. Anything else is 401 (no credentials) or 403.
#[derive(Debug, Clone)]
pub struct OwnerPrincipal(pub Principal);

impl<S> FromRequestParts<S> for OwnerPrincipal
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let CallerPrincipal(principal) = CallerPrincipal::from_request_parts(parts, state).await?;
        match principal.role {
            Role::Owner => Ok(OwnerPrincipal(principal)),
            Role::Anonymous => Err(AppError::Unauthorized {
                message: "Missing Authorization header".to_string(),
                docs_hint: Some(format!(
                    "This endpoint needs an owner key: 'Authorization: Bearer {OWNER_KEY_PREFIX}...'."
                )),
            }),
            Role::Visitor => Err(AppError::forbidden("Owner credentials required")),
        }
    }
}

use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::CorsLayer;

/// Headers a browser widget may send on a turn request.
const ALLOWED_HEADERS: &[&str] = &[
    "authorization",
    "content-type",
    "x-share-token",
    "x-training-session-id",
    "x-request-id",
];

/// Parse a comma-separated origin list, skipping blanks and invalid values.
fn parse_origins(raw: &str) -> Vec<HeaderValue> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect()
}

/// CORS for embedded widgets and share pages, from `TWIN_CORS_ORIGINS`
/// (default `http://localhost:3000`).
pub fn build_cors_layer() -> CorsLayer {
    let raw =
        std::env::var("TWIN_CORS_ORIGINS").unwrap_or_else(|_| "http://localhost:3000".to_string());
    let origins = parse_origins(&raw);
    if origins.is_empty() {
        tracing::warn!(raw = %raw, "TWIN_CORS_ORIGINS has no valid origins; cross-origin calls will fail");
    }

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(
            ALLOWED_HEADERS
                .iter()
                .copied()
                .map(HeaderName::from_static)
                .collect::<Vec<_>>(),
        )
        .allow_credentials(true)
        .max_age(std::time::Duration::from_secs(3600))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origins_are_trimmed_and_blank_entries_dropped() {
        let origins = parse_origins(" https://a.example , ,https://b.example");
        assert_eq!(origins.len(), 2);
        assert_eq!(origins[0], "https://a.example");
        assert_eq!(origins[1], "https://b.example");
    }
}

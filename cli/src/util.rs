use serde_json::json;

pub fn client() -> reqwest::Client {
    reqwest::Client::new()
}

pub fn exit_error(message: &str, docs_hint: Option<&str>) -> ! {
    let mut err = json!({
        "error": "cli_error",
        "message": message
    });
    if let Some(hint) = docs_hint {
        err["docs_hint"] = json!(hint);
    }
    eprintln!("{}", pretty(&err));
    std::process::exit(4);
}

fn pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Parse `key=value` pairs (for `--pin` / `--filter`).
pub fn parse_pairs(pairs: &[String]) -> Result<serde_json::Map<String, serde_json::Value>, String> {
    let mut map = serde_json::Map::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got '{pair}'"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("empty key in '{pair}'"));
        }
        map.insert(key.to_string(), json!(value.trim()));
    }
    Ok(map)
}

/// Read JSON from a file path or stdin (when path is "-").
pub fn read_json_from_file(path: &str) -> Result<serde_json::Value, String> {
    let raw = if path == "-" {
        std::io::read_to_string(std::io::stdin()).map_err(|e| format!("Failed to read stdin: {e}"))?
    } else {
        std::fs::read_to_string(path).map_err(|e| format!("Failed to read file '{path}': {e}"))?
    };
    serde_json::from_str(&raw).map_err(|e| format!("Invalid JSON in '{path}': {e}"))
}

pub struct ApiCall<'a> {
    pub method: reqwest::Method,
    pub path: String,
    pub token: Option<&'a str>,
    pub body: Option<serde_json::Value>,
    pub headers: Vec<(&'static str, String)>,
}

/// Execute an API request, print the response, return a structured exit code.
///
/// Exit codes: 0=success (2xx), 1=client error (4xx), 2=server error (5xx),
///             3=connection error, 4=usage error
pub async fn api_request(api_url: &str, call: ApiCall<'_>, raw: bool) -> i32 {
    let url = match reqwest::Url::parse(&format!("{}{}", api_url.trim_end_matches('/'), call.path)) {
        Ok(url) => url,
        Err(e) => {
            eprintln!(
                "{}",
                pretty(&json!({
                    "error": "cli_error",
                    "message": format!("Invalid URL: {api_url}{}: {e}", call.path)
                }))
            );
            return 4;
        }
    };
    tracing::debug!(method = %call.method, url = %url, "sending request");

    let mut req = client().request(call.method, url);
    if let Some(token) = call.token {
        req = req.bearer_auth(token);
    }
    for (name, value) in &call.headers {
        req = req.header(*name, value.as_str());
    }
    if let Some(body) = call.body {
        req = req.json(&body);
    }

    let resp = match req.send().await {
        Ok(resp) => resp,
        Err(e) => {
            eprintln!(
                "{}",
                pretty(&json!({
                    "error": "connection_error",
                    "message": format!("{e}"),
                    "docs_hint": "Is the API server running? Check TWIN_API_URL."
                }))
            );
            return 3;
        }
    };

    let status = resp.status().as_u16();
    let exit_code = exit_code_for(status);
    let body: serde_json::Value = match resp.json().await {
        Ok(value) => value,
        Err(e) => json!({"raw_error": format!("Failed to parse response as JSON: {e}")}),
    };

    let formatted = if raw { body.to_string() } else { pretty(&body) };
    if exit_code == 0 {
        println!("{formatted}");
    } else {
        eprintln!("{formatted}");
    }
    exit_code
}

pub fn exit_code_for(status: u16) -> i32 {
    match status {
        200..=299 => 0,
        400..=499 => 1,
        _ => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_split_on_first_equals() {
        let map = parse_pairs(&["goal=ship v2".to_string(), "note=a=b".to_string()]).unwrap();
        assert_eq!(map["goal"], "ship v2");
        assert_eq!(map["note"], "a=b");
        assert!(parse_pairs(&["novalue".to_string()]).is_err());
        assert!(parse_pairs(&["=x".to_string()]).is_err());
    }

    #[test]
    fn exit_codes_follow_status_class() {
        assert_eq!(exit_code_for(200), 0);
        assert_eq!(exit_code_for(403), 1);
        assert_eq!(exit_code_for(503), 2);
    }
}

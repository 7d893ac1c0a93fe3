use clap::{Parser, Subcommand};
use serde_json::json;
use twin_core::auth::{OWNER_KEY_PREFIX, WIDGET_KEY_PREFIX};
use uuid::Uuid;

mod util;

use util::{ApiCall, api_request, exit_error, parse_pairs, read_json_from_file};

#[derive(Parser)]
#[command(name = "twin", version, about = "Persona twin CLI: talk to a twin, approve its actions, teach it")]
struct Cli {
    /// API base URL
    #[arg(long, env = "TWIN_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    /// Owner (twin_sk_...) or widget (twin_wk_...) key; omit for anonymous
    #[arg(long, env = "TWIN_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Print compact JSON
    #[arg(long, global = true)]
    raw: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check API health
    Health,
    /// Send one message to a twin
    Turn {
        twin_id: Uuid,
        query: String,
        /// Continue an existing conversation
        #[arg(long)]
        conversation_id: Option<Uuid>,
        /// Share link token (public share context)
        #[arg(long, env = "TWIN_SHARE_TOKEN", hide_env_values = true)]
        share_token: Option<String>,
        /// Owner training session id
        #[arg(long)]
        training_session: Option<Uuid>,
        /// Calling surface, e.g. chat or training
        #[arg(long, default_value = "chat")]
        origin: String,
        /// Pinned context as key=value (repeatable)
        #[arg(long = "pin")]
        pins: Vec<String>,
        /// Evidence metadata filter as key=value (repeatable)
        #[arg(long = "filter")]
        filters: Vec<String>,
    },
    /// Approve a pending action (owner key required)
    Approve { twin_id: Uuid, action_id: Uuid },
    /// Persona operations
    Persona {
        #[command(subcommand)]
        command: PersonaCommands,
    },
    /// Turn counter snapshot (owner key required)
    Telemetry,
}

#[derive(Subcommand)]
enum PersonaCommands {
    /// Upsert a runtime-learned procedural module inside a training session
    Upsert {
        twin_id: Uuid,
        /// Module JSON file, or "-" for stdin
        #[arg(long)]
        file: String,
        #[arg(long)]
        training_session: Uuid,
    },
}

fn require_owner_key(api_key: Option<&str>) -> &str {
    match api_key {
        Some(key) if key.starts_with(OWNER_KEY_PREFIX) => key,
        Some(key) if key.starts_with(WIDGET_KEY_PREFIX) => exit_error(
            "this command needs an owner key, not a widget key",
            Some("Set --api-key or TWIN_API_KEY to a twin_sk_... key"),
        ),
        _ => exit_error(
            "this command needs an owner key",
            Some("Set --api-key or TWIN_API_KEY to a twin_sk_... key"),
        ),
    }
}

fn build_turn_call<'a>(
    token: Option<&'a str>,
    twin_id: Uuid,
    query: String,
    conversation_id: Option<Uuid>,
    share_token: Option<String>,
    training_session: Option<Uuid>,
    origin: String,
    pins: &[String],
    filters: &[String],
) -> Result<ApiCall<'a>, String> {
    let mut headers = vec![("x-twin-origin", origin)];
    if let Some(token) = share_token {
        headers.push(("x-share-token", token));
    }
    if let Some(session) = training_session {
        headers.push(("x-training-session-id", session.to_string()));
    }
    Ok(ApiCall {
        method: reqwest::Method::POST,
        path: format!("/v1/twins/{twin_id}/turns"),
        token,
        body: Some(json!({
            "query": query,
            "conversation_id": conversation_id,
            "pinned_context": parse_pairs(pins)?,
            "filters": parse_pairs(filters)?,
        })),
        headers,
    })
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "twin=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let api_key = cli.api_key.as_deref();

    let call = match cli.command {
        Commands::Health => ApiCall {
            method: reqwest::Method::GET,
            path: "/health".to_string(),
            token: None,
            body: None,
            headers: Vec::new(),
        },
        Commands::Turn {
            twin_id,
            query,
            conversation_id,
            share_token,
            training_session,
            origin,
            pins,
            filters,
        } => build_turn_call(
            api_key,
            twin_id,
            query,
            conversation_id,
            share_token,
            training_session,
            origin,
            &pins,
            &filters,
        )
        .unwrap_or_else(|e| exit_error(&e, Some("Use --pin key=value / --filter key=value"))),
        Commands::Approve { twin_id, action_id } => ApiCall {
            method: reqwest::Method::POST,
            path: format!("/v1/twins/{twin_id}/actions/{action_id}/approve"),
            token: Some(require_owner_key(api_key)),
            body: None,
            headers: Vec::new(),
        },
        Commands::Persona {
            command:
                PersonaCommands::Upsert {
                    twin_id,
                    file,
                    training_session,
                },
        } => {
            let module = read_json_from_file(&file).unwrap_or_else(|e| exit_error(&e, None));
            ApiCall {
                method: reqwest::Method::PUT,
                path: format!("/v1/twins/{twin_id}/persona/modules"),
                token: Some(require_owner_key(api_key)),
                body: Some(module),
                headers: vec![("x-training-session-id", training_session.to_string())],
            }
        }
        Commands::Telemetry => ApiCall {
            method: reqwest::Method::GET,
            path: "/v1/telemetry/turns".to_string(),
            token: Some(require_owner_key(api_key)),
            body: None,
            headers: Vec::new(),
        },
    };

    let code = api_request(&cli.api_url, call, cli.raw).await;
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_call_carries_context_headers_and_pins() {
        let twin_id = Uuid::now_v7();
        let call = build_turn_call(
            None,
            twin_id,
            "Make a plan".to_string(),
            None,
            Some("share-abc".to_string()),
            None,
            "chat".to_string(),
            &["goal=ship v2".to_string()],
            &[],
        )
        .unwrap();
        assert_eq!(call.path, format!("/v1/twins/{twin_id}/turns"));
        assert!(call.headers.contains(&("x-share-token", "share-abc".to_string())));
        let body = call.body.unwrap();
        assert_eq!(body["pinned_context"]["goal"], "ship v2");
        assert_eq!(body["query"], "Make a plan");
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}

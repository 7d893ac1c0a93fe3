use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod auth;
mod config;
mod error;
mod extract;
mod llm;
mod middleware;
mod routes;
mod state;
mod stores;
mod turn;

use crate::config::{PipelineConfig, StoreBackend};
use crate::llm::{HttpLlmProvider, LlmProvider, UnconfiguredLlm};
use crate::stores::http::{HttpActionConnector, HttpEvidenceStore, UnconfiguredConnector};
use crate::stores::memory::MemoryStore;
use crate::stores::postgres::PgStore;
use crate::stores::{ActionConnector, EvidenceStore, Stores};
use crate::turn::TurnEngine;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Persona Twin API",
        version = "0.1.0",
        description = "Conversational twin of a person: grounded answers, teaching questions and owner-approved actions."
    ),
    paths(
        routes::health::health_check,
        routes::turns::create_turn,
        routes::actions::approve_action,
        routes::persona::upsert_module,
        routes::telemetry::turn_telemetry,
    ),
    components(schemas(
        HealthResponse,
        twin_core::error::ApiError,
        twin_core::context::InteractionContextKind,
        twin_core::actions::ActionPlan,
        twin_core::actions::ActionStatus,
        twin_core::actions::ActionType,
        twin_core::routing::RoutingDecision,
        twin_core::routing::RoutingAction,
        twin_core::routing::Workflow,
        twin_core::judge::JudgeResult,
        twin_core::judge::JudgeVerdict,
        twin_core::answerability::AnswerabilityState,
        twin_core::evidence::RetrievalStats,
        twin_core::evidence::RetrievalPath,
        twin_core::persona::ProceduralModule,
        routes::turns::CreateTurnRequest,
        routes::persona::ModuleUpsertResponse,
        turn::TurnResponse,
        turn::TurnDebugSnapshot,
        turn::planner::PlannerAction,
        turn::telemetry::TelemetrySnapshot,
    )),
    modifiers(&SecurityAddon)
)]
struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            utoipa::openapi::security::SecurityScheme::Http(
                utoipa::openapi::security::Http::new(
                    utoipa::openapi::security::HttpAuthScheme::Bearer,
                ),
            ),
        );
    }
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub backend: String,
}

fn env_url(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Build the store seams for the configured backend. HTTP collaborators
/// override the evidence and connector seams when their URLs are set.
async fn build_stores() -> (Stores, Option<PgStore>) {
    let (mut stores, pg) = match StoreBackend::from_env() {
        StoreBackend::Memory => {
            let memory = Arc::new(MemoryStore::new());
            if let Some(path) = env_url("TWIN_MEMORY_FIXTURE") {
                memory
                    .load_fixture(&path)
                    .await
                    .expect("Failed to load TWIN_MEMORY_FIXTURE");
                tracing::info!(path = %path, "memory fixture loaded");
            }
            tracing::warn!("using in-memory stores; data is lost on restart");
            (Stores::in_memory(memory), None)
        }
        StoreBackend::Postgres => {
            let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
            let pool = PgPoolOptions::new()
                .max_connections(20)
                .connect(&database_url)
                .await
                .expect("Failed to connect to database");
            let pg = PgStore::new(pool);
            let shared = Arc::new(pg.clone());
            let stores = Stores {
                evidence: shared.clone(),
                owner_memory: shared.clone(),
                verified_answers: shared.clone(),
                persona: shared.clone(),
                sessions: shared.clone(),
                audit: shared.clone(),
                history: shared,
                connector: Arc::new(UnconfiguredConnector),
            };
            (stores, Some(pg))
        }
    };

    if let Some(url) = env_url("TWIN_EVIDENCE_URL") {
        tracing::info!(url = %url, "using HTTP evidence store");
        stores.evidence = Arc::new(HttpEvidenceStore::new(url)) as Arc<dyn EvidenceStore>;
    }
    if let Some(url) = env_url("TWIN_ACTION_URL") {
        tracing::info!(url = %url, "using HTTP action connector");
        stores.connector = Arc::new(HttpActionConnector::new(url)) as Arc<dyn ActionConnector>;
    }
    (stores, pg)
}

fn build_llm() -> Arc<dyn LlmProvider> {
    match env_url("TWIN_LLM_URL") {
        Some(url) => {
            tracing::info!(url = %url, "using HTTP LLM provider");
            Arc::new(HttpLlmProvider::new(url, env_url("TWIN_LLM_API_KEY")))
        }
        None => {
            tracing::warn!("TWIN_LLM_URL not set; answers fall back to the uncertainty message");
            Arc::new(UnconfiguredLlm)
        }
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "twin_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = PipelineConfig::from_env();
    let (stores, pg) = build_stores().await;
    let sessions = stores.sessions.clone();
    let engine = Arc::new(TurnEngine::new(config.clone(), stores, build_llm()));
    let app_state = state::AppState { engine, pg };

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes::health::router())
        .merge(routes::turns::router().layer(middleware::rate_limit::turns_layer()))
        .merge(routes::actions::router().layer(middleware::rate_limit::owner_layer()))
        .merge(routes::persona::router().layer(middleware::rate_limit::owner_layer()))
        .merge(routes::telemetry::router().layer(middleware::rate_limit::owner_layer()))
        .layer(auth::InjectPrincipalLayer::new(sessions, config.store_timeout))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(middleware::cors::build_cors_layer()),
        )
        .with_state(app_state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Twin API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listener");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Server error");
}

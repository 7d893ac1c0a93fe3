use std::sync::Arc;

use crate::stores::postgres::PgStore;
use crate::turn::TurnEngine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<TurnEngine>,
    /// Set when the postgres backend is active; health checks ping it.
    pub pg: Option<PgStore>,
}

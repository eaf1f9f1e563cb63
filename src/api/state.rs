use std::sync::Arc;

use crate::orchestrator::Orchestrator;
use crate::storage::SqliteMetricsRepository;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Write side for `POST /metrics`.
    pub metrics: SqliteMetricsRepository,
    pub environment: String,
}

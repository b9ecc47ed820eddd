//! Application state for the API server.

use std::sync::Arc;

use healmate_coordinator::{CoordinatorConfig, Orchestrator};

use crate::auth::ApiKeyConfig;

/// Shared application state for the API server.
pub struct AppState {
    /// The orchestrator that handles every turn
    pub orchestrator: Arc<Orchestrator>,

    /// Bearer key required on `/api/*` routes, when set
    pub api_key: Option<ApiKeyConfig>,

    /// Server start time (for health checks)
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            api_key: None,
            start_time: std::time::Instant::now(),
        }
    }

    /// Build the production orchestrator from configuration.
    pub fn from_config(config: &CoordinatorConfig) -> anyhow::Result<Self> {
        let orchestrator = Orchestrator::from_config(config)?;
        Ok(Self::new(Arc::new(orchestrator)))
    }

    pub fn with_api_key(mut self, api_key: ApiKeyConfig) -> Self {
        self.api_key = Some(api_key);
        self
    }

    /// Get the uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

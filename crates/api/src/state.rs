//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use storyforge_metering::MeteringService;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub metering: Arc<MeteringService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        Self {
            config,
            metering: Arc::new(MeteringService::postgres(pool)),
        }
    }

    /// State over an explicit service (tests use the in-memory backend)
    pub fn with_service(service: MeteringService, config: Config) -> Self {
        Self {
            config,
            metering: Arc::new(service),
        }
    }
}

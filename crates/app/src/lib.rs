//! Storyreel application composition root
//!
//! Wires the in-memory store, event hub, provider backend and scheduler
//! together and composes the domain routers into a single application.

use std::sync::Arc;

use axum::Router;

use storyreel_common::Config;
use storyreel_jobs::{AuthConfig, EngineLimits, EventHub, JobsState, MemoryStore, Scheduler};
use storyreel_provider::{Provider, ProviderFactory};

/// Create the main application router with all routes
pub fn create_app(config: &Config) -> Result<Router, anyhow::Error> {
    let store = Arc::new(MemoryStore::new());
    let hub = Arc::new(EventHub::new());

    let provider: Arc<dyn Provider> = Arc::from(
        ProviderFactory::create(&config.provider)
            .map_err(|e| anyhow::anyhow!("Failed to create provider: {}", e))?,
    );

    let limits = EngineLimits {
        max_concurrent_tasks: config.max_concurrent_tasks,
        max_user_jobs: config.max_user_jobs,
        max_scene_workers: config.max_scene_workers,
    };
    let scheduler = Scheduler::new(Arc::clone(&store), Arc::clone(&hub), provider, limits);

    let jobs_state = JobsState {
        store,
        hub,
        scheduler,
        auth: AuthConfig {
            jwt_secret: config.jwt_secret.clone(),
        },
    };

    let app = Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(storyreel_jobs::routes().with_state(jobs_state));

    Ok(app)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

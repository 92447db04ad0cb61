//! Configuration management following 12-factor app principles
//!
//! All configuration is loaded from environment variables to ensure
//! clean separation between code and config.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Default global cap on concurrent provider calls.
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 20;
/// Default per-user cap on simultaneously running jobs.
pub const DEFAULT_MAX_USER_JOBS: usize = 2;
/// Default per-job cap on concurrent scene workers.
pub const DEFAULT_MAX_SCENE_WORKERS: usize = 6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Secret for validating bearer tokens (issuance happens upstream)
    pub jwt_secret: String,

    /// Generative backend selection ("mock" is the only built-in)
    pub provider: String,

    /// Engine concurrency knobs
    pub max_concurrent_tasks: usize,
    pub max_user_jobs: usize,
    pub max_scene_workers: usize,

    /// Runtime configuration
    pub rust_log: String,
    pub port: u16,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if it exists

        let config = Self {
            jwt_secret: env::var("JWT_SECRET")
                .map_err(|_| anyhow::anyhow!("JWT_SECRET is required"))?,

            provider: env::var("PROVIDER").unwrap_or_else(|_| "mock".to_string()),

            max_concurrent_tasks: knob("MAX_CONCURRENT_TASKS", DEFAULT_MAX_CONCURRENT_TASKS),
            max_user_jobs: knob("MAX_USER_JOBS", DEFAULT_MAX_USER_JOBS),
            max_scene_workers: knob("MAX_SCENE_WORKERS", DEFAULT_MAX_SCENE_WORKERS),

            rust_log: env::var("RUST_LOG").unwrap_or_else(|_| "storyreel=debug".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .unwrap_or(3000),
        };

        Ok(config)
    }
}

/// Read a concurrency knob from the environment.
///
/// Unset, unparsable, and zero values all coerce to the default: a knob of
/// zero would deadlock the engine, so it is treated as misconfiguration.
fn knob(key: &str, default: usize) -> usize {
    match env::var(key) {
        Ok(v) => match v.parse::<usize>() {
            Ok(n) if n >= 1 => n,
            _ => default,
        },
        Err(_) => default,
    }
}

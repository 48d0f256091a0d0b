//! Server configuration from environment.

use std::env;
use std::time::Duration;

use dispatch_core::OptimizerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_path: String,
    pub database_max_connections: u32,
    pub redis_url: Option<String>,
    pub secret_key: String,
    pub admin_token: String,
    pub allowed_hosts: Vec<String>,
    pub allowed_origins: Vec<String>,
    pub retry_count: u32,
    pub retry_delay_s: u64,
    pub worker_concurrency: usize,
    pub rate_limit_enabled: bool,
    pub rate_limit_rps: u32,
    pub trust_proxy: bool,
    pub optimizer: OptimizerConfig,
    pub environment: Environment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Config {
    pub fn from_env() -> Self {
        let environment = match env::var("DISPATCH_ENV").unwrap_or_default().to_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        };

        let optimizer = OptimizerConfig {
            grid_resolution_deg: env_f64("GRID_RESOLUTION", 0.001),
            altitude_step_m: env_f64("ALTITUDE_STEP", 20.0),
            min_altitude_m: env_f64("MIN_ALTITUDE", 50.0),
            max_altitude_m: env_f64("MAX_ALTITUDE", 400.0),
            min_terrain_clearance_m: env_f64("MIN_TERRAIN_CLEARANCE", 30.0),
            safety_buffer_m: env_f64("SAFETY_BUFFER", 100.0),
            search_iteration_cap: env::var("SEARCH_ITERATION_CAP")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10_000),
            search_wall_clock_cap: Duration::from_secs(
                env::var("SEARCH_WALL_CLOCK_CAP_S").ok().and_then(|s| s.parse().ok()).unwrap_or(5),
            ),
            cache_ttl_s: env::var("CACHE_TTL_S").ok().and_then(|s| s.parse().ok()).unwrap_or(3600),
            cache_max_entries: env::var("CACHE_MAX_ENTRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2048),
        };

        Self {
            server_port: env::var("DISPATCH_PORT").ok().and_then(|s| s.parse().ok()).unwrap_or(3000),
            database_path: env::var("DB_PATH").unwrap_or_else(|_| "data/dispatch.db".to_string()),
            database_max_connections: env::var("DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
            redis_url: env::var("REDIS_URL").ok().filter(|s| !s.trim().is_empty()),
            secret_key: env::var("SECRET_KEY").unwrap_or_else(|_| "change-me-secret-key".to_string()),
            admin_token: env::var("DISPATCH_ADMIN_TOKEN").unwrap_or_else(|_| "change-me-admin".to_string()),
            allowed_hosts: split_csv(env::var("ALLOWED_HOSTS").unwrap_or_default()),
            allowed_origins: split_csv(env::var("CORS_ALLOWED_ORIGINS").unwrap_or_default()),
            retry_count: env::var("RETRY_COUNT").ok().and_then(|s| s.parse().ok()).unwrap_or(3),
            retry_delay_s: env::var("RETRY_DELAY_S").ok().and_then(|s| s.parse().ok()).unwrap_or(60),
            worker_concurrency: env::var("WORKER_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(4),
            rate_limit_enabled: env::var("RATE_LIMIT_ENABLED").ok().and_then(|s| s.parse().ok()).unwrap_or(true),
            rate_limit_rps: env::var("RATE_LIMIT_RPS").ok().and_then(|s| s.parse().ok()).unwrap_or(50),
            trust_proxy: env::var("TRUST_PROXY").ok().and_then(|s| s.parse().ok()).unwrap_or(false),
            optimizer,
            environment,
        }
    }

    pub fn is_development(&self) -> bool {
        self.environment == Environment::Development
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn split_csv(value: String) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

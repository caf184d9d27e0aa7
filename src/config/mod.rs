use crate::{Result, SpiralError};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub api: ApiConfig,
    pub workflow: WorkflowConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub base_url: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub enable_auth: bool,
    pub allowed_origins: Vec<String>,
}

/// Defaults seeded for `WorkflowSettings` (§3); the running settings singleton
/// lives in the Store and can be updated at runtime — these are only the
/// process's initial values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub first_activity_ack_timeout_ms: u64,
    pub max_rework_cycles: u32,
}

impl Config {
    pub fn load() -> Result<Self> {
        match dotenv() {
            Ok(path) => tracing::info!("Loaded .env file from: {:?}", path),
            Err(e) => tracing::warn!("Could not load .env file: {}", e),
        }

        let gateway = GatewayConfig {
            base_url: env::var("MC_GATEWAY_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:4000".to_string()),
            namespace: env::var("MC_GATEWAY_NAMESPACE")
                .unwrap_or_else(|_| "mission-control".to_string()),
        };

        // SECURITY: Authentication is always enabled; a configured API key is required.
        let api_key = env::var("API_KEY").ok();

        match &api_key {
            Some(key) if key.trim().is_empty() => {
                tracing::error!("SECURITY ERROR: API_KEY is blank");
                tracing::error!("Set API_KEY to a secure value: openssl rand -hex 32");
                return Err(SpiralError::ConfigurationError(
                    "API key is required and cannot be blank".to_string(),
                ));
            }
            None => {
                tracing::error!("SECURITY ERROR: API_KEY environment variable not set");
                tracing::error!("Generate and set API_KEY: openssl rand -hex 32");
                return Err(SpiralError::ConfigurationError(
                    "API key is required for security".to_string(),
                ));
            }
            Some(key) if key.len() < 32 => {
                tracing::error!("SECURITY ERROR: API key is too short (minimum 32 characters)");
                tracing::error!("Generate a secure key with: openssl rand -hex 32");
                return Err(SpiralError::ConfigurationError(
                    "API key must be at least 32 characters for security".to_string(),
                ));
            }
            Some(_) => {
                tracing::info!("API authentication configured with secure key");
            }
        }

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let api = ApiConfig {
            host: env::var("API_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .unwrap_or(3000),
            api_key,
            enable_auth: true,
            allowed_origins,
        };

        let workflow = WorkflowConfig {
            first_activity_ack_timeout_ms: crate::constants::first_activity_ack_timeout_ms(),
            max_rework_cycles: env::var("MC_MAX_REWORK_CYCLES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3)
                .min(crate::constants::MAX_REWORK_CYCLES_CEILING),
        };

        Ok(Config {
            gateway,
            api,
            workflow,
        })
    }
}

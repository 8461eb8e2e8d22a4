use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ClerkConfig {
    pub secret_key: String,
    pub api_url: String,
    pub webhook_secret: Option<String>,
    pub timeout_secs: u64,
    pub profile_cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub clerk: ClerkConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
        let max_connections = env_parse("DB_MAX_CONNECTIONS").unwrap_or(10);
        let clerk = ClerkConfig {
            secret_key: std::env::var("CLERK_SECRET_KEY").context("CLERK_SECRET_KEY is not set")?,
            api_url: std::env::var("CLERK_API_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| "https://api.clerk.com/v1".into()),
            webhook_secret: std::env::var("CLERK_WEBHOOK_SECRET")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            timeout_secs: env_parse("CLERK_TIMEOUT_SECS").unwrap_or(5),
            profile_cache_ttl_secs: env_parse("CLERK_PROFILE_CACHE_TTL_SECS").unwrap_or(300),
        };
        Ok(Self {
            database_url,
            max_connections,
            clerk,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

// Server configuration loaded from environment variables.
// Decision: DATABASE_URL is optional; without it every collaborator runs in memory
// Decision: JWT_SECRET is mandatory in production, a fixed development secret otherwise

use anyhow::{bail, Result};

const DEV_JWT_SECRET: &str = "vigil-development-secret";

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub http_addr: String,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub jwt_secret: String,
    pub environment: String,
    pub cors_origins: Vec<String>,
    /// Prefix for the /v1 routes, e.g. "/api"
    pub api_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:9000".to_string(),
            database_url: None,
            db_max_connections: 10,
            jwt_secret: DEV_JWT_SECRET.to_string(),
            environment: "development".to_string(),
            cors_origins: Vec::new(),
            api_prefix: String::new(),
        }
    }
}

impl ServerConfig {
    /// Environment variables:
    /// - `VIGIL_HTTP_ADDR` (default: 0.0.0.0:9000)
    /// - `DATABASE_URL` (optional)
    /// - `DATABASE_MAX_CONNECTIONS` (default: 10)
    /// - `JWT_SECRET` (required when `VIGIL_ENV=production`)
    /// - `VIGIL_ENV` (default: development)
    /// - `CORS_ALLOWED_ORIGINS` (comma separated)
    /// - `API_PREFIX`
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let environment = std::env::var("VIGIL_ENV").unwrap_or(defaults.environment);
        let jwt_secret = match std::env::var("JWT_SECRET").ok().filter(|s| !s.is_empty()) {
            Some(secret) => secret,
            None if environment == "production" => {
                bail!("JWT_SECRET must be set when VIGIL_ENV=production")
            }
            None => defaults.jwt_secret,
        };

        Ok(Self {
            http_addr: std::env::var("VIGIL_HTTP_ADDR").unwrap_or(defaults.http_addr),
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            db_max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.db_max_connections),
            jwt_secret,
            environment,
            cors_origins: parse_origins(std::env::var("CORS_ALLOWED_ORIGINS").ok().as_deref()),
            api_prefix: std::env::var("API_PREFIX").unwrap_or_default(),
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn uses_dev_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

fn parse_origins(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_origins() {
        assert_eq!(
            parse_origins(Some("https://a.example, https://b.example,,")),
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
        assert!(parse_origins(None).is_empty());
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert!(!config.is_production());
        assert!(config.uses_dev_secret());
        assert!(config.database_url.is_none());
    }
}

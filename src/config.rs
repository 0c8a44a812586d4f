use std::env;

use anyhow::Context;

use crate::services::aggregate_service::RecomputePolicy;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub jwt_secret: String,
    pub jwt_ttl_hours: i64,
    pub stripe_secret_key: String,
    pub stripe_api_base: String,
    pub currency: String,
    pub recompute_policy: RecomputePolicy,
    pub recompute_retries: u32,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = database_url()?;
        let jwt_secret = env::var("JWT_SECRET").context("JWT_SECRET is not set")?;
        let stripe_secret_key =
            env::var("STRIPE_SECRET_KEY").context("STRIPE_SECRET_KEY is not set")?;
        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(3000);
        let jwt_ttl_hours = env::var("JWT_TTL_HOURS")
            .ok()
            .and_then(|h| h.parse::<i64>().ok())
            .unwrap_or(24);
        let stripe_api_base = env::var("STRIPE_API_BASE")
            .unwrap_or_else(|_| "https://api.stripe.com".to_string());
        let currency = env::var("PAYMENT_CURRENCY").unwrap_or_else(|_| "usd".to_string());
        let recompute_policy = match env::var("AGGREGATE_RECOMPUTE") {
            Ok(raw) => raw.parse::<RecomputePolicy>()?,
            Err(_) => RecomputePolicy::default(),
        };
        let recompute_retries = env::var("AGGREGATE_RETRIES")
            .ok()
            .and_then(|r| r.parse::<u32>().ok())
            .unwrap_or(3);
        Ok(Self {
            port,
            database_url,
            host,
            jwt_secret,
            jwt_ttl_hours,
            stripe_secret_key,
            stripe_api_base,
            currency,
            recompute_policy,
            recompute_retries,
        })
    }
}

/// Just the connection string, for the maintenance binaries.
pub fn database_url() -> anyhow::Result<String> {
    env::var("DATABASE_URL").context("DATABASE_URL is not set")
}

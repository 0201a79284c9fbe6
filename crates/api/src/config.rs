//! API server configuration

use anyhow::Context;

/// Server configuration loaded from the environment
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    /// Shared secret authenticating the job-trigger endpoints
    pub job_trigger_secret: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let job_trigger_secret =
            std::env::var("JOB_TRIGGER_SECRET").context("JOB_TRIGGER_SECRET must be set")?;
        if job_trigger_secret.len() < 32 {
            anyhow::bail!("JOB_TRIGGER_SECRET must be at least 32 characters");
        }

        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .context("PORT must be a valid port number")?;

        Ok(Self {
            database_url,
            host,
            port,
            job_trigger_secret,
        })
    }
}

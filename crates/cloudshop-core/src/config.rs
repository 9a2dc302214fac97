//! Configuration and data directory management.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};

/// Knobs for a single orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Maximum number of resources provisioned at the same time.
    pub concurrency: usize,
    /// Upper bound on a single capability invocation.
    pub capability_timeout: Duration,
    /// Age after which a `created` job (or an order lock) is considered abandoned.
    pub grace_period: Duration,
}

impl OrchestratorSettings {
    /// A `created` job younger than the grace period may still be inside its
    /// capability call, so the grace period must outlast the call timeout.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config(
                "CLOUDSHOP_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        if self.grace_period <= self.capability_timeout {
            return Err(Error::Config(format!(
                "CLOUDSHOP_JOB_GRACE_SECS ({}s) must exceed CLOUDSHOP_CAPABILITY_TIMEOUT_SECS ({}s)",
                self.grace_period.as_secs(),
                self.capability_timeout.as_secs()
            )));
        }
        Ok(())
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            capability_timeout: Duration::from_secs(300),
            grace_period: Duration::from_secs(900),
        }
    }
}

/// Top-level CloudShop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudShopConfig {
    /// HTTP server port.
    pub port: u16,
    /// Root data directory (e.g., `data/`).
    pub data_dir: PathBuf,
    /// Document store location (`data/cloudshop.db` unless overridden).
    pub db_path: PathBuf,
    /// Region used when an order does not carry one.
    pub default_region: String,
    /// Base URL the resource creation endpoints (`template.api`) are joined onto.
    pub capability_base_url: String,
    pub orchestrator: OrchestratorSettings,
}

impl CloudShopConfig {
    /// Create configuration from environment and defaults.
    pub fn from_env(data_dir: impl AsRef<Path>) -> Result<Self> {
        Self::from_vars(data_dir, |key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_vars<F>(data_dir: impl AsRef<Path>, var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let port = parse_var(&var, "PORT")?.unwrap_or(3000);
        let db_path = var("CLOUDSHOP_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("cloudshop.db"));
        let default_region = var("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string());
        let capability_base_url = var("CLOUDSHOP_CAPABILITY_URL")
            .unwrap_or_else(|| format!("http://localhost:{}", port));

        let defaults = OrchestratorSettings::default();
        let concurrency = parse_var::<usize, _>(&var, "CLOUDSHOP_CONCURRENCY")?
            .unwrap_or(defaults.concurrency);
        let capability_timeout = parse_var(&var, "CLOUDSHOP_CAPABILITY_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.capability_timeout);
        let grace_period = parse_var(&var, "CLOUDSHOP_JOB_GRACE_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.grace_period);
        let orchestrator = OrchestratorSettings {
            concurrency,
            capability_timeout,
            grace_period,
        };
        orchestrator.validate()?;

        debug!(
            "Configuration loaded: port={}, db={}, concurrency={}",
            port,
            db_path.display(),
            concurrency
        );

        Ok(Self {
            port,
            data_dir,
            db_path,
            default_region,
            capability_base_url,
            orchestrator,
        })
    }
}

fn parse_var<T, F>(var: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} has an invalid value: {:?}", key, raw))),
        None => Ok(None),
    }
}

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::orchestrator::JobOrchestrator;
use crate::transport::{FalHttpTransport, SystemClock};

pub const DEFAULT_QUEUE_BASE: &str = "https://queue.fal.run";
pub const DEFAULT_DIRECT_BASE: &str = "https://fal.run";
pub const DEFAULT_STORAGE_INITIATE_URL: &str = "https://rest.alpha.fal.ai/storage/upload/initiate";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1800);

#[derive(Debug, Clone, PartialEq)]
pub struct FalConfig {
    pub api_key: Option<String>,
    pub queue_base: String,
    pub direct_base: String,
    pub storage_initiate_url: String,
    pub poll_interval: Duration,
}

impl Default for FalConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            queue_base: DEFAULT_QUEUE_BASE.to_string(),
            direct_base: DEFAULT_DIRECT_BASE.to_string(),
            storage_initiate_url: DEFAULT_STORAGE_INITIATE_URL.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl FalConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Blank values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let base = |key: &str, default: &str| {
            read(key)
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| default.to_string())
        };
        Self {
            api_key: read("FAL_KEY").or_else(|| read("FAL_API_KEY")),
            queue_base: base("FAL_QUEUE_BASE", DEFAULT_QUEUE_BASE),
            direct_base: base("FAL_RUN_BASE", DEFAULT_DIRECT_BASE),
            storage_initiate_url: read("FAL_STORAGE_INITIATE_URL")
                .unwrap_or_else(|| DEFAULT_STORAGE_INITIATE_URL.to_string()),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        if let Some(key) = api_key
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
        {
            self.api_key = Some(key);
        }
        self
    }

    pub fn require_api_key(&self) -> Result<&str> {
        match self.api_key.as_deref() {
            Some(key) => Ok(key),
            None => bail!("FAL_KEY (or FAL_API_KEY) not set; pass --key"),
        }
    }

    pub fn orchestrator(&self) -> Result<JobOrchestrator> {
        let transport = FalHttpTransport::new(self.require_api_key()?);
        Ok(JobOrchestrator::new(
            Arc::new(transport),
            Arc::new(SystemClock::new()),
            &self.queue_base,
            &self.direct_base,
        )
        .with_poll_interval(self.poll_interval))
    }
}

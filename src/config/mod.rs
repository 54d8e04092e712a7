//! Configuration for trawl

mod crawler;
mod logging;
mod queue;

pub use crawler::{CrawlerConfig, LimitRuleConfig};
pub use logging::{LogFormat, LogLevel, LoggingConfig};
pub use queue::{QueueBackend, QueueConfig};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default user agent for all HTTP requests, robots.txt included
pub const DEFAULT_USER_AGENT: &str = concat!("trawl/", env!("CARGO_PKG_VERSION"));

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file '{}'", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Default configuration rendered as TOML
    pub fn default_toml() -> Result<String> {
        toml::to_string_pretty(&Config::default()).context("Failed to serialize default config")
    }

    /// Validate all configuration fields.
    ///
    /// Collects every error and reports them together.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();
        let crawler = &self.crawler;

        if crawler.user_agent.trim().is_empty() {
            errors.push("crawler.user_agent must not be empty".to_string());
        }
        if crawler.request_timeout_secs == 0 {
            errors.push("crawler.request_timeout_secs must be positive".to_string());
        }
        if crawler.robots_cache_size == 0 {
            errors.push("crawler.robots_cache_size must be positive".to_string());
        }

        for (field, patterns) in [
            ("url_filters", &crawler.url_filters),
            ("disallowed_url_filters", &crawler.disallowed_url_filters),
        ] {
            for pattern in patterns {
                if let Err(e) = Regex::new(pattern) {
                    errors.push(format!("crawler.{} has invalid regex '{}': {}", field, pattern, e));
                }
            }
        }

        for (i, rule) in crawler.limits.iter().enumerate() {
            if rule.domain_regex.is_none() && rule.domain_glob.is_none() {
                errors.push(format!(
                    "crawler.limits[{}] needs domain_regex or domain_glob",
                    i
                ));
            }
            if rule.parallelism == 0 {
                errors.push(format!("crawler.limits[{}].parallelism must be positive", i));
            }
            if let Some(pattern) = &rule.domain_regex {
                if let Err(e) = Regex::new(pattern) {
                    errors.push(format!(
                        "crawler.limits[{}].domain_regex '{}' is invalid: {}",
                        i, pattern, e
                    ));
                }
            }
        }

        if self.queue.threads == 0 {
            errors.push("queue.threads must be positive".to_string());
        }
        if self.queue.max_size == 0 {
            errors.push("queue.max_size must be positive".to_string());
        }
        if self.queue.backend == QueueBackend::Sled && self.queue.path.is_none() {
            errors.push("queue.path is required for the sled backend".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration validation failed:\n  - {}", errors.join("\n  - "));
        }
        Ok(())
    }
}

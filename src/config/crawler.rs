//! Crawler and limit rule configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::DEFAULT_USER_AGENT;
use crate::crawler::LimitRule;

/// Dispatch pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// User agent sent with every request and matched against robots.txt
    pub user_agent: String,
    /// Maximum link depth from the entry request (0 = unlimited)
    pub max_depth: u32,
    /// Only these hosts may be visited (empty = any host)
    pub allowed_domains: Vec<String>,
    /// These hosts are never visited
    pub disallowed_domains: Vec<String>,
    /// URL must match at least one of these regexes (empty = any URL)
    pub url_filters: Vec<String>,
    /// URL must match none of these regexes
    pub disallowed_url_filters: Vec<String>,
    /// Fetch the same request more than once
    pub allow_url_revisit: bool,
    /// Response body cap in bytes; longer bodies are truncated (0 = unlimited)
    pub max_body_size: usize,
    /// Skip robots.txt checks
    pub ignore_robots_txt: bool,
    /// Run fetches as background tasks instead of inline
    pub async_mode: bool,
    /// Deliver responses with status >= 400 to the response hooks
    pub parse_http_error_response: bool,
    /// Per-request timeout (seconds)
    pub request_timeout_secs: u64,
    /// Stop admitting new requests after this many (0 = unlimited)
    pub max_requests: u64,
    /// Directory for the on-disk response cache (unset = no cache)
    pub cache_dir: Option<PathBuf>,
    /// Number of origins whose robots.txt is kept in memory
    pub robots_cache_size: usize,
    /// Per-destination throttling rules, matched in order
    pub limits: Vec<LimitRuleConfig>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_depth: 0,
            allowed_domains: Vec::new(),
            disallowed_domains: Vec::new(),
            url_filters: Vec::new(),
            disallowed_url_filters: Vec::new(),
            allow_url_revisit: false,
            max_body_size: 10 * 1024 * 1024,
            ignore_robots_txt: false,
            async_mode: false,
            parse_http_error_response: false,
            request_timeout_secs: 30,
            max_requests: 0,
            cache_dir: None,
            robots_cache_size: 10_000,
            limits: Vec::new(),
        }
    }
}

impl CrawlerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// TOML form of a [`LimitRule`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitRuleConfig {
    pub domain_regex: Option<String>,
    pub domain_glob: Option<String>,
    pub parallelism: usize,
    pub delay_ms: u64,
    pub random_delay_ms: u64,
}

impl Default for LimitRuleConfig {
    fn default() -> Self {
        Self {
            domain_regex: None,
            domain_glob: None,
            parallelism: 1,
            delay_ms: 0,
            random_delay_ms: 0,
        }
    }
}

impl From<&LimitRuleConfig> for LimitRule {
    fn from(config: &LimitRuleConfig) -> Self {
        LimitRule {
            domain_regex: config.domain_regex.clone(),
            domain_glob: config.domain_glob.clone(),
            parallelism: config.parallelism,
            delay: Duration::from_millis(config.delay_ms),
            random_delay: Duration::from_millis(config.random_delay_ms),
        }
    }
}

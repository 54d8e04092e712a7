//! Per-destination throttling
//!
//! A [`LimitRule`] matches hosts by regex and/or glob and bounds how many
//! fetches to matching hosts may be in flight at once. Releasing a slot
//! sleeps for the rule's delay *before* the slot is freed, so the next
//! fetch admitted under the same rule starts no sooner than `delay` after
//! the previous one finished.

use parking_lot::RwLock;
use rand::Rng;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::CrawlError;

/// Host-matching throttling policy
#[derive(Debug, Clone, PartialEq)]
pub struct LimitRule {
    /// Regular expression matched anywhere in the host
    pub domain_regex: Option<String>,
    /// Glob matched against the whole host (`*` and `?` wildcards)
    pub domain_glob: Option<String>,
    /// Maximum concurrent in-flight fetches for matching hosts
    pub parallelism: usize,
    /// Fixed wait applied after a fetch finishes, before its slot is freed
    pub delay: Duration,
    /// Upper bound of the uniform random jitter added to `delay`
    pub random_delay: Duration,
}

impl LimitRule {
    pub fn glob(pattern: impl Into<String>) -> Self {
        Self {
            domain_glob: Some(pattern.into()),
            ..Self::empty()
        }
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Self {
            domain_regex: Some(pattern.into()),
            ..Self::empty()
        }
    }

    fn empty() -> Self {
        Self {
            domain_regex: None,
            domain_glob: None,
            parallelism: 1,
            delay: Duration::ZERO,
            random_delay: Duration::ZERO,
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_random_delay(mut self, random_delay: Duration) -> Self {
        self.random_delay = random_delay;
        self
    }
}

/// Translate a host glob into an anchored regex
fn glob_to_regex(glob: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            c => pattern.push_str(&regex::escape(&c.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
}

/// A compiled [`LimitRule`] with its admission gate
#[derive(Debug)]
pub struct Limiter {
    rule: LimitRule,
    regex: Option<Regex>,
    glob: Option<Regex>,
    slots: Arc<Semaphore>,
}

impl Limiter {
    pub fn new(rule: LimitRule) -> Result<Self, CrawlError> {
        if rule.domain_regex.is_none() && rule.domain_glob.is_none() {
            return Err(CrawlError::InvalidLimitRule(
                "either domain_regex or domain_glob must be set".to_string(),
            ));
        }
        if rule.parallelism == 0 {
            return Err(CrawlError::InvalidLimitRule(
                "parallelism must be at least 1".to_string(),
            ));
        }

        let regex = rule
            .domain_regex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| CrawlError::InvalidLimitRule(format!("bad domain_regex: {}", e)))?;
        let glob = rule
            .domain_glob
            .as_deref()
            .map(glob_to_regex)
            .transpose()
            .map_err(|e| CrawlError::InvalidLimitRule(format!("bad domain_glob: {}", e)))?;

        Ok(Self {
            slots: Arc::new(Semaphore::new(rule.parallelism)),
            rule,
            regex,
            glob,
        })
    }

    pub fn rule(&self) -> &LimitRule {
        &self.rule
    }

    /// Regex match OR glob match
    pub fn matches(&self, host: &str) -> bool {
        self.regex.as_ref().is_some_and(|r| r.is_match(host))
            || self.glob.as_ref().is_some_and(|g| g.is_match(host))
    }

    /// Wait for a free slot
    pub async fn admit(&self) -> Result<Slot, CrawlError> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| CrawlError::Cancelled)?;

        Ok(Slot {
            permit: Some(permit),
            delay: self.next_delay(),
        })
    }

    /// Slots currently free
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    fn next_delay(&self) -> Duration {
        let jitter = if self.rule.random_delay.is_zero() {
            Duration::ZERO
        } else {
            let max = self.rule.random_delay.as_nanos().min(u64::MAX as u128) as u64;
            Duration::from_nanos(rand::thread_rng().gen_range(0..=max))
        };
        self.rule.delay + jitter
    }
}

/// One unit of a rule's concurrency capacity.
///
/// Call [`Slot::release`] when the fetch finishes. A slot dropped without
/// being released (e.g. the fetch future was cancelled) still waits out its
/// delay on a detached task before freeing capacity.
#[derive(Debug)]
pub struct Slot {
    permit: Option<OwnedSemaphorePermit>,
    delay: Duration,
}

impl Slot {
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Sleep for the rule's delay, then free the slot
    pub async fn release(mut self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.permit.take();
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        if self.delay.is_zero() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let delay = self.delay;
            handle.spawn(async move {
                tokio::time::sleep(delay).await;
                drop(permit);
            });
        }
    }
}

/// Registered limit rules, matched in registration order
#[derive(Debug, Default)]
pub struct Throttle {
    limiters: RwLock<Vec<Arc<Limiter>>>,
}

impl Throttle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and register a rule
    pub fn add_rule(&self, rule: LimitRule) -> Result<(), CrawlError> {
        let limiter = Limiter::new(rule)?;
        self.limiters.write().push(Arc::new(limiter));
        Ok(())
    }

    /// First registered rule whose pattern matches `host`
    pub fn matching(&self, host: &str) -> Option<Arc<Limiter>> {
        self.limiters
            .read()
            .iter()
            .find(|l| l.matches(host))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.limiters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.read().is_empty()
    }
}

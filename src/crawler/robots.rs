//! robots.txt handling
//!
//! Policies are fetched once per origin through the crawl's [`Transport`]
//! (outside any limit rule) and kept in a bounded LRU. A robots.txt that
//! cannot be fetched, or answers with a non-2xx status, allows everything.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

use super::transport::{ExchangeOptions, Transport};
use crate::types::Request;

/// robots.txt files larger than this are truncated before parsing
const MAX_ROBOTS_SIZE: usize = 512 * 1024;

/// Parsed rules of one robots.txt for one user agent
#[derive(Debug, Clone)]
pub struct RobotsPolicy {
    disallow_patterns: Vec<String>,
    allow_patterns: Vec<String>,
    fetched_at: Instant,
    ttl: Duration,
}

impl RobotsPolicy {
    pub fn parse(content: &str, user_agent: &str) -> Self {
        let (disallow_patterns, allow_patterns) = Self::parse_rules(content, user_agent);

        Self {
            disallow_patterns,
            allow_patterns,
            fetched_at: Instant::now(),
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Policy used when robots.txt is missing or unreachable
    pub fn allow_all() -> Self {
        Self {
            disallow_patterns: Vec::new(),
            allow_patterns: Vec::new(),
            fetched_at: Instant::now(),
            ttl: Duration::from_secs(60 * 60),
        }
    }

    /// Longest matching pattern wins; on a tie, allow wins
    pub fn is_allowed(&self, path: &str) -> bool {
        let longest = |patterns: &[String]| {
            patterns
                .iter()
                .filter(|p| Self::path_matches(path, p))
                .map(|p| p.len())
                .max()
                .unwrap_or(0)
        };
        longest(&self.allow_patterns) >= longest(&self.disallow_patterns)
    }

    pub fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < self.ttl
    }

    /// Collect the rules of every group naming `user_agent`, or of the
    /// wildcard groups when none does. A group is a run of consecutive
    /// `User-agent` lines followed by its rule lines.
    fn parse_rules(content: &str, user_agent: &str) -> (Vec<String>, Vec<String>) {
        let mut disallow = Vec::new();
        let mut allow = Vec::new();

        let ua_lower = user_agent.to_lowercase();
        let mut group_applies = false;
        let mut in_agent_lines = false;
        let mut found_specific_agent = false;

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }

            let Some((directive, value)) = line.split_once(':') else {
                continue;
            };
            let directive = directive.trim().to_lowercase();
            let value = value.trim();

            if directive != "user-agent" {
                in_agent_lines = false;
            }

            match directive.as_str() {
                "user-agent" => {
                    if !in_agent_lines {
                        // First agent line of a new group
                        in_agent_lines = true;
                        group_applies = false;
                    }
                    let agent = value.to_lowercase();
                    if agent == "*" {
                        group_applies |= !found_specific_agent;
                    } else if !agent.is_empty() && ua_lower.contains(&agent) {
                        group_applies = true;
                        if !found_specific_agent {
                            // A named group replaces whatever the wildcard groups set
                            found_specific_agent = true;
                            disallow.clear();
                            allow.clear();
                        }
                    }
                }
                "disallow" if group_applies && !value.is_empty() => {
                    disallow.push(value.to_string());
                }
                "allow" if group_applies && !value.is_empty() => {
                    allow.push(value.to_string());
                }
                _ => {}
            }
        }

        (disallow, allow)
    }

    /// Prefix match with `*` wildcards and a trailing `$` anchor
    fn path_matches(path: &str, pattern: &str) -> bool {
        if pattern.is_empty() {
            return false;
        }

        let (pattern, anchored) = match pattern.strip_suffix('$') {
            Some(p) => (p, true),
            None => (pattern, false),
        };

        if !pattern.contains('*') {
            return if anchored {
                path == pattern
            } else {
                path.starts_with(pattern)
            };
        }

        let parts: Vec<&str> = pattern.split('*').collect();
        let mut pos = 0;
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() {
                continue;
            }
            match path[pos..].find(part) {
                Some(found) if i == 0 && found != 0 => return false,
                Some(found) => pos += found + part.len(),
                None => return false,
            }
        }

        if anchored {
            // The last literal must sit at the very end
            let last = parts.last().copied().unwrap_or_default();
            return last.is_empty() || path.ends_with(last);
        }
        true
    }
}

/// Per-origin robots.txt cache
pub struct RobotsCache {
    user_agent: String,
    entries: Mutex<LruCache<String, Arc<RobotsPolicy>>>,
}

impl RobotsCache {
    pub fn new(user_agent: impl Into<String>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            user_agent: user_agent.into(),
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Whether `url` may be fetched, fetching robots.txt on first contact
    pub async fn is_allowed(&self, url: &Url, transport: &dyn Transport) -> bool {
        let policy = self.policy_for(url, transport).await;
        let target = match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        };
        policy.is_allowed(&target)
    }

    /// Install a policy directly, bypassing the fetch
    pub fn insert(&self, origin: &Url, policy: RobotsPolicy) {
        self.entries
            .lock()
            .put(origin.origin().ascii_serialization(), Arc::new(policy));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    async fn policy_for(&self, url: &Url, transport: &dyn Transport) -> Arc<RobotsPolicy> {
        let origin = url.origin().ascii_serialization();
        if let Some(policy) = self.entries.lock().get(&origin) {
            if policy.is_fresh() {
                return Arc::clone(policy);
            }
        }

        let policy = Arc::new(self.fetch(&origin, transport).await);
        self.entries.lock().put(origin, Arc::clone(&policy));
        policy
    }

    async fn fetch(&self, origin: &str, transport: &dyn Transport) -> RobotsPolicy {
        let robots_url = match Url::parse(&format!("{}/robots.txt", origin)) {
            Ok(url) => url,
            Err(_) => return RobotsPolicy::allow_all(),
        };

        let request = Request::get(robots_url).with_header("User-Agent", self.user_agent.as_str());
        let options = ExchangeOptions {
            max_body_size: MAX_ROBOTS_SIZE,
            on_headers: None,
        };

        match transport.perform(&request, &options).await {
            Ok(response) if (200..300).contains(&response.head.status) => {
                let content = String::from_utf8_lossy(&response.body);
                RobotsPolicy::parse(&content, &self.user_agent)
            }
            Ok(response) => {
                debug!("robots.txt for {} returned {}, allowing all", origin, response.head.status);
                RobotsPolicy::allow_all()
            }
            Err(e) => {
                debug!("robots.txt for {} unavailable ({}), allowing all", origin, e);
                RobotsPolicy::allow_all()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::transport::TransportResponse;
    use crate::crawler::CrawlError;
    use crate::types::{Headers, ResponseHead};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_robots_parsing() {
        let content = r#"
User-agent: *
Disallow: /private/
Allow: /private/public/
Crawl-delay: 2

User-agent: TrawlBot
Disallow: /admin/
Crawl-delay: 1
"#;

        let robots = RobotsPolicy::parse(content, "TrawlBot/0.1");

        assert!(robots.is_allowed("/public/page.html"));
        assert!(!robots.is_allowed("/admin/settings"));
        assert!(robots.is_allowed("/private/test"));
    }

    #[test]
    fn test_group_with_several_agent_lines() {
        let content = r#"
User-agent: TrawlBot
User-agent: OtherBot
Disallow: /members/

User-agent: *
Disallow: /
"#;

        let robots = RobotsPolicy::parse(content, "TrawlBot/0.1");
        assert!(!robots.is_allowed("/members/list"));
        assert!(robots.is_allowed("/public/page.html"));

        // Listed second in the same group
        let other = RobotsPolicy::parse(content, "OtherBot");
        assert!(!other.is_allowed("/members/list"));
        assert!(other.is_allowed("/public/page.html"));

        let unnamed = RobotsPolicy::parse(content, "SomeCrawler");
        assert!(!unnamed.is_allowed("/public/page.html"));
    }

    #[test]
    fn test_wildcard_group_after_named_group_is_ignored() {
        let content = r#"
User-agent: *
User-agent: TrawlBot
Disallow: /tmp/

User-agent: *
Disallow: /
"#;

        let robots = RobotsPolicy::parse(content, "TrawlBot");
        assert!(!robots.is_allowed("/tmp/file"));
        assert!(robots.is_allowed("/index.html"));
    }

    #[test]
    fn test_robots_wildcard_group() {
        let content = r#"
User-agent: *
Disallow: /private/
Disallow: /*.pdf$
Allow: /private/readme.txt   # keep this one open
"#;

        let robots = RobotsPolicy::parse(content, "OtherBot");

        assert!(robots.is_allowed("/public/page.html"));
        assert!(!robots.is_allowed("/private/secret"));
        assert!(robots.is_allowed("/private/readme.txt"));
        assert!(!robots.is_allowed("/docs/manual.pdf"));
        assert!(robots.is_allowed("/docs/manual.html"));
    }

    #[test]
    fn test_path_matching() {
        assert!(RobotsPolicy::path_matches("/admin/test", "/admin/"));
        assert!(!RobotsPolicy::path_matches("/public/test", "/admin/"));
        assert!(RobotsPolicy::path_matches("/images/cat.jpg", "/images/*.jpg"));
        assert!(RobotsPolicy::path_matches("/page.html", "/page.html$"));
        assert!(!RobotsPolicy::path_matches("/page.html?query", "/page.html$"));
        assert!(!RobotsPolicy::path_matches("/a.pdf.html", "/*.pdf$"));
    }

    #[test]
    fn test_empty_disallow_allows_everything() {
        let robots = RobotsPolicy::parse("User-agent: *\nDisallow:\n", "TrawlBot");
        assert!(robots.is_allowed("/anything"));
    }

    struct StaticRobots {
        status: u16,
        body: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for StaticRobots {
        async fn perform(
            &self,
            request: &Request,
            _options: &ExchangeOptions<'_>,
        ) -> Result<TransportResponse, CrawlError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(request.url.path(), "/robots.txt");
            Ok(TransportResponse {
                head: ResponseHead {
                    status: self.status,
                    headers: Headers::new(),
                    url: request.url.clone(),
                },
                body: self.body.as_bytes().to_vec(),
            })
        }
    }

    #[tokio::test]
    async fn test_cache_fetches_once_per_origin() {
        let transport = StaticRobots {
            status: 200,
            body: "User-agent: *\nDisallow: /admin\n",
            calls: AtomicUsize::new(0),
        };
        let cache = RobotsCache::new("TrawlBot", 16);

        let open = Url::parse("https://example.com/docs").unwrap();
        let closed = Url::parse("https://example.com/admin/users").unwrap();
        assert!(cache.is_allowed(&open, &transport).await);
        assert!(!cache.is_allowed(&closed, &transport).await);

        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_robots_allows_all() {
        let transport = StaticRobots {
            status: 404,
            body: "User-agent: *\nDisallow: /\n",
            calls: AtomicUsize::new(0),
        };
        let cache = RobotsCache::new("TrawlBot", 16);
        let url = Url::parse("https://example.com/anything").unwrap();
        assert!(cache.is_allowed(&url, &transport).await);
    }
}

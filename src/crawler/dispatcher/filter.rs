//! Admission filters: scheme, domain lists, URL patterns and depth

use regex::Regex;
use std::collections::HashSet;

use super::types::SkipReason;
use crate::config::CrawlerConfig;
use crate::crawler::CrawlError;
use crate::types::Request;

/// Compiled form of the crawler's filter settings
#[derive(Debug, Clone)]
pub(crate) struct UrlFilter {
    allowed_domains: HashSet<String>,
    disallowed_domains: HashSet<String>,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    max_depth: u32,
}

fn compile(patterns: &[String], field: &str) -> Result<Vec<Regex>, CrawlError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| CrawlError::Config(format!("{} '{}': {}", field, p, e)))
        })
        .collect()
}

fn host_set(domains: &[String]) -> HashSet<String> {
    domains.iter().map(|d| d.trim().to_lowercase()).collect()
}

impl UrlFilter {
    pub(crate) fn from_config(config: &CrawlerConfig) -> Result<Self, CrawlError> {
        Ok(Self {
            allowed_domains: host_set(&config.allowed_domains),
            disallowed_domains: host_set(&config.disallowed_domains),
            include: compile(&config.url_filters, "url_filters")?,
            exclude: compile(&config.disallowed_url_filters, "disallowed_url_filters")?,
            max_depth: config.max_depth,
        })
    }

    /// First reason `request` must not be fetched, if any
    pub(crate) fn check(&self, request: &Request) -> Result<(), SkipReason> {
        let url = &request.url;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SkipReason::UrlFiltered);
        }

        let Some(host) = url.host_str() else {
            return Err(SkipReason::ForbiddenDomain);
        };
        let host = host.to_lowercase();
        if self.disallowed_domains.contains(&host) {
            return Err(SkipReason::ForbiddenDomain);
        }
        if !self.allowed_domains.is_empty() && !self.allowed_domains.contains(&host) {
            return Err(SkipReason::ForbiddenDomain);
        }

        let url_str = url.as_str();
        if self.exclude.iter().any(|p| p.is_match(url_str)) {
            return Err(SkipReason::UrlFiltered);
        }
        if !self.include.is_empty() && !self.include.iter().any(|p| p.is_match(url_str)) {
            return Err(SkipReason::UrlFiltered);
        }

        if self.max_depth > 0 && request.depth > self.max_depth {
            return Err(SkipReason::MaxDepth);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(config: CrawlerConfig) -> UrlFilter {
        UrlFilter::from_config(&config).unwrap()
    }

    fn request(url: &str) -> Request {
        Request::parse(url).unwrap()
    }

    #[test]
    fn test_domain_lists() {
        let f = filter(CrawlerConfig {
            allowed_domains: vec!["example.com".into(), "Docs.Example.com".into()],
            disallowed_domains: vec!["docs.example.com".into()],
            ..Default::default()
        });

        assert_eq!(f.check(&request("https://example.com/")), Ok(()));
        assert_eq!(
            f.check(&request("https://docs.example.com/")),
            Err(SkipReason::ForbiddenDomain)
        );
        assert_eq!(
            f.check(&request("https://other.org/")),
            Err(SkipReason::ForbiddenDomain)
        );
    }

    #[test]
    fn test_url_patterns() {
        let f = filter(CrawlerConfig {
            url_filters: vec![r"/blog/".into()],
            disallowed_url_filters: vec![r"\.pdf$".into()],
            ..Default::default()
        });

        assert_eq!(f.check(&request("https://example.com/blog/post")), Ok(()));
        assert_eq!(
            f.check(&request("https://example.com/about")),
            Err(SkipReason::UrlFiltered)
        );
        assert_eq!(
            f.check(&request("https://example.com/blog/paper.pdf")),
            Err(SkipReason::UrlFiltered)
        );
    }

    #[test]
    fn test_depth_limit() {
        let f = filter(CrawlerConfig {
            max_depth: 2,
            ..Default::default()
        });
        assert_eq!(f.check(&request("https://example.com/").with_depth(2)), Ok(()));
        assert_eq!(
            f.check(&request("https://example.com/").with_depth(3)),
            Err(SkipReason::MaxDepth)
        );

        let unlimited = filter(CrawlerConfig::default());
        assert_eq!(unlimited.check(&request("https://example.com/").with_depth(500)), Ok(()));
    }

    #[test]
    fn test_non_http_scheme_is_filtered() {
        let f = filter(CrawlerConfig::default());
        assert_eq!(
            f.check(&request("ftp://example.com/file")),
            Err(SkipReason::UrlFiltered)
        );
    }

    #[test]
    fn test_invalid_pattern_fails_fast() {
        let err = UrlFilter::from_config(&CrawlerConfig {
            url_filters: vec!["(".into()],
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, CrawlError::Config(_)));
    }
}

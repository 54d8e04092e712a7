//! Shared helpers for the command line

use url::Url;

/// Shorten `s` to at most `max_chars` characters, marking the cut with "..."
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = s.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// Parse a seed URL, assuming https when the scheme is missing
pub fn parse_seed(input: &str) -> Option<Url> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    match Url::parse(input) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Some(url),
        Ok(_) | Err(url::ParseError::RelativeUrlWithoutBase) => {
            if input.contains("://") {
                return None;
            }
            Url::parse(&format!("https://{}", input)).ok()
        }
        Err(_) => None,
    }
}

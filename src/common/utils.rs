//! Utility functions for skyclaw

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Current UTC time
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Mint an entity id with the given prefix, e.g. `job_5f3a...`
pub fn mint_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

/// Normalize a capability set: trimmed, non-empty, de-duplicated, sorted.
/// Keeps request hashes and subset checks stable across submitters.
pub fn normalize_capabilities(raw: &[String]) -> Vec<String> {
    let mut caps: Vec<String> = raw
        .iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    caps.sort();
    caps.dedup();
    caps
}

/// `required ⊆ offered`, both normalized
pub fn capabilities_satisfied(required: &[String], offered: &[String]) -> bool {
    required.iter().all(|c| offered.iter().any(|o| o == c))
}

/// Normalize a peer base URL to scheme+host+path with no trailing slash.
/// Returns `None` for anything that is not a plain http(s) URL.
pub fn normalize_base_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
        return None;
    }
    let without_fragment = trimmed.split('#').next().unwrap_or(trimmed);
    let without_query = without_fragment.split('?').next().unwrap_or(without_fragment);
    let normalized = without_query.trim_end_matches('/');
    // scheme alone is not a base URL
    let rest = normalized
        .strip_prefix("http://")
        .or_else(|| normalized.strip_prefix("https://"))?;
    if rest.is_empty() {
        return None;
    }
    Some(normalized.to_string())
}

/// Strip a trailing `/` from a reported service endpoint
pub fn normalize_endpoint(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_id_prefix_and_uniqueness() {
        let a = mint_id("host");
        let b = mint_id("host");
        assert!(a.starts_with("host_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_normalize_capabilities() {
        let caps = normalize_capabilities(&[
            " shell ".into(),
            "openclaw".into(),
            "".into(),
            "shell".into(),
        ]);
        assert_eq!(caps, vec!["openclaw".to_string(), "shell".to_string()]);
    }

    #[test]
    fn test_capabilities_satisfied() {
        let offered = vec!["openclaw".to_string(), "shell".to_string()];
        assert!(capabilities_satisfied(&["shell".to_string()], &offered));
        assert!(capabilities_satisfied(&[], &offered));
        assert!(!capabilities_satisfied(&["gpu".to_string()], &offered));
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("http://10.0.0.1:7070/"),
            Some("http://10.0.0.1:7070".to_string())
        );
        assert_eq!(
            normalize_base_url("  https://coord.example/api/ "),
            Some("https://coord.example/api".to_string())
        );
        assert_eq!(
            normalize_base_url("http://coord:7070?x=1"),
            Some("http://coord:7070".to_string())
        );
        assert_eq!(normalize_base_url("ftp://coord"), None);
        assert_eq!(normalize_base_url("coord:7070"), None);
        assert_eq!(normalize_base_url("http://"), None);
    }

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("http://10.1.2.3:9000/"), "http://10.1.2.3:9000");
        assert_eq!(normalize_endpoint("http://10.1.2.3:9000"), "http://10.1.2.3:9000");
    }
}

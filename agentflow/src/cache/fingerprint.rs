//! Deterministic cache keys.

use md5::{Digest as _, Md5};
use sha2::Sha256;

/// Default namespace for search result keys.
pub const SEARCH_NAMESPACE: &str = "search";

/// Parameters that determine a web search result.
///
/// Domain filters are sorted before hashing, so two requests that list the
/// same domains in a different order share a key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFingerprint {
    /// Search query text.
    pub query: String,
    /// Maximum number of results requested.
    pub max_results: usize,
    /// Domains to restrict the search to.
    pub include_domains: Vec<String>,
    /// Domains to exclude.
    pub exclude_domains: Vec<String>,
}

impl SearchFingerprint {
    /// Creates a fingerprint for a query.
    #[must_use]
    pub fn new(query: impl Into<String>, max_results: usize) -> Self {
        Self {
            query: query.into(),
            max_results,
            ..Default::default()
        }
    }

    /// Restricts the search to the given domains.
    #[must_use]
    pub fn include<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_domains = domains.into_iter().map(Into::into).collect();
        self
    }

    /// Excludes the given domains.
    #[must_use]
    pub fn exclude<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_domains = domains.into_iter().map(Into::into).collect();
        self
    }

    /// Returns the canonical string that is hashed.
    #[must_use]
    pub fn canonical(&self) -> String {
        let mut out = format!("{}|{}", self.query, self.max_results);
        if !self.include_domains.is_empty() {
            out.push_str("|inc:");
            out.push_str(&sorted_join(&self.include_domains));
        }
        if !self.exclude_domains.is_empty() {
            out.push_str("|exc:");
            out.push_str(&sorted_join(&self.exclude_domains));
        }
        out
    }

    /// Returns the key under the default `search` namespace.
    #[must_use]
    pub fn key(&self) -> String {
        self.key_in(SEARCH_NAMESPACE)
    }

    /// Returns the key under a custom namespace.
    #[must_use]
    pub fn key_in(&self, namespace: &str) -> String {
        let digest = Md5::digest(self.canonical().as_bytes());
        format!("{namespace}:{}", hex::encode(digest))
    }
}

fn sorted_join(domains: &[String]) -> String {
    let mut sorted: Vec<&str> = domains.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.join(",")
}

/// Hashes arbitrary JSON parameters into a namespaced key.
///
/// Object keys are sorted recursively before hashing, so field order in the
/// input never changes the result.
#[must_use]
pub fn fingerprint(namespace: &str, params: &serde_json::Value) -> String {
    let canonical = canonicalize(params).to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{namespace}:{}", hex::encode(&digest[..16]))
}

fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_search_key_format() {
        let fp = SearchFingerprint::new("EV market share 2024", 5);

        assert_eq!(fp.canonical(), "EV market share 2024|5");
        let key = fp.key();
        assert!(key.starts_with("search:"));
        assert_eq!(key.len(), "search:".len() + 32);
    }

    #[test]
    fn test_domain_order_does_not_matter() {
        let a = SearchFingerprint::new("tesla", 5).include(["reuters.com", "bloomberg.com"]);
        let b = SearchFingerprint::new("tesla", 5).include(["bloomberg.com", "reuters.com"]);

        assert_eq!(a.key(), b.key());
        assert_eq!(a.canonical(), "tesla|5|inc:bloomberg.com,reuters.com");
    }

    #[test]
    fn test_parameters_change_key() {
        let base = SearchFingerprint::new("tesla", 5);

        assert_ne!(base.key(), SearchFingerprint::new("tesla", 10).key());
        assert_ne!(base.key(), base.clone().exclude(["reddit.com"]).key());
        assert_ne!(base.key(), base.key_in("news"));
    }

    #[test]
    fn test_generic_fingerprint_ignores_key_order() {
        let a = fingerprint("llm", &json!({"model": "x", "prompt": "hi", "opts": {"b": 1, "a": 2}}));
        let b = fingerprint("llm", &json!({"opts": {"a": 2, "b": 1}, "prompt": "hi", "model": "x"}));

        assert_eq!(a, b);
        assert!(a.starts_with("llm:"));
    }
}

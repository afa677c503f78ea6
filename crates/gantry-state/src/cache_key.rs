//! Content-addressed keys for resource caches and config scopes.
//!
//! Keys are the SHA-256 hex digest of the canonical JSON serialization
//! of the identifying tuple. `serde_json` maps are `BTreeMap`-backed,
//! so object keys serialize sorted and the digest is stable across
//! processes.

use serde_json::json;
use sha2::{Digest, Sha256};

use gantry_types::{Version, VersionedResourceType};

fn digest(value: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Key identifying a cached fetch: one per
/// `(type, version, source, params, resource_types)` tuple.
#[must_use]
pub fn resource_cache_key(
    resource_type: &str,
    version: Option<&Version>,
    source: &serde_json::Value,
    params: &serde_json::Value,
    resource_types: &[VersionedResourceType],
) -> String {
    digest(&json!({
        "type": resource_type,
        "version": version,
        "source": source,
        "params": params,
        "resource_types": resource_types,
    }))
}

/// Key identifying a resource configuration: the identity under which
/// check results and discovered versions are recorded.
#[must_use]
pub fn resource_config_key(
    resource_type: &str,
    source: &serde_json::Value,
    resource_types: &[VersionedResourceType],
) -> String {
    digest(&json!({
        "type": resource_type,
        "source": source,
        "resource_types": resource_types,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_stable_across_map_orderings() {
        let a = serde_json::from_str(r#"{"uri": "u", "branch": "main"}"#).unwrap();
        let b = serde_json::from_str(r#"{"branch": "main", "uri": "u"}"#).unwrap();
        assert_eq!(
            resource_config_key("git", &a, &[]),
            resource_config_key("git", &b, &[])
        );
    }

    #[test]
    fn params_change_the_cache_key() {
        let source = serde_json::json!({"uri": "u"});
        let base = resource_cache_key("git", None, &source, &serde_json::json!({}), &[]);
        let depth = resource_cache_key(
            "git",
            None,
            &source,
            &serde_json::json!({"depth": 1}),
            &[],
        );
        assert_ne!(base, depth);
    }

    #[test]
    fn version_changes_the_cache_key() {
        let source = serde_json::json!({"uri": "u"});
        let v1 = Version::from_pairs([("ref", "a")]);
        let v2 = Version::from_pairs([("ref", "b")]);
        let none = resource_cache_key("git", None, &source, &serde_json::Value::Null, &[]);
        let k1 = resource_cache_key("git", Some(&v1), &source, &serde_json::Value::Null, &[]);
        let k2 = resource_cache_key("git", Some(&v2), &source, &serde_json::Value::Null, &[]);
        assert_ne!(k1, k2);
        assert_ne!(k1, none);
    }

    #[test]
    fn keys_look_like_sha256_hex() {
        let key = resource_config_key("git", &serde_json::json!({}), &[]);
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

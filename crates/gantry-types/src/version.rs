//! Resource versions and version results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A resource version: an ordered set of key/value identifiers
/// (e.g. `{"ref": "abc123"}`).
///
/// Backed by a `BTreeMap` so serialization is canonical, which matters
/// for content-addressed resource cache keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(BTreeMap<String, String>);

impl Version {
    /// Build a version from key/value pairs.
    #[must_use]
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Look up a single identifier.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate identifiers in canonical (sorted) order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{k}:{v}")?;
            first = false;
        }
        Ok(())
    }
}

/// One line of resource metadata reported by `/opt/resource/in` and
/// `/opt/resource/out`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub name: String,
    pub value: String,
}

/// The version (plus human-readable metadata) produced by a resource
/// operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionResult {
    pub version: Version,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<MetadataField>,
}

/// A pipeline-defined resource type, carried alongside the plans that
/// may need it. Participates in resource cache identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedResourceType {
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub source: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    #[serde(default)]
    pub privileged: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_serializes_canonically() {
        let v = Version::from_pairs([("ref", "abc"), ("aux", "1")]);
        let json = serde_json::to_string(&v).unwrap();
        // BTreeMap ordering puts "aux" first regardless of insertion order.
        assert_eq!(json, r#"{"aux":"1","ref":"abc"}"#);
    }

    #[test]
    fn version_roundtrip_and_get() {
        let v = Version::from_pairs([("ref", "abc123")]);
        let back: Version = serde_json::from_str(&serde_json::to_string(&v).unwrap()).unwrap();
        assert_eq!(back, v);
        assert_eq!(back.get("ref"), Some("abc123"));
        assert_eq!(back.get("missing"), None);
    }

    #[test]
    fn version_display_is_stable() {
        let v = Version::from_pairs([("b", "2"), ("a", "1")]);
        assert_eq!(v.to_string(), "a:1,b:2");
    }

    #[test]
    fn version_result_omits_empty_metadata() {
        let result = VersionResult {
            version: Version::from_pairs([("ref", "x")]),
            metadata: vec![],
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("metadata"));
    }
}

//! Attribute hashing for change detection.
//!
//! The diff engine compares these hashes against the hashes recorded in the
//! applied state, so equal attribute maps must always hash the same.

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::model::{Attributes, ResourceSpec};

/// Hasher for resource attributes and declared sets.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResourceHasher;

impl ResourceHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the attribute hash of a spec.
    #[must_use]
    pub fn attributes_hash(&self, spec: &ResourceSpec) -> String {
        self.hash_attributes(&spec.attributes)
    }

    /// Computes the hash of an attribute map.
    #[must_use]
    pub fn hash_attributes(&self, attributes: &Attributes) -> String {
        let mut hasher = Sha256::new();
        let mut buf = String::new();
        for (name, value) in attributes {
            buf.clear();
            write_canonical(value, &mut buf);
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(buf.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Computes a fingerprint of a whole declared set, in declaration order.
    #[must_use]
    pub fn fingerprint(&self, specs: &[ResourceSpec]) -> String {
        let mut hasher = Sha256::new();
        for spec in specs {
            hasher.update(spec.id.as_bytes());
            hasher.update(spec.kind.as_str().as_bytes());
            hasher.update(self.attributes_hash(spec).as_bytes());
            for dep in &spec.depends_on {
                hasher.update(dep.as_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

/// Writes `value` as JSON with object keys sorted at every level.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKind;
    use serde_json::json;

    fn service(count: u32) -> ResourceSpec {
        ResourceSpec::new("svc", ResourceKind::Service)
            .with_attr("cluster", "cluster")
            .with_attr("desired_count", count)
            .with_attr("circuit_breaker", json!({"rollback": true, "enable": true}))
    }

    #[test]
    fn test_hash_deterministic() {
        let hasher = ResourceHasher::new();
        assert_eq!(hasher.attributes_hash(&service(3)), hasher.attributes_hash(&service(3)));
    }

    #[test]
    fn test_hash_insertion_order_irrelevant() {
        let hasher = ResourceHasher::new();
        let a = ResourceSpec::new("x", ResourceKind::Cluster)
            .with_attr("name", "main")
            .with_attr("tags", json!({"b": "2", "a": "1"}));
        let b = ResourceSpec::new("x", ResourceKind::Cluster)
            .with_attr("tags", json!({"a": "1", "b": "2"}))
            .with_attr("name", "main");
        assert_eq!(hasher.attributes_hash(&a), hasher.attributes_hash(&b));
    }

    #[test]
    fn test_hash_changes_with_value() {
        let hasher = ResourceHasher::new();
        assert_ne!(hasher.attributes_hash(&service(3)), hasher.attributes_hash(&service(5)));
    }

    #[test]
    fn test_hash_ignores_id() {
        let hasher = ResourceHasher::new();
        let mut other = service(3);
        other.id = String::from("renamed");
        assert_eq!(hasher.attributes_hash(&service(3)), hasher.attributes_hash(&other));
        assert_ne!(hasher.fingerprint(&[service(3)]), hasher.fingerprint(&[other]));
    }

    #[test]
    fn test_short_hash() {
        let short = ResourceHasher::short_hash("abcdef1234567890abcdef1234567890");
        assert_eq!(short, "abcdef12");
    }

    #[test]
    fn test_hashes_match() {
        assert!(ResourceHasher::hashes_match("abc123", "abc123"));
        assert!(!ResourceHasher::hashes_match("abc123", "abc124"));
        assert!(!ResourceHasher::hashes_match("abc123", "abc12"));
    }
}

//! Digests for change detection.
//!
//! Property maps are hashed through their canonical JSON form. Keys are
//! ordered maps, so equal property sets always produce equal digests.

use sha2::{Digest, Sha256};

use crate::graph::{Graph, PropertyMap};

/// Hasher for computing property and stack digests.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the digest of a property map.
    #[must_use]
    pub fn hash_properties(properties: &PropertyMap) -> String {
        let canonical = serde_json::to_vec(properties).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }

    /// Computes a digest of the whole declared graph.
    ///
    /// Covers identities, desired properties (references included) and the
    /// dependency relation, visited in topological order.
    #[must_use]
    pub fn hash_graph(graph: &Graph) -> String {
        let mut hasher = Sha256::new();
        for resource in graph.iter() {
            hasher.update(resource.id.to_string().as_bytes());
            hasher.update(Self::hash_properties(&resource.properties).as_bytes());
            for dependency in resource.dependencies() {
                hasher.update(dependency.to_string().as_bytes());
            }
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        // Constant-time comparison
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ResourceDecl, ResourceId, Value};

    fn properties(pairs: &[(&str, &str)]) -> PropertyMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), Value::from(*v)))
            .collect()
    }

    #[test]
    fn test_property_hash_is_order_independent() {
        let a = properties(&[("cidr_block", "10.0.0.0/16"), ("name", "egress")]);
        let b = properties(&[("name", "egress"), ("cidr_block", "10.0.0.0/16")]);

        assert_eq!(ConfigHasher::hash_properties(&a), ConfigHasher::hash_properties(&b));
        assert_eq!(ConfigHasher::hash_properties(&a).len(), 64);
    }

    #[test]
    fn test_property_hash_distinguishes_types() {
        let mut as_string = PropertyMap::new();
        as_string.insert("port".to_string(), Value::from("443"));
        let mut as_integer = PropertyMap::new();
        as_integer.insert("port".to_string(), Value::Integer(443));

        assert_ne!(
            ConfigHasher::hash_properties(&as_string),
            ConfigHasher::hash_properties(&as_integer)
        );
    }

    #[test]
    fn test_graph_hash_tracks_references() {
        let vpc = ResourceId::new("vpc", "main");
        let build = |output: &str| {
            Graph::from_decls([
                ResourceDecl::new("vpc", "main"),
                ResourceDecl::new("subnet", "a").with_property("vpc_id", vpc.output(output)),
            ])
            .expect("acyclic")
        };

        assert_eq!(
            ConfigHasher::hash_graph(&build("id")),
            ConfigHasher::hash_graph(&build("id"))
        );
        assert_ne!(
            ConfigHasher::hash_graph(&build("id")),
            ConfigHasher::hash_graph(&build("arn"))
        );
    }

    #[test]
    fn test_short_hash() {
        let hasher = ConfigHasher::new();
        let full_hash = "abcdef1234567890abcdef1234567890";
        let short = hasher.short_hash(full_hash);

        assert_eq!(short, "abcdef12");
        assert_eq!(short.len(), 8);
    }

    #[test]
    fn test_hashes_match() {
        assert!(ConfigHasher::hashes_match("abc123", "abc123"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc124"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc12"));
    }
}

//! Content fingerprints of desired declarations
//!
//! A fingerprint is the hex SHA-256 of the canonical JSON encoding of a
//! declaration's kind, clone source, and attributes. [`Attributes`] is a
//! `BTreeMap`, so the encoding is independent of declaration order.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::value::Attributes;

/// Hex encoded SHA-256 digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

#[derive(Serialize)]
struct Canonical<'a> {
    kind: &'a str,
    source: Option<&'a str>,
    attributes: &'a Attributes,
}

impl Fingerprint {
    /// Compute the fingerprint of a declaration's content
    pub fn compute(kind: &str, source: Option<&str>, attributes: &Attributes) -> Self {
        let canonical = Canonical {
            kind,
            source,
            attributes,
        };
        // Serializing a struct of strings and BTreeMaps cannot fail.
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        let digest = Sha256::digest(&bytes);
        Fingerprint(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough for logs
        f.write_str(&self.0[..self.0.len().min(12)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::AttrValue;

    fn attrs(pairs: &[(&str, i64)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), AttrValue::from(*v)))
            .collect()
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let a = attrs(&[("cores", 2), ("memory", 2048)]);
        let b = attrs(&[("memory", 2048), ("cores", 2)]);
        assert_eq!(
            Fingerprint::compute("virtual_machine", None, &a),
            Fingerprint::compute("virtual_machine", None, &b)
        );
    }

    #[test]
    fn test_fingerprint_covers_source_and_kind() {
        let a = attrs(&[("cores", 2)]);
        let base = Fingerprint::compute("virtual_machine", Some("template-A"), &a);
        assert_ne!(base, Fingerprint::compute("virtual_machine", Some("template-B"), &a));
        assert_ne!(base, Fingerprint::compute("container", Some("template-A"), &a));
        assert_eq!(base.as_str().len(), 64);
    }
}

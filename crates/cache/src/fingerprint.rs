//! Content-derived cache keys.
//!
//! A fingerprint is `<namespace>:<sha256 hex>` over the sorted `key=value`
//! parameters, so argument order never matters. Free-text parameters are
//! normalized (casing, stray whitespace); identifiers are hashed as given.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Namespaces used by the pipeline.
pub mod namespaces {
    pub const RELEVANCE: &str = "relevance";
    pub const SELECTION: &str = "selection";
    pub const TEMPLATE: &str = "template";
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

/// Collects the parameters of one fingerprint.
#[derive(Debug, Clone)]
pub struct FingerprintBuilder {
    namespace: String,
    params: Vec<(String, String)>,
}

impl FingerprintBuilder {
    /// A free-text parameter, normalized before hashing.
    pub fn text(mut self, key: &str, value: &str) -> Self {
        self.params.push((key.to_string(), normalize_text(value)));
        self
    }

    /// An identifier or setting, hashed byte for byte.
    pub fn exact(mut self, key: &str, value: &str) -> Self {
        self.params.push((key.to_string(), value.to_string()));
        self
    }

    pub fn finish(mut self) -> Fingerprint {
        self.params.sort_by(|a, b| a.0.cmp(&b.0));

        let mut hasher = Sha256::new();
        hasher.update(self.namespace.as_bytes());
        for (k, v) in &self.params {
            hasher.update(b"\x1f");
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
        }
        Fingerprint(format!("{}:{}", self.namespace, hex::encode(hasher.finalize())))
    }
}

impl Fingerprint {
    pub fn builder(namespace: &str) -> FingerprintBuilder {
        FingerprintBuilder {
            namespace: namespace.to_string(),
            params: Vec::new(),
        }
    }

    /// Fingerprint free-text parameters within a namespace.
    pub fn of(namespace: &str, params: &[(&str, &str)]) -> Self {
        params
            .iter()
            .fold(Self::builder(namespace), |b, (k, v)| b.text(k, v))
            .finish()
    }

    pub fn namespace(&self) -> &str {
        self.0.split_once(':').map(|(ns, _)| ns).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase, trim, and collapse internal whitespace.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_ignores_case_and_spacing() {
        assert_eq!(normalize_text("  Основы   Термодинамики "), "основы термодинамики");
        let a = Fingerprint::of("relevance", &[("topic", "Heat  Transfer"), ("lang", "ru")]);
        let b = Fingerprint::of("relevance", &[("lang", "RU"), ("topic", "heat transfer")]);
        assert_eq!(a, b);
    }

    #[test]
    fn exact_parameters_keep_case() {
        let key = |source: &str| {
            Fingerprint::builder("relevance")
                .text("theme", "Heat  Transfer")
                .exact("source", source)
                .finish()
        };
        assert_ne!(key("b1"), key("B1"));
        assert_eq!(
            key("b1"),
            Fingerprint::builder("relevance")
                .exact("source", "b1")
                .text("theme", "heat transfer")
                .finish()
        );
    }

    #[test]
    fn namespace_separates_keys() {
        let a = Fingerprint::of("relevance", &[("topic", "x")]);
        let b = Fingerprint::of("selection", &[("topic", "x")]);
        assert_ne!(a, b);
        assert_eq!(a.namespace(), "relevance");
        assert!(b.as_str().starts_with("selection:"));
    }

    #[test]
    fn different_values_differ() {
        let a = Fingerprint::of("relevance", &[("topic", "entropy")]);
        let b = Fingerprint::of("relevance", &[("topic", "enthalpy")]);
        assert_ne!(a, b);
    }
}

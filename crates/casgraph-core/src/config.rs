//! Runtime configuration, loadable from JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SerializationError;
use crate::index::IndexSpec;

/// Settings applied to every CAS created with them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CasConfig {
    /// Indexes declared in every view on creation (and again after reset).
    pub indexes: Vec<IndexSpec>,
    /// MIME type recorded by `set_document_text`.
    pub document_mime_type: String,
    pub xmi: XmiOptions,
    pub binary: BinaryOptions,
}

impl Default for CasConfig {
    fn default() -> Self {
        Self {
            indexes: Vec::new(),
            document_mime_type: "text".to_string(),
            xmi: XmiOptions::default(),
            binary: BinaryOptions::default(),
        }
    }
}

impl CasConfig {
    pub fn from_json(text: &str) -> Result<Self, SerializationError> {
        serde_json::from_str(text).map_err(|e| SerializationError::Malformed(e.to_string()))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SerializationError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct XmiOptions {
    /// Fail on the first problem instead of skipping it with a diagnostic.
    pub strict: bool,
    /// Indent written documents.
    pub pretty: bool,
}

impl Default for XmiOptions {
    fn default() -> Self {
        Self {
            strict: true,
            pretty: true,
        }
    }
}

impl XmiOptions {
    pub fn lenient() -> Self {
        Self {
            strict: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinaryOptions {
    /// Varint/zigzag body instead of the plain bincode body.
    pub compressed: bool,
    /// Prepend the type system so the file can be read without it.
    pub embed_type_system: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use casgraph_types::{IndexKind, KeyDirection};

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = CasConfig::from_json(r#"{ "xmi": { "strict": false } }"#).unwrap();
        assert!(!config.xmi.strict);
        assert!(config.xmi.pretty);
        assert_eq!(config.document_mime_type, "text");
        assert_eq!(config.binary, BinaryOptions::default());
    }

    #[test]
    fn json_round_trip_keeps_indexes() {
        let config = CasConfig {
            indexes: vec![IndexSpec::new("Tokens", "org.example.Token", IndexKind::Sorted)
                .with_key("begin", KeyDirection::Standard)],
            ..CasConfig::default()
        };
        let back = CasConfig::from_json(&config.to_json()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn malformed_json_is_reported() {
        assert!(matches!(
            CasConfig::from_json("{ nope"),
            Err(SerializationError::Malformed(_))
        ));
    }
}

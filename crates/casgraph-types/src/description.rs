//! Declarative, serializable form of a type system (plus index declarations).
//!
//! This is what descriptor files parse into, what binary CAS files embed when
//! they are written self-describing, and what `TypeSystemBuilder` can be
//! rebuilt from. Built-in types are never listed; they are implied.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeSystemDescription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub types: Vec<TypeDescription>,
    #[serde(default)]
    pub priority_lists: Vec<Vec<String>>,
    #[serde(default)]
    pub indexes: Vec<IndexDescription>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescription {
    pub name: String,
    pub supertype: String,
    #[serde(default)]
    pub features: Vec<FeatureDescription>,
    /// Non-empty only for string subtypes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureDescription {
    pub name: String,
    /// Range type name; `X[]` denotes an array of `X`.
    pub range: String,
    #[serde(default)]
    pub multiple_references_allowed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Sorted,
    Set,
    Bag,
}

impl IndexKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexKind::Sorted => "sorted",
            IndexKind::Set => "set",
            IndexKind::Bag => "bag",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "sorted" => Some(IndexKind::Sorted),
            "set" => Some(IndexKind::Set),
            "bag" => Some(IndexKind::Bag),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyDirection {
    #[default]
    Standard,
    Reverse,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "snake_case")]
pub enum IndexKeyDescription {
    Feature {
        name: String,
        #[serde(default)]
        direction: KeyDirection,
    },
    TypePriority,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexDescription {
    pub label: String,
    pub type_name: String,
    pub kind: IndexKind,
    #[serde(default)]
    pub keys: Vec<IndexKeyDescription>,
}

impl IndexDescription {
    pub fn new(label: &str, type_name: &str, kind: IndexKind) -> Self {
        Self {
            label: label.to_string(),
            type_name: type_name.to_string(),
            kind,
            keys: Vec::new(),
        }
    }

    pub fn with_key(mut self, feature: &str, direction: KeyDirection) -> Self {
        self.keys.push(IndexKeyDescription::Feature {
            name: feature.to_string(),
            direction,
        });
        self
    }

    pub fn with_type_priority(mut self) -> Self {
        self.keys.push(IndexKeyDescription::TypePriority);
        self
    }
}

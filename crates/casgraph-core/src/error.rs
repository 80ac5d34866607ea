use thiserror::Error;

/// Failures while encoding or decoding a CAS.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SerializationError {
    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("unsupported format version {found} (this build reads {supported})")]
    VersionMismatch { found: u16, supported: u16 },

    #[error("type system mismatch: data written with {found}, reader has {expected}")]
    TypeSystemMismatch { expected: String, found: String },

    #[error("unknown type `{0}`")]
    UnknownType(String),

    #[error("unresolved reference `{0}`")]
    UnresolvedReference(String),

    #[error("bad value: {0}")]
    BadValue(String),

    #[error("delta does not apply: {0}")]
    DeltaMismatch(String),

    #[error("xml error: {0}")]
    Xml(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SerializationError {
    fn from(err: std::io::Error) -> Self {
        SerializationError::Io(err.to_string())
    }
}

impl From<bincode::Error> for SerializationError {
    fn from(err: bincode::Error) -> Self {
        SerializationError::Malformed(err.to_string())
    }
}

impl From<casgraph_types::xml::XmlError> for SerializationError {
    fn from(err: casgraph_types::xml::XmlError) -> Self {
        SerializationError::Xml(err.to_string())
    }
}

impl From<quick_xml::Error> for SerializationError {
    fn from(err: quick_xml::Error) -> Self {
        SerializationError::Xml(err.to_string())
    }
}

/// Errors raised by CAS operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CasError {
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("type `{type_name}` has no feature `{feature}`")]
    FeatureNotFound { type_name: String, feature: String },

    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("view `{0}` already exists")]
    DuplicateView(String),

    #[error("no view named `{0}`")]
    ViewNotFound(String),

    #[error("reference #{id} is stale or does not belong to this CAS")]
    StaleReference { id: u32 },

    #[error("no index labelled `{0}`")]
    UnknownIndex(String),

    #[error("invalid index definition: {0}")]
    IndexDefinition(String),

    #[error("feature structure #{id} belongs to another view than `{view}`")]
    CrossViewIndex { id: u32, view: String },

    #[error("feature `{0}` is read-only")]
    ReadOnlyFeature(String),

    #[error("type `{0}` cannot be created this way")]
    NotCreatable(String),

    #[error("subject of analysis of view `{0}` is already set")]
    SofaDataAlreadySet(String),

    #[error(transparent)]
    Serialization(#[from] SerializationError),
}

pub type Result<T> = std::result::Result<T, CasError>;

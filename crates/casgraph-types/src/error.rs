//! Errors raised while assembling, merging or committing a type system.

use thiserror::Error;

/// Everything that can go wrong before a type system is committed.
///
/// All variants are fatal for the build in progress: a builder that returned
/// one of these from `commit` should be discarded or fixed and re-committed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TypeSystemError {
    #[error("type `{type_name}` names unknown supertype `{supertype}`")]
    UnresolvedSupertype { type_name: String, supertype: String },

    #[error("feature `{type_name}:{feature}` has unknown range type `{range}`")]
    UnresolvedRange {
        type_name: String,
        feature: String,
        range: String,
    },

    #[error(
        "feature `{feature}` on `{type_name}` collides with `{existing_owner}:{feature}` \
         (range `{range}` vs `{existing_range}`)"
    )]
    FeatureCollision {
        type_name: String,
        feature: String,
        range: String,
        existing_owner: String,
        existing_range: String,
    },

    #[error("type `{type_name}` redeclared with supertype `{new}` (was `{existing}`)")]
    ConflictingSupertype {
        type_name: String,
        existing: String,
        new: String,
    },

    #[error("feature `{type_name}:{feature}` redeclared with range `{new}` (was `{existing}`)")]
    ConflictingFeatureRange {
        type_name: String,
        feature: String,
        existing: String,
        new: String,
    },

    #[error("string subtype `{type_name}` redeclared with different allowed values")]
    ConflictingAllowedValues { type_name: String },

    #[error("type `{type_name}` cannot carry declared features")]
    FeaturesNotAllowed { type_name: String },

    #[error("inheritance cycle through type `{type_name}`")]
    Cycle { type_name: String },

    #[error("type `{type_name}` cannot inherit from final type `{supertype}`")]
    FinalSupertype { type_name: String, supertype: String },

    #[error("contradictory type priorities among {types:?}")]
    PriorityCycle { types: Vec<String> },

    #[error("index label `{label}` redeclared with a different definition")]
    ConflictingIndex { label: String },

    #[error("invalid {what} name `{name}`")]
    InvalidName { what: &'static str, name: String },

    #[error("unknown type `{0}`")]
    UnknownType(String),

    #[error("import of `{target}` failed: {message}")]
    Import { target: String, message: String },

    #[error("descriptor error: {0}")]
    Descriptor(String),
}

pub type Result<T> = std::result::Result<T, TypeSystemError>;

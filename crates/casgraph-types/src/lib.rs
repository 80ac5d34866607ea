//! Type systems for feature-structure stores.
//!
//! A [`TypeSystemBuilder`] collects type, feature and priority declarations
//! (by hand, from descriptor XML, or merged from several sources) and commits
//! them into an immutable, shareable [`TypeSystem`]. After commit every type
//! and feature has a dense code, subtype tests are constant time, and the
//! priority order is total.

pub mod builder;
pub mod builtin;
pub mod description;
pub mod descriptor;
pub mod digest;
pub mod error;
pub mod priority;
pub mod type_system;
pub mod xml;

pub use builder::{FeatureHandle, TypeHandle, TypeSystemBuilder};
pub use description::{
    FeatureDescription, IndexDescription, IndexKeyDescription, IndexKind, KeyDirection,
    TypeDescription, TypeSystemDescription,
};
pub use descriptor::{
    load_type_system, parse_descriptor, write_descriptor, DescriptorLoader, FileResolver,
    MemoryResolver, ResourceResolver,
};
pub use error::{Result, TypeSystemError};
pub use priority::LinearTypeOrder;
pub use type_system::{
    BuiltinCodes, ElementKind, FeatureCode, FeatureInfo, PrimitiveKind, TypeCode, TypeInfo,
    TypeKind, TypeSystem, ValueKind,
};

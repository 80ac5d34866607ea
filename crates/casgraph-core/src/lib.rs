//! Casgraph CAS: a typed feature-structure heap with per-view indexes.
//!
//! A [`Cas`] is bound to one committed [`casgraph_types::TypeSystem`] (shared
//! through an `Arc`). It owns:
//!
//! - a heap of feature structures addressed by [`FsRef`] handles, each
//!   stamped with the generation of the heap so use after [`Cas::reset`] is
//!   detected,
//! - a set of views, each backed by a `cas.Sofa` structure and carrying its
//!   own index repository (sorted, set and bag indexes plus the built-in
//!   `AnnotationIndex`),
//! - an optional change journal used for delta serialization.
//!
//! ## Serialization
//!
//! - [`serialize_binary`] / [`deserialize_binary`]: fixed header plus a
//!   bincode or varint-compressed body, optionally self-describing.
//! - [`serialize_delta`] / [`apply_delta`]: changes since a [`Marker`].
//! - [`serialize_xmi`] / [`deserialize_xmi`]: XMI-style XML, strict or
//!   lenient.

pub mod cas;
pub mod config;
pub mod error;
pub mod index;
pub mod pool;
pub mod serde_binary;
mod store;
pub mod value;
pub mod view;
pub mod xmi;

pub use cas::{BoundsViolation, Cas, Marker};
pub use config::{BinaryOptions, CasConfig, XmiOptions};
pub use error::{CasError, Result, SerializationError};
pub use index::{annotation_index_spec, FsIterator, IndexSpec, ANNOTATION_INDEX};
pub use pool::{CasGuard, CasPool};
pub use serde_binary::{
    apply_delta, deserialize_binary, deserialize_binary_self_describing,
    deserialize_binary_self_describing_with, deserialize_binary_with, read_header, serialize_binary, serialize_binary_with,
    serialize_delta, BinaryHeader,
};
pub use value::{FeatureValue, FsRef};
pub use view::{ViewId, INITIAL_VIEW};
pub use xmi::{deserialize_xmi, deserialize_xmi_with, serialize_xmi, XmiDiagnostic, XmiLoad};

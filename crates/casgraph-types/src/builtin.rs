//! Built-in type names and their declarations.
//!
//! Every builder starts out with these; user declarations hang below
//! `cas.TOP` (or below `cas.Annotation` / `cas.AnnotationBase` for
//! view-bound structures).

use crate::builder::{DeclKind, ElementDecl, FeatureDecl, TypeDecl};
use crate::type_system::PrimitiveKind;

pub const TOP: &str = "cas.TOP";

pub const INTEGER: &str = "cas.Integer";
pub const FLOAT: &str = "cas.Float";
pub const BOOLEAN: &str = "cas.Boolean";
pub const BYTE: &str = "cas.Byte";
pub const SHORT: &str = "cas.Short";
pub const LONG: &str = "cas.Long";
pub const DOUBLE: &str = "cas.Double";
pub const STRING: &str = "cas.String";

pub const ARRAY_BASE: &str = "cas.ArrayBase";
pub const FS_ARRAY: &str = "cas.FSArray";
pub const INTEGER_ARRAY: &str = "cas.IntegerArray";
pub const FLOAT_ARRAY: &str = "cas.FloatArray";
pub const STRING_ARRAY: &str = "cas.StringArray";
pub const BOOLEAN_ARRAY: &str = "cas.BooleanArray";
pub const BYTE_ARRAY: &str = "cas.ByteArray";
pub const SHORT_ARRAY: &str = "cas.ShortArray";
pub const LONG_ARRAY: &str = "cas.LongArray";
pub const DOUBLE_ARRAY: &str = "cas.DoubleArray";

pub const SOFA: &str = "cas.Sofa";
pub const ANNOTATION_BASE: &str = "cas.AnnotationBase";
pub const ANNOTATION: &str = "cas.Annotation";
pub const DOCUMENT_ANNOTATION: &str = "cas.DocumentAnnotation";

pub const FS_LIST: &str = "cas.FSList";
pub const EMPTY_FS_LIST: &str = "cas.EmptyFSList";
pub const NON_EMPTY_FS_LIST: &str = "cas.NonEmptyFSList";

// Feature short names on the built-in structure types.
pub const FEAT_SOFA_NUM: &str = "sofaNum";
pub const FEAT_SOFA_ID: &str = "sofaID";
pub const FEAT_SOFA_MIME: &str = "mimeType";
pub const FEAT_SOFA_ARRAY: &str = "sofaArray";
pub const FEAT_SOFA_STRING: &str = "sofaString";
pub const FEAT_SOFA_URI: &str = "sofaURI";
pub const FEAT_SOFA: &str = "sofa";
pub const FEAT_BEGIN: &str = "begin";
pub const FEAT_END: &str = "end";
pub const FEAT_LANGUAGE: &str = "language";
pub const FEAT_HEAD: &str = "head";
pub const FEAT_TAIL: &str = "tail";

/// Suffix that turns an element type name into an array range (`Token[]`).
pub const ARRAY_SUFFIX: &str = "[]";

const PRIMITIVES: [(&str, PrimitiveKind, &str); 7] = [
    (INTEGER, PrimitiveKind::Integer, INTEGER_ARRAY),
    (FLOAT, PrimitiveKind::Float, FLOAT_ARRAY),
    (BOOLEAN, PrimitiveKind::Boolean, BOOLEAN_ARRAY),
    (BYTE, PrimitiveKind::Byte, BYTE_ARRAY),
    (SHORT, PrimitiveKind::Short, SHORT_ARRAY),
    (LONG, PrimitiveKind::Long, LONG_ARRAY),
    (DOUBLE, PrimitiveKind::Double, DOUBLE_ARRAY),
];

/// Name of the built-in array type whose elements are `element`, if any.
pub fn builtin_array_for(element: &str) -> Option<&'static str> {
    if element == STRING {
        return Some(STRING_ARRAY);
    }
    if element == TOP {
        return Some(FS_ARRAY);
    }
    PRIMITIVES
        .iter()
        .find(|(name, _, _)| *name == element)
        .map(|(_, _, array)| *array)
}

fn feature(name: &str, range: &str) -> FeatureDecl {
    FeatureDecl {
        name: name.to_string(),
        range: range.to_string(),
        multiple_references_allowed: false,
    }
}

fn decl(name: &str, supertype: Option<&str>, kind: DeclKind, features: Vec<FeatureDecl>) -> TypeDecl {
    TypeDecl {
        name: name.to_string(),
        supertype: supertype.map(str::to_string),
        kind,
        features,
        builtin: true,
    }
}

pub(crate) fn declarations() -> Vec<TypeDecl> {
    let mut out = vec![decl(TOP, None, DeclKind::Top, vec![])];

    for (name, kind, _) in PRIMITIVES {
        out.push(decl(name, Some(TOP), DeclKind::Primitive(kind), vec![]));
    }
    out.push(decl(STRING, Some(TOP), DeclKind::String, vec![]));

    out.push(decl(ARRAY_BASE, Some(TOP), DeclKind::ArrayBase, vec![]));
    out.push(decl(
        FS_ARRAY,
        Some(ARRAY_BASE),
        DeclKind::Array(ElementDecl::Fs(TOP.to_string())),
        vec![],
    ));
    for (_, kind, array) in PRIMITIVES {
        out.push(decl(
            array,
            Some(ARRAY_BASE),
            DeclKind::Array(ElementDecl::Primitive(kind)),
            vec![],
        ));
    }
    out.push(decl(
        STRING_ARRAY,
        Some(ARRAY_BASE),
        DeclKind::Array(ElementDecl::String),
        vec![],
    ));

    out.push(decl(
        SOFA,
        Some(TOP),
        DeclKind::Structure,
        vec![
            feature(FEAT_SOFA_NUM, INTEGER),
            feature(FEAT_SOFA_ID, STRING),
            feature(FEAT_SOFA_MIME, STRING),
            feature(FEAT_SOFA_ARRAY, TOP),
            feature(FEAT_SOFA_STRING, STRING),
            feature(FEAT_SOFA_URI, STRING),
        ],
    ));
    out.push(decl(
        ANNOTATION_BASE,
        Some(TOP),
        DeclKind::Structure,
        vec![feature(FEAT_SOFA, SOFA)],
    ));
    out.push(decl(
        ANNOTATION,
        Some(ANNOTATION_BASE),
        DeclKind::Structure,
        vec![feature(FEAT_BEGIN, INTEGER), feature(FEAT_END, INTEGER)],
    ));
    out.push(decl(
        DOCUMENT_ANNOTATION,
        Some(ANNOTATION),
        DeclKind::Structure,
        vec![feature(FEAT_LANGUAGE, STRING)],
    ));

    out.push(decl(FS_LIST, Some(TOP), DeclKind::Structure, vec![]));
    out.push(decl(EMPTY_FS_LIST, Some(FS_LIST), DeclKind::Structure, vec![]));
    out.push(decl(
        NON_EMPTY_FS_LIST,
        Some(FS_LIST),
        DeclKind::Structure,
        vec![feature(FEAT_HEAD, TOP), feature(FEAT_TAIL, FS_LIST)],
    ));

    out
}

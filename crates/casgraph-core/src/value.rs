//! Handles and values exchanged through the CAS API.

use std::fmt;

use casgraph_types::{ElementKind, PrimitiveKind, TypeCode, TypeKind, TypeSystem};

/// Handle to a feature structure.
///
/// Carries the generation of the store that issued it; after `Cas::reset`
/// every outstanding handle is rejected with `StaleReference`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FsRef {
    id: u32,
    generation: u32,
}

impl FsRef {
    pub(crate) fn new(id: u32, generation: u32) -> Self {
        Self { id, generation }
    }

    /// Identifier, unique within the CAS until the next reset. Never 0.
    pub fn id(self) -> u32 {
        self.id
    }

    pub(crate) fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for FsRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(Option<String>),
    Ref(Option<FsRef>),
}

impl FeatureValue {
    pub fn describe(&self) -> &'static str {
        match self {
            FeatureValue::Boolean(_) => "boolean",
            FeatureValue::Byte(_) => "byte",
            FeatureValue::Short(_) => "short",
            FeatureValue::Int(_) => "int",
            FeatureValue::Long(_) => "long",
            FeatureValue::Float(_) => "float",
            FeatureValue::Double(_) => "double",
            FeatureValue::String(_) => "string",
            FeatureValue::Ref(_) => "reference",
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            FeatureValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FeatureValue::String(Some(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_fs(&self) -> Option<FsRef> {
        match self {
            FeatureValue::Ref(r) => *r,
            _ => None,
        }
    }
}

impl From<i32> for FeatureValue {
    fn from(v: i32) -> Self {
        FeatureValue::Int(v)
    }
}

impl From<bool> for FeatureValue {
    fn from(v: bool) -> Self {
        FeatureValue::Boolean(v)
    }
}

impl From<&str> for FeatureValue {
    fn from(v: &str) -> Self {
        FeatureValue::String(Some(v.to_string()))
    }
}

impl From<FsRef> for FeatureValue {
    fn from(v: FsRef) -> Self {
        FeatureValue::Ref(Some(v))
    }
}

/// How one heap cell is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum CellKind {
    Primitive(PrimitiveKind),
    /// String-table index + 1, 0 for null.
    Str,
    /// Target id, 0 for null.
    Ref,
}

/// What a slot accepts, derived from a feature range or array element type.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SlotTarget {
    Primitive(PrimitiveKind),
    /// Any string, or only the allowed values of a string subtype.
    Str(Option<TypeCode>),
    Ref(TypeCode),
}

impl SlotTarget {
    pub(crate) fn for_range(ts: &TypeSystem, range: TypeCode) -> Self {
        match ts.kind(range) {
            TypeKind::Primitive(p) => SlotTarget::Primitive(p),
            TypeKind::String => SlotTarget::Str(None),
            TypeKind::StringSubtype => SlotTarget::Str(Some(range)),
            _ => SlotTarget::Ref(range),
        }
    }

    pub(crate) fn for_element(element: ElementKind) -> Self {
        match element {
            ElementKind::Primitive(p) => SlotTarget::Primitive(p),
            ElementKind::String => SlotTarget::Str(None),
            ElementKind::Fs(t) => SlotTarget::Ref(t),
        }
    }

    pub(crate) fn cell_kind(self) -> CellKind {
        match self {
            SlotTarget::Primitive(p) => CellKind::Primitive(p),
            SlotTarget::Str(_) => CellKind::Str,
            SlotTarget::Ref(_) => CellKind::Ref,
        }
    }

    pub(crate) fn describe(self, ts: &TypeSystem) -> String {
        match self {
            SlotTarget::Primitive(p) => p.name().to_string(),
            SlotTarget::Str(None) => "string".to_string(),
            SlotTarget::Str(Some(t)) => format!("string value of `{}`", ts.type_name(t)),
            SlotTarget::Ref(t) => format!("reference to `{}`", ts.type_name(t)),
        }
    }
}

/// Targets of every cell of a structure of type `ty` (one per feature), or of
/// an array of `len` elements.
pub(crate) fn slot_targets(ts: &TypeSystem, ty: TypeCode, len: usize) -> Vec<SlotTarget> {
    match ts.element_kind(ty) {
        Some(element) => vec![SlotTarget::for_element(element); len],
        None => ts
            .features_of(ty)
            .iter()
            .map(|f| SlotTarget::for_range(ts, ts.feature_info(*f).range()))
            .collect(),
    }
}

pub(crate) fn encode_primitive(value: &FeatureValue, kind: PrimitiveKind) -> Option<u64> {
    Some(match (kind, value) {
        (PrimitiveKind::Boolean, FeatureValue::Boolean(v)) => *v as u64,
        (PrimitiveKind::Byte, FeatureValue::Byte(v)) => *v as u8 as u64,
        (PrimitiveKind::Short, FeatureValue::Short(v)) => *v as u16 as u64,
        (PrimitiveKind::Integer, FeatureValue::Int(v)) => *v as u32 as u64,
        (PrimitiveKind::Long, FeatureValue::Long(v)) => *v as u64,
        (PrimitiveKind::Float, FeatureValue::Float(v)) => v.to_bits() as u64,
        (PrimitiveKind::Double, FeatureValue::Double(v)) => v.to_bits(),
        _ => return None,
    })
}

pub(crate) fn decode_primitive(cell: u64, kind: PrimitiveKind) -> FeatureValue {
    match kind {
        PrimitiveKind::Boolean => FeatureValue::Boolean(cell != 0),
        PrimitiveKind::Byte => FeatureValue::Byte(cell as u8 as i8),
        PrimitiveKind::Short => FeatureValue::Short(cell as u16 as i16),
        PrimitiveKind::Integer => FeatureValue::Int(cell as u32 as i32),
        PrimitiveKind::Long => FeatureValue::Long(cell as i64),
        PrimitiveKind::Float => FeatureValue::Float(f32::from_bits(cell as u32)),
        PrimitiveKind::Double => FeatureValue::Double(f64::from_bits(cell)),
    }
}

/// Whether `cell` is a value a slot of `kind` could hold.
pub(crate) fn primitive_cell_is_valid(cell: u64, kind: PrimitiveKind) -> bool {
    match kind {
        PrimitiveKind::Boolean => cell <= 1,
        PrimitiveKind::Byte => cell <= u8::MAX as u64,
        PrimitiveKind::Short => cell <= u16::MAX as u64,
        PrimitiveKind::Integer | PrimitiveKind::Float => cell <= u32::MAX as u64,
        PrimitiveKind::Long | PrimitiveKind::Double => true,
    }
}

/// Signed view of an integral cell, used by sort keys and compact encoding.
pub(crate) fn integral_value(cell: u64, kind: PrimitiveKind) -> Option<i64> {
    Some(match kind {
        PrimitiveKind::Boolean => cell as i64,
        PrimitiveKind::Byte => cell as u8 as i8 as i64,
        PrimitiveKind::Short => cell as u16 as i16 as i64,
        PrimitiveKind::Integer => cell as u32 as i32 as i64,
        PrimitiveKind::Long => cell as i64,
        PrimitiveKind::Float | PrimitiveKind::Double => return None,
    })
}

pub(crate) fn float_value(cell: u64, kind: PrimitiveKind) -> Option<f64> {
    match kind {
        PrimitiveKind::Float => Some(f32::from_bits(cell as u32) as f64),
        PrimitiveKind::Double => Some(f64::from_bits(cell)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_cells_round_trip() {
        let cases = [
            (PrimitiveKind::Boolean, FeatureValue::Boolean(true)),
            (PrimitiveKind::Byte, FeatureValue::Byte(-7)),
            (PrimitiveKind::Short, FeatureValue::Short(-300)),
            (PrimitiveKind::Integer, FeatureValue::Int(i32::MIN)),
            (PrimitiveKind::Long, FeatureValue::Long(-1)),
            (PrimitiveKind::Float, FeatureValue::Float(1.5)),
            (PrimitiveKind::Double, FeatureValue::Double(-2.25)),
        ];
        for (kind, value) in cases {
            let cell = encode_primitive(&value, kind).unwrap();
            assert!(primitive_cell_is_valid(cell, kind));
            assert_eq!(decode_primitive(cell, kind), value);
        }
    }

    #[test]
    fn mismatched_kinds_do_not_encode() {
        assert!(encode_primitive(&FeatureValue::Int(1), PrimitiveKind::Long).is_none());
        assert!(encode_primitive(&FeatureValue::String(None), PrimitiveKind::Integer).is_none());
    }

    #[test]
    fn integral_values_are_sign_extended() {
        let cell = encode_primitive(&FeatureValue::Short(-2), PrimitiveKind::Short).unwrap();
        assert_eq!(integral_value(cell, PrimitiveKind::Short), Some(-2));
        assert_eq!(integral_value(cell, PrimitiveKind::Float), None);
    }
}

//! The committed, immutable type system.
//!
//! Types are numbered in pre-order of the inheritance tree, so a type's
//! subtypes occupy the contiguous code range `[code, subtree_end)`. That makes
//! `subsumes` two integer comparisons. Features are numbered globally and
//! carry a fixed slot offset: with single inheritance the flattened feature
//! list of a supertype is always a prefix of its subtypes' lists, so one offset
//! is valid for every type that has the feature.

use std::collections::BTreeSet;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::builder::{DeclKind, ElementDecl, TypeDecl};
use crate::builtin;
use crate::description::TypeSystemDescription;
use crate::digest::Fnv1a64;
use crate::error::{Result, TypeSystemError};
use crate::priority::LinearTypeOrder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TypeCode(u32);

impl TypeCode {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct FeatureCode(u32);

impl FeatureCode {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveKind {
    Boolean,
    Byte,
    Short,
    Integer,
    Long,
    Float,
    Double,
}

impl PrimitiveKind {
    pub fn name(self) -> &'static str {
        match self {
            PrimitiveKind::Boolean => "boolean",
            PrimitiveKind::Byte => "byte",
            PrimitiveKind::Short => "short",
            PrimitiveKind::Integer => "int",
            PrimitiveKind::Long => "long",
            PrimitiveKind::Float => "float",
            PrimitiveKind::Double => "double",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Primitive(PrimitiveKind),
    String,
    /// References to structures of the given type (or its subtypes).
    Fs(TypeCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Top,
    Primitive(PrimitiveKind),
    String,
    StringSubtype,
    ArrayBase,
    Array(ElementKind),
    Structure,
}

/// How a feature's slot is interpreted, derived from its range type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Primitive(PrimitiveKind),
    /// `cas.String` or one of its subtypes.
    String,
    /// A reference to another feature structure (or null).
    Ref,
}

#[derive(Debug, Clone)]
pub struct TypeInfo {
    name: String,
    code: TypeCode,
    supertype: Option<TypeCode>,
    kind: TypeKind,
    declared_features: Vec<FeatureCode>,
    features: Vec<FeatureCode>,
    feature_by_name: AHashMap<String, FeatureCode>,
    subtypes: Vec<TypeCode>,
    allowed_values: Option<Vec<String>>,
    subtree_end: u32,
    depth: u32,
}

impl TypeInfo {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last dotted segment of the name (`org.example.Token` -> `Token`).
    pub fn short_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }

    pub fn code(&self) -> TypeCode {
        self.code
    }

    pub fn supertype(&self) -> Option<TypeCode> {
        self.supertype
    }

    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, TypeKind::Array(_))
    }

    /// Flattened feature closure: inherited features first, slot offset ==
    /// position in this slice.
    pub fn features(&self) -> &[FeatureCode] {
        &self.features
    }

    pub fn declared_features(&self) -> &[FeatureCode] {
        &self.declared_features
    }

    pub fn subtypes(&self) -> &[TypeCode] {
        &self.subtypes
    }

    pub fn allowed_values(&self) -> Option<&[String]> {
        self.allowed_values.as_deref()
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }
}

#[derive(Debug, Clone)]
pub struct FeatureInfo {
    name: String,
    full_name: String,
    code: FeatureCode,
    domain: TypeCode,
    range: TypeCode,
    offset: u32,
    multiple_references_allowed: bool,
}

impl FeatureInfo {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `Type:feature`
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn code(&self) -> FeatureCode {
        self.code
    }

    pub fn domain(&self) -> TypeCode {
        self.domain
    }

    pub fn range(&self) -> TypeCode {
        self.range
    }

    pub fn offset(&self) -> usize {
        self.offset as usize
    }

    pub fn multiple_references_allowed(&self) -> bool {
        self.multiple_references_allowed
    }
}

/// Codes of the built-in types and features the CAS relies on.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinCodes {
    pub top: TypeCode,
    pub string: TypeCode,
    pub array_base: TypeCode,
    pub fs_array: TypeCode,
    pub sofa: TypeCode,
    pub annotation_base: TypeCode,
    pub annotation: TypeCode,
    pub document_annotation: TypeCode,
    pub fs_list: TypeCode,
    pub empty_fs_list: TypeCode,
    pub non_empty_fs_list: TypeCode,
    pub sofa_num: FeatureCode,
    pub sofa_id: FeatureCode,
    pub sofa_mime: FeatureCode,
    pub sofa_array: FeatureCode,
    pub sofa_string: FeatureCode,
    pub sofa_uri: FeatureCode,
    pub sofa_ref: FeatureCode,
    pub begin: FeatureCode,
    pub end: FeatureCode,
    pub language: FeatureCode,
    pub head: FeatureCode,
    pub tail: FeatureCode,
}

#[derive(Debug, Clone)]
pub struct TypeSystem {
    types: Vec<TypeInfo>,
    features: Vec<FeatureInfo>,
    type_by_name: AHashMap<String, TypeCode>,
    feature_by_full_name: AHashMap<String, FeatureCode>,
    order: LinearTypeOrder,
    builtins: BuiltinCodes,
    fingerprint: u64,
    description: TypeSystemDescription,
}

impl TypeSystem {
    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    pub fn feature_count(&self) -> usize {
        self.features.len()
    }

    pub fn get_type(&self, name: &str) -> Option<TypeCode> {
        self.type_by_name.get(name).copied()
    }

    pub fn contains(&self, code: TypeCode) -> bool {
        code.index() < self.types.len()
    }

    /// Panics if `code` did not come from this type system.
    pub fn type_info(&self, code: TypeCode) -> &TypeInfo {
        &self.types[code.index()]
    }

    pub fn type_name(&self, code: TypeCode) -> &str {
        &self.types[code.index()].name
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeInfo> + '_ {
        self.types.iter()
    }

    /// Look up a feature by short name in the closure of `ty`.
    pub fn get_feature(&self, ty: TypeCode, name: &str) -> Option<FeatureCode> {
        self.types.get(ty.index())?.feature_by_name.get(name).copied()
    }

    pub fn feature_by_full_name(&self, full_name: &str) -> Option<FeatureCode> {
        self.feature_by_full_name.get(full_name).copied()
    }

    pub fn contains_feature(&self, code: FeatureCode) -> bool {
        code.index() < self.features.len()
    }

    /// Panics if `code` did not come from this type system.
    pub fn feature_info(&self, code: FeatureCode) -> &FeatureInfo {
        &self.features[code.index()]
    }

    pub fn features_of(&self, ty: TypeCode) -> &[FeatureCode] {
        &self.types[ty.index()].features
    }

    /// Whether `feature` is part of `ty`'s flattened closure.
    pub fn has_feature(&self, ty: TypeCode, feature: FeatureCode) -> bool {
        match self.features.get(feature.index()) {
            Some(info) => self.subsumes(info.domain, ty),
            None => false,
        }
    }

    /// Reflexive, transitive subtype test: is `sub` a `sup`?
    pub fn subsumes(&self, sup: TypeCode, sub: TypeCode) -> bool {
        let Some(info) = self.types.get(sup.index()) else {
            return false;
        };
        sup.0 <= sub.0 && sub.0 < info.subtree_end
    }

    pub fn supertype(&self, ty: TypeCode) -> Option<TypeCode> {
        self.types[ty.index()].supertype
    }

    /// `ty` followed by its ancestors up to `cas.TOP`.
    pub fn ancestors(&self, ty: TypeCode) -> impl Iterator<Item = TypeCode> + '_ {
        std::iter::successors(Some(ty), move |t| self.supertype(*t))
    }

    /// `ty` and every transitive subtype, in code order.
    pub fn subsumed_types(&self, ty: TypeCode) -> impl Iterator<Item = TypeCode> {
        let end = self.types[ty.index()].subtree_end;
        (ty.0..end).map(TypeCode)
    }

    pub fn kind(&self, ty: TypeCode) -> TypeKind {
        self.types[ty.index()].kind
    }

    pub fn value_kind(&self, range: TypeCode) -> ValueKind {
        match self.kind(range) {
            TypeKind::Primitive(p) => ValueKind::Primitive(p),
            TypeKind::String | TypeKind::StringSubtype => ValueKind::String,
            _ => ValueKind::Ref,
        }
    }

    pub fn element_kind(&self, ty: TypeCode) -> Option<ElementKind> {
        match self.kind(ty) {
            TypeKind::Array(element) => Some(element),
            _ => None,
        }
    }

    /// Array type whose elements are `element`, if one exists.
    pub fn array_type_for(&self, element: TypeCode) -> Option<TypeCode> {
        let name = self.type_name(element);
        match builtin::builtin_array_for(name) {
            Some(builtin_name) => self.get_type(builtin_name),
            None => self.get_type(&format!("{name}{}", builtin::ARRAY_SUFFIX)),
        }
    }

    pub fn priority(&self) -> &LinearTypeOrder {
        &self.order
    }

    pub fn builtins(&self) -> &BuiltinCodes {
        &self.builtins
    }

    /// FNV-1a 64 over a canonical rendering of every type and feature.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// The user declarations this type system was committed from.
    pub fn description(&self) -> &TypeSystemDescription {
        &self.description
    }

    pub(crate) fn assemble(
        mut decls: Vec<TypeDecl>,
        priority_lists: &[Vec<String>],
        description: TypeSystemDescription,
    ) -> Result<Self> {
        synthesize_array_types(&mut decls)?;

        let by_name: AHashMap<String, usize> = decls
            .iter()
            .enumerate()
            .map(|(i, d)| (d.name.clone(), i))
            .collect();

        // Resolve supertypes.
        let mut parent: Vec<Option<usize>> = Vec::with_capacity(decls.len());
        let mut root = None;
        for (i, decl) in decls.iter().enumerate() {
            match &decl.supertype {
                None => {
                    root = Some(i);
                    parent.push(None);
                }
                Some(sup) => {
                    let Some(&p) = by_name.get(sup) else {
                        return Err(TypeSystemError::UnresolvedSupertype {
                            type_name: decl.name.clone(),
                            supertype: sup.clone(),
                        });
                    };
                    parent.push(Some(p));
                }
            }
        }
        let Some(root) = root else {
            return Err(TypeSystemError::UnknownType(builtin::TOP.to_string()));
        };

        // Every chain must reach the root within `n` steps.
        for (i, decl) in decls.iter().enumerate() {
            let mut cursor = i;
            let mut steps = 0usize;
            while let Some(p) = parent[cursor] {
                cursor = p;
                steps += 1;
                if steps > decls.len() {
                    return Err(TypeSystemError::Cycle {
                        type_name: decl.name.clone(),
                    });
                }
            }
        }

        for (i, decl) in decls.iter().enumerate() {
            let Some(p) = parent[i] else { continue };
            let sup = &decls[p];
            if is_final(sup, decl) {
                return Err(TypeSystemError::FinalSupertype {
                    type_name: decl.name.clone(),
                    supertype: sup.name.clone(),
                });
            }
        }

        let mut children: Vec<Vec<usize>> = vec![Vec::new(); decls.len()];
        for (i, p) in parent.iter().enumerate() {
            if let Some(p) = p {
                children[*p].push(i);
            }
        }

        // Pre-order numbering, children in declaration order.
        let mut preorder: Vec<usize> = Vec::with_capacity(decls.len());
        let mut stack = vec![root];
        while let Some(d) = stack.pop() {
            preorder.push(d);
            for &c in children[d].iter().rev() {
                stack.push(c);
            }
        }
        let mut code_of = vec![0u32; decls.len()];
        for (code, &d) in preorder.iter().enumerate() {
            code_of[d] = code as u32;
        }

        let mut subtree_size = vec![1u32; decls.len()];
        for &d in preorder.iter().rev() {
            if let Some(p) = parent[d] {
                subtree_size[p] += subtree_size[d];
            }
        }

        let mut types: Vec<TypeInfo> = Vec::with_capacity(decls.len());
        for &d in &preorder {
            let decl = &decls[d];
            let code = code_of[d];
            let supertype = parent[d].map(|p| TypeCode(code_of[p]));
            let depth = supertype.map(|s| types[s.index()].depth + 1).unwrap_or(0);
            let kind = match &decl.kind {
                DeclKind::Top => TypeKind::Top,
                DeclKind::Primitive(p) => TypeKind::Primitive(*p),
                DeclKind::String => TypeKind::String,
                DeclKind::StringSubtype(_) => TypeKind::StringSubtype,
                DeclKind::ArrayBase => TypeKind::ArrayBase,
                DeclKind::Array(ElementDecl::Primitive(p)) => {
                    TypeKind::Array(ElementKind::Primitive(*p))
                }
                DeclKind::Array(ElementDecl::String) => TypeKind::Array(ElementKind::String),
                DeclKind::Array(ElementDecl::Fs(element)) => {
                    let Some(&e) = by_name.get(element) else {
                        return Err(TypeSystemError::UnknownType(element.clone()));
                    };
                    TypeKind::Array(ElementKind::Fs(TypeCode(code_of[e])))
                }
                DeclKind::Structure => TypeKind::Structure,
            };
            let allowed_values = match &decl.kind {
                DeclKind::StringSubtype(values) => Some(values.clone()),
                _ => None,
            };
            types.push(TypeInfo {
                name: decl.name.clone(),
                code: TypeCode(code),
                supertype,
                kind,
                declared_features: Vec::new(),
                features: Vec::new(),
                feature_by_name: AHashMap::new(),
                subtypes: children[d].iter().map(|&c| TypeCode(code_of[c])).collect(),
                allowed_values,
                subtree_end: code + subtree_size[d],
                depth,
            });
        }

        // Flatten features; parents are always processed before children.
        let mut features: Vec<FeatureInfo> = Vec::new();
        for (code, &d) in preorder.iter().enumerate() {
            let decl = &decls[d];
            let (mut flat, mut by_name_map) = match types[code].supertype {
                Some(s) => (
                    types[s.index()].features.clone(),
                    types[s.index()].feature_by_name.clone(),
                ),
                None => (Vec::new(), AHashMap::new()),
            };
            let mut declared = Vec::new();
            for f in &decl.features {
                let Some(&r) = by_name.get(&f.range) else {
                    return Err(TypeSystemError::UnresolvedRange {
                        type_name: decl.name.clone(),
                        feature: f.name.clone(),
                        range: f.range.clone(),
                    });
                };
                let range = TypeCode(code_of[r]);
                if let Some(&existing) = by_name_map.get(&f.name) {
                    let existing: &FeatureInfo = &features[FeatureCode::index(existing)];
                    if existing.range == range {
                        continue;
                    }
                    return Err(TypeSystemError::FeatureCollision {
                        type_name: decl.name.clone(),
                        feature: f.name.clone(),
                        range: f.range.clone(),
                        existing_owner: types[existing.domain.index()].name.clone(),
                        existing_range: types[existing.range.index()].name.clone(),
                    });
                }
                let fc = FeatureCode(features.len() as u32);
                features.push(FeatureInfo {
                    name: f.name.clone(),
                    full_name: format!("{}:{}", decl.name, f.name),
                    code: fc,
                    domain: TypeCode(code as u32),
                    range,
                    offset: flat.len() as u32,
                    multiple_references_allowed: f.multiple_references_allowed,
                });
                by_name_map.insert(f.name.clone(), fc);
                flat.push(fc);
                declared.push(fc);
            }
            let info = &mut types[code];
            info.features = flat;
            info.feature_by_name = by_name_map;
            info.declared_features = declared;
        }

        let type_by_name: AHashMap<String, TypeCode> =
            types.iter().map(|t| (t.name.clone(), t.code)).collect();
        let feature_by_full_name: AHashMap<String, FeatureCode> = features
            .iter()
            .map(|f| (f.full_name.clone(), f.code))
            .collect();

        let order = LinearTypeOrder::build(&types, &type_by_name, priority_lists)?;
        let builtins = resolve_builtins(&type_by_name, &feature_by_full_name)?;
        let fingerprint = compute_fingerprint(&types, &features);

        Ok(Self {
            types,
            features,
            type_by_name,
            feature_by_full_name,
            order,
            builtins,
            fingerprint,
            description,
        })
    }
}

fn is_final(sup: &TypeDecl, sub: &TypeDecl) -> bool {
    match &sup.kind {
        DeclKind::Top | DeclKind::Structure => sup.name == builtin::SOFA,
        DeclKind::String => !matches!(sub.kind, DeclKind::StringSubtype(_)),
        DeclKind::ArrayBase => !matches!(sub.kind, DeclKind::Array(_)) || !sub.builtin,
        // Synthesized typed arrays hang below `cas.FSArray`.
        DeclKind::Array(ElementDecl::Fs(_)) => {
            !(sup.name == builtin::FS_ARRAY && matches!(sub.kind, DeclKind::Array(_)))
        }
        DeclKind::Primitive(_)
        | DeclKind::StringSubtype(_)
        | DeclKind::Array(_) => true,
    }
}

/// Turn `X[]` ranges into array types: built-in arrays for primitives,
/// strings and `cas.TOP`, synthesized `cas.FSArray` subtypes otherwise.
fn synthesize_array_types(decls: &mut Vec<TypeDecl>) -> Result<()> {
    let mut wanted: BTreeSet<String> = BTreeSet::new();
    for decl in decls.iter() {
        for f in &decl.features {
            if let Some(element) = f.range.strip_suffix(builtin::ARRAY_SUFFIX) {
                wanted.insert(element.to_string());
            }
        }
    }
    if wanted.is_empty() {
        return Ok(());
    }

    let mut rewrite: AHashMap<String, String> = AHashMap::new();
    let mut synthesized = Vec::new();
    for element in wanted {
        let array_name = format!("{element}{}", builtin::ARRAY_SUFFIX);
        if let Some(builtin_array) = builtin::builtin_array_for(&element) {
            rewrite.insert(array_name, builtin_array.to_string());
            continue;
        }
        let Some(element_decl) = decls.iter().find(|d| d.name == element) else {
            let (type_name, feature) = decls
                .iter()
                .flat_map(|d| d.features.iter().map(move |f| (d, f)))
                .find(|(_, f)| f.range == array_name)
                .map(|(d, f)| (d.name.clone(), f.name.clone()))
                .unwrap_or_default();
            return Err(TypeSystemError::UnresolvedRange {
                type_name,
                feature,
                range: array_name,
            });
        };
        match element_decl.kind {
            DeclKind::String | DeclKind::StringSubtype(_) => {
                rewrite.insert(array_name, builtin::STRING_ARRAY.to_string());
            }
            DeclKind::Primitive(_) => {
                // Only reachable for primitives missing from the built-in table.
                return Err(TypeSystemError::UnknownType(array_name));
            }
            _ => synthesized.push(TypeDecl {
                name: array_name,
                supertype: Some(builtin::FS_ARRAY.to_string()),
                kind: DeclKind::Array(ElementDecl::Fs(element)),
                features: Vec::new(),
                builtin: false,
            }),
        }
    }

    for decl in decls.iter_mut() {
        for f in decl.features.iter_mut() {
            if let Some(target) = rewrite.get(&f.range) {
                f.range = target.clone();
            }
        }
    }
    decls.extend(synthesized);
    Ok(())
}

fn resolve_builtins(
    types: &AHashMap<String, TypeCode>,
    features: &AHashMap<String, FeatureCode>,
) -> Result<BuiltinCodes> {
    let ty = |name: &str| {
        types
            .get(name)
            .copied()
            .ok_or_else(|| TypeSystemError::UnknownType(name.to_string()))
    };
    let feat = |owner: &str, name: &str| {
        let full = format!("{owner}:{name}");
        features
            .get(&full)
            .copied()
            .ok_or(TypeSystemError::UnknownType(full))
    };
    Ok(BuiltinCodes {
        top: ty(builtin::TOP)?,
        string: ty(builtin::STRING)?,
        array_base: ty(builtin::ARRAY_BASE)?,
        fs_array: ty(builtin::FS_ARRAY)?,
        sofa: ty(builtin::SOFA)?,
        annotation_base: ty(builtin::ANNOTATION_BASE)?,
        annotation: ty(builtin::ANNOTATION)?,
        document_annotation: ty(builtin::DOCUMENT_ANNOTATION)?,
        fs_list: ty(builtin::FS_LIST)?,
        empty_fs_list: ty(builtin::EMPTY_FS_LIST)?,
        non_empty_fs_list: ty(builtin::NON_EMPTY_FS_LIST)?,
        sofa_num: feat(builtin::SOFA, builtin::FEAT_SOFA_NUM)?,
        sofa_id: feat(builtin::SOFA, builtin::FEAT_SOFA_ID)?,
        sofa_mime: feat(builtin::SOFA, builtin::FEAT_SOFA_MIME)?,
        sofa_array: feat(builtin::SOFA, builtin::FEAT_SOFA_ARRAY)?,
        sofa_string: feat(builtin::SOFA, builtin::FEAT_SOFA_STRING)?,
        sofa_uri: feat(builtin::SOFA, builtin::FEAT_SOFA_URI)?,
        sofa_ref: feat(builtin::ANNOTATION_BASE, builtin::FEAT_SOFA)?,
        begin: feat(builtin::ANNOTATION, builtin::FEAT_BEGIN)?,
        end: feat(builtin::ANNOTATION, builtin::FEAT_END)?,
        language: feat(builtin::DOCUMENT_ANNOTATION, builtin::FEAT_LANGUAGE)?,
        head: feat(builtin::NON_EMPTY_FS_LIST, builtin::FEAT_HEAD)?,
        tail: feat(builtin::NON_EMPTY_FS_LIST, builtin::FEAT_TAIL)?,
    })
}

fn compute_fingerprint(types: &[TypeInfo], features: &[FeatureInfo]) -> u64 {
    let mut hash = Fnv1a64::new();
    for t in types {
        hash.add_str("type=");
        hash.add_str(&t.name);
        hash.add_str("|super=");
        if let Some(s) = t.supertype {
            hash.add_str(&types[s.index()].name);
        }
        hash.add_str(&format!("|kind={:?}", t.kind));
        if let Some(values) = &t.allowed_values {
            for v in values {
                hash.add_str("|allowed=");
                hash.add_str(v);
            }
        }
        for &f in &t.declared_features {
            let f = &features[f.index()];
            hash.add_str("|feature=");
            hash.add_str(&f.name);
            hash.add_str(":");
            hash.add_str(&types[f.range.index()].name);
            hash.add_str(if f.multiple_references_allowed { ":m" } else { ":s" });
        }
        hash.add_str(";");
    }
    hash.finish()
}

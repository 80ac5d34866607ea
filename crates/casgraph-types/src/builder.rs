//! Mutable type-system assembly.
//!
//! Declarations are collected by name and only cross-checked at `commit`, so
//! independently authored pieces (descriptor imports, component type systems)
//! can be merged in any order. Redeclaring something identically is a no-op;
//! redeclaring it differently is an error raised at declaration time.

use std::sync::{Arc, OnceLock};

use ahash::AHashMap;
use regex::Regex;

use crate::builtin;
use crate::description::{
    FeatureDescription, IndexDescription, TypeDescription, TypeSystemDescription,
};
use crate::error::{Result, TypeSystemError};
use crate::type_system::{PrimitiveKind, TypeSystem};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ElementDecl {
    Primitive(PrimitiveKind),
    String,
    Fs(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DeclKind {
    Top,
    Primitive(PrimitiveKind),
    String,
    StringSubtype(Vec<String>),
    ArrayBase,
    Array(ElementDecl),
    Structure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FeatureDecl {
    pub name: String,
    pub range: String,
    pub multiple_references_allowed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TypeDecl {
    pub name: String,
    pub supertype: Option<String>,
    pub kind: DeclKind,
    pub features: Vec<FeatureDecl>,
    pub builtin: bool,
}

/// Handle to a type declared in a builder (position in declaration order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeHandle(u32);

impl TypeHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle to a feature declared in a builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeatureHandle {
    pub owner: TypeHandle,
    index: u32,
}

impl FeatureHandle {
    pub fn index(self) -> usize {
        self.index as usize
    }
}

fn type_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$").expect("valid regex")
    })
}

fn feature_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"))
}

pub(crate) fn check_type_name(name: &str) -> Result<()> {
    if type_name_re().is_match(name) {
        Ok(())
    } else {
        Err(TypeSystemError::InvalidName {
            what: "type",
            name: name.to_string(),
        })
    }
}

fn check_range_name(name: &str) -> Result<()> {
    let element = name.strip_suffix(builtin::ARRAY_SUFFIX).unwrap_or(name);
    check_type_name(element).map_err(|_| TypeSystemError::InvalidName {
        what: "range type",
        name: name.to_string(),
    })
}

fn check_feature_name(name: &str) -> Result<()> {
    if feature_name_re().is_match(name) {
        Ok(())
    } else {
        Err(TypeSystemError::InvalidName {
            what: "feature",
            name: name.to_string(),
        })
    }
}

/// Collects type, feature, priority and index declarations until `commit`.
#[derive(Debug, Clone)]
pub struct TypeSystemBuilder {
    decls: Vec<TypeDecl>,
    by_name: AHashMap<String, usize>,
    priority_lists: Vec<Vec<String>>,
    indexes: Vec<IndexDescription>,
}

impl Default for TypeSystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeSystemBuilder {
    /// A builder pre-populated with the built-in types.
    pub fn new() -> Self {
        let decls = builtin::declarations();
        let by_name = decls
            .iter()
            .enumerate()
            .map(|(i, d)| (d.name.clone(), i))
            .collect();
        Self {
            decls,
            by_name,
            priority_lists: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn from_description(desc: &TypeSystemDescription) -> Result<Self> {
        let mut builder = Self::new();
        builder.add_description(desc)?;
        Ok(builder)
    }

    pub fn contains_type(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn type_handle(&self, name: &str) -> Option<TypeHandle> {
        self.by_name.get(name).map(|&i| TypeHandle(i as u32))
    }

    /// Declare `name` as a direct subtype of `supertype`.
    ///
    /// The supertype does not have to exist yet; it is resolved at commit.
    pub fn declare_type(&mut self, name: &str, supertype: &str) -> Result<TypeHandle> {
        check_type_name(name)?;
        check_type_name(supertype)?;

        if let Some(&index) = self.by_name.get(name) {
            let existing = &self.decls[index];
            let existing_super = existing.supertype.as_deref().unwrap_or("");
            if existing_super != supertype {
                return Err(TypeSystemError::ConflictingSupertype {
                    type_name: name.to_string(),
                    existing: existing_super.to_string(),
                    new: supertype.to_string(),
                });
            }
            return Ok(TypeHandle(index as u32));
        }

        Ok(self.push_decl(TypeDecl {
            name: name.to_string(),
            supertype: Some(supertype.to_string()),
            kind: DeclKind::Structure,
            features: Vec::new(),
            builtin: false,
        }))
    }

    /// Declare a subtype of `cas.String` restricted to `allowed_values`.
    pub fn declare_string_subtype<S: AsRef<str>>(
        &mut self,
        name: &str,
        allowed_values: &[S],
    ) -> Result<TypeHandle> {
        check_type_name(name)?;
        let allowed: Vec<String> = allowed_values
            .iter()
            .map(|s| s.as_ref().to_string())
            .collect();

        if let Some(&index) = self.by_name.get(name) {
            let existing = &self.decls[index];
            return match &existing.kind {
                DeclKind::StringSubtype(values) if *values == allowed => {
                    Ok(TypeHandle(index as u32))
                }
                DeclKind::StringSubtype(_) => Err(TypeSystemError::ConflictingAllowedValues {
                    type_name: name.to_string(),
                }),
                _ => Err(TypeSystemError::ConflictingSupertype {
                    type_name: name.to_string(),
                    existing: existing.supertype.clone().unwrap_or_default(),
                    new: builtin::STRING.to_string(),
                }),
            };
        }

        Ok(self.push_decl(TypeDecl {
            name: name.to_string(),
            supertype: Some(builtin::STRING.to_string()),
            kind: DeclKind::StringSubtype(allowed),
            features: Vec::new(),
            builtin: false,
        }))
    }

    /// Declare feature `feature` on the already-declared `type_name`.
    pub fn declare_feature(
        &mut self,
        type_name: &str,
        feature: &str,
        range: &str,
        multiple_references_allowed: bool,
    ) -> Result<FeatureHandle> {
        check_feature_name(feature)?;
        check_range_name(range)?;

        let Some(&type_index) = self.by_name.get(type_name) else {
            return Err(TypeSystemError::UnknownType(type_name.to_string()));
        };
        let decl = &mut self.decls[type_index];
        if decl.kind != DeclKind::Structure || decl.name == builtin::SOFA {
            return Err(TypeSystemError::FeaturesNotAllowed {
                type_name: type_name.to_string(),
            });
        }

        if let Some(pos) = decl.features.iter().position(|f| f.name == feature) {
            let existing = &mut decl.features[pos];
            if existing.range != range {
                return Err(TypeSystemError::ConflictingFeatureRange {
                    type_name: type_name.to_string(),
                    feature: feature.to_string(),
                    existing: existing.range.clone(),
                    new: range.to_string(),
                });
            }
            existing.multiple_references_allowed |= multiple_references_allowed;
            return Ok(FeatureHandle {
                owner: TypeHandle(type_index as u32),
                index: pos as u32,
            });
        }

        decl.features.push(FeatureDecl {
            name: feature.to_string(),
            range: range.to_string(),
            multiple_references_allowed,
        });
        Ok(FeatureHandle {
            owner: TypeHandle(type_index as u32),
            index: (decl.features.len() - 1) as u32,
        })
    }

    /// Add a priority list: earlier entries sort before later ones.
    pub fn declare_priority_list<I, S>(&mut self, types: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let list: Vec<String> = types.into_iter().map(Into::into).collect();
        if list.len() > 1 && !self.priority_lists.contains(&list) {
            self.priority_lists.push(list);
        }
    }

    /// Declare an index every CAS over this type system starts with. Labels
    /// are unique; redeclaring an identical index is a no-op.
    pub fn declare_index(&mut self, index: IndexDescription) -> Result<()> {
        match self.indexes.iter().find(|i| i.label == index.label) {
            Some(existing) if *existing == index => Ok(()),
            Some(_) => Err(TypeSystemError::ConflictingIndex { label: index.label }),
            None => {
                self.indexes.push(index);
                Ok(())
            }
        }
    }

    pub fn indexes(&self) -> &[IndexDescription] {
        &self.indexes
    }

    /// Union another builder's declarations into this one.
    pub fn merge(&mut self, other: &TypeSystemBuilder) -> Result<()> {
        self.add_description(&other.to_description())
    }

    pub fn add_description(&mut self, desc: &TypeSystemDescription) -> Result<()> {
        // Types first so that features may reference types declared later in
        // the same description.
        for ty in &desc.types {
            if ty.allowed_values.is_empty() {
                self.declare_type(&ty.name, &ty.supertype)?;
            } else if ty.supertype == builtin::STRING {
                self.declare_string_subtype(&ty.name, &ty.allowed_values)?;
            } else {
                return Err(TypeSystemError::FinalSupertype {
                    type_name: ty.name.clone(),
                    supertype: ty.supertype.clone(),
                });
            }
        }
        for ty in &desc.types {
            for f in &ty.features {
                self.declare_feature(&ty.name, &f.name, &f.range, f.multiple_references_allowed)?;
            }
        }
        for list in &desc.priority_lists {
            self.declare_priority_list(list.iter().cloned());
        }
        for index in &desc.indexes {
            self.declare_index(index.clone())?;
        }
        Ok(())
    }

    /// Features declared on built-in types are kept too, so a description
    /// round-trips additions like `cas.DocumentAnnotation:author`.
    pub fn to_description(&self) -> TypeSystemDescription {
        let mut types = Vec::new();
        let builtin_defaults = builtin::declarations();
        for decl in &self.decls {
            let features: Vec<FeatureDescription> = if decl.builtin {
                let defaults = builtin_defaults
                    .iter()
                    .find(|d| d.name == decl.name)
                    .map(|d| d.features.len())
                    .unwrap_or(0);
                decl.features[defaults..].iter().map(feature_description).collect()
            } else {
                decl.features.iter().map(feature_description).collect()
            };
            if decl.builtin && features.is_empty() {
                continue;
            }
            let allowed_values = match &decl.kind {
                DeclKind::StringSubtype(values) => values.clone(),
                _ => Vec::new(),
            };
            types.push(TypeDescription {
                name: decl.name.clone(),
                supertype: decl.supertype.clone().unwrap_or_default(),
                features,
                allowed_values,
            });
        }
        TypeSystemDescription {
            name: None,
            types,
            priority_lists: self.priority_lists.clone(),
            indexes: self.indexes.clone(),
        }
    }

    /// Resolve, validate and freeze the declarations.
    pub fn commit(&self) -> Result<Arc<TypeSystem>> {
        let ts = TypeSystem::assemble(self.decls.clone(), &self.priority_lists, self.to_description())?;
        tracing::debug!(
            types = ts.type_count(),
            features = ts.feature_count(),
            fingerprint = %format!("{:016x}", ts.fingerprint()),
            "committed type system"
        );
        Ok(Arc::new(ts))
    }

    fn push_decl(&mut self, decl: TypeDecl) -> TypeHandle {
        let index = self.decls.len();
        self.by_name.insert(decl.name.clone(), index);
        self.decls.push(decl);
        TypeHandle(index as u32)
    }
}

fn feature_description(f: &FeatureDecl) -> FeatureDescription {
    FeatureDescription {
        name: f.name.clone(),
        range: f.range.clone(),
        multiple_references_allowed: f.multiple_references_allowed,
    }
}

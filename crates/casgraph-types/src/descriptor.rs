//! XML type-system descriptors.
//!
//! ```xml
//! <typeSystemDescription>
//!   <name>example</name>
//!   <imports><import location="common.xml"/><import name="org.example.Base"/></imports>
//!   <types>
//!     <typeDescription>
//!       <name>org.example.Token</name>
//!       <supertypeName>cas.Annotation</supertypeName>
//!       <features>
//!         <featureDescription>
//!           <name>pos</name>
//!           <rangeTypeName>cas.String</rangeTypeName>
//!         </featureDescription>
//!       </features>
//!     </typeDescription>
//!   </types>
//!   <typePriorities><priorityList><type>A</type><type>B</type></priorityList></typePriorities>
//!   <fsIndexes>...</fsIndexes>
//! </typeSystemDescription>
//! ```
//!
//! Imports are followed through a [`ResourceResolver`]; every resource is read
//! at most once per load, so diamond and cyclic imports terminate.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::builtin;
use crate::description::{
    FeatureDescription, IndexDescription, IndexKeyDescription, IndexKind, KeyDirection,
    TypeDescription, TypeSystemDescription,
};
use crate::error::{Result, TypeSystemError};
use crate::type_system::TypeSystem;
use crate::xml::{parse_document, XmlElement};
use crate::TypeSystemBuilder;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Import {
    /// Path relative to the importing descriptor.
    Location(String),
    /// Dotted name looked up on the resolver's search path.
    Name(String),
}

/// One descriptor document, before its imports are followed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDescriptor {
    pub description: TypeSystemDescription,
    pub imports: Vec<Import>,
}

fn descriptor_error(message: impl Into<String>) -> TypeSystemError {
    TypeSystemError::Descriptor(message.into())
}

fn required_text<'a>(element: &'a XmlElement, child: &str) -> Result<&'a str> {
    match element.child_text(child) {
        Some(text) if !text.is_empty() => Ok(text),
        _ => Err(descriptor_error(format!(
            "<{}> at byte {} is missing <{child}>",
            element.local_name(),
            element.position
        ))),
    }
}

fn parse_feature(element: &XmlElement) -> Result<FeatureDescription> {
    let name = required_text(element, "name")?.to_string();
    let range = required_text(element, "rangeTypeName")?;
    let range = match element.child_text("elementType") {
        Some(el) if !el.is_empty() && range == builtin::FS_ARRAY => {
            format!("{el}{}", builtin::ARRAY_SUFFIX)
        }
        _ => range.to_string(),
    };
    let multiple_references_allowed = element
        .child_text("multipleReferencesAllowed")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    Ok(FeatureDescription {
        name,
        range,
        multiple_references_allowed,
    })
}

fn parse_type(element: &XmlElement) -> Result<TypeDescription> {
    let name = required_text(element, "name")?.to_string();
    let supertype = required_text(element, "supertypeName")?.to_string();
    let mut features = Vec::new();
    if let Some(list) = element.child("features") {
        for f in list.children_named("featureDescription") {
            features.push(parse_feature(f)?);
        }
    }
    let mut allowed_values = Vec::new();
    if let Some(list) = element.child("allowedValues") {
        for v in list.children_named("value") {
            allowed_values.push(required_text(v, "string")?.to_string());
        }
    }
    Ok(TypeDescription {
        name,
        supertype,
        features,
        allowed_values,
    })
}

fn parse_index(element: &XmlElement) -> Result<IndexDescription> {
    let label = required_text(element, "label")?;
    let type_name = required_text(element, "typeName")?;
    let kind = match element.child_text("kind") {
        None | Some("") => IndexKind::Sorted,
        Some(k) => IndexKind::parse(k)
            .ok_or_else(|| descriptor_error(format!("index `{label}` has unknown kind `{k}`")))?,
    };
    let mut index = IndexDescription::new(label, type_name, kind);
    if let Some(keys) = element.child("keys") {
        for key in keys.children_named("fsIndexKey") {
            if key.child("typePriority").is_some() {
                index = index.with_type_priority();
                continue;
            }
            let feature = required_text(key, "featureName")?;
            let direction = match key.child_text("comparator") {
                None | Some("") | Some("standard") => KeyDirection::Standard,
                Some("reverse") => KeyDirection::Reverse,
                Some(other) => {
                    return Err(descriptor_error(format!(
                        "index `{label}` key `{feature}` has unknown comparator `{other}`"
                    )))
                }
            };
            index = index.with_key(feature, direction);
        }
    }
    Ok(index)
}

/// Parse one descriptor document without following its imports.
pub fn parse_descriptor(text: &str) -> Result<ParsedDescriptor> {
    let root = parse_document(text).map_err(|e| descriptor_error(e.to_string()))?;
    if root.local_name() != "typeSystemDescription" {
        return Err(descriptor_error(format!(
            "expected <typeSystemDescription>, found <{}>",
            root.name
        )));
    }

    let mut description = TypeSystemDescription {
        name: root.child_text("name").filter(|n| !n.is_empty()).map(str::to_string),
        ..TypeSystemDescription::default()
    };

    let mut imports = Vec::new();
    if let Some(list) = root.child("imports") {
        for import in list.children_named("import") {
            match (import.attr("location"), import.attr("name")) {
                (Some(location), _) => imports.push(Import::Location(location.to_string())),
                (None, Some(name)) => imports.push(Import::Name(name.to_string())),
                (None, None) => {
                    return Err(descriptor_error(format!(
                        "<import> at byte {} has neither location nor name",
                        import.position
                    )))
                }
            }
        }
    }

    if let Some(types) = root.child("types") {
        for t in types.children_named("typeDescription") {
            description.types.push(parse_type(t)?);
        }
    }

    if let Some(priorities) = root.child("typePriorities") {
        for list in priorities.children_named("priorityList") {
            let names: Vec<String> = list
                .children_named("type")
                .map(|t| t.text.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
            description.priority_lists.push(names);
        }
    }

    if let Some(indexes) = root.child("fsIndexes") {
        for index in indexes.children_named("fsIndexDescription") {
            description.indexes.push(parse_index(index)?);
        }
    }

    Ok(ParsedDescriptor {
        description,
        imports,
    })
}

/// Locates and reads descriptor resources.
///
/// Keys returned by the `resolve_*` methods identify a resource uniquely;
/// the loader uses them to skip resources it has already read.
pub trait ResourceResolver {
    /// Resolve `location`, relative to the resource `base` when given.
    fn resolve_location(&self, location: &str, base: Option<&str>) -> Result<String>;

    /// Resolve a dotted descriptor name such as `org.example.TypeSystem`.
    fn resolve_name(&self, name: &str) -> Result<String>;

    fn read(&self, key: &str) -> Result<String>;
}

fn import_error(target: &str, message: impl Into<String>) -> TypeSystemError {
    TypeSystemError::Import {
        target: target.to_string(),
        message: message.into(),
    }
}

fn name_to_relative_path(name: &str) -> String {
    format!("{}.xml", name.replace('.', "/"))
}

/// Resolves against the filesystem plus a list of search directories.
#[derive(Debug, Clone, Default)]
pub struct FileResolver {
    search_paths: Vec<PathBuf>,
}

impl FileResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_search_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_paths.push(dir.into());
        self
    }

    fn canonical(path: &Path, target: &str) -> Result<String> {
        let canonical = path
            .canonicalize()
            .map_err(|e| import_error(target, format!("{}: {e}", path.display())))?;
        Ok(canonical.to_string_lossy().into_owned())
    }
}

impl ResourceResolver for FileResolver {
    fn resolve_location(&self, location: &str, base: Option<&str>) -> Result<String> {
        let path = Path::new(location);
        if path.is_absolute() {
            return Self::canonical(path, location);
        }
        if let Some(dir) = base.and_then(|b| Path::new(b).parent()) {
            let candidate = dir.join(path);
            if candidate.exists() {
                return Self::canonical(&candidate, location);
            }
        }
        for dir in &self.search_paths {
            let candidate = dir.join(path);
            if candidate.exists() {
                return Self::canonical(&candidate, location);
            }
        }
        Self::canonical(path, location)
    }

    fn resolve_name(&self, name: &str) -> Result<String> {
        let relative = name_to_relative_path(name);
        for dir in &self.search_paths {
            let candidate = dir.join(&relative);
            if candidate.exists() {
                return Self::canonical(&candidate, name);
            }
        }
        Err(import_error(name, "not found on the search path"))
    }

    fn read(&self, key: &str) -> Result<String> {
        std::fs::read_to_string(key).map_err(|e| import_error(key, e.to_string()))
    }
}

/// In-memory documents keyed by `/`-separated paths.
#[derive(Debug, Clone, Default)]
pub struct MemoryResolver {
    documents: AHashMap<String, String>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, text: &str) -> &mut Self {
        self.documents.insert(normalize(key), text.to_string());
        self
    }
}

fn normalize(key: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(key).components() {
        match component {
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            _ => {}
        }
    }
    parts.join("/")
}

impl ResourceResolver for MemoryResolver {
    fn resolve_location(&self, location: &str, base: Option<&str>) -> Result<String> {
        let joined = match base.and_then(|b| b.rsplit_once('/')) {
            Some((dir, _)) => format!("{dir}/{location}"),
            None => location.to_string(),
        };
        let key = normalize(&joined);
        if self.documents.contains_key(&key) {
            Ok(key)
        } else {
            Err(import_error(location, "no such document"))
        }
    }

    fn resolve_name(&self, name: &str) -> Result<String> {
        let key = name_to_relative_path(name);
        if self.documents.contains_key(&key) {
            Ok(key)
        } else {
            Err(import_error(name, "no such document"))
        }
    }

    fn read(&self, key: &str) -> Result<String> {
        self.documents
            .get(key)
            .cloned()
            .ok_or_else(|| import_error(key, "no such document"))
    }
}

/// Follows imports and concatenates everything into one description.
///
/// Imported declarations come before the importer's own, so a later
/// conflicting redeclaration is reported against the importer.
pub struct DescriptorLoader<R> {
    resolver: R,
    loaded: AHashSet<String>,
}

impl<R: ResourceResolver> DescriptorLoader<R> {
    pub fn new(resolver: R) -> Self {
        Self {
            resolver,
            loaded: AHashSet::new(),
        }
    }

    pub fn load_location(&mut self, location: &str) -> Result<TypeSystemDescription> {
        let key = self.resolver.resolve_location(location, None)?;
        let mut out = TypeSystemDescription::default();
        self.load_into(&key, &mut out)?;
        Ok(out)
    }

    pub fn load_name(&mut self, name: &str) -> Result<TypeSystemDescription> {
        let key = self.resolver.resolve_name(name)?;
        let mut out = TypeSystemDescription::default();
        self.load_into(&key, &mut out)?;
        Ok(out)
    }

    fn load_into(&mut self, key: &str, out: &mut TypeSystemDescription) -> Result<()> {
        if !self.loaded.insert(key.to_string()) {
            tracing::trace!(resource = key, "descriptor already loaded");
            return Ok(());
        }
        let text = self.resolver.read(key)?;
        let parsed = parse_descriptor(&text).map_err(|e| match e {
            TypeSystemError::Descriptor(message) => import_error(key, message),
            other => other,
        })?;
        tracing::debug!(
            resource = key,
            types = parsed.description.types.len(),
            imports = parsed.imports.len(),
            "loaded descriptor"
        );

        let description = parsed.description;
        // The outermost named descriptor names the result, not its imports.
        if out.name.is_none() {
            out.name = description.name;
        }

        for import in &parsed.imports {
            let target = match import {
                Import::Location(location) => self.resolver.resolve_location(location, Some(key))?,
                Import::Name(name) => self.resolver.resolve_name(name)?,
            };
            self.load_into(&target, out)?;
        }

        out.types.extend(description.types);
        out.priority_lists.extend(description.priority_lists);
        for index in description.indexes {
            if !out.indexes.contains(&index) {
                out.indexes.push(index);
            }
        }
        Ok(())
    }
}

/// Load a descriptor file (and its imports) and commit it.
///
/// Name imports are searched for relative to the file's directory.
pub fn load_type_system(path: impl AsRef<Path>) -> Result<(Arc<TypeSystem>, TypeSystemDescription)> {
    let path = path.as_ref();
    let mut resolver = FileResolver::new();
    if let Some(dir) = path.parent() {
        resolver = resolver.with_search_path(dir);
    }
    let mut loader = DescriptorLoader::new(resolver);
    let description = loader.load_location(&path.to_string_lossy())?;
    let ts = TypeSystemBuilder::from_description(&description)?.commit()?;
    Ok((ts, description))
}

struct DescriptorWriter {
    writer: Writer<Vec<u8>>,
}

impl DescriptorWriter {
    fn start(&mut self, name: &str) -> quick_xml::Result<()> {
        self.writer.write_event(Event::Start(BytesStart::new(name)))
    }

    fn end(&mut self, name: &str) -> quick_xml::Result<()> {
        self.writer.write_event(Event::End(BytesEnd::new(name)))
    }

    fn text_element(&mut self, name: &str, text: &str) -> quick_xml::Result<()> {
        self.start(name)?;
        self.writer.write_event(Event::Text(BytesText::new(text)))?;
        self.end(name)
    }

    fn empty(&mut self, name: &str) -> quick_xml::Result<()> {
        self.writer.write_event(Event::Empty(BytesStart::new(name)))
    }
}

fn write_feature(w: &mut DescriptorWriter, f: &FeatureDescription) -> quick_xml::Result<()> {
    w.start("featureDescription")?;
    w.text_element("name", &f.name)?;
    match f.range.strip_suffix(builtin::ARRAY_SUFFIX) {
        Some(element) if builtin::builtin_array_for(element).is_none() => {
            w.text_element("rangeTypeName", builtin::FS_ARRAY)?;
            w.text_element("elementType", element)?;
        }
        _ => w.text_element("rangeTypeName", &f.range)?,
    }
    if f.multiple_references_allowed {
        w.text_element("multipleReferencesAllowed", "true")?;
    }
    w.end("featureDescription")
}

fn write_all(w: &mut DescriptorWriter, desc: &TypeSystemDescription) -> quick_xml::Result<()> {
    w.writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    w.start("typeSystemDescription")?;
    if let Some(name) = &desc.name {
        w.text_element("name", name)?;
    }

    w.start("types")?;
    for t in &desc.types {
        w.start("typeDescription")?;
        w.text_element("name", &t.name)?;
        w.text_element("supertypeName", &t.supertype)?;
        if !t.features.is_empty() {
            w.start("features")?;
            for f in &t.features {
                write_feature(w, f)?;
            }
            w.end("features")?;
        }
        if !t.allowed_values.is_empty() {
            w.start("allowedValues")?;
            for v in &t.allowed_values {
                w.start("value")?;
                w.text_element("string", v)?;
                w.end("value")?;
            }
            w.end("allowedValues")?;
        }
        w.end("typeDescription")?;
    }
    w.end("types")?;

    if !desc.priority_lists.is_empty() {
        w.start("typePriorities")?;
        for list in &desc.priority_lists {
            w.start("priorityList")?;
            for t in list {
                w.text_element("type", t)?;
            }
            w.end("priorityList")?;
        }
        w.end("typePriorities")?;
    }

    if !desc.indexes.is_empty() {
        w.start("fsIndexes")?;
        for index in &desc.indexes {
            w.start("fsIndexDescription")?;
            w.text_element("label", &index.label)?;
            w.text_element("typeName", &index.type_name)?;
            w.text_element("kind", index.kind.as_str())?;
            if !index.keys.is_empty() {
                w.start("keys")?;
                for key in &index.keys {
                    w.start("fsIndexKey")?;
                    match key {
                        IndexKeyDescription::Feature { name, direction } => {
                            w.text_element("featureName", name)?;
                            let comparator = match direction {
                                KeyDirection::Standard => "standard",
                                KeyDirection::Reverse => "reverse",
                            };
                            w.text_element("comparator", comparator)?;
                        }
                        IndexKeyDescription::TypePriority => w.empty("typePriority")?,
                    }
                    w.end("fsIndexKey")?;
                }
                w.end("keys")?;
            }
            w.end("fsIndexDescription")?;
        }
        w.end("fsIndexes")?;
    }

    w.end("typeSystemDescription")
}

/// Render a description back to descriptor XML.
pub fn write_descriptor(desc: &TypeSystemDescription) -> Result<String> {
    let mut w = DescriptorWriter {
        writer: Writer::new_with_indent(Vec::new(), b' ', 2),
    };
    write_all(&mut w, desc).map_err(|e| descriptor_error(e.to_string()))?;
    String::from_utf8(w.writer.into_inner()).map_err(|e| descriptor_error(e.to_string()))
}

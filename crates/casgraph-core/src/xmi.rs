//! XMI-style XML serialization.
//!
//! ```xml
//! <xmi:XMI xmlns:xmi="http://www.omg.org/XMI" xmlns:cas="http:///uima/cas.ecore"
//!          xmlns:example="http:///org/example.ecore" xmi:version="2.0">
//!   <cas:NULL xmi:id="0"/>
//!   <cas:Sofa xmi:id="1" sofaNum="1" sofaID="_InitialView" sofaString="cat sat"/>
//!   <example:Token xmi:id="2" sofa="1" begin="0" end="3" pos="NOUN"/>
//!   <cas:View sofa="1" members="2"/>
//! </xmi:XMI>
//! ```
//!
//! One element per structure. Primitive and string features are attributes,
//! references are attributes holding the target's `xmi:id`, null values are
//! omitted. Arrays list their elements in an `elements` attribute, except
//! string arrays which use `<elements>` children. Reading builds the whole
//! element tree first, allocates every structure, then fills values, so
//! references may point forward.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use casgraph_types::xml::{escape_attribute, parse_document, XmlElement};
use casgraph_types::{ElementKind, PrimitiveKind, TypeCode, TypeKind, TypeSystem};
use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::name::QName;
use quick_xml::Writer;

use crate::cas::Cas;
use crate::config::{CasConfig, XmiOptions};
use crate::error::{Result, SerializationError};
use crate::store::FsStore;
use crate::value::{FeatureValue, SlotTarget};
use crate::view::ViewId;

const XMI_NS: &str = "http://www.omg.org/XMI";
const CAS_NS: &str = "http:///uima/cas.ecore";
const NO_NAMESPACE_NS: &str = "http:///uima/noNamespace.ecore";
const NO_NAMESPACE_PREFIX: &str = "noNamespace";
const CAS_PACKAGE: &str = "cas";

const ATTR_ID: &str = "xmi:id";
const ATTR_ELEMENTS: &str = "elements";
const ATTR_ELEMENT_TYPE: &str = "elementType";

type SerResult<T> = std::result::Result<T, SerializationError>;

/// A problem skipped by a lenient load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmiDiagnostic {
    /// Byte offset of the offending element.
    pub position: usize,
    pub message: String,
}

/// Result of `deserialize_xmi`: the CAS and, in lenient mode, what was
/// skipped while building it.
#[derive(Debug)]
pub struct XmiLoad {
    pub cas: Cas,
    pub diagnostics: Vec<XmiDiagnostic>,
}

// ============================================================================
// Namespaces
// ============================================================================

fn split_type_name(name: &str) -> (Option<&str>, &str) {
    match name.rsplit_once('.') {
        Some((package, local)) => (Some(package), local),
        None => (None, name),
    }
}

fn namespace_uri(package: Option<&str>) -> String {
    match package {
        None => NO_NAMESPACE_NS.to_string(),
        Some(CAS_PACKAGE) => CAS_NS.to_string(),
        Some(p) => format!("http:///{}.ecore", p.replace('.', "/")),
    }
}

/// Inverse of [`namespace_uri`]; `None` if the URI is not a type namespace.
fn package_of_uri(uri: &str) -> Option<Option<String>> {
    match uri {
        CAS_NS => Some(Some(CAS_PACKAGE.to_string())),
        NO_NAMESPACE_NS => Some(None),
        _ => {
            let path = uri.strip_prefix("http:///")?.strip_suffix(".ecore")?;
            Some(Some(path.replace('/', ".")))
        }
    }
}

/// Package to prefix assignment for one document.
struct Namespaces {
    prefixes: BTreeMap<Option<String>, String>,
}

impl Namespaces {
    fn new() -> Self {
        let mut prefixes = BTreeMap::new();
        prefixes.insert(Some(CAS_PACKAGE.to_string()), CAS_PACKAGE.to_string());
        Self { prefixes }
    }

    fn prefix_for(&mut self, package: Option<&str>) -> String {
        let key = package.map(str::to_string);
        if let Some(prefix) = self.prefixes.get(&key) {
            return prefix.clone();
        }
        let base = match package {
            None => NO_NAMESPACE_PREFIX,
            Some(p) => p.rsplit('.').next().unwrap_or(p),
        };
        let taken: AHashSet<&str> = self.prefixes.values().map(String::as_str).collect();
        let mut prefix = base.to_string();
        let mut n = 2;
        while prefix == "xmi" || taken.contains(prefix.as_str()) {
            prefix = format!("{base}{n}");
            n += 1;
        }
        self.prefixes.insert(key, prefix.clone());
        prefix
    }
}

// ============================================================================
// Writing
// ============================================================================

fn value_text(value: &FeatureValue) -> Option<String> {
    Some(match value {
        FeatureValue::Boolean(v) => v.to_string(),
        FeatureValue::Byte(v) => v.to_string(),
        FeatureValue::Short(v) => v.to_string(),
        FeatureValue::Int(v) => v.to_string(),
        FeatureValue::Long(v) => v.to_string(),
        FeatureValue::Float(v) => v.to_string(),
        FeatureValue::Double(v) => v.to_string(),
        FeatureValue::String(v) => return v.clone(),
        FeatureValue::Ref(v) => return v.map(|fs| fs.id().to_string()),
    })
}

struct XmiElement {
    name: String,
    attributes: Vec<(String, String)>,
    /// `<elements>` children of a string array; `None` entries are null.
    strings: Vec<Option<String>>,
}

fn element_for(ts: &TypeSystem, store: &FsStore, ns: &mut Namespaces, id: u32) -> XmiElement {
    let b = ts.builtins();
    let ty = store.type_of(id).unwrap_or(b.top);
    let mut attributes = vec![(ATTR_ID.to_string(), id.to_string())];
    let mut strings = Vec::new();

    let (package, local) = match ts.kind(ty) {
        TypeKind::Array(ElementKind::Fs(element)) if ty != b.fs_array => {
            attributes.push((
                ATTR_ELEMENT_TYPE.to_string(),
                ts.type_name(element).to_string(),
            ));
            (Some(CAS_PACKAGE), "FSArray")
        }
        _ => split_type_name(ts.type_name(ty)),
    };
    let name = format!("{}:{local}", ns.prefix_for(package));

    let targets = store.targets(id);
    let cells = store.cells(id);
    match ts.element_kind(ty) {
        Some(ElementKind::String) => {
            strings = cells.iter().map(|&c| store.string(c).map(str::to_string)).collect();
        }
        Some(_) => {
            if !cells.is_empty() {
                let items: Vec<String> = targets
                    .iter()
                    .zip(cells)
                    .map(|(t, &c)| value_text(&store.decode(*t, c)).unwrap_or_else(|| "0".into()))
                    .collect();
                attributes.push((ATTR_ELEMENTS.to_string(), items.join(" ")));
            }
        }
        None => {
            for ((feature, target), &cell) in ts.features_of(ty).iter().zip(&targets).zip(cells) {
                if let Some(text) = value_text(&store.decode(*target, cell)) {
                    attributes.push((ts.feature_info(*feature).name().to_string(), text));
                }
            }
        }
    }
    XmiElement {
        name,
        attributes,
        strings,
    }
}

fn start_tag<'a>(name: &str, attributes: &'a [(String, String)]) -> BytesStart<'a> {
    let mut start = BytesStart::new(name.to_string());
    for (key, value) in attributes {
        start.push_attribute(Attribute {
            key: QName(key.as_bytes()),
            value: Cow::Owned(escape_attribute(value).into_bytes()),
        });
    }
    start
}

fn write_document(cas: &Cas, writer: &mut Writer<Vec<u8>>) -> quick_xml::Result<()> {
    let ts = cas.type_system();
    let store = cas.store();
    let mut ns = Namespaces::new();
    let elements: Vec<XmiElement> = store
        .ids()
        .map(|id| element_for(ts, store, &mut ns, id))
        .collect();

    let mut root = vec![
        ("xmlns:xmi".to_string(), XMI_NS.to_string()),
    ];
    for (package, prefix) in &ns.prefixes {
        root.push((format!("xmlns:{prefix}"), namespace_uri(package.as_deref())));
    }
    root.push(("xmi:version".to_string(), "2.0".to_string()));

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Start(start_tag("xmi:XMI", &root)))?;
    let null = [(ATTR_ID.to_string(), "0".to_string())];
    writer.write_event(Event::Empty(start_tag("cas:NULL", &null)))?;

    for element in &elements {
        let tag = start_tag(&element.name, &element.attributes);
        if element.strings.is_empty() {
            writer.write_event(Event::Empty(tag))?;
            continue;
        }
        writer.write_event(Event::Start(tag))?;
        for item in &element.strings {
            match item {
                Some(text) => {
                    writer.write_event(Event::Start(BytesStart::new(ATTR_ELEMENTS)))?;
                    writer.write_event(Event::Text(BytesText::new(text)))?;
                    writer.write_event(Event::End(BytesEnd::new(ATTR_ELEMENTS)))?;
                }
                None => {
                    let nil = [("xmi:nil".to_string(), "true".to_string())];
                    writer.write_event(Event::Empty(start_tag(ATTR_ELEMENTS, &nil)))?;
                }
            }
        }
        writer.write_event(Event::End(BytesEnd::new(element.name.clone())))?;
    }

    for view in cas.views_slice() {
        let members: Vec<String> = view
            .indexes
            .add_order()
            .map(|id| id.to_string())
            .collect();
        let mut attributes = vec![("sofa".to_string(), view.sofa.to_string())];
        if !members.is_empty() {
            attributes.push(("members".to_string(), members.join(" ")));
        }
        writer.write_event(Event::Empty(start_tag("cas:View", &attributes)))?;
    }

    writer.write_event(Event::End(BytesEnd::new("xmi:XMI")))?;
    Ok(())
}

/// Render `cas` as XMI, indented unless the CAS's configuration says not to.
pub fn serialize_xmi(cas: &Cas) -> Result<String> {
    let mut writer = if cas.config().xmi.pretty {
        Writer::new_with_indent(Vec::new(), b' ', 2)
    } else {
        Writer::new(Vec::new())
    };
    write_document(cas, &mut writer).map_err(SerializationError::from)?;
    let text = String::from_utf8(writer.into_inner())
        .map_err(|e| SerializationError::Xml(e.to_string()))?;
    tracing::debug!(bytes = text.len(), structures = cas.fs_count(), "serialized xmi");
    Ok(text)
}

// ============================================================================
// Reading
// ============================================================================

fn parse_value(target: SlotTarget, text: &str) -> Option<FeatureValue> {
    Some(match target {
        SlotTarget::Primitive(p) => match p {
            PrimitiveKind::Boolean => FeatureValue::Boolean(match text.trim() {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => return None,
            }),
            PrimitiveKind::Byte => FeatureValue::Byte(text.trim().parse().ok()?),
            PrimitiveKind::Short => FeatureValue::Short(text.trim().parse().ok()?),
            PrimitiveKind::Integer => FeatureValue::Int(text.trim().parse().ok()?),
            PrimitiveKind::Long => FeatureValue::Long(text.trim().parse().ok()?),
            PrimitiveKind::Float => FeatureValue::Float(text.trim().parse().ok()?),
            PrimitiveKind::Double => FeatureValue::Double(text.trim().parse().ok()?),
        },
        SlotTarget::Str(_) => FeatureValue::String(Some(text.to_string())),
        // References are resolved through the id table by the caller.
        SlotTarget::Ref(_) => return None,
    })
}

struct Pending<'x> {
    element: &'x XmlElement,
    id: u32,
    ty: TypeCode,
}

struct Loader<'x> {
    cas: Cas,
    strict: bool,
    diagnostics: Vec<XmiDiagnostic>,
    /// `xmi:id` as written to heap id.
    ids: AHashMap<&'x str, u32>,
    prefixes: AHashMap<String, Option<String>>,
}

impl<'x> Loader<'x> {
    /// Fail in strict mode, record and continue in lenient mode.
    fn problem(&mut self, position: usize, err: SerializationError) -> SerResult<()> {
        if self.strict {
            return Err(err);
        }
        tracing::warn!(position, error = %err, "skipping xmi content");
        self.diagnostics.push(XmiDiagnostic {
            position,
            message: err.to_string(),
        });
        Ok(())
    }

    fn type_of_element(&self, element: &XmlElement) -> SerResult<TypeCode> {
        let ts = self.cas.type_system();
        let package = match element.prefix() {
            Some(prefix) => self.prefixes.get(prefix).cloned().ok_or_else(|| {
                SerializationError::Malformed(format!("undeclared namespace prefix `{prefix}`"))
            })?,
            None => None,
        };
        let name = match &package {
            Some(p) => format!("{p}.{}", element.local_name()),
            None => element.local_name().to_string(),
        };
        let ty = ts
            .get_type(&name)
            .ok_or_else(|| SerializationError::UnknownType(name.clone()))?;
        match element.attr(ATTR_ELEMENT_TYPE) {
            Some(element_type) if ty == ts.builtins().fs_array => {
                let element_ty = ts
                    .get_type(element_type)
                    .ok_or_else(|| SerializationError::UnknownType(element_type.to_string()))?;
                ts.array_type_for(element_ty)
                    .ok_or_else(|| SerializationError::UnknownType(format!("{element_type}[]")))
            }
            _ => Ok(ty),
        }
    }

    fn slot_count(&self, element: &XmlElement, ty: TypeCode) -> usize {
        let ts = self.cas.type_system();
        match ts.element_kind(ty) {
            Some(ElementKind::String) => element.children_named(ATTR_ELEMENTS).count(),
            Some(_) => element
                .attr(ATTR_ELEMENTS)
                .map(|s| s.split_whitespace().count())
                .unwrap_or(0),
            None => ts.features_of(ty).len(),
        }
    }

    fn cell_for(&mut self, target: SlotTarget, text: &str) -> SerResult<u64> {
        let value = match target {
            SlotTarget::Ref(_) => {
                let text = text.trim();
                if text == "0" {
                    return Ok(0);
                }
                let id = *self
                    .ids
                    .get(text)
                    .ok_or_else(|| SerializationError::UnresolvedReference(text.to_string()))?;
                FeatureValue::Ref(Some(self.cas.store().make_ref(id)))
            }
            _ => parse_value(target, text).ok_or_else(|| {
                SerializationError::BadValue(format!(
                    "`{text}` is not a valid {}",
                    target.describe(self.cas.type_system())
                ))
            })?,
        };
        self.cas
            .store_mut()
            .encode(target, &value)
            .map_err(|e| SerializationError::BadValue(e.to_string()))
    }

    fn fill(&mut self, pending: &Pending<'x>) -> SerResult<()> {
        let ts = Arc::clone(self.cas.type_system());
        let element = pending.element;
        let targets = self.cas.store().targets(pending.id);
        match ts.element_kind(pending.ty) {
            Some(ElementKind::String) => {
                for (slot, child) in element.children_named(ATTR_ELEMENTS).enumerate() {
                    if child.attr("xmi:nil") == Some("true") {
                        continue;
                    }
                    let cell = self.cas.store_mut().intern(&child.text);
                    self.cas.store_mut().set_cell(pending.id, slot, cell);
                }
            }
            Some(_) => {
                let items = element.attr(ATTR_ELEMENTS).unwrap_or("");
                for (slot, item) in items.split_whitespace().enumerate() {
                    match self.cell_for(targets[slot], item) {
                        Ok(cell) => self.cas.store_mut().set_cell(pending.id, slot, cell),
                        Err(err) => self.problem(element.position, err)?,
                    }
                }
            }
            None => {
                for (key, text) in &element.attributes {
                    if key == ATTR_ID || key == ATTR_ELEMENT_TYPE || key.starts_with("xmi:") {
                        continue;
                    }
                    let Some(feature) = ts.get_feature(pending.ty, key) else {
                        let err = SerializationError::Malformed(format!(
                            "type `{}` has no feature `{key}`",
                            ts.type_name(pending.ty)
                        ));
                        self.problem(element.position, err)?;
                        continue;
                    };
                    let info = ts.feature_info(feature);
                    let target = SlotTarget::for_range(&ts, info.range());
                    match self.cell_for(target, text) {
                        Ok(cell) => self.cas.store_mut().set_cell(pending.id, info.offset(), cell),
                        Err(err) => self.problem(element.position, err)?,
                    }
                }
            }
        }
        Ok(())
    }
}

/// Parse XMI produced by [`serialize_xmi`] (or a compatible writer).
pub fn deserialize_xmi(xml: &str, ts: Arc<TypeSystem>, options: &XmiOptions) -> Result<XmiLoad> {
    let config = CasConfig {
        xmi: *options,
        ..CasConfig::default()
    };
    deserialize_xmi_with(xml, ts, config)
}

/// Like [`deserialize_xmi`], taking strictness from `config.xmi` and building
/// the CAS with `config`.
pub fn deserialize_xmi_with(xml: &str, ts: Arc<TypeSystem>, config: CasConfig) -> Result<XmiLoad> {
    let root = parse_document(xml).map_err(SerializationError::from)?;
    if root.local_name() != "XMI" {
        return Err(SerializationError::Malformed(format!(
            "root element is `{}`, expected `xmi:XMI`",
            root.name
        ))
        .into());
    }

    let strict = config.xmi.strict;
    let mut loader = Loader {
        cas: Cas::blank(ts, config)?,
        strict,
        diagnostics: Vec::new(),
        ids: AHashMap::new(),
        prefixes: AHashMap::new(),
    };
    for (key, value) in &root.attributes {
        if let Some(prefix) = key.strip_prefix("xmlns:") {
            if let Some(package) = package_of_uri(value) {
                loader.prefixes.insert(prefix.to_string(), package);
            }
        }
    }

    // Pass 1: type every structure element and collect its id.
    let mut typed: Vec<(&XmlElement, TypeCode, &str)> = Vec::new();
    let mut views: Vec<&XmlElement> = Vec::new();
    for element in &root.children {
        let is_cas = loader.prefixes.get(element.prefix().unwrap_or(""))
            == Some(&Some(CAS_PACKAGE.to_string()));
        match element.local_name() {
            "NULL" if is_cas => continue,
            "View" if is_cas => {
                views.push(element);
                continue;
            }
            _ => {}
        }
        if element.prefix() == Some("xmi") {
            continue;
        }
        let ty = match loader.type_of_element(element) {
            Ok(ty) => ty,
            Err(err) => {
                loader.problem(element.position, err)?;
                continue;
            }
        };
        let Some(xmi_id) = element.attr(ATTR_ID) else {
            let err = SerializationError::Malformed(format!("`{}` has no xmi:id", element.name));
            loader.problem(element.position, err)?;
            continue;
        };
        typed.push((element, ty, xmi_id));
    }

    // Keep numeric ids when they are unique and reasonably dense, otherwise
    // number in document order.
    let mut seen = AHashSet::new();
    let max_id = 2 * typed.len() + 16;
    let numeric = typed.iter().all(|(_, _, xmi_id)| {
        matches!(xmi_id.parse::<u32>(), Ok(n) if n > 0 && n as usize <= max_id && seen.insert(n))
    });
    let mut pending: Vec<Pending> = Vec::with_capacity(typed.len());
    for (n, (element, ty, xmi_id)) in typed.into_iter().enumerate() {
        let id = match xmi_id.parse::<u32>() {
            Ok(id) if numeric => id,
            _ => n as u32 + 1,
        };
        if loader.ids.contains_key(xmi_id) {
            let err = SerializationError::Malformed(format!("duplicate xmi:id `{xmi_id}`"));
            loader.problem(element.position, err)?;
            continue;
        }
        loader.ids.insert(xmi_id, id);
        pending.push(Pending { element, id, ty });
    }
    pending.sort_by_key(|p| p.id);
    for p in &pending {
        let len = loader.slot_count(p.element, p.ty);
        loader.cas.store_mut().allocate_at(p.id, p.ty, len)?;
    }

    // Pass 2: values.
    for p in &pending {
        loader.fill(p)?;
    }

    // Views: one per sofa, in id order, then membership.
    let sofa_type = loader.cas.type_system().builtins().sofa;
    let mut view_of_sofa: AHashMap<u32, ViewId> = AHashMap::new();
    for p in pending.iter().filter(|p| p.ty == sofa_type) {
        let sofa_id = loader.cas.type_system().builtins().sofa_id;
        let name = match loader.cas.get_string(loader.cas.store().make_ref(p.id), sofa_id) {
            Ok(Some(name)) => name,
            _ => {
                let err = SerializationError::Malformed(format!("sofa #{} has no sofaID", p.id));
                loader.problem(p.element.position, err)?;
                continue;
            }
        };
        match loader.cas.register_view(&name, p.id) {
            Ok(view) => {
                view_of_sofa.insert(p.id, view);
            }
            Err(err) => {
                let err = SerializationError::Malformed(err.to_string());
                loader.problem(p.element.position, err)?;
            }
        }
    }
    loader.cas.ensure_initial_view();

    for element in views {
        let view = element
            .attr("sofa")
            .and_then(|s| loader.ids.get(s.trim()))
            .and_then(|id| view_of_sofa.get(id))
            .copied();
        let Some(view) = view else {
            let err = SerializationError::UnresolvedReference(format!(
                "view sofa `{}`",
                element.attr("sofa").unwrap_or("")
            ));
            loader.problem(element.position, err)?;
            continue;
        };
        for member in element.attr("members").unwrap_or("").split_whitespace() {
            let Some(&id) = loader.ids.get(member) else {
                let err = SerializationError::UnresolvedReference(member.to_string());
                loader.problem(element.position, err)?;
                continue;
            };
            let fs = loader.cas.store().make_ref(id);
            if let Err(err) = loader.cas.add_to_index(view, fs) {
                let err = SerializationError::Malformed(err.to_string());
                loader.problem(element.position, err)?;
            }
        }
    }

    tracing::debug!(
        structures = loader.cas.fs_count(),
        diagnostics = loader.diagnostics.len(),
        "deserialized xmi"
    );
    Ok(XmiLoad {
        cas: loader.cas,
        diagnostics: loader.diagnostics,
    })
}

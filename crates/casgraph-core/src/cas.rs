//! The CAS: a type system, a heap, and a set of views over it.

use std::sync::Arc;

use ahash::AHashMap;
use casgraph_types::{FeatureCode, FeatureInfo, TypeCode, TypeKind, TypeSystem};
use roaring::RoaringBitmap;

use crate::config::CasConfig;
use crate::error::{CasError, Result};
use crate::index::{FsIterator, IndexRepository, IndexSpec, ANNOTATION_INDEX};
use crate::store::FsStore;
use crate::value::{FeatureValue, FsRef, SlotTarget};
use crate::view::{IndexEvent, View, ViewId, INITIAL_VIEW};

/// Handle returned by [`Cas::mark`]; identifies the state a delta is
/// computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker {
    pub(crate) mark: u64,
    pub(crate) generation: u32,
    pub(crate) watermark: u32,
}

impl Marker {
    /// Structures with an id at or above this were created after the mark.
    pub fn watermark(&self) -> u32 {
        self.watermark
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Journal {
    pub mark: u64,
    pub watermark: u32,
    pub views_at_mark: usize,
    pub events: Vec<IndexEvent>,
}

/// An annotation whose span does not fit its view's document text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundsViolation {
    pub fs: FsRef,
    pub begin: i32,
    pub end: i32,
    pub text_len: usize,
}

/// Common Analysis Structure.
///
/// Owned by one thread at a time; share the `Arc<TypeSystem>` instead and
/// give each thread its own `Cas` (see [`crate::CasPool`]).
#[derive(Debug, Clone)]
pub struct Cas {
    ts: Arc<TypeSystem>,
    config: CasConfig,
    store: FsStore,
    views: Vec<View>,
    view_by_name: AHashMap<String, usize>,
    /// Index repository every new view starts from.
    template: IndexRepository,
    journal: Option<Journal>,
    marks: u64,
}

impl Cas {
    pub fn new(ts: Arc<TypeSystem>) -> Result<Self> {
        Self::with_config(ts, CasConfig::default())
    }

    pub fn with_config(ts: Arc<TypeSystem>, config: CasConfig) -> Result<Self> {
        let mut cas = Self::blank(ts, config)?;
        cas.ensure_initial_view();
        Ok(cas)
    }

    /// A CAS without any view, to be filled by a deserializer.
    pub(crate) fn blank(ts: Arc<TypeSystem>, config: CasConfig) -> Result<Self> {
        let store = FsStore::new(Arc::clone(&ts));
        let mut template = IndexRepository::new(&ts)?;
        for spec in ts.description().indexes.iter().chain(&config.indexes) {
            template.declare(&store, spec)?;
        }
        Ok(Self {
            ts,
            config,
            store,
            views: Vec::new(),
            view_by_name: AHashMap::new(),
            template,
            journal: None,
            marks: 0,
        })
    }

    pub fn type_system(&self) -> &Arc<TypeSystem> {
        &self.ts
    }

    pub fn config(&self) -> &CasConfig {
        &self.config
    }

    /// Number of feature structures on the heap.
    pub fn fs_count(&self) -> usize {
        self.store.len()
    }

    /// Incremented by every `reset`.
    pub fn generation(&self) -> u32 {
        self.store.generation()
    }

    pub(crate) fn store(&self) -> &FsStore {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut FsStore {
        &mut self.store
    }

    /// Every structure on the heap, indexed or not, in id order.
    pub fn all_fs(&self) -> Vec<FsRef> {
        self.store.ids().map(|id| self.store.make_ref(id)).collect()
    }

    /// Every structure whose type is `ty` or one of its subtypes, in id order.
    pub fn all_fs_of_type(&self, ty: TypeCode) -> Vec<FsRef> {
        let mut ids = RoaringBitmap::new();
        for sub in self.ts.subsumed_types(ty) {
            ids |= self.store.ids_of_exact_type(sub);
        }
        ids.iter().map(|id| self.store.make_ref(id)).collect()
    }

    /// Drop all structures and views; only an empty initial view remains.
    pub fn reset(&mut self) {
        self.store.reset();
        self.views.clear();
        self.view_by_name.clear();
        self.journal = None;
        self.ensure_initial_view();
        tracing::debug!(generation = self.store.generation(), "cas reset");
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    pub fn initial_view(&self) -> ViewId {
        ViewId::new(self.view_by_name.get(INITIAL_VIEW).copied().unwrap_or(0))
    }

    pub fn create_view(&mut self, name: &str) -> Result<ViewId> {
        if self.view_by_name.contains_key(name) {
            return Err(CasError::DuplicateView(name.to_string()));
        }
        let sofa = self.create_sofa(name);
        let view = self.register_view(name, sofa)?;
        tracing::debug!(view = name, sofa, "created view");
        Ok(view)
    }

    pub fn get_view(&self, name: &str) -> Result<ViewId> {
        self.view_by_name
            .get(name)
            .map(|&i| ViewId::new(i))
            .ok_or_else(|| CasError::ViewNotFound(name.to_string()))
    }

    pub fn views(&self) -> impl Iterator<Item = ViewId> + '_ {
        (0..self.views.len()).map(ViewId::new)
    }

    pub fn view_name(&self, view: ViewId) -> Result<&str> {
        Ok(&self.view(view)?.name)
    }

    /// The `cas.Sofa` structure backing `view`.
    pub fn view_sofa(&self, view: ViewId) -> Result<FsRef> {
        Ok(self.store.make_ref(self.view(view)?.sofa))
    }

    pub(crate) fn view(&self, view: ViewId) -> Result<&View> {
        self.views
            .get(view.index())
            .ok_or_else(|| CasError::ViewNotFound(format!("#{}", view.index())))
    }

    /// Attach a view to an existing sofa structure.
    pub(crate) fn register_view(&mut self, name: &str, sofa: u32) -> Result<ViewId> {
        if self.view_by_name.contains_key(name) {
            return Err(CasError::DuplicateView(name.to_string()));
        }
        let index = self.views.len();
        self.views.push(View {
            name: name.to_string(),
            sofa,
            indexes: self.template.clone(),
        });
        self.view_by_name.insert(name.to_string(), index);
        Ok(ViewId::new(index))
    }

    pub(crate) fn ensure_initial_view(&mut self) {
        if self.view_by_name.contains_key(INITIAL_VIEW) {
            return;
        }
        let sofa = self.create_sofa(INITIAL_VIEW);
        let index = self.views.len();
        self.views.push(View {
            name: INITIAL_VIEW.to_string(),
            sofa,
            indexes: self.template.clone(),
        });
        self.view_by_name.insert(INITIAL_VIEW.to_string(), index);
    }

    fn create_sofa(&mut self, name: &str) -> u32 {
        let b = *self.ts.builtins();
        let sofa_num = self
            .views
            .iter()
            .map(|v| self.store.cell(v.sofa, self.offset(b.sofa_num)) as u32 as i32)
            .max()
            .unwrap_or(0)
            + 1;
        let len = self.ts.features_of(b.sofa).len();
        let id = self.store.allocate(b.sofa, len);
        let name_cell = self.store.intern(name);
        self.store
            .set_cell(id, self.offset(b.sofa_num), sofa_num as u32 as u64);
        self.store.set_cell(id, self.offset(b.sofa_id), name_cell);
        id
    }

    fn offset(&self, feature: FeatureCode) -> usize {
        self.ts.feature_info(feature).offset()
    }

    // ------------------------------------------------------------------
    // Subject of analysis
    // ------------------------------------------------------------------

    pub fn set_document_text(&mut self, view: ViewId, text: &str) -> Result<()> {
        let mime = self.config.document_mime_type.clone();
        self.set_sofa_data_string(view, text, &mime)
    }

    pub fn set_sofa_data_string(&mut self, view: ViewId, text: &str, mime: &str) -> Result<()> {
        let b = *self.ts.builtins();
        let sofa = self.unset_sofa(view)?;
        let text_cell = self.store.intern(text);
        let mime_cell = self.store.intern(mime);
        self.write_cell(sofa, self.offset(b.sofa_string), text_cell);
        self.write_cell(sofa, self.offset(b.sofa_mime), mime_cell);

        if let Some(doc) = self.find_document_annotation(view)? {
            let len = text.chars().count() as u32 as u64;
            self.write_cell(doc, self.offset(b.end), len);
        }
        Ok(())
    }

    pub fn set_sofa_data_array(&mut self, view: ViewId, array: FsRef, mime: &str) -> Result<()> {
        let b = *self.ts.builtins();
        let id = self.store.resolve(array)?;
        let ty = self.type_id(id);
        if !self.ts.type_info(ty).is_array() {
            return Err(CasError::TypeMismatch {
                expected: "array".to_string(),
                found: self.ts.type_name(ty).to_string(),
            });
        }
        let sofa = self.unset_sofa(view)?;
        let mime_cell = self.store.intern(mime);
        self.write_cell(sofa, self.offset(b.sofa_array), id as u64);
        self.write_cell(sofa, self.offset(b.sofa_mime), mime_cell);
        Ok(())
    }

    pub fn set_sofa_data_uri(&mut self, view: ViewId, uri: &str, mime: &str) -> Result<()> {
        let b = *self.ts.builtins();
        let sofa = self.unset_sofa(view)?;
        let uri_cell = self.store.intern(uri);
        let mime_cell = self.store.intern(mime);
        self.write_cell(sofa, self.offset(b.sofa_uri), uri_cell);
        self.write_cell(sofa, self.offset(b.sofa_mime), mime_cell);
        Ok(())
    }

    /// Sofa id of `view`, if its data has not been set yet.
    fn unset_sofa(&self, view: ViewId) -> Result<u32> {
        let b = self.ts.builtins();
        let v = self.view(view)?;
        let is_set = [b.sofa_string, b.sofa_array, b.sofa_uri]
            .iter()
            .any(|f| self.store.cell(v.sofa, self.offset(*f)) != 0);
        if is_set {
            return Err(CasError::SofaDataAlreadySet(v.name.clone()));
        }
        Ok(v.sofa)
    }

    fn sofa_string(&self, sofa: u32, feature: FeatureCode) -> Option<&str> {
        self.store.string(self.store.cell(sofa, self.offset(feature)))
    }

    pub fn document_text(&self, view: ViewId) -> Result<Option<&str>> {
        let sofa = self.view(view)?.sofa;
        Ok(self.sofa_string(sofa, self.ts.builtins().sofa_string))
    }

    pub fn mime_type(&self, view: ViewId) -> Result<Option<&str>> {
        let sofa = self.view(view)?.sofa;
        Ok(self.sofa_string(sofa, self.ts.builtins().sofa_mime))
    }

    pub fn sofa_uri(&self, view: ViewId) -> Result<Option<&str>> {
        let sofa = self.view(view)?.sofa;
        Ok(self.sofa_string(sofa, self.ts.builtins().sofa_uri))
    }

    pub fn sofa_data_array(&self, view: ViewId) -> Result<Option<FsRef>> {
        let sofa = self.view(view)?.sofa;
        let cell = self.store.cell(sofa, self.offset(self.ts.builtins().sofa_array));
        Ok((cell != 0).then(|| self.store.make_ref(cell as u32)))
    }

    fn find_document_annotation(&self, view: ViewId) -> Result<Option<u32>> {
        let doc_type = self.ts.builtins().document_annotation;
        Ok(self
            .view(view)?
            .indexes
            .members()
            .map(|(id, _)| id)
            .find(|&id| {
                self.store
                    .type_of(id)
                    .is_some_and(|ty| self.ts.subsumes(doc_type, ty))
            }))
    }

    /// The view's `cas.DocumentAnnotation`, created and indexed on first use.
    pub fn document_annotation(&mut self, view: ViewId) -> Result<FsRef> {
        if let Some(id) = self.find_document_annotation(view)? {
            return Ok(self.store.make_ref(id));
        }
        let b = *self.ts.builtins();
        let len = self
            .document_text(view)?
            .map(|t| t.chars().count())
            .unwrap_or(0);
        let doc = self.create_annotation(view, b.document_annotation, 0, len as i32)?;
        self.add_to_index(view, doc)?;
        Ok(doc)
    }

    pub fn set_document_language(&mut self, view: ViewId, language: &str) -> Result<()> {
        let doc = self.document_annotation(view)?;
        let language_feature = self.ts.builtins().language;
        self.set_string(doc, language_feature, Some(language))
    }

    // ------------------------------------------------------------------
    // Feature structures
    // ------------------------------------------------------------------

    fn type_id(&self, id: u32) -> TypeCode {
        self.store.type_of(id).unwrap_or(self.ts.builtins().top)
    }

    pub fn type_of(&self, fs: FsRef) -> Result<TypeCode> {
        let id = self.store.resolve(fs)?;
        Ok(self.type_id(id))
    }

    /// Create a structure of type `ty`. Subtypes of `cas.AnnotationBase`
    /// are bound to `view`'s sofa.
    pub fn create(&mut self, view: ViewId, ty: TypeCode) -> Result<FsRef> {
        let sofa = self.view(view)?.sofa;
        if !self.ts.contains(ty) {
            return Err(CasError::NotCreatable(format!("type code {}", ty.raw())));
        }
        let b = *self.ts.builtins();
        let creatable = matches!(self.ts.kind(ty), TypeKind::Structure | TypeKind::Top);
        if !creatable || ty == b.sofa {
            return Err(CasError::NotCreatable(self.ts.type_name(ty).to_string()));
        }
        let len = self.ts.features_of(ty).len();
        let id = self.store.allocate(ty, len);
        if self.ts.subsumes(b.annotation_base, ty) {
            self.store.set_cell(id, self.offset(b.sofa_ref), sofa as u64);
        }
        Ok(self.store.make_ref(id))
    }

    /// Create an annotation and set its span. Not added to any index.
    pub fn create_annotation(
        &mut self,
        view: ViewId,
        ty: TypeCode,
        begin: i32,
        end: i32,
    ) -> Result<FsRef> {
        let b = *self.ts.builtins();
        if !self.ts.subsumes(b.annotation, ty) {
            return Err(CasError::TypeMismatch {
                expected: format!("subtype of `{}`", self.ts.type_name(b.annotation)),
                found: self.ts.type_name(ty).to_string(),
            });
        }
        let fs = self.create(view, ty)?;
        self.set_int(fs, b.begin, begin)?;
        self.set_int(fs, b.end, end)?;
        Ok(fs)
    }

    pub fn create_array(&mut self, view: ViewId, ty: TypeCode, len: usize) -> Result<FsRef> {
        self.view(view)?;
        if !self.ts.contains(ty) || !self.ts.type_info(ty).is_array() {
            let name = if self.ts.contains(ty) {
                self.ts.type_name(ty).to_string()
            } else {
                format!("type code {}", ty.raw())
            };
            return Err(CasError::NotCreatable(name));
        }
        let id = self.store.allocate(ty, len);
        Ok(self.store.make_ref(id))
    }

    /// Resolve a feature by short name on `fs`'s type.
    pub fn feature_by_name(&self, fs: FsRef, name: &str) -> Result<FeatureCode> {
        let ty = self.type_of(fs)?;
        self.ts
            .get_feature(ty, name)
            .ok_or_else(|| CasError::FeatureNotFound {
                type_name: self.ts.type_name(ty).to_string(),
                feature: name.to_string(),
            })
    }

    fn checked_feature(&self, id: u32, feature: FeatureCode) -> Result<&FeatureInfo> {
        let ty = self.type_id(id);
        if !self.ts.has_feature(ty, feature) {
            let feature = if self.ts.contains_feature(feature) {
                self.ts.feature_info(feature).full_name().to_string()
            } else {
                format!("feature code {}", feature.raw())
            };
            return Err(CasError::FeatureNotFound {
                type_name: self.ts.type_name(ty).to_string(),
                feature,
            });
        }
        Ok(self.ts.feature_info(feature))
    }

    pub fn get_feature_value(&self, fs: FsRef, feature: FeatureCode) -> Result<FeatureValue> {
        let id = self.store.resolve(fs)?;
        let info = self.checked_feature(id, feature)?;
        let target = SlotTarget::for_range(&self.ts, info.range());
        Ok(self
            .store
            .decode(target, self.store.cell(id, info.offset())))
    }

    pub fn set_feature_value(
        &mut self,
        fs: FsRef,
        feature: FeatureCode,
        value: FeatureValue,
    ) -> Result<()> {
        let id = self.store.resolve(fs)?;
        let info = self.checked_feature(id, feature)?;
        let b = self.ts.builtins();
        if info.domain() == b.sofa || feature == b.sofa_ref {
            return Err(CasError::ReadOnlyFeature(info.full_name().to_string()));
        }
        let offset = info.offset();
        let target = SlotTarget::for_range(&self.ts, info.range());
        let cell = self.store.encode(target, &value)?;
        self.write_cell(id, offset, cell);
        Ok(())
    }

    /// Write a cell and keep every index holding `id` sorted.
    fn write_cell(&mut self, id: u32, offset: usize, cell: u64) {
        self.store.set_cell(id, offset, cell);
        for view in &mut self.views {
            view.indexes.refresh(&self.store, id, offset);
        }
    }

    pub(crate) fn reindex_after_restore(&mut self, id: u32) {
        let len = self.store.cells(id).len();
        for view in &mut self.views {
            for offset in 0..len {
                view.indexes.refresh(&self.store, id, offset);
            }
        }
    }

    pub fn get_int(&self, fs: FsRef, feature: FeatureCode) -> Result<i32> {
        match self.get_feature_value(fs, feature)? {
            FeatureValue::Int(v) => Ok(v),
            other => Err(mismatch("int", &other)),
        }
    }

    pub fn set_int(&mut self, fs: FsRef, feature: FeatureCode, value: i32) -> Result<()> {
        self.set_feature_value(fs, feature, FeatureValue::Int(value))
    }

    pub fn get_long(&self, fs: FsRef, feature: FeatureCode) -> Result<i64> {
        match self.get_feature_value(fs, feature)? {
            FeatureValue::Long(v) => Ok(v),
            other => Err(mismatch("long", &other)),
        }
    }

    pub fn set_long(&mut self, fs: FsRef, feature: FeatureCode, value: i64) -> Result<()> {
        self.set_feature_value(fs, feature, FeatureValue::Long(value))
    }

    pub fn get_float(&self, fs: FsRef, feature: FeatureCode) -> Result<f32> {
        match self.get_feature_value(fs, feature)? {
            FeatureValue::Float(v) => Ok(v),
            other => Err(mismatch("float", &other)),
        }
    }

    pub fn set_float(&mut self, fs: FsRef, feature: FeatureCode, value: f32) -> Result<()> {
        self.set_feature_value(fs, feature, FeatureValue::Float(value))
    }

    pub fn get_double(&self, fs: FsRef, feature: FeatureCode) -> Result<f64> {
        match self.get_feature_value(fs, feature)? {
            FeatureValue::Double(v) => Ok(v),
            other => Err(mismatch("double", &other)),
        }
    }

    pub fn set_double(&mut self, fs: FsRef, feature: FeatureCode, value: f64) -> Result<()> {
        self.set_feature_value(fs, feature, FeatureValue::Double(value))
    }

    pub fn get_bool(&self, fs: FsRef, feature: FeatureCode) -> Result<bool> {
        match self.get_feature_value(fs, feature)? {
            FeatureValue::Boolean(v) => Ok(v),
            other => Err(mismatch("boolean", &other)),
        }
    }

    pub fn set_bool(&mut self, fs: FsRef, feature: FeatureCode, value: bool) -> Result<()> {
        self.set_feature_value(fs, feature, FeatureValue::Boolean(value))
    }

    pub fn get_string(&self, fs: FsRef, feature: FeatureCode) -> Result<Option<String>> {
        match self.get_feature_value(fs, feature)? {
            FeatureValue::String(v) => Ok(v),
            other => Err(mismatch("string", &other)),
        }
    }

    pub fn set_string(&mut self, fs: FsRef, feature: FeatureCode, value: Option<&str>) -> Result<()> {
        self.set_feature_value(fs, feature, FeatureValue::String(value.map(str::to_string)))
    }

    pub fn get_ref(&self, fs: FsRef, feature: FeatureCode) -> Result<Option<FsRef>> {
        match self.get_feature_value(fs, feature)? {
            FeatureValue::Ref(v) => Ok(v),
            other => Err(mismatch("reference", &other)),
        }
    }

    pub fn set_ref(&mut self, fs: FsRef, feature: FeatureCode, value: Option<FsRef>) -> Result<()> {
        self.set_feature_value(fs, feature, FeatureValue::Ref(value))
    }

    // ------------------------------------------------------------------
    // Arrays
    // ------------------------------------------------------------------

    fn array_id(&self, fs: FsRef) -> Result<u32> {
        let id = self.store.resolve(fs)?;
        let ty = self.type_id(id);
        if !self.ts.type_info(ty).is_array() {
            return Err(CasError::TypeMismatch {
                expected: "array".to_string(),
                found: self.ts.type_name(ty).to_string(),
            });
        }
        Ok(id)
    }

    pub fn array_len(&self, fs: FsRef) -> Result<usize> {
        let id = self.array_id(fs)?;
        Ok(self.store.cells(id).len())
    }

    pub fn get_array_element(&self, fs: FsRef, index: usize) -> Result<FeatureValue> {
        let id = self.array_id(fs)?;
        let len = self.store.cells(id).len();
        if index >= len {
            return Err(CasError::IndexOutOfRange { index, len });
        }
        let target = self
            .store
            .slot_target(id, index)
            .ok_or(CasError::IndexOutOfRange { index, len })?;
        Ok(self.store.decode(target, self.store.cell(id, index)))
    }

    pub fn set_array_element(&mut self, fs: FsRef, index: usize, value: FeatureValue) -> Result<()> {
        let id = self.array_id(fs)?;
        let len = self.store.cells(id).len();
        if index >= len {
            return Err(CasError::IndexOutOfRange { index, len });
        }
        let target = self
            .store
            .slot_target(id, index)
            .ok_or(CasError::IndexOutOfRange { index, len })?;
        let cell = self.store.encode(target, &value)?;
        self.store.set_cell(id, index, cell);
        Ok(())
    }

    /// All elements of an array, in order.
    pub fn array_elements(&self, fs: FsRef) -> Result<Vec<FeatureValue>> {
        let len = self.array_len(fs)?;
        (0..len).map(|i| self.get_array_element(fs, i)).collect()
    }

    // ------------------------------------------------------------------
    // Indexes
    // ------------------------------------------------------------------

    pub fn declare_index(&mut self, view: ViewId, spec: &IndexSpec) -> Result<()> {
        let v = self.views.get_mut(view.index()).ok_or_else(|| {
            CasError::ViewNotFound(format!("#{}", view.index()))
        })?;
        v.indexes.declare(&self.store, spec)
    }

    /// Add `fs` to every index of `view` whose type subsumes its type.
    pub fn add_to_index(&mut self, view: ViewId, fs: FsRef) -> Result<()> {
        let id = self.store.resolve(fs)?;
        let ty = self.type_id(id);
        let b = *self.ts.builtins();
        let v = self.view(view)?;
        if self.ts.subsumes(b.annotation_base, ty) {
            let sofa = self.store.cell(id, self.offset(b.sofa_ref)) as u32;
            if sofa != v.sofa {
                return Err(CasError::CrossViewIndex {
                    id,
                    view: v.name.clone(),
                });
            }
        }
        self.views[view.index()].indexes.add(&self.store, id);
        if let Some(journal) = &mut self.journal {
            journal.events.push(IndexEvent {
                view: view.index() as u32,
                id,
                added: true,
            });
        }
        Ok(())
    }

    /// Remove one occurrence of `fs` from `view`'s indexes. Returns whether
    /// it was indexed there.
    pub fn remove_from_index(&mut self, view: ViewId, fs: FsRef) -> Result<bool> {
        let id = self.store.resolve(fs)?;
        let v = self.views.get_mut(view.index()).ok_or_else(|| {
            CasError::ViewNotFound(format!("#{}", view.index()))
        })?;
        let removed = v.indexes.remove(&self.store, id);
        if removed {
            if let Some(journal) = &mut self.journal {
                journal.events.push(IndexEvent {
                    view: view.index() as u32,
                    id,
                    added: false,
                });
            }
        }
        Ok(removed)
    }

    /// Snapshot iterator over index `label` of `view`, optionally narrowed to
    /// a subtype of the index type.
    pub fn iter(&self, view: ViewId, label: &str, narrow: Option<TypeCode>) -> Result<FsIterator> {
        self.view(view)?.indexes.snapshot(&self.store, label, narrow)
    }

    pub fn annotation_index(&self, view: ViewId) -> Result<FsIterator> {
        self.iter(view, ANNOTATION_INDEX, None)
    }

    /// Every structure added to `view`, once each, in id order.
    pub fn all_indexed(&self, view: ViewId) -> Result<Vec<FsRef>> {
        Ok(self
            .view(view)?
            .indexes
            .members()
            .map(|(id, _)| self.store.make_ref(id))
            .collect())
    }

    pub fn contains(&self, view: ViewId, label: &str, fs: FsRef) -> Result<bool> {
        let id = self.store.resolve(fs)?;
        self.view(view)?.indexes.contains(label, id)
    }

    pub fn index_size(&self, view: ViewId, label: &str) -> Result<usize> {
        self.view(view)?.indexes.size(label)
    }

    pub fn index_labels(&self, view: ViewId) -> Result<Vec<String>> {
        Ok(self
            .view(view)?
            .indexes
            .labels()
            .map(str::to_string)
            .collect())
    }

    pub fn index_type(&self, view: ViewId, label: &str) -> Result<TypeCode> {
        self.view(view)?.indexes.index_type(label)
    }

    // ------------------------------------------------------------------
    // Annotations
    // ------------------------------------------------------------------

    /// `(begin, end)` of an annotation.
    pub fn span(&self, fs: FsRef) -> Result<(i32, i32)> {
        let b = self.ts.builtins();
        Ok((self.get_int(fs, b.begin)?, self.get_int(fs, b.end)?))
    }

    /// Text of the annotation's own view between `begin` and `end`
    /// (character offsets).
    pub fn covered_text(&self, fs: FsRef) -> Result<String> {
        let b = self.ts.builtins();
        let (begin, end) = self.span(fs)?;
        let id = self.store.resolve(fs)?;
        let sofa = self.store.cell(id, self.offset(b.sofa_ref)) as u32;
        let text = self.sofa_string(sofa, b.sofa_string).unwrap_or("");
        let len = text.chars().count();
        if begin < 0 || end < begin || end as usize > len {
            return Err(CasError::IndexOutOfRange {
                index: end.max(0) as usize,
                len,
            });
        }
        Ok(text
            .chars()
            .skip(begin as usize)
            .take((end - begin) as usize)
            .collect())
    }

    /// Annotations of type `ty` in `view` lying within `covering`'s span,
    /// in annotation-index order. `covering` itself is excluded.
    pub fn select_covered(&self, view: ViewId, ty: TypeCode, covering: FsRef) -> Result<Vec<FsRef>> {
        let (cb, ce) = self.span(covering)?;
        let mut out = Vec::new();
        for fs in self.iter(view, ANNOTATION_INDEX, Some(ty))? {
            if fs == covering {
                continue;
            }
            let (b, e) = self.span(fs)?;
            if b > ce {
                break;
            }
            if b >= cb && e <= ce {
                out.push(fs);
            }
        }
        Ok(out)
    }

    /// Annotations in `view` whose span is not `0 <= begin <= end <= len`.
    pub fn validate_annotation_bounds(&self, view: ViewId) -> Result<Vec<BoundsViolation>> {
        let text_len = self
            .document_text(view)?
            .map(|t| t.chars().count())
            .unwrap_or(0);
        let mut out = Vec::new();
        for fs in self.annotation_index(view)? {
            let (begin, end) = self.span(fs)?;
            if begin < 0 || end < begin || end as usize > text_len {
                out.push(BoundsViolation {
                    fs,
                    begin,
                    end,
                    text_len,
                });
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Delta support
    // ------------------------------------------------------------------

    /// Start recording changes; a later `serialize_delta` against the
    /// returned marker contains only what changed since. Replaces any
    /// previous mark.
    pub fn mark(&mut self) -> Marker {
        self.marks += 1;
        let watermark = self.store.start_tracking();
        self.journal = Some(Journal {
            mark: self.marks,
            watermark,
            views_at_mark: self.views.len(),
            events: Vec::new(),
        });
        Marker {
            mark: self.marks,
            generation: self.store.generation(),
            watermark,
        }
    }

    pub(crate) fn journal(&self) -> Option<&Journal> {
        self.journal.as_ref()
    }

    pub(crate) fn view_count(&self) -> usize {
        self.views.len()
    }

    pub(crate) fn views_slice(&self) -> &[View] {
        &self.views
    }
}

fn mismatch(expected: &str, found: &FeatureValue) -> CasError {
    CasError::TypeMismatch {
        expected: expected.to_string(),
        found: found.describe().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casgraph_types::{builtin, TypeSystemBuilder};

    fn token_ts() -> Arc<TypeSystem> {
        let mut b = TypeSystemBuilder::new();
        b.declare_type("Token", builtin::ANNOTATION).unwrap();
        b.declare_feature("Token", "pos", builtin::STRING, false).unwrap();
        b.commit().unwrap()
    }

    #[test]
    fn new_cas_has_initial_view_backed_by_sofa() {
        let cas = Cas::new(token_ts()).unwrap();
        let view = cas.initial_view();
        assert_eq!(cas.view_name(view).unwrap(), INITIAL_VIEW);
        let sofa = cas.view_sofa(view).unwrap();
        let b = *cas.type_system().builtins();
        assert_eq!(cas.type_of(sofa).unwrap(), b.sofa);
        assert_eq!(cas.get_int(sofa, b.sofa_num).unwrap(), 1);
        assert_eq!(
            cas.get_string(sofa, b.sofa_id).unwrap().as_deref(),
            Some(INITIAL_VIEW)
        );
    }

    #[test]
    fn sofa_features_are_read_only() {
        let mut cas = Cas::new(token_ts()).unwrap();
        let b = *cas.type_system().builtins();
        let sofa = cas.view_sofa(cas.initial_view()).unwrap();
        assert!(matches!(
            cas.set_string(sofa, b.sofa_id, Some("other")),
            Err(CasError::ReadOnlyFeature(_))
        ));
        let view = cas.initial_view();
        let token = cas.type_system().get_type("Token").unwrap();
        let fs = cas.create(view, token).unwrap();
        assert!(matches!(
            cas.set_ref(fs, b.sofa_ref, None),
            Err(CasError::ReadOnlyFeature(_))
        ));
        assert!(matches!(
            cas.create(view, b.sofa),
            Err(CasError::NotCreatable(_))
        ));
    }

    #[test]
    fn document_annotation_tracks_text_length() {
        let mut cas = Cas::new(token_ts()).unwrap();
        let view = cas.initial_view();
        let doc = cas.document_annotation(view).unwrap();
        assert_eq!(cas.span(doc).unwrap(), (0, 0));
        cas.set_document_text(view, "héllo").unwrap();
        assert_eq!(cas.span(doc).unwrap(), (0, 5));
        assert_eq!(cas.document_annotation(view).unwrap(), doc);
        cas.set_document_language(view, "fr").unwrap();
        let language = cas.type_system().builtins().language;
        assert_eq!(cas.get_string(doc, language).unwrap().as_deref(), Some("fr"));
        assert_eq!(cas.mime_type(view).unwrap(), Some("text"));
    }

    #[test]
    fn sofa_data_can_only_be_set_once() {
        let mut cas = Cas::new(token_ts()).unwrap();
        let view = cas.initial_view();
        cas.set_document_text(view, "a").unwrap();
        assert_eq!(
            cas.set_sofa_data_uri(view, "file:///x", "text/plain"),
            Err(CasError::SofaDataAlreadySet(INITIAL_VIEW.to_string()))
        );
    }

    #[test]
    fn covered_text_uses_character_offsets() {
        let mut cas = Cas::new(token_ts()).unwrap();
        let view = cas.initial_view();
        cas.set_document_text(view, "naïve café").unwrap();
        let token = cas.type_system().get_type("Token").unwrap();
        let fs = cas.create_annotation(view, token, 6, 10).unwrap();
        assert_eq!(cas.covered_text(fs).unwrap(), "café");
        let bad = cas.create_annotation(view, token, 6, 42).unwrap();
        assert!(matches!(
            cas.covered_text(bad),
            Err(CasError::IndexOutOfRange { .. })
        ));
    }
}

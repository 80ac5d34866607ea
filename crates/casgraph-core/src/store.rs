//! The feature-structure heap.
//!
//! Every structure is a record `(type, start, len)` over one flat `u64` cell
//! array: one cell per feature of the type's flattened closure, or one per
//! element for arrays. Strings live in a side table and cells hold
//! `index + 1`; references hold the target id. Id 0 is never issued so a zero
//! cell always means null.

use std::sync::Arc;

use ahash::AHashMap;
use casgraph_types::{TypeCode, TypeSystem};
use roaring::RoaringBitmap;

use crate::error::{CasError, Result, SerializationError};
use crate::value::{
    decode_primitive, encode_primitive, slot_targets, FeatureValue, FsRef, SlotTarget,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FsRecord {
    pub ty: TypeCode,
    pub start: u32,
    pub len: u32,
}

#[derive(Debug, Clone)]
struct ModificationTracking {
    watermark: u32,
    modified: RoaringBitmap,
}

#[derive(Debug, Clone)]
pub(crate) struct FsStore {
    ts: Arc<TypeSystem>,
    /// Indexed by id; slot 0 and any gaps left by restored data are `None`.
    records: Vec<Option<FsRecord>>,
    cells: Vec<u64>,
    strings: Vec<String>,
    string_ids: AHashMap<String, u32>,
    /// Ids per exact type code.
    by_type: Vec<RoaringBitmap>,
    live: usize,
    generation: u32,
    tracking: Option<ModificationTracking>,
}

impl FsStore {
    pub(crate) fn new(ts: Arc<TypeSystem>) -> Self {
        let by_type = vec![RoaringBitmap::new(); ts.type_count()];
        Self {
            ts,
            records: vec![None],
            cells: Vec::new(),
            strings: Vec::new(),
            string_ids: AHashMap::new(),
            by_type,
            live: 0,
            generation: 0,
            tracking: None,
        }
    }

    pub(crate) fn type_system(&self) -> &Arc<TypeSystem> {
        &self.ts
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }

    /// The id the next allocation will receive.
    pub(crate) fn next_id(&self) -> u32 {
        self.records.len() as u32
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn make_ref(&self, id: u32) -> FsRef {
        FsRef::new(id, self.generation)
    }

    /// Check that `fs` was issued by this store since the last reset.
    pub(crate) fn resolve(&self, fs: FsRef) -> Result<u32> {
        if fs.generation() != self.generation || self.record(fs.id()).is_none() {
            return Err(CasError::StaleReference { id: fs.id() });
        }
        Ok(fs.id())
    }

    pub(crate) fn record(&self, id: u32) -> Option<&FsRecord> {
        self.records.get(id as usize).and_then(Option::as_ref)
    }

    pub(crate) fn type_of(&self, id: u32) -> Option<TypeCode> {
        self.record(id).map(|r| r.ty)
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_some())
            .map(|(id, _)| id as u32)
    }

    /// Ids whose exact type is `ty`.
    pub(crate) fn ids_of_exact_type(&self, ty: TypeCode) -> &RoaringBitmap {
        &self.by_type[ty.index()]
    }

    pub(crate) fn allocate(&mut self, ty: TypeCode, len: usize) -> u32 {
        let id = self.next_id();
        let start = self.cells.len() as u32;
        self.cells.resize(self.cells.len() + len, 0);
        self.records.push(Some(FsRecord {
            ty,
            start,
            len: len as u32,
        }));
        self.by_type[ty.index()].insert(id);
        self.live += 1;
        id
    }

    /// Allocate with a caller-chosen id, used when restoring serialized data.
    /// Ids must be strictly increasing across calls.
    pub(crate) fn allocate_at(
        &mut self,
        id: u32,
        ty: TypeCode,
        len: usize,
    ) -> std::result::Result<(), SerializationError> {
        if id == 0 || id < self.next_id() {
            return Err(SerializationError::Malformed(format!(
                "feature structure id {id} is duplicated or out of order"
            )));
        }
        if !self.ts.contains(ty) {
            return Err(SerializationError::UnknownType(format!("code {}", ty.raw())));
        }
        while self.next_id() < id {
            self.records.push(None);
        }
        self.allocate(ty, len);
        Ok(())
    }

    /// Raw cell read; `id` and `slot` must be valid.
    pub(crate) fn cell(&self, id: u32, slot: usize) -> u64 {
        match self.record(id) {
            Some(r) if slot < r.len as usize => self.cells[r.start as usize + slot],
            _ => 0,
        }
    }

    pub(crate) fn cells(&self, id: u32) -> &[u64] {
        match self.record(id) {
            Some(r) => &self.cells[r.start as usize..(r.start + r.len) as usize],
            None => &[],
        }
    }

    /// Raw cell write; records the modification when a mark is active.
    pub(crate) fn set_cell(&mut self, id: u32, slot: usize, cell: u64) {
        let Some(r) = self.record(id).copied() else {
            return;
        };
        if slot >= r.len as usize {
            return;
        }
        self.cells[r.start as usize + slot] = cell;
        if let Some(tracking) = &mut self.tracking {
            if id < tracking.watermark {
                tracking.modified.insert(id);
            }
        }
    }

    pub(crate) fn intern(&mut self, s: &str) -> u64 {
        if let Some(&index) = self.string_ids.get(s) {
            return index as u64 + 1;
        }
        let index = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.string_ids.insert(s.to_string(), index);
        index as u64 + 1
    }

    pub(crate) fn string(&self, cell: u64) -> Option<&str> {
        if cell == 0 {
            return None;
        }
        self.strings.get(cell as usize - 1).map(String::as_str)
    }

    pub(crate) fn slot_target(&self, id: u32, slot: usize) -> Option<SlotTarget> {
        let r = self.record(id)?;
        match self.ts.element_kind(r.ty) {
            Some(element) => Some(SlotTarget::for_element(element)),
            None => {
                let f = *self.ts.features_of(r.ty).get(slot)?;
                Some(SlotTarget::for_range(&self.ts, self.ts.feature_info(f).range()))
            }
        }
    }

    pub(crate) fn targets(&self, id: u32) -> Vec<SlotTarget> {
        match self.record(id) {
            Some(r) => slot_targets(&self.ts, r.ty, r.len as usize),
            None => Vec::new(),
        }
    }

    pub(crate) fn decode(&self, target: SlotTarget, cell: u64) -> FeatureValue {
        match target {
            SlotTarget::Primitive(p) => decode_primitive(cell, p),
            SlotTarget::Str(_) => FeatureValue::String(self.string(cell).map(str::to_string)),
            SlotTarget::Ref(_) => FeatureValue::Ref(match cell {
                0 => None,
                id => Some(self.make_ref(id as u32)),
            }),
        }
    }

    /// Validate `value` against `target` and turn it into a cell.
    pub(crate) fn encode(&mut self, target: SlotTarget, value: &FeatureValue) -> Result<u64> {
        let ts = Arc::clone(&self.ts);
        let mismatch = |found: String| CasError::TypeMismatch {
            expected: target.describe(&ts),
            found,
        };
        match (target, value) {
            (SlotTarget::Primitive(p), _) => {
                encode_primitive(value, p).ok_or_else(|| mismatch(value.describe().to_string()))
            }
            (SlotTarget::Str(_), FeatureValue::String(None)) => Ok(0),
            (SlotTarget::Str(allowed), FeatureValue::String(Some(s))) => {
                if let Some(subtype) = allowed {
                    let permitted = ts
                        .type_info(subtype)
                        .allowed_values()
                        .map(|values| values.iter().any(|v| v == s))
                        .unwrap_or(true);
                    if !permitted {
                        return Err(mismatch(format!("\"{s}\"")));
                    }
                }
                Ok(self.intern(s))
            }
            (SlotTarget::Ref(_), FeatureValue::Ref(None)) => Ok(0),
            (SlotTarget::Ref(range), FeatureValue::Ref(Some(fs))) => {
                let id = self.resolve(*fs)?;
                let ty = self.type_of(id).unwrap_or(ts.builtins().top);
                if !ts.subsumes(range, ty) {
                    return Err(mismatch(format!("reference to `{}`", ts.type_name(ty))));
                }
                Ok(id as u64)
            }
            (_, other) => Err(mismatch(other.describe().to_string())),
        }
    }

    pub(crate) fn start_tracking(&mut self) -> u32 {
        let watermark = self.next_id();
        self.tracking = Some(ModificationTracking {
            watermark,
            modified: RoaringBitmap::new(),
        });
        watermark
    }

    pub(crate) fn modified(&self) -> Option<&RoaringBitmap> {
        self.tracking.as_ref().map(|t| &t.modified)
    }

    /// Drop every structure and string. Outstanding refs become stale.
    pub(crate) fn reset(&mut self) {
        self.records.clear();
        self.records.push(None);
        self.cells.clear();
        self.strings.clear();
        self.string_ids.clear();
        for bucket in &mut self.by_type {
            bucket.clear();
        }
        self.live = 0;
        self.generation = self.generation.wrapping_add(1);
        self.tracking = None;
    }
}

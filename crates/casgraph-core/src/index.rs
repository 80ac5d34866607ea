//! Per-view index repository.
//!
//! Sorted and set indexes are `BTreeMap`s over materialized sort keys; the
//! key of each member is remembered so removal never has to re-read the
//! structure. Bags are a vector with a position table and swap-remove.
//!
//! Iteration is snapshot based: an [`FsIterator`] captures the members at
//! creation and is unaffected by later adds, removes or value changes.

use std::cmp::{Ordering, Reverse};
use std::collections::BTreeMap;

use ahash::AHashMap;
use casgraph_types::builtin;
use casgraph_types::{
    IndexDescription, IndexKeyDescription, IndexKind, KeyDirection, TypeCode, TypeSystem,
};

use crate::error::{CasError, Result};
use crate::store::FsStore;
use crate::value::{float_value, integral_value, CellKind, FsRef, SlotTarget};

/// Declaration of an index: label, type, kind and key list.
pub type IndexSpec = IndexDescription;

/// Label of the built-in annotation index present in every view.
pub const ANNOTATION_INDEX: &str = "AnnotationIndex";

/// `cas.Annotation` sorted by begin ascending, end descending, type priority.
pub fn annotation_index_spec() -> IndexSpec {
    IndexSpec::new(ANNOTATION_INDEX, builtin::ANNOTATION, IndexKind::Sorted)
        .with_key(builtin::FEAT_BEGIN, KeyDirection::Standard)
        .with_key(builtin::FEAT_END, KeyDirection::Reverse)
        .with_type_priority()
}

#[derive(Debug, Clone)]
enum KeyValue {
    Int(i64),
    Float(f64),
    Str(Option<String>),
}

impl KeyValue {
    fn rank(&self) -> u8 {
        match self {
            KeyValue::Int(_) => 0,
            KeyValue::Float(_) => 1,
            KeyValue::Str(_) => 2,
        }
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyValue::Int(a), KeyValue::Int(b)) => a.cmp(b),
            (KeyValue::Float(a), KeyValue::Float(b)) => a.total_cmp(b),
            (KeyValue::Str(a), KeyValue::Str(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyValue {}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum KeyPart {
    Asc(KeyValue),
    Desc(Reverse<KeyValue>),
    Priority(u32),
}

type SortKey = Vec<KeyPart>;

#[derive(Debug, Clone, Copy)]
enum CompiledKey {
    Slot {
        offset: usize,
        kind: CellKind,
        reverse: bool,
    },
    TypePriority,
}

#[derive(Debug, Clone)]
pub(crate) struct IndexDef {
    spec: IndexSpec,
    ty: TypeCode,
    keys: Vec<CompiledKey>,
}

impl IndexDef {
    pub(crate) fn compile(ts: &TypeSystem, spec: &IndexSpec) -> Result<Self> {
        let ty = ts.get_type(&spec.type_name).ok_or_else(|| {
            CasError::IndexDefinition(format!(
                "index `{}` names unknown type `{}`",
                spec.label, spec.type_name
            ))
        })?;
        let mut keys = Vec::with_capacity(spec.keys.len() + 1);
        for key in &spec.keys {
            match key {
                IndexKeyDescription::Feature { name, direction } => {
                    let feature = ts.get_feature(ty, name).ok_or_else(|| {
                        CasError::IndexDefinition(format!(
                            "index `{}`: type `{}` has no feature `{name}`",
                            spec.label, spec.type_name
                        ))
                    })?;
                    let info = ts.feature_info(feature);
                    let kind = SlotTarget::for_range(ts, info.range()).cell_kind();
                    if kind == CellKind::Ref {
                        return Err(CasError::IndexDefinition(format!(
                            "index `{}`: key `{name}` is not a primitive or string feature",
                            spec.label
                        )));
                    }
                    keys.push(CompiledKey::Slot {
                        offset: info.offset(),
                        kind,
                        reverse: *direction == KeyDirection::Reverse,
                    });
                }
                IndexKeyDescription::TypePriority => keys.push(CompiledKey::TypePriority),
            }
        }
        let has_priority = keys.iter().any(|k| matches!(k, CompiledKey::TypePriority));
        if spec.kind != IndexKind::Bag && !has_priority {
            keys.push(CompiledKey::TypePriority);
        }
        Ok(Self {
            spec: spec.clone(),
            ty,
            keys,
        })
    }

    fn key_for(&self, store: &FsStore, id: u32) -> SortKey {
        let ts = store.type_system();
        self.keys
            .iter()
            .map(|key| match *key {
                CompiledKey::Slot {
                    offset,
                    kind,
                    reverse,
                } => {
                    let cell = store.cell(id, offset);
                    let value = match kind {
                        CellKind::Primitive(p) => match integral_value(cell, p) {
                            Some(v) => KeyValue::Int(v),
                            None => KeyValue::Float(float_value(cell, p).unwrap_or_default()),
                        },
                        CellKind::Str => KeyValue::Str(store.string(cell).map(str::to_string)),
                        CellKind::Ref => KeyValue::Int(cell as i64),
                    };
                    if reverse {
                        KeyPart::Desc(Reverse(value))
                    } else {
                        KeyPart::Asc(value)
                    }
                }
                CompiledKey::TypePriority => {
                    let ty = store.type_of(id).unwrap_or(ts.builtins().top);
                    KeyPart::Priority(ts.priority().rank(ty))
                }
            })
            .collect()
    }

    fn uses_offset(&self, offset: usize) -> bool {
        self.keys
            .iter()
            .any(|k| matches!(k, CompiledKey::Slot { offset: o, .. } if *o == offset))
    }
}

#[derive(Debug, Clone)]
enum Entries {
    Sorted {
        map: BTreeMap<(SortKey, u32), u32>,
        keys: AHashMap<u32, SortKey>,
    },
    Set {
        map: BTreeMap<SortKey, u32>,
        keys: AHashMap<u32, SortKey>,
    },
    Bag {
        items: Vec<u32>,
        positions: AHashMap<u32, Vec<usize>>,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct Index {
    def: IndexDef,
    entries: Entries,
    len: usize,
}

impl Index {
    fn new(def: IndexDef) -> Self {
        let entries = match def.spec.kind {
            IndexKind::Sorted => Entries::Sorted {
                map: BTreeMap::new(),
                keys: AHashMap::new(),
            },
            IndexKind::Set => Entries::Set {
                map: BTreeMap::new(),
                keys: AHashMap::new(),
            },
            IndexKind::Bag => Entries::Bag {
                items: Vec::new(),
                positions: AHashMap::new(),
            },
        };
        Self {
            def,
            entries,
            len: 0,
        }
    }

    pub(crate) fn spec(&self) -> &IndexSpec {
        &self.def.spec
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    fn insert(&mut self, store: &FsStore, id: u32) {
        match &mut self.entries {
            Entries::Sorted { map, keys } => {
                let key = keys
                    .entry(id)
                    .or_insert_with(|| self.def.key_for(store, id))
                    .clone();
                *map.entry((key, id)).or_insert(0) += 1;
                self.len += 1;
            }
            Entries::Set { map, keys } => {
                if keys.contains_key(&id) {
                    return;
                }
                let key = self.def.key_for(store, id);
                if map.contains_key(&key) {
                    return;
                }
                map.insert(key.clone(), id);
                keys.insert(id, key);
                self.len += 1;
            }
            Entries::Bag { items, positions } => {
                positions.entry(id).or_default().push(items.len());
                items.push(id);
                self.len += 1;
            }
        }
    }

    fn remove(&mut self, id: u32) {
        match &mut self.entries {
            Entries::Sorted { map, keys } => {
                let Some(key) = keys.get(&id) else { return };
                let slot = (key.clone(), id);
                if let Some(count) = map.get_mut(&slot) {
                    *count -= 1;
                    if *count == 0 {
                        map.remove(&slot);
                        keys.remove(&id);
                    }
                    self.len -= 1;
                }
            }
            Entries::Set { map, keys } => {
                let Some(key) = keys.remove(&id) else { return };
                map.remove(&key);
                self.len -= 1;
            }
            Entries::Bag { items, positions } => {
                let Some(list) = positions.get_mut(&id) else {
                    return;
                };
                let Some(pos) = list.pop() else { return };
                if list.is_empty() {
                    positions.remove(&id);
                }
                items.swap_remove(pos);
                if let Some(&moved) = items.get(pos) {
                    let old = items.len();
                    if let Some(slot) = positions
                        .get_mut(&moved)
                        .and_then(|l| l.iter_mut().find(|p| **p == old))
                    {
                        *slot = pos;
                    }
                }
                self.len -= 1;
            }
        }
    }

    fn contains(&self, id: u32) -> bool {
        match &self.entries {
            Entries::Sorted { keys, .. } | Entries::Set { keys, .. } => keys.contains_key(&id),
            Entries::Bag { positions, .. } => positions.contains_key(&id),
        }
    }

    /// Recompute the key of `id` after one of its key slots changed.
    fn refresh(&mut self, store: &FsStore, id: u32) {
        match self.def.spec.kind {
            IndexKind::Sorted => {
                let Entries::Sorted { map, keys } = &mut self.entries else {
                    return;
                };
                let Some(old) = keys.remove(&id) else { return };
                let count = map.remove(&(old, id)).unwrap_or(0);
                let key = self.def.key_for(store, id);
                map.insert((key.clone(), id), count);
                keys.insert(id, key);
            }
            IndexKind::Set => {
                if self.contains(id) {
                    self.remove(id);
                    self.insert(store, id);
                }
            }
            IndexKind::Bag => {}
        }
    }

    /// Members in index order, with repetitions.
    fn ids(&self) -> Vec<u32> {
        match &self.entries {
            Entries::Sorted { map, .. } => map
                .iter()
                .flat_map(|((_, id), count)| std::iter::repeat(*id).take(*count as usize))
                .collect(),
            Entries::Set { map, .. } => map.values().copied().collect(),
            Entries::Bag { items, .. } => items.clone(),
        }
    }
}

/// The indexes and index membership of one view.
#[derive(Debug, Clone)]
pub(crate) struct IndexRepository {
    indexes: Vec<Index>,
    by_label: AHashMap<String, usize>,
    /// Every structure added to this view, with the sequence number of each add.
    members: BTreeMap<u32, Vec<u64>>,
    /// Adds still in effect, by sequence number.
    added: BTreeMap<u64, u32>,
    next_seq: u64,
}

impl IndexRepository {
    pub(crate) fn new(ts: &TypeSystem) -> Result<Self> {
        let mut repo = Self {
            indexes: Vec::new(),
            by_label: AHashMap::new(),
            members: BTreeMap::new(),
            added: BTreeMap::new(),
            next_seq: 0,
        };
        let def = IndexDef::compile(ts, &annotation_index_spec())?;
        repo.by_label.insert(ANNOTATION_INDEX.to_string(), 0);
        repo.indexes.push(Index::new(def));
        Ok(repo)
    }

    /// Declare an index; redeclaring an identical one is a no-op. Structures
    /// already in the view are added to the new index.
    pub(crate) fn declare(&mut self, store: &FsStore, spec: &IndexSpec) -> Result<()> {
        if let Some(&i) = self.by_label.get(&spec.label) {
            if self.indexes[i].spec() == spec {
                return Ok(());
            }
            return Err(CasError::IndexDefinition(format!(
                "label `{}` is already used by a different index",
                spec.label
            )));
        }
        let def = IndexDef::compile(store.type_system(), spec)?;
        let mut index = Index::new(def);
        let ts = store.type_system();
        for &id in self.added.values() {
            if store
                .type_of(id)
                .is_some_and(|ty| ts.subsumes(index.def.ty, ty))
            {
                index.insert(store, id);
            }
        }
        self.by_label.insert(spec.label.clone(), self.indexes.len());
        self.indexes.push(index);
        Ok(())
    }

    /// Declared (non built-in) index specs, in declaration order.
    pub(crate) fn declared_specs(&self) -> impl Iterator<Item = &IndexSpec> + '_ {
        self.indexes.iter().skip(1).map(Index::spec)
    }

    pub(crate) fn labels(&self) -> impl Iterator<Item = &str> + '_ {
        self.indexes.iter().map(|i| i.spec().label.as_str())
    }

    pub(crate) fn add(&mut self, store: &FsStore, id: u32) {
        let Some(ty) = store.type_of(id) else { return };
        let ts = store.type_system();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.members.entry(id).or_default().push(seq);
        self.added.insert(seq, id);
        for index in &mut self.indexes {
            if ts.subsumes(index.def.ty, ty) {
                index.insert(store, id);
            }
        }
    }

    /// Remove one occurrence; returns whether `id` was a member.
    pub(crate) fn remove(&mut self, store: &FsStore, id: u32) -> bool {
        let Some(seqs) = self.members.get_mut(&id) else {
            return false;
        };
        if let Some(seq) = seqs.pop() {
            self.added.remove(&seq);
        }
        if seqs.is_empty() {
            self.members.remove(&id);
        }
        let Some(ty) = store.type_of(id) else {
            return true;
        };
        let ts = store.type_system();
        for index in &mut self.indexes {
            if ts.subsumes(index.def.ty, ty) {
                index.remove(id);
            }
        }
        true
    }

    /// Re-sort `id` in every index keyed on the slot at `offset`.
    pub(crate) fn refresh(&mut self, store: &FsStore, id: u32, offset: usize) {
        if !self.members.contains_key(&id) {
            return;
        }
        for index in &mut self.indexes {
            if index.def.uses_offset(offset) {
                index.refresh(store, id);
            }
        }
    }

    /// Members in id order, with their add counts.
    pub(crate) fn members(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.members
            .iter()
            .map(|(id, seqs)| (*id, seqs.len() as u32))
    }

    /// One entry per add still in effect, oldest first. Replaying these adds
    /// rebuilds every index, set indexes included, exactly.
    pub(crate) fn add_order(&self) -> impl Iterator<Item = u32> + '_ {
        self.added.values().copied()
    }

    fn index(&self, label: &str) -> Result<&Index> {
        self.by_label
            .get(label)
            .map(|&i| &self.indexes[i])
            .ok_or_else(|| CasError::UnknownIndex(label.to_string()))
    }

    pub(crate) fn size(&self, label: &str) -> Result<usize> {
        Ok(self.index(label)?.len())
    }

    pub(crate) fn contains(&self, label: &str, id: u32) -> Result<bool> {
        Ok(self.index(label)?.contains(id))
    }

    pub(crate) fn index_type(&self, label: &str) -> Result<TypeCode> {
        Ok(self.index(label)?.def.ty)
    }

    /// Snapshot of the members of `label`, optionally narrowed to structures
    /// whose type is subsumed by `narrow`.
    pub(crate) fn snapshot(
        &self,
        store: &FsStore,
        label: &str,
        narrow: Option<TypeCode>,
    ) -> Result<FsIterator> {
        let index = self.index(label)?;
        let ts = store.type_system();
        let items = index
            .ids()
            .into_iter()
            .filter(|&id| match (narrow, store.type_of(id)) {
                (Some(n), Some(ty)) => ts.subsumes(n, ty),
                _ => true,
            })
            .map(|id| store.make_ref(id))
            .collect();
        Ok(FsIterator::new(items))
    }
}

/// Restartable cursor over a snapshot of an index.
///
/// Also an `Iterator`: `next` yields the current element and advances.
#[derive(Debug, Clone)]
pub struct FsIterator {
    items: Vec<FsRef>,
    cursor: Option<usize>,
}

impl FsIterator {
    pub(crate) fn new(items: Vec<FsRef>) -> Self {
        let cursor = if items.is_empty() { None } else { Some(0) };
        Self { items, cursor }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        self.cursor.is_some()
    }

    pub fn get(&self) -> Option<FsRef> {
        self.cursor.map(|i| self.items[i])
    }

    pub fn move_to_first(&mut self) {
        self.cursor = if self.items.is_empty() { None } else { Some(0) };
    }

    pub fn move_to_last(&mut self) {
        self.cursor = self.items.len().checked_sub(1);
    }

    pub fn advance(&mut self) {
        self.cursor = match self.cursor {
            Some(i) if i + 1 < self.items.len() => Some(i + 1),
            _ => None,
        };
    }

    pub fn retreat(&mut self) {
        self.cursor = match self.cursor {
            Some(i) if i > 0 => Some(i - 1),
            _ => None,
        };
    }

    pub fn restart(&mut self) {
        self.move_to_first();
    }

    pub fn as_slice(&self) -> &[FsRef] {
        &self.items
    }
}

impl Iterator for FsIterator {
    type Item = FsRef;

    fn next(&mut self) -> Option<FsRef> {
        let current = self.get()?;
        self.advance();
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casgraph_types::TypeSystemBuilder;

    fn store() -> FsStore {
        let mut b = TypeSystemBuilder::new();
        b.declare_type("Token", builtin::ANNOTATION).unwrap();
        FsStore::new(b.commit().unwrap())
    }

    fn annotation(store: &mut FsStore, ty: TypeCode, begin: i32, end: i32) -> u32 {
        let len = store.type_system().features_of(ty).len();
        let id = store.allocate(ty, len);
        store.set_cell(id, 1, begin as u32 as u64);
        store.set_cell(id, 2, end as u32 as u64);
        id
    }

    #[test]
    fn annotation_index_orders_by_begin_then_longest_first() {
        let mut s = store();
        let token = s.type_system().get_type("Token").unwrap();
        let a = annotation(&mut s, token, 4, 7);
        let b = annotation(&mut s, token, 0, 3);
        let c = annotation(&mut s, token, 0, 7);
        let mut repo = IndexRepository::new(s.type_system()).unwrap();
        for id in [a, b, c] {
            repo.add(&s, id);
        }
        let ids: Vec<u32> = repo
            .snapshot(&s, ANNOTATION_INDEX, None)
            .unwrap()
            .map(FsRef::id)
            .collect();
        assert_eq!(ids, vec![c, b, a]);
    }

    #[test]
    fn bag_swap_remove_keeps_positions_consistent() {
        let mut s = store();
        let token = s.type_system().get_type("Token").unwrap();
        let ids: Vec<u32> = (0..5).map(|i| annotation(&mut s, token, i, i)).collect();
        let mut repo = IndexRepository::new(s.type_system()).unwrap();
        repo.declare(&s, &IndexSpec::new("bag", "Token", IndexKind::Bag))
            .unwrap();
        for &id in &ids {
            repo.add(&s, id);
        }
        assert!(repo.remove(&s, ids[1]));
        assert!(repo.remove(&s, ids[4]));
        assert!(!repo.remove(&s, ids[4]));
        let mut left: Vec<u32> = repo.snapshot(&s, "bag", None).unwrap().map(FsRef::id).collect();
        left.sort_unstable();
        assert_eq!(left, vec![ids[0], ids[2], ids[3]]);
        assert!(repo.remove(&s, ids[0]));
        assert_eq!(repo.size("bag").unwrap(), 2);
    }

    #[test]
    fn set_index_keeps_first_of_equal_keys() {
        let mut s = store();
        let token = s.type_system().get_type("Token").unwrap();
        let first = annotation(&mut s, token, 1, 2);
        let second = annotation(&mut s, token, 1, 2);
        let mut repo = IndexRepository::new(s.type_system()).unwrap();
        let spec = IndexSpec::new("spans", "Token", IndexKind::Set)
            .with_key("begin", KeyDirection::Standard)
            .with_key("end", KeyDirection::Standard);
        repo.declare(&s, &spec).unwrap();
        repo.add(&s, first);
        repo.add(&s, second);
        assert_eq!(repo.size("spans").unwrap(), 1);
        assert!(repo.contains("spans", first).unwrap());
        assert!(!repo.contains("spans", second).unwrap());
        // Removing the shadowed structure leaves the stored one alone.
        repo.remove(&s, second);
        assert!(repo.contains("spans", first).unwrap());
    }

    #[test]
    fn late_set_index_is_filled_in_add_order() {
        let mut s = store();
        let token = s.type_system().get_type("Token").unwrap();
        let low = annotation(&mut s, token, 1, 2);
        let high = annotation(&mut s, token, 1, 5);
        let mut repo = IndexRepository::new(s.type_system()).unwrap();
        repo.add(&s, high);
        repo.add(&s, low);
        repo.add(&s, high);
        repo.remove(&s, high);
        assert_eq!(repo.add_order().collect::<Vec<_>>(), vec![high, low]);

        let spec = IndexSpec::new("starts", "Token", IndexKind::Set)
            .with_key("begin", KeyDirection::Standard);
        repo.declare(&s, &spec).unwrap();
        assert!(repo.contains("starts", high).unwrap());
        assert!(!repo.contains("starts", low).unwrap());
    }

    #[test]
    fn key_changes_are_resorted() {
        let mut s = store();
        let token = s.type_system().get_type("Token").unwrap();
        let a = annotation(&mut s, token, 0, 1);
        let b = annotation(&mut s, token, 5, 6);
        let mut repo = IndexRepository::new(s.type_system()).unwrap();
        repo.add(&s, a);
        repo.add(&s, b);
        s.set_cell(a, 1, 9);
        repo.refresh(&s, a, 1);
        let ids: Vec<u32> = repo
            .snapshot(&s, ANNOTATION_INDEX, None)
            .unwrap()
            .map(FsRef::id)
            .collect();
        assert_eq!(ids, vec![b, a]);
    }

    #[test]
    fn invalid_index_definitions_are_rejected() {
        let s = store();
        let mut repo = IndexRepository::new(s.type_system()).unwrap();
        let bad_feature = IndexSpec::new("x", "Token", IndexKind::Sorted)
            .with_key("nope", KeyDirection::Standard);
        assert!(matches!(
            repo.declare(&s, &bad_feature),
            Err(CasError::IndexDefinition(_))
        ));
        let ref_key = IndexSpec::new("y", "Token", IndexKind::Sorted)
            .with_key("sofa", KeyDirection::Standard);
        assert!(matches!(
            repo.declare(&s, &ref_key),
            Err(CasError::IndexDefinition(_))
        ));
        let clash = IndexSpec::new(ANNOTATION_INDEX, "Token", IndexKind::Bag);
        assert!(matches!(
            repo.declare(&s, &clash),
            Err(CasError::IndexDefinition(_))
        ));
    }

    #[test]
    fn iterator_cursor_moves_both_ways() {
        let s = store();
        let refs: Vec<FsRef> = (1..=3).map(|id| s.make_ref(id)).collect();
        let mut it = FsIterator::new(refs.clone());
        it.move_to_last();
        assert_eq!(it.get(), Some(refs[2]));
        it.retreat();
        it.retreat();
        assert_eq!(it.get(), Some(refs[0]));
        it.retreat();
        assert!(!it.is_valid());
        it.restart();
        assert_eq!(it.collect::<Vec<_>>(), refs);
    }
}

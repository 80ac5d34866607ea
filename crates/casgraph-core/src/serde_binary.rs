//! Binary CAS format.
//!
//! ```text
//! header   32 bytes, little endian
//!          magic "CASB" | version u16 | flags u16 | fingerprint u64
//!          | watermark u32 | next id u32 | body length u64
//! [types]  u32 length + CBOR `TypeSystemDescription`   (EMBEDDED_TYPE_SYSTEM)
//! body     bincode `BodyImage`, or the varint encoding  (COMPRESSED)
//! ```
//!
//! Ids are written as they are in the heap, so a round trip preserves them.
//! A delta body carries only structures at or above the watermark plus the
//! modified ones below it, and replays index changes from the journal.

use std::sync::Arc;

use ahash::AHashMap;
use casgraph_types::{
    digest::format_fingerprint, IndexDescription, IndexKeyDescription, IndexKind, KeyDirection,
    PrimitiveKind, TypeCode, TypeKind, TypeSystem, TypeSystemBuilder, TypeSystemDescription,
};
use serde::{Deserialize, Serialize};

use crate::cas::{Cas, Marker};
use crate::config::{BinaryOptions, CasConfig};
use crate::error::{Result, SerializationError};
use crate::store::FsStore;
use crate::value::{
    integral_value, primitive_cell_is_valid, slot_targets, CellKind, FsRef, SlotTarget,
};
use crate::view::ViewId;

pub const MAGIC: [u8; 4] = *b"CASB";
pub const FORMAT_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 32;

pub const FLAG_DELTA: u16 = 1;
pub const FLAG_COMPRESSED: u16 = 1 << 1;
pub const FLAG_EMBEDDED_TYPE_SYSTEM: u16 = 1 << 2;

type SerResult<T> = std::result::Result<T, SerializationError>;

/// Fixed-size header at the start of every binary CAS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryHeader {
    pub version: u16,
    pub flags: u16,
    pub fingerprint: u64,
    /// First id created after the mark (deltas only).
    pub watermark: u32,
    pub next_id: u32,
    pub body_len: u64,
}

impl BinaryHeader {
    pub fn is_delta(&self) -> bool {
        self.flags & FLAG_DELTA != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn has_embedded_type_system(&self) -> bool {
        self.flags & FLAG_EMBEDDED_TYPE_SYSTEM != 0
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.fingerprint.to_le_bytes());
        out.extend_from_slice(&self.watermark.to_le_bytes());
        out.extend_from_slice(&self.next_id.to_le_bytes());
        out.extend_from_slice(&self.body_len.to_le_bytes());
    }
}

/// Parse and validate the header of a binary CAS.
pub fn read_header(bytes: &[u8]) -> SerResult<BinaryHeader> {
    if bytes.len() < HEADER_LEN {
        return Err(SerializationError::Malformed(format!(
            "input is {} bytes, shorter than the {HEADER_LEN}-byte header",
            bytes.len()
        )));
    }
    if bytes[0..4] != MAGIC {
        return Err(SerializationError::Malformed(
            "not a binary CAS (bad magic)".to_string(),
        ));
    }
    let u16_at = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
    let u32_at = |at: usize| {
        let mut b = [0u8; 4];
        b.copy_from_slice(&bytes[at..at + 4]);
        u32::from_le_bytes(b)
    };
    let u64_at = |at: usize| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&bytes[at..at + 8]);
        u64::from_le_bytes(b)
    };
    let version = u16_at(4);
    if version != FORMAT_VERSION {
        return Err(SerializationError::VersionMismatch {
            found: version,
            supported: FORMAT_VERSION,
        });
    }
    Ok(BinaryHeader {
        version,
        flags: u16_at(6),
        fingerprint: u64_at(8),
        watermark: u32_at(16),
        next_id: u32_at(20),
        body_len: u64_at(24),
    })
}

// ============================================================================
// Images
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct RecordImage {
    id: u32,
    type_code: u32,
    len: u32,
}

/// Structures with their cells. String cells index `strings` (+1), reference
/// cells hold target ids, both 0 for null.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct HeapImage {
    strings: Vec<String>,
    records: Vec<RecordImage>,
    cells: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct KeyImage {
    /// `None` for the type-priority key.
    feature: Option<String>,
    reverse: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IndexImage {
    label: String,
    type_name: String,
    kind: u8,
    keys: Vec<KeyImage>,
}

impl IndexImage {
    fn from_spec(spec: &IndexDescription) -> Self {
        let kind = match spec.kind {
            IndexKind::Sorted => 0,
            IndexKind::Set => 1,
            IndexKind::Bag => 2,
        };
        let keys = spec
            .keys
            .iter()
            .map(|key| match key {
                IndexKeyDescription::Feature { name, direction } => KeyImage {
                    feature: Some(name.clone()),
                    reverse: *direction == KeyDirection::Reverse,
                },
                IndexKeyDescription::TypePriority => KeyImage {
                    feature: None,
                    reverse: false,
                },
            })
            .collect();
        Self {
            label: spec.label.clone(),
            type_name: spec.type_name.clone(),
            kind,
            keys,
        }
    }

    fn to_spec(&self) -> SerResult<IndexDescription> {
        let kind = match self.kind {
            0 => IndexKind::Sorted,
            1 => IndexKind::Set,
            2 => IndexKind::Bag,
            other => {
                return Err(SerializationError::Malformed(format!(
                    "index `{}` has unknown kind {other}",
                    self.label
                )))
            }
        };
        let mut spec = IndexDescription::new(&self.label, &self.type_name, kind);
        for key in &self.keys {
            spec = match &key.feature {
                Some(name) => {
                    let direction = if key.reverse {
                        KeyDirection::Reverse
                    } else {
                        KeyDirection::Standard
                    };
                    spec.with_key(name, direction)
                }
                None => spec.with_type_priority(),
            };
        }
        Ok(spec)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ViewImage {
    sofa: u32,
    indexes: Vec<IndexImage>,
    /// Indexed ids in the order they were added, once per add. Empty in deltas.
    members: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct EventImage {
    view: u32,
    id: u32,
    added: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct BodyImage {
    heap: HeapImage,
    views: Vec<ViewImage>,
    /// Number of views the receiver of a delta must have.
    base_views: u32,
    events: Vec<EventImage>,
}

fn heap_image(store: &FsStore, ids: impl IntoIterator<Item = u32>) -> HeapImage {
    let mut image = HeapImage::default();
    let mut local: AHashMap<&str, u64> = AHashMap::new();
    for id in ids {
        let Some(record) = store.record(id) else {
            continue;
        };
        image.records.push(RecordImage {
            id,
            type_code: record.ty.raw(),
            len: record.len,
        });
        let targets = store.targets(id);
        for (slot, &cell) in store.cells(id).iter().enumerate() {
            let kind = targets.get(slot).map(|t| t.cell_kind());
            let out = match (kind, store.string(cell)) {
                (Some(CellKind::Str), Some(s)) => *local.entry(s).or_insert_with(|| {
                    image.strings.push(s.to_string());
                    image.strings.len() as u64
                }),
                (Some(CellKind::Str), None) => 0,
                _ => cell,
            };
            image.cells.push(out);
        }
    }
    image
}

fn view_images(cas: &Cas, with_members: bool) -> Vec<ViewImage> {
    cas.views_slice()
        .iter()
        .map(|view| ViewImage {
            sofa: view.sofa,
            indexes: view
                .indexes
                .declared_specs()
                .map(IndexImage::from_spec)
                .collect(),
            members: if with_members {
                view.indexes.add_order().collect()
            } else {
                Vec::new()
            },
        })
        .collect()
}

// ============================================================================
// Writing
// ============================================================================

/// Serialize with the options from the CAS's configuration.
pub fn serialize_binary(cas: &Cas) -> Result<Vec<u8>> {
    let options = cas.config().binary;
    serialize_binary_with(cas, &options)
}

pub fn serialize_binary_with(cas: &Cas, options: &BinaryOptions) -> Result<Vec<u8>> {
    let store = cas.store();
    let body = BodyImage {
        heap: heap_image(store, store.ids()),
        views: view_images(cas, true),
        base_views: 0,
        events: Vec::new(),
    };
    let bytes = write_file(cas.type_system(), &body, 0, 0, store.next_id(), options)?;
    tracing::debug!(
        bytes = bytes.len(),
        structures = store.len(),
        compressed = options.compressed,
        "serialized binary cas"
    );
    Ok(bytes)
}

/// Serialize everything that changed since `marker`.
pub fn serialize_delta(cas: &Cas, marker: &Marker) -> Result<Vec<u8>> {
    let journal = match cas.journal() {
        Some(j) if j.mark == marker.mark && cas.generation() == marker.generation => j,
        _ => {
            return Err(SerializationError::DeltaMismatch(
                "marker is stale or was not issued by this CAS".to_string(),
            )
            .into())
        }
    };
    let store = cas.store();
    let modified: Vec<u32> = store
        .modified()
        .map(|m| m.iter().collect())
        .unwrap_or_default();
    let created = store.ids().filter(|&id| id >= journal.watermark);
    let body = BodyImage {
        heap: heap_image(store, modified.iter().copied().chain(created)),
        views: view_images(cas, false),
        base_views: journal.views_at_mark as u32,
        events: journal
            .events
            .iter()
            .map(|e| EventImage {
                view: e.view,
                id: e.id,
                added: e.added,
            })
            .collect(),
    };
    let options = cas.config().binary;
    let bytes = write_file(
        cas.type_system(),
        &body,
        FLAG_DELTA,
        journal.watermark,
        store.next_id(),
        &options,
    )?;
    tracing::debug!(
        bytes = bytes.len(),
        modified = modified.len(),
        records = body.heap.records.len(),
        events = body.events.len(),
        "serialized delta"
    );
    Ok(bytes)
}

fn write_file(
    ts: &TypeSystem,
    body: &BodyImage,
    mut flags: u16,
    watermark: u32,
    next_id: u32,
    options: &BinaryOptions,
) -> SerResult<Vec<u8>> {
    let body_bytes = if options.compressed {
        flags |= FLAG_COMPRESSED;
        compact::encode(ts, body)?
    } else {
        bincode::serialize(body)?
    };
    let mut types = Vec::new();
    if options.embed_type_system {
        flags |= FLAG_EMBEDDED_TYPE_SYSTEM;
        ciborium::into_writer(ts.description(), &mut types)
            .map_err(|e| SerializationError::Malformed(format!("type system encoding: {e}")))?;
    }

    let header = BinaryHeader {
        version: FORMAT_VERSION,
        flags,
        fingerprint: ts.fingerprint(),
        watermark,
        next_id,
        body_len: body_bytes.len() as u64,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + types.len() + body_bytes.len() + 4);
    header.write(&mut out);
    if options.embed_type_system {
        out.extend_from_slice(&(types.len() as u32).to_le_bytes());
        out.extend_from_slice(&types);
    }
    out.extend_from_slice(&body_bytes);
    Ok(out)
}

// ============================================================================
// Reading
// ============================================================================

/// Split a file into header, optional embedded type system and body.
fn split_file(bytes: &[u8]) -> SerResult<(BinaryHeader, Option<&[u8]>, &[u8])> {
    let header = read_header(bytes)?;
    let mut rest = &bytes[HEADER_LEN..];
    let mut types = None;
    if header.has_embedded_type_system() {
        if rest.len() < 4 {
            return Err(SerializationError::Malformed(
                "truncated type system section".to_string(),
            ));
        }
        let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        if rest.len() < 4 + len {
            return Err(SerializationError::Malformed(
                "truncated type system section".to_string(),
            ));
        }
        types = Some(&rest[4..4 + len]);
        rest = &rest[4 + len..];
    }
    if rest.len() as u64 != header.body_len {
        return Err(SerializationError::Malformed(format!(
            "body is {} bytes, header says {}",
            rest.len(),
            header.body_len
        )));
    }
    Ok((header, types, rest))
}

fn check_fingerprint(ts: &TypeSystem, header: &BinaryHeader) -> SerResult<()> {
    if ts.fingerprint() != header.fingerprint {
        return Err(SerializationError::TypeSystemMismatch {
            expected: format_fingerprint(ts.fingerprint()),
            found: format_fingerprint(header.fingerprint),
        });
    }
    Ok(())
}

fn decode_body(ts: &TypeSystem, header: &BinaryHeader, body: &[u8]) -> SerResult<BodyImage> {
    if header.is_compressed() {
        compact::decode(ts, body)
    } else {
        Ok(bincode::deserialize(body)?)
    }
}

pub fn deserialize_binary(bytes: &[u8], ts: Arc<TypeSystem>) -> Result<Cas> {
    deserialize_binary_with(bytes, ts, CasConfig::default())
}

pub fn deserialize_binary_with(bytes: &[u8], ts: Arc<TypeSystem>, config: CasConfig) -> Result<Cas> {
    let (header, _, body) = split_file(bytes)?;
    if header.is_delta() {
        return Err(SerializationError::Malformed(
            "input is a delta; use apply_delta".to_string(),
        )
        .into());
    }
    check_fingerprint(&ts, &header)?;
    let image = decode_body(&ts, &header, body)?;
    let cas = restore(ts, config, &image, &header)?;
    tracing::debug!(structures = cas.fs_count(), "deserialized binary cas");
    Ok(cas)
}

/// Read a file written with `embed_type_system`, rebuilding its type system.
pub fn deserialize_binary_self_describing(bytes: &[u8]) -> Result<Cas> {
    deserialize_binary_self_describing_with(bytes, CasConfig::default())
}

pub fn deserialize_binary_self_describing_with(bytes: &[u8], config: CasConfig) -> Result<Cas> {
    let (_, types, _) = split_file(bytes)?;
    let types = types.ok_or_else(|| {
        SerializationError::Malformed("no embedded type system".to_string())
    })?;
    let ts = embedded_type_system(types)?;
    deserialize_binary_with(bytes, ts, config)
}

fn embedded_type_system(types: &[u8]) -> SerResult<Arc<TypeSystem>> {
    let desc: TypeSystemDescription = ciborium::from_reader(types)
        .map_err(|e| SerializationError::Malformed(format!("embedded type system: {e}")))?;
    TypeSystemBuilder::from_description(&desc)
        .and_then(|b| b.commit())
        .map_err(|e| SerializationError::Malformed(format!("embedded type system: {e}")))
}

fn restore(
    ts: Arc<TypeSystem>,
    config: CasConfig,
    image: &BodyImage,
    header: &BinaryHeader,
) -> Result<Cas> {
    let mut cas = Cas::blank(ts, config)?;
    restore_heap(cas.store_mut(), &image.heap, None)?;
    if let Some(last) = image.heap.records.last() {
        if last.id >= header.next_id {
            return Err(SerializationError::Malformed(format!(
                "structure #{} is beyond next id {}",
                last.id, header.next_id
            ))
            .into());
        }
    }
    for view in &image.views {
        let name = sofa_name(&cas, view.sofa)?;
        let id = cas.register_view(&name, view.sofa)?;
        declare_indexes(&mut cas, id, &view.indexes)?;
        for &member in &view.members {
            let fs = member_ref(&cas, member)?;
            cas.add_to_index(id, fs)?;
        }
    }
    cas.ensure_initial_view();
    Ok(cas)
}

fn sofa_name(cas: &Cas, sofa: u32) -> SerResult<String> {
    let ts = cas.type_system();
    let b = ts.builtins();
    let store = cas.store();
    if store.type_of(sofa) != Some(b.sofa) {
        return Err(SerializationError::Malformed(format!(
            "view refers to #{sofa}, which is not a sofa"
        )));
    }
    let offset = ts.feature_info(b.sofa_id).offset();
    store
        .string(store.cell(sofa, offset))
        .map(str::to_string)
        .ok_or_else(|| SerializationError::Malformed(format!("sofa #{sofa} has no sofaID")))
}

fn member_ref(cas: &Cas, id: u32) -> SerResult<FsRef> {
    match cas.store().record(id) {
        Some(_) => Ok(cas.store().make_ref(id)),
        None => Err(SerializationError::UnresolvedReference(format!("#{id}"))),
    }
}

fn declare_indexes(cas: &mut Cas, view: ViewId, indexes: &[IndexImage]) -> Result<()> {
    for index in indexes {
        cas.declare_index(view, &index.to_spec()?)?;
    }
    Ok(())
}

/// Load heap records into `store`. With a watermark, records below it must
/// already exist (same type and length) and are overwritten.
fn restore_heap(store: &mut FsStore, heap: &HeapImage, watermark: Option<u32>) -> SerResult<()> {
    let ts = Arc::clone(store.type_system());

    // Serialized ids are dense above the receiver's next id.
    let limit = store.next_id() as u64 + heap.records.len() as u64;
    let mut total = 0usize;
    for record in &heap.records {
        if record.id as u64 > limit {
            return Err(SerializationError::Malformed(format!(
                "structure id {} is far beyond the heap",
                record.id
            )));
        }
        let ty = TypeCode::new(record.type_code);
        if !ts.contains(ty) {
            return Err(SerializationError::UnknownType(format!(
                "code {}",
                record.type_code
            )));
        }
        let len = record.len as usize;
        if !matches!(ts.kind(ty), TypeKind::Array(_)) && ts.features_of(ty).len() != len {
            return Err(SerializationError::Malformed(format!(
                "structure #{} of `{}` has {len} slots, type has {}",
                record.id,
                ts.type_name(ty),
                ts.features_of(ty).len()
            )));
        }
        total += len;
    }
    if total != heap.cells.len() {
        return Err(SerializationError::Malformed(format!(
            "{} cells for {total} slots",
            heap.cells.len()
        )));
    }

    // Allocate everything first so references can point forward.
    for record in &heap.records {
        let ty = TypeCode::new(record.type_code);
        match watermark {
            Some(w) if record.id < w => {
                let existing = store.record(record.id).copied();
                if existing.map(|r| (r.ty, r.len)) != Some((ty, record.len)) {
                    return Err(SerializationError::DeltaMismatch(format!(
                        "modified structure #{} does not match the receiver",
                        record.id
                    )));
                }
            }
            _ => store.allocate_at(record.id, ty, record.len as usize)?,
        }
    }

    let mut at = 0usize;
    for record in &heap.records {
        let ty = TypeCode::new(record.type_code);
        let len = record.len as usize;
        let targets = slot_targets(&ts, ty, len);
        for (slot, target) in targets.into_iter().enumerate() {
            let raw = heap.cells[at + slot];
            let cell = restore_cell(store, &heap.strings, target, raw, record.id)?;
            store.set_cell(record.id, slot, cell);
        }
        at += len;
    }
    Ok(())
}

fn restore_cell(
    store: &mut FsStore,
    strings: &[String],
    target: SlotTarget,
    raw: u64,
    owner: u32,
) -> SerResult<u64> {
    let ts = Arc::clone(store.type_system());
    match target {
        SlotTarget::Primitive(p) => {
            if !primitive_cell_is_valid(raw, p) {
                return Err(SerializationError::BadValue(format!(
                    "#{owner}: {raw:#x} is not a valid {}",
                    p.name()
                )));
            }
            Ok(raw)
        }
        SlotTarget::Str(allowed) => {
            if raw == 0 {
                return Ok(0);
            }
            let s = strings.get(raw as usize - 1).ok_or_else(|| {
                SerializationError::Malformed(format!("#{owner}: string {raw} out of range"))
            })?;
            if let Some(subtype) = allowed {
                let permitted = ts
                    .type_info(subtype)
                    .allowed_values()
                    .map(|values| values.iter().any(|v| v == s))
                    .unwrap_or(true);
                if !permitted {
                    return Err(SerializationError::BadValue(format!(
                        "#{owner}: \"{s}\" is not allowed for `{}`",
                        ts.type_name(subtype)
                    )));
                }
            }
            Ok(store.intern(s))
        }
        SlotTarget::Ref(range) => {
            if raw == 0 {
                return Ok(0);
            }
            let target = u32::try_from(raw)
                .ok()
                .and_then(|id| store.type_of(id))
                .ok_or_else(|| SerializationError::UnresolvedReference(format!("#{raw}")))?;
            if !ts.subsumes(range, target) {
                return Err(SerializationError::BadValue(format!(
                    "#{owner}: reference to `{}` where `{}` is expected",
                    ts.type_name(target),
                    ts.type_name(range)
                )));
            }
            Ok(raw)
        }
    }
}

/// Replay a delta onto `cas`, which must be in the state the delta's mark
/// was taken in.
pub fn apply_delta(cas: &mut Cas, bytes: &[u8]) -> Result<()> {
    let (header, _, body) = split_file(bytes)?;
    if !header.is_delta() {
        return Err(SerializationError::Malformed("input is not a delta".to_string()).into());
    }
    check_fingerprint(cas.type_system(), &header)?;
    let next_id = cas.store().next_id();
    if next_id != header.watermark {
        return Err(SerializationError::DeltaMismatch(format!(
            "receiver's next id is {next_id}, delta was marked at {}",
            header.watermark
        ))
        .into());
    }
    let image = decode_body(cas.type_system(), &header, body)?;
    if cas.view_count() != image.base_views as usize {
        return Err(SerializationError::DeltaMismatch(format!(
            "receiver has {} views, delta was marked with {}",
            cas.view_count(),
            image.base_views
        ))
        .into());
    }

    // Replay onto a copy so a delta that fails halfway leaves `cas` untouched.
    let mut staged = cas.clone();
    replay_delta(&mut staged, &image, header.watermark)?;
    *cas = staged;
    tracing::debug!(
        records = image.heap.records.len(),
        events = image.events.len(),
        "applied delta"
    );
    Ok(())
}

fn replay_delta(cas: &mut Cas, image: &BodyImage, watermark: u32) -> Result<()> {
    restore_heap(cas.store_mut(), &image.heap, Some(watermark))?;
    for record in &image.heap.records {
        if record.id < watermark {
            cas.reindex_after_restore(record.id);
        }
    }

    for (i, view) in image.views.iter().enumerate() {
        let id = if i < cas.view_count() {
            let existing = ViewId::new(i);
            if cas.view(existing)?.sofa != view.sofa {
                return Err(SerializationError::DeltaMismatch(format!(
                    "view {i} is backed by a different sofa"
                ))
                .into());
            }
            existing
        } else {
            let name = sofa_name(cas, view.sofa)?;
            cas.register_view(&name, view.sofa)?
        };
        declare_indexes(cas, id, &view.indexes)?;
    }

    for event in &image.events {
        let view = ViewId::new(event.view as usize);
        let fs = member_ref(cas, event.id)?;
        if event.added {
            cas.add_to_index(view, fs)?;
        } else {
            cas.remove_from_index(view, fs)?;
        }
    }
    Ok(())
}

// ============================================================================
// Compressed body
// ============================================================================

mod compact {
    //! LEB128 varints, zigzag for signed values, per-kind cells, delta-coded
    //! ids. Floats are kept as raw little-endian bits.

    use super::*;

    pub(super) fn encode(ts: &TypeSystem, body: &BodyImage) -> SerResult<Vec<u8>> {
        let mut w = Writer::default();
        let heap = &body.heap;

        w.varint(heap.strings.len() as u64);
        for s in &heap.strings {
            w.string(s);
        }

        w.varint(heap.records.len() as u64);
        let mut prev = 0u32;
        let mut at = 0usize;
        for record in &heap.records {
            w.varint((record.id - prev) as u64);
            prev = record.id;
            w.varint(record.type_code as u64);
            w.varint(record.len as u64);
            let ty = TypeCode::new(record.type_code);
            let len = record.len as usize;
            let cells = heap.cells.get(at..at + len).ok_or_else(|| {
                SerializationError::Malformed("cell table shorter than records".to_string())
            })?;
            for (target, &cell) in slot_targets(ts, ty, len).iter().zip(cells) {
                match target.cell_kind() {
                    CellKind::Primitive(PrimitiveKind::Float) => {
                        w.bytes(&(cell as u32).to_le_bytes())
                    }
                    CellKind::Primitive(PrimitiveKind::Double) => w.bytes(&cell.to_le_bytes()),
                    CellKind::Primitive(p) => {
                        w.varint(zigzag(integral_value(cell, p).unwrap_or_default()))
                    }
                    CellKind::Str => w.varint(cell),
                    CellKind::Ref => match cell {
                        0 => w.varint(0),
                        target => w.varint(zigzag(target as i64 - record.id as i64) + 1),
                    },
                }
            }
            at += len;
        }

        w.varint(body.views.len() as u64);
        for view in &body.views {
            w.varint(view.sofa as u64);
            w.varint(view.indexes.len() as u64);
            for index in &view.indexes {
                w.string(&index.label);
                w.string(&index.type_name);
                w.bytes(&[index.kind]);
                w.varint(index.keys.len() as u64);
                for key in &index.keys {
                    let flags = key.feature.is_some() as u8 | ((key.reverse as u8) << 1);
                    w.bytes(&[flags]);
                    if let Some(name) = &key.feature {
                        w.string(name);
                    }
                }
            }
            w.varint(view.members.len() as u64);
            let mut prev = 0i64;
            for &member in &view.members {
                w.varint(zigzag(member as i64 - prev));
                prev = member as i64;
            }
        }

        w.varint(body.base_views as u64);
        w.varint(body.events.len() as u64);
        for event in &body.events {
            w.varint(event.view as u64);
            w.varint(event.id as u64);
            w.bytes(&[event.added as u8]);
        }
        Ok(w.out)
    }

    pub(super) fn decode(ts: &TypeSystem, bytes: &[u8]) -> SerResult<BodyImage> {
        let mut r = Reader { bytes, pos: 0 };
        let mut body = BodyImage::default();

        let count = r.count()?;
        for _ in 0..count {
            body.heap.strings.push(r.string()?);
        }

        let count = r.count()?;
        let mut prev = 0u32;
        for _ in 0..count {
            let id = prev
                .checked_add(r.u32()?)
                .ok_or_else(|| malformed("id overflow"))?;
            prev = id;
            let type_code = r.u32()?;
            let len = r.count()? as u32;
            let ty = TypeCode::new(type_code);
            if !ts.contains(ty) {
                return Err(SerializationError::UnknownType(format!("code {type_code}")));
            }
            body.heap.records.push(RecordImage { id, type_code, len });
            for target in slot_targets(ts, ty, len as usize) {
                let cell = match target.cell_kind() {
                    CellKind::Primitive(PrimitiveKind::Float) => r.fixed::<4>()?,
                    CellKind::Primitive(PrimitiveKind::Double) => r.fixed::<8>()?,
                    CellKind::Primitive(p) => truncate(unzigzag(r.varint()?), p),
                    CellKind::Str => r.varint()?,
                    CellKind::Ref => match r.varint()? {
                        0 => 0,
                        v => (id as i64)
                            .checked_add(unzigzag(v - 1))
                            .and_then(|target| u32::try_from(target).ok())
                            .ok_or_else(|| malformed("reference out of range"))?
                            as u64,
                    },
                };
                body.heap.cells.push(cell);
            }
        }

        let count = r.count()?;
        for _ in 0..count {
            let sofa = r.u32()?;
            let index_count = r.count()?;
            let mut indexes = Vec::with_capacity(index_count);
            for _ in 0..index_count {
                let label = r.string()?;
                let type_name = r.string()?;
                let kind = r.byte()?;
                let key_count = r.count()?;
                let mut keys = Vec::with_capacity(key_count);
                for _ in 0..key_count {
                    let flags = r.byte()?;
                    let feature = if flags & 1 != 0 {
                        Some(r.string()?)
                    } else {
                        None
                    };
                    keys.push(KeyImage {
                        feature,
                        reverse: flags & 2 != 0,
                    });
                }
                indexes.push(IndexImage {
                    label,
                    type_name,
                    kind,
                    keys,
                });
            }
            let member_count = r.count()?;
            let mut members = Vec::with_capacity(member_count);
            let mut prev = 0u32;
            for _ in 0..member_count {
                prev = (prev as i64)
                    .checked_add(unzigzag(r.varint()?))
                    .and_then(|id| u32::try_from(id).ok())
                    .ok_or_else(|| malformed("member id out of range"))?;
                members.push(prev);
            }
            body.views.push(ViewImage {
                sofa,
                indexes,
                members,
            });
        }

        body.base_views = r.u32()?;
        let count = r.count()?;
        for _ in 0..count {
            let view = r.u32()?;
            let id = r.u32()?;
            let added = r.byte()? != 0;
            body.events.push(EventImage { view, id, added });
        }
        if r.pos != bytes.len() {
            return Err(malformed("trailing bytes after compressed body"));
        }
        Ok(body)
    }

    fn malformed(message: &str) -> SerializationError {
        SerializationError::Malformed(message.to_string())
    }

    fn zigzag(v: i64) -> u64 {
        ((v << 1) ^ (v >> 63)) as u64
    }

    fn unzigzag(v: u64) -> i64 {
        ((v >> 1) as i64) ^ -((v & 1) as i64)
    }

    /// Back to the cell representation of an integral primitive.
    fn truncate(v: i64, kind: PrimitiveKind) -> u64 {
        match kind {
            PrimitiveKind::Boolean => v as u64,
            PrimitiveKind::Byte => v as i8 as u8 as u64,
            PrimitiveKind::Short => v as i16 as u16 as u64,
            PrimitiveKind::Integer => v as i32 as u32 as u64,
            PrimitiveKind::Long | PrimitiveKind::Float | PrimitiveKind::Double => v as u64,
        }
    }

    #[derive(Default)]
    struct Writer {
        out: Vec<u8>,
    }

    impl Writer {
        fn varint(&mut self, mut v: u64) {
            loop {
                let byte = (v & 0x7f) as u8;
                v >>= 7;
                if v == 0 {
                    self.out.push(byte);
                    return;
                }
                self.out.push(byte | 0x80);
            }
        }

        fn bytes(&mut self, b: &[u8]) {
            self.out.extend_from_slice(b);
        }

        fn string(&mut self, s: &str) {
            self.varint(s.len() as u64);
            self.bytes(s.as_bytes());
        }
    }

    struct Reader<'a> {
        bytes: &'a [u8],
        pos: usize,
    }

    impl Reader<'_> {
        fn byte(&mut self) -> SerResult<u8> {
            let b = *self
                .bytes
                .get(self.pos)
                .ok_or_else(|| malformed("truncated compressed body"))?;
            self.pos += 1;
            Ok(b)
        }

        fn varint(&mut self) -> SerResult<u64> {
            let mut v = 0u64;
            for shift in (0..64).step_by(7) {
                let b = self.byte()?;
                v |= ((b & 0x7f) as u64) << shift;
                if b & 0x80 == 0 {
                    return Ok(v);
                }
            }
            Err(malformed("varint longer than 10 bytes"))
        }

        fn u32(&mut self) -> SerResult<u32> {
            u32::try_from(self.varint()?).map_err(|_| malformed("value exceeds u32"))
        }

        /// A length; bounded by the remaining input so corrupt counts fail
        /// fast instead of allocating.
        fn count(&mut self) -> SerResult<usize> {
            let n = self.varint()? as usize;
            if n > self.bytes.len() - self.pos {
                return Err(malformed("count exceeds remaining input"));
            }
            Ok(n)
        }

        fn fixed<const N: usize>(&mut self) -> SerResult<u64> {
            let end = self.pos + N;
            let slice = self
                .bytes
                .get(self.pos..end)
                .ok_or_else(|| malformed("truncated compressed body"))?;
            let mut buf = [0u8; 8];
            buf[..N].copy_from_slice(slice);
            self.pos = end;
            Ok(u64::from_le_bytes(buf))
        }

        fn string(&mut self) -> SerResult<String> {
            let len = self.count()?;
            let slice = &self.bytes[self.pos..self.pos + len];
            self.pos += len;
            String::from_utf8(slice.to_vec()).map_err(|_| malformed("string is not utf-8"))
        }
    }

}

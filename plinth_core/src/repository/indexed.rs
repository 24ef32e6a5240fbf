use super::observation::ObservationPlan;
use super::record::RecordBox;
use super::RepositoryError;
use crate::borrow::{AccessState, ConflictLatch};
use crate::interner::InternedString;
use crate::reflection::{
    read_field_value, FieldValue, PathResolution, Registry, StructDescription,
};
use fxhash::FxHashMap;
use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::ops::Bound;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Stable identity of a record inside one indexed storage. Slot reuse bumps
/// the generation so stale cursor entries never alias a new record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RecordId {
    slot: u32,
    generation: u32,
}

pub(crate) struct Slot {
    pub record: RecordBox,
    pub access: AccessState,
}

/// Ordering key for interval indices. Only ordered archetypes participate.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OrdKey {
    Signed(i64),
    Unsigned(u64),
    Float(OrderedFloat<f64>),
    Str(InternedString),
}

impl OrdKey {
    fn from_value(value: FieldValue) -> Option<OrdKey> {
        match value {
            FieldValue::Signed(inner) => Some(OrdKey::Signed(inner)),
            FieldValue::Unsigned(inner) => Some(OrdKey::Unsigned(inner)),
            FieldValue::Float(inner) => Some(OrdKey::Float(OrderedFloat(inner))),
            FieldValue::Str(inner) => Some(OrdKey::Str(inner)),
            FieldValue::Bool(inner) => Some(OrdKey::Unsigned(inner as u64)),
            FieldValue::Enum(inner) => Some(OrdKey::Unsigned(inner as u64)),
        }
    }
}

struct ValueIndex {
    path: PathResolution,
    buckets: FxHashMap<u64, SmallVec<[RecordId; 2]>>,
}

struct SignalIndex {
    path: PathResolution,
    value: FieldValue,
    ids: Vec<RecordId>,
}

struct IntervalIndex {
    path: PathResolution,
    /// Sorted by `(key, slot)` for deterministic iteration.
    entries: Vec<(OrdKey, RecordId)>,
}

#[derive(Default)]
struct Indices {
    value: Vec<ValueIndex>,
    signal: Vec<SignalIndex>,
    interval: Vec<IntervalIndex>,
}

struct StorageState {
    slots: Vec<Option<Box<Slot>>>,
    generations: Vec<u32>,
    free: Vec<u32>,
    indices: Indices,
}

/// Cascade rule resolved at the serving transition: deleting a record of this
/// storage deletes matching records of `child_storage`.
pub(crate) struct CascadeRule {
    pub parent_path: PathResolution,
    pub child_storage: Arc<IndexedStorage>,
    pub child_path: PathResolution,
}

#[derive(Default)]
pub(crate) struct IndexedObservation {
    pub plan: ObservationPlan,
    pub cascades: Vec<CascadeRule>,
}

/// Storage holding a multiset of records of one type, queryable by sequence,
/// exact value, signal constant or ordered interval.
pub struct IndexedStorage {
    type_name: InternedString,
    description: RwLock<Arc<StructDescription>>,
    registry: RwLock<Arc<Registry>>,
    serving: Arc<AtomicBool>,
    conflict: ConflictLatch,
    state: RwLock<StorageState>,
    observation: RwLock<Option<Arc<IndexedObservation>>>,
}

unsafe fn field_value_at(path: &PathResolution, record: *const u8) -> Option<FieldValue> {
    read_field_value(&path.archetype, record.add(path.offset as usize))
}

fn add_to_indices(indices: &mut Indices, id: RecordId, record: *const u8) {
    for index in &mut indices.value {
        if let Some(value) = unsafe { field_value_at(&index.path, record) } {
            index.buckets.entry(value.hash_key()).or_default().push(id);
        }
    }
    for index in &mut indices.signal {
        if let Some(value) = unsafe { field_value_at(&index.path, record) } {
            if value == index.value {
                index.ids.push(id);
            }
        }
    }
    for index in &mut indices.interval {
        if let Some(key) = unsafe { field_value_at(&index.path, record) }.and_then(OrdKey::from_value)
        {
            let position = index
                .entries
                .partition_point(|(existing, existing_id)| (existing, existing_id.slot) < (&key, id.slot));
            index.entries.insert(position, (key, id));
        }
    }
}

fn remove_from_indices(indices: &mut Indices, id: RecordId, record: *const u8) {
    for index in &mut indices.value {
        if let Some(value) = unsafe { field_value_at(&index.path, record) } {
            if let Some(bucket) = index.buckets.get_mut(&value.hash_key()) {
                bucket.retain(|existing| *existing != id);
            }
        }
    }
    for index in &mut indices.signal {
        index.ids.retain(|existing| *existing != id);
    }
    for index in &mut indices.interval {
        index.entries.retain(|(_, existing)| *existing != id);
    }
}

impl IndexedStorage {
    pub(crate) fn new(
        description: Arc<StructDescription>,
        registry: Arc<Registry>,
        serving: Arc<AtomicBool>,
    ) -> Self {
        IndexedStorage {
            type_name: description.name,
            description: RwLock::new(description),
            registry: RwLock::new(registry),
            serving,
            conflict: ConflictLatch::new(),
            state: RwLock::new(StorageState {
                slots: Vec::new(),
                generations: Vec::new(),
                free: Vec::new(),
                indices: Indices::default(),
            }),
            observation: RwLock::new(None),
        }
    }

    pub fn type_name(&self) -> InternedString {
        self.type_name
    }

    pub(crate) fn description(&self) -> Arc<StructDescription> {
        self.description.read().clone()
    }

    pub(crate) fn install_observation(&self, observation: Option<Arc<IndexedObservation>>) {
        *self.observation.write() = observation;
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.state
            .read()
            .slots
            .iter()
            .flatten()
            .all(|slot| slot.access.is_idle())
    }

    pub fn record_count(&self) -> usize {
        self.state.read().slots.iter().flatten().count()
    }

    fn ensure_planning(&self) -> Result<(), RepositoryError> {
        if self.serving.load(Ordering::Acquire) {
            return Err(RepositoryError::NotInPlanning {
                type_name: self.type_name,
            });
        }
        Ok(())
    }

    fn ensure_serving(&self) -> bool {
        if !self.serving.load(Ordering::Acquire) {
            self.conflict.report(self.type_name, "indexed_access_in_planning");
            return false;
        }
        true
    }

    fn resolve(&self, path: &[InternedString]) -> Result<PathResolution, RepositoryError> {
        let registry = self.registry.read();
        let description = self.description.read();
        registry
            .resolve_path(&description, path)
            .map_err(RepositoryError::Reflection)
    }

    pub fn insert_query(self: &Arc<Self>) -> Result<IndexedInsertQuery, RepositoryError> {
        self.ensure_planning()?;
        Ok(IndexedInsertQuery {
            storage: self.clone(),
        })
    }

    pub fn sequence_read_query(self: &Arc<Self>) -> Result<IndexedSequenceReadQuery, RepositoryError> {
        self.ensure_planning()?;
        Ok(IndexedSequenceReadQuery {
            storage: self.clone(),
        })
    }

    pub fn sequence_write_query(
        self: &Arc<Self>,
    ) -> Result<IndexedSequenceWriteQuery, RepositoryError> {
        self.ensure_planning()?;
        Ok(IndexedSequenceWriteQuery {
            storage: self.clone(),
        })
    }

    fn register_value_index(&self, path: &[InternedString]) -> Result<usize, RepositoryError> {
        let resolution = self.resolve(path)?;
        let mut state = self.state.write();
        if let Some(position) = state
            .indices
            .value
            .iter()
            .position(|index| index.path.offset == resolution.offset && index.path.size == resolution.size)
        {
            return Ok(position);
        }

        let mut index = ValueIndex {
            path: resolution,
            buckets: FxHashMap::default(),
        };
        for (slot_index, slot) in state.slots.iter().enumerate() {
            if let Some(slot) = slot {
                let id = RecordId {
                    slot: slot_index as u32,
                    generation: state.generations[slot_index],
                };
                if let Some(value) = unsafe { field_value_at(&index.path, slot.record.data()) } {
                    index.buckets.entry(value.hash_key()).or_default().push(id);
                }
            }
        }
        state.indices.value.push(index);
        Ok(state.indices.value.len() - 1)
    }

    pub fn value_read_query(
        self: &Arc<Self>,
        path: &[InternedString],
    ) -> Result<IndexedValueReadQuery, RepositoryError> {
        self.ensure_planning()?;
        let index = self.register_value_index(path)?;
        Ok(IndexedValueReadQuery {
            storage: self.clone(),
            index,
        })
    }

    pub fn value_write_query(
        self: &Arc<Self>,
        path: &[InternedString],
    ) -> Result<IndexedValueWriteQuery, RepositoryError> {
        self.ensure_planning()?;
        let index = self.register_value_index(path)?;
        Ok(IndexedValueWriteQuery {
            storage: self.clone(),
            index,
        })
    }

    fn register_signal_index(
        &self,
        path: &[InternedString],
        value: FieldValue,
    ) -> Result<usize, RepositoryError> {
        let resolution = self.resolve(path)?;
        let mut state = self.state.write();
        if let Some(position) = state.indices.signal.iter().position(|index| {
            index.path.offset == resolution.offset && index.value == value
        }) {
            return Ok(position);
        }

        let mut index = SignalIndex {
            path: resolution,
            value,
            ids: Vec::new(),
        };
        for (slot_index, slot) in state.slots.iter().enumerate() {
            if let Some(slot) = slot {
                if unsafe { field_value_at(&index.path, slot.record.data()) } == Some(value) {
                    index.ids.push(RecordId {
                        slot: slot_index as u32,
                        generation: state.generations[slot_index],
                    });
                }
            }
        }
        state.indices.signal.push(index);
        Ok(state.indices.signal.len() - 1)
    }

    pub fn signal_read_query(
        self: &Arc<Self>,
        path: &[InternedString],
        value: FieldValue,
    ) -> Result<IndexedSignalReadQuery, RepositoryError> {
        self.ensure_planning()?;
        let index = self.register_signal_index(path, value)?;
        Ok(IndexedSignalReadQuery {
            storage: self.clone(),
            index,
        })
    }

    pub fn signal_write_query(
        self: &Arc<Self>,
        path: &[InternedString],
        value: FieldValue,
    ) -> Result<IndexedSignalWriteQuery, RepositoryError> {
        self.ensure_planning()?;
        let index = self.register_signal_index(path, value)?;
        Ok(IndexedSignalWriteQuery {
            storage: self.clone(),
            index,
        })
    }

    fn register_interval_index(&self, path: &[InternedString]) -> Result<usize, RepositoryError> {
        let resolution = self.resolve(path)?;
        let mut state = self.state.write();
        if let Some(position) = state
            .indices
            .interval
            .iter()
            .position(|index| index.path.offset == resolution.offset)
        {
            return Ok(position);
        }

        let mut index = IntervalIndex {
            path: resolution,
            entries: Vec::new(),
        };
        for (slot_index, slot) in state.slots.iter().enumerate() {
            if let Some(slot) = slot {
                let id = RecordId {
                    slot: slot_index as u32,
                    generation: state.generations[slot_index],
                };
                if let Some(key) = unsafe { field_value_at(&index.path, slot.record.data()) }
                    .and_then(OrdKey::from_value)
                {
                    index.entries.push((key, id));
                }
            }
        }
        index.entries.sort_by(|a, b| (&a.0, a.1.slot).cmp(&(&b.0, b.1.slot)));
        state.indices.interval.push(index);
        Ok(state.indices.interval.len() - 1)
    }

    pub fn interval_read_query(
        self: &Arc<Self>,
        path: &[InternedString],
    ) -> Result<IndexedIntervalReadQuery, RepositoryError> {
        self.ensure_planning()?;
        let index = self.register_interval_index(path)?;
        Ok(IndexedIntervalReadQuery {
            storage: self.clone(),
            index,
        })
    }

    pub fn interval_write_query(
        self: &Arc<Self>,
        path: &[InternedString],
    ) -> Result<IndexedIntervalWriteQuery, RepositoryError> {
        self.ensure_planning()?;
        let index = self.register_interval_index(path)?;
        Ok(IndexedIntervalWriteQuery {
            storage: self.clone(),
            index,
        })
    }

    /// Collects currently live record ids in slot order.
    fn sequence_ids(&self) -> Vec<RecordId> {
        let state = self.state.read();
        state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| RecordId {
                slot: index as u32,
                generation: state.generations[index],
            })
            .collect()
    }

    fn value_ids(&self, index: usize, key: &FieldValue) -> Vec<RecordId> {
        let state = self.state.read();
        state.indices.value[index]
            .buckets
            .get(&key.hash_key())
            .map(|bucket| bucket.to_vec())
            .unwrap_or_default()
    }

    fn signal_ids(&self, index: usize) -> Vec<RecordId> {
        self.state.read().indices.signal[index].ids.clone()
    }

    fn interval_ids(
        &self,
        index: usize,
        lower: Bound<FieldValue>,
        upper: Bound<FieldValue>,
        descending: bool,
    ) -> Vec<RecordId> {
        let state = self.state.read();
        let entries = &state.indices.interval[index].entries;

        let lower_key = match &lower {
            Bound::Included(value) | Bound::Excluded(value) => OrdKey::from_value(*value),
            Bound::Unbounded => None,
        };
        let upper_key = match &upper {
            Bound::Included(value) | Bound::Excluded(value) => OrdKey::from_value(*value),
            Bound::Unbounded => None,
        };

        let mut ids: Vec<RecordId> = entries
            .iter()
            .filter(|(key, _)| {
                let above_lower = match (&lower, &lower_key) {
                    (Bound::Included(_), Some(bound)) => key >= bound,
                    (Bound::Excluded(_), Some(bound)) => key > bound,
                    _ => true,
                };
                let below_upper = match (&upper, &upper_key) {
                    (Bound::Included(_), Some(bound)) => key <= bound,
                    (Bound::Excluded(_), Some(bound)) => key < bound,
                    _ => true,
                };
                above_lower && below_upper
            })
            .map(|(_, id)| *id)
            .collect();

        if descending {
            ids.reverse();
        }
        ids
    }

    /// Opens a read access on one record; `None` when the record vanished or
    /// a writer holds it.
    fn open_read(self: &Arc<Self>, id: RecordId) -> Option<IndexedReadAccess> {
        let state = self.state.read();
        let slot = match state.slots.get(id.slot as usize) {
            Some(Some(slot)) if state.generations[id.slot as usize] == id.generation => slot,
            _ => return None,
        };
        if !slot.access.try_read() {
            self.conflict.report(self.type_name, "indexed_read");
            return None;
        }
        let pointer = NonNull::from(&**slot);
        drop(state);
        Some(IndexedReadAccess {
            storage: self.clone(),
            id,
            slot: pointer,
        })
    }

    fn open_write(self: &Arc<Self>, id: RecordId) -> Option<IndexedWriteAccess> {
        let observation = self.observation.read().clone();
        let state = self.state.read();
        let slot = match state.slots.get(id.slot as usize) {
            Some(Some(slot)) if state.generations[id.slot as usize] == id.generation => slot,
            _ => return None,
        };
        if !slot.access.try_write() {
            self.conflict.report(self.type_name, "indexed_write");
            return None;
        }
        let pointer = NonNull::from(&**slot);

        let record = slot.record.data();
        let mut snapshot = Vec::new();
        if let Some(observation) = &observation {
            unsafe { observation.plan.scenario.snapshot(record, &mut snapshot) };
        }

        let mut old_keys = OldKeys::default();
        for (position, index) in state.indices.value.iter().enumerate() {
            old_keys
                .value
                .push((position, unsafe { field_value_at(&index.path, record) }));
        }
        for (position, index) in state.indices.signal.iter().enumerate() {
            let member = unsafe { field_value_at(&index.path, record) } == Some(index.value);
            old_keys.signal.push((position, member));
        }
        for (position, index) in state.indices.interval.iter().enumerate() {
            old_keys.interval.push((
                position,
                unsafe { field_value_at(&index.path, record) }.and_then(OrdKey::from_value),
            ));
        }
        drop(state);

        Some(IndexedWriteAccess {
            storage: self.clone(),
            id,
            slot: pointer,
            snapshot,
            old_keys,
            observation,
            consumed: false,
        })
    }

    fn remove_slot_locked(state: &mut StorageState, id: RecordId) -> Option<Box<Slot>> {
        match state.slots.get(id.slot as usize) {
            Some(Some(_)) if state.generations[id.slot as usize] == id.generation => {}
            _ => return None,
        }
        let slot = state.slots[id.slot as usize].take().unwrap();
        state.generations[id.slot as usize] = state.generations[id.slot as usize].wrapping_add(1);
        state.free.push(id.slot);
        remove_from_indices(&mut state.indices, id, slot.record.data());
        Some(slot)
    }

    /// Removes every record whose `path` bytes equal `key`, acquiring the
    /// write token of each. Used by cascade deletion.
    fn remove_matching(
        self: &Arc<Self>,
        path: &PathResolution,
        key: &[u8],
    ) -> Vec<Box<Slot>> {
        let mut state = self.state.write();
        let mut removed = Vec::new();

        for slot_index in 0..state.slots.len() {
            let id = RecordId {
                slot: slot_index as u32,
                generation: state.generations[slot_index],
            };

            let matches = match &state.slots[slot_index] {
                Some(slot) => {
                    let bytes = unsafe {
                        std::slice::from_raw_parts(
                            slot.record.data().add(path.offset as usize),
                            path.size as usize,
                        )
                    };
                    if bytes != key {
                        false
                    } else if !slot.access.try_write() {
                        self.conflict.report(self.type_name, "cascade_delete");
                        false
                    } else {
                        true
                    }
                }
                None => false,
            };

            if matches {
                if let Some(slot) = Self::remove_slot_locked(&mut state, id) {
                    removed.push(slot);
                }
            }
        }

        removed
    }

    pub(crate) fn migrate(
        &self,
        new_registry: Arc<Registry>,
        new_description: Arc<StructDescription>,
    ) {
        let mut state = self.state.write();
        let old_description = self.description();

        for slot in state.slots.iter_mut().flatten() {
            let replacement = RecordBox::new(new_description.clone());
            unsafe {
                super::migration::migrate_record_contents(
                    &new_registry,
                    &old_description,
                    slot.record.data(),
                    &new_description,
                    replacement.data(),
                );
            }
            slot.record = replacement;
        }

        // Indices are re-resolved against the new layout; entries that no
        // longer resolve are dropped together with their queries' usefulness.
        let mut rebuilt = Indices::default();
        for index in &state.indices.value {
            rebuilt.value.push(ValueIndex {
                path: index.path.clone(),
                buckets: FxHashMap::default(),
            });
        }
        for index in &state.indices.signal {
            rebuilt.signal.push(SignalIndex {
                path: index.path.clone(),
                value: index.value,
                ids: Vec::new(),
            });
        }
        for index in &state.indices.interval {
            rebuilt.interval.push(IntervalIndex {
                path: index.path.clone(),
                entries: Vec::new(),
            });
        }
        state.indices = rebuilt;

        let slot_count = state.slots.len();
        for slot_index in 0..slot_count {
            if state.slots[slot_index].is_some() {
                let id = RecordId {
                    slot: slot_index as u32,
                    generation: state.generations[slot_index],
                };
                let record = state.slots[slot_index].as_ref().unwrap().record.data();
                add_to_indices(&mut state.indices, id, record);
            }
        }

        *self.description.write() = new_description;
        *self.registry.write() = new_registry;
    }
}

#[derive(Default)]
struct OldKeys {
    value: SmallVec<[(usize, Option<FieldValue>); 2]>,
    signal: SmallVec<[(usize, bool); 2]>,
    interval: SmallVec<[(usize, Option<OrdKey>); 2]>,
}

pub struct IndexedInsertQuery {
    storage: Arc<IndexedStorage>,
}

impl IndexedInsertQuery {
    pub fn execute(&self) -> Option<IndexedInsertionPackage> {
        if !self.storage.ensure_serving() {
            return None;
        }
        let description = self.storage.description();
        Some(IndexedInsertionPackage {
            storage: self.storage.clone(),
            record: Some(RecordBox::new(description)),
        })
    }
}

/// Scope-guarded insertion: `submit` commits the record and updates indices,
/// dropping without submit undoes the insertion and runs the reflected
/// shutdown.
pub struct IndexedInsertionPackage {
    storage: Arc<IndexedStorage>,
    record: Option<RecordBox>,
}

impl IndexedInsertionPackage {
    pub fn get<T: 'static>(&mut self) -> &mut T {
        unsafe { self.record.as_ref().unwrap().typed_mut() }
    }

    pub fn data(&mut self) -> *mut u8 {
        self.record.as_ref().unwrap().data()
    }

    pub fn description(&self) -> Arc<StructDescription> {
        self.record.as_ref().unwrap().description().clone()
    }

    pub fn submit(mut self) -> RecordId {
        let record = self.record.take().unwrap();
        let storage = self.storage.clone();
        let observation = storage.observation.read().clone();

        let mut state = storage.state.write();
        let slot_index = match state.free.pop() {
            Some(index) => index,
            None => {
                state.slots.push(None);
                state.generations.push(0);
                (state.slots.len() - 1) as u32
            }
        };

        let id = RecordId {
            slot: slot_index,
            generation: state.generations[slot_index as usize],
        };
        let slot = Box::new(Slot {
            record,
            access: AccessState::new(),
        });
        let record_pointer = slot.record.data();
        add_to_indices(&mut state.indices, id, record_pointer);

        // Hold a read token across trigger firing so the freshly inserted
        // record cannot be deleted while copy-outs read it.
        assert!(slot.access.try_read());
        let pointer = NonNull::from(&*slot);
        state.slots[slot_index as usize] = Some(slot);
        drop(state);

        if let Some(observation) = &observation {
            for trigger in &observation.plan.insert_triggers {
                unsafe { trigger.fire(record_pointer) };
            }
        }
        unsafe { pointer.as_ref().access.release_read() };

        id
    }
}

pub struct IndexedSequenceReadQuery {
    storage: Arc<IndexedStorage>,
}

impl IndexedSequenceReadQuery {
    pub fn execute(&self) -> IndexedReadCursor {
        let ids = if self.storage.ensure_serving() {
            self.storage.sequence_ids()
        } else {
            Vec::new()
        };
        IndexedReadCursor {
            storage: self.storage.clone(),
            ids,
            position: 0,
        }
    }
}

pub struct IndexedSequenceWriteQuery {
    storage: Arc<IndexedStorage>,
}

impl IndexedSequenceWriteQuery {
    pub fn execute(&self) -> IndexedWriteCursor {
        let ids = if self.storage.ensure_serving() {
            self.storage.sequence_ids()
        } else {
            Vec::new()
        };
        IndexedWriteCursor {
            storage: self.storage.clone(),
            ids,
            position: 0,
        }
    }
}

pub struct IndexedValueReadQuery {
    storage: Arc<IndexedStorage>,
    index: usize,
}

impl IndexedValueReadQuery {
    pub fn execute(&self, key: FieldValue) -> IndexedReadCursor {
        let ids = if self.storage.ensure_serving() {
            self.storage.value_ids(self.index, &key)
        } else {
            Vec::new()
        };
        IndexedReadCursor {
            storage: self.storage.clone(),
            ids,
            position: 0,
        }
    }
}

pub struct IndexedValueWriteQuery {
    storage: Arc<IndexedStorage>,
    index: usize,
}

impl IndexedValueWriteQuery {
    pub fn execute(&self, key: FieldValue) -> IndexedWriteCursor {
        let ids = if self.storage.ensure_serving() {
            self.storage.value_ids(self.index, &key)
        } else {
            Vec::new()
        };
        IndexedWriteCursor {
            storage: self.storage.clone(),
            ids,
            position: 0,
        }
    }
}

pub struct IndexedSignalReadQuery {
    storage: Arc<IndexedStorage>,
    index: usize,
}

impl IndexedSignalReadQuery {
    pub fn execute(&self) -> IndexedReadCursor {
        let ids = if self.storage.ensure_serving() {
            self.storage.signal_ids(self.index)
        } else {
            Vec::new()
        };
        IndexedReadCursor {
            storage: self.storage.clone(),
            ids,
            position: 0,
        }
    }
}

pub struct IndexedSignalWriteQuery {
    storage: Arc<IndexedStorage>,
    index: usize,
}

impl IndexedSignalWriteQuery {
    pub fn execute(&self) -> IndexedWriteCursor {
        let ids = if self.storage.ensure_serving() {
            self.storage.signal_ids(self.index)
        } else {
            Vec::new()
        };
        IndexedWriteCursor {
            storage: self.storage.clone(),
            ids,
            position: 0,
        }
    }
}

pub struct IndexedIntervalReadQuery {
    storage: Arc<IndexedStorage>,
    index: usize,
}

impl IndexedIntervalReadQuery {
    pub fn execute(
        &self,
        lower: Bound<FieldValue>,
        upper: Bound<FieldValue>,
        descending: bool,
    ) -> IndexedReadCursor {
        let ids = if self.storage.ensure_serving() {
            self.storage.interval_ids(self.index, lower, upper, descending)
        } else {
            Vec::new()
        };
        IndexedReadCursor {
            storage: self.storage.clone(),
            ids,
            position: 0,
        }
    }
}

pub struct IndexedIntervalWriteQuery {
    storage: Arc<IndexedStorage>,
    index: usize,
}

impl IndexedIntervalWriteQuery {
    pub fn execute(
        &self,
        lower: Bound<FieldValue>,
        upper: Bound<FieldValue>,
        descending: bool,
    ) -> IndexedWriteCursor {
        let ids = if self.storage.ensure_serving() {
            self.storage.interval_ids(self.index, lower, upper, descending)
        } else {
            Vec::new()
        };
        IndexedWriteCursor {
            storage: self.storage.clone(),
            ids,
            position: 0,
        }
    }
}

/// Iterates records captured at execute time. Inserts racing the cursor may
/// or may not appear; nothing appears twice.
pub struct IndexedReadCursor {
    storage: Arc<IndexedStorage>,
    ids: Vec<RecordId>,
    position: usize,
}

impl IndexedReadCursor {
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<IndexedReadAccess> {
        while self.position < self.ids.len() {
            let id = self.ids[self.position];
            self.position += 1;
            if let Some(access) = self.storage.open_read(id) {
                return Some(access);
            }
        }
        None
    }
}

pub struct IndexedWriteCursor {
    storage: Arc<IndexedStorage>,
    ids: Vec<RecordId>,
    position: usize,
}

impl IndexedWriteCursor {
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<IndexedWriteAccess> {
        while self.position < self.ids.len() {
            let id = self.ids[self.position];
            self.position += 1;
            if let Some(access) = self.storage.open_write(id) {
                return Some(access);
            }
        }
        None
    }
}

pub struct IndexedReadAccess {
    storage: Arc<IndexedStorage>,
    id: RecordId,
    slot: NonNull<Slot>,
}

impl IndexedReadAccess {
    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn get<T: 'static>(&self) -> &T {
        unsafe { self.slot.as_ref().record.typed() }
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { self.slot.as_ref().record.bytes() }
    }

    pub fn data(&self) -> *const u8 {
        unsafe { self.slot.as_ref().record.data() }
    }
}

impl Drop for IndexedReadAccess {
    fn drop(&mut self) {
        unsafe { self.slot.as_ref().access.release_read() };
    }
}

pub struct IndexedWriteAccess {
    storage: Arc<IndexedStorage>,
    id: RecordId,
    slot: NonNull<Slot>,
    snapshot: Vec<u8>,
    old_keys: OldKeys,
    observation: Option<Arc<IndexedObservation>>,
    consumed: bool,
}

impl IndexedWriteAccess {
    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn get_mut<T: 'static>(&mut self) -> &mut T {
        unsafe { self.slot.as_ref().record.typed_mut() }
    }

    pub fn get<T: 'static>(&self) -> &T {
        unsafe { self.slot.as_ref().record.typed() }
    }

    pub fn data(&mut self) -> *mut u8 {
        unsafe { self.slot.as_ref().record.data() }
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { self.slot.as_ref().record.bytes() }
    }

    /// Deletes the record, running cascade deletion rules breadth-first: the
    /// whole deletion closure is collected before any on-delete event fires,
    /// so event handlers never observe a half-deleted graph.
    pub fn delete(mut self) {
        self.consumed = true;
        let storage = self.storage.clone();

        let root = {
            let mut state = storage.state.write();
            IndexedStorage::remove_slot_locked(&mut state, self.id)
        };
        let root = match root {
            Some(slot) => slot,
            None => return,
        };

        let mut removed: Vec<(Arc<IndexedStorage>, Box<Slot>)> = vec![(storage, root)];
        let mut cursor = 0;
        while cursor < removed.len() {
            let (owner, slot) = {
                let (owner, slot) = &removed[cursor];
                (owner.clone(), slot.record.data())
            };

            if let Some(observation) = owner.observation.read().clone() {
                for rule in &observation.cascades {
                    if rule.parent_path.size != rule.child_path.size {
                        continue;
                    }
                    let key = unsafe {
                        std::slice::from_raw_parts(
                            slot.add(rule.parent_path.offset as usize),
                            rule.parent_path.size as usize,
                        )
                    };
                    let children = rule.child_storage.remove_matching(&rule.child_path, key);
                    removed.extend(
                        children
                            .into_iter()
                            .map(|child| (rule.child_storage.clone(), child)),
                    );
                }
            }
            cursor += 1;
        }

        // All removals are done; now fire on-delete events in closure order.
        for (owner, slot) in &removed {
            if let Some(observation) = owner.observation.read().clone() {
                for trigger in &observation.plan.delete_triggers {
                    unsafe { trigger.fire(slot.record.data()) };
                }
            }
        }
        // Dropping `removed` runs reflected shutdowns and releases tokens.
    }
}

impl Drop for IndexedWriteAccess {
    fn drop(&mut self) {
        if self.consumed {
            return;
        }

        let record = unsafe { self.slot.as_ref().record.data() };

        if let Some(observation) = &self.observation {
            unsafe {
                let changed = observation.plan.scenario.changed_chunks(record, &self.snapshot);
                if !changed.is_empty() {
                    for trigger in &observation.plan.change_triggers {
                        trigger.fire_if_changed(&changed, record, &self.snapshot);
                    }
                }
            }
        }

        // Re-index fields whose values changed during the scope.
        let mut state = self.storage.state.write();
        let id = self.id;
        for (position, old_value) in &self.old_keys.value {
            let index = &mut state.indices.value[*position];
            let new_value = unsafe { field_value_at(&index.path, record) };
            if *old_value != new_value {
                if let Some(old_value) = old_value {
                    if let Some(bucket) = index.buckets.get_mut(&old_value.hash_key()) {
                        bucket.retain(|existing| *existing != id);
                    }
                }
                if let Some(new_value) = new_value {
                    index
                        .buckets
                        .entry(new_value.hash_key())
                        .or_default()
                        .push(id);
                }
            }
        }
        for (position, was_member) in &self.old_keys.signal {
            let index = &mut state.indices.signal[*position];
            let is_member = unsafe { field_value_at(&index.path, record) } == Some(index.value);
            if *was_member != is_member {
                if is_member {
                    index.ids.push(id);
                } else {
                    index.ids.retain(|existing| *existing != id);
                }
            }
        }
        for (position, old_key) in &self.old_keys.interval {
            let index = &mut state.indices.interval[*position];
            let new_key =
                unsafe { field_value_at(&index.path, record) }.and_then(OrdKey::from_value);
            if *old_key != new_key {
                index.entries.retain(|(_, existing)| *existing != id);
                if let Some(new_key) = new_key {
                    let position = index.entries.partition_point(|(existing, existing_id)| {
                        (existing, existing_id.slot) < (&new_key, id.slot)
                    });
                    index.entries.insert(position, (new_key, id));
                }
            }
        }
        drop(state);

        unsafe { self.slot.as_ref().access.release_write() };
    }
}

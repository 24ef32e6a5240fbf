use super::event::EventStorage;
use crate::interner::InternedString;
use crate::reflection::{Registry, StructDescription};
use smallvec::SmallVec;
use std::sync::Arc;

pub type FieldPath = Vec<InternedString>;

/// Declarative `(source field path, target field path)` copy used to populate
/// automatic event fields from pre- and post-state.
#[derive(Clone, Debug)]
pub struct CopyOutSpec {
    pub source: FieldPath,
    pub target: FieldPath,
}

/// Meta: mutating any observed field of the carrier type emits an event.
///
/// `unchanged_copy_outs` read from the pre-change snapshot, `changed_copy_outs`
/// read from the record after the write scope closed.
#[derive(Clone, Debug)]
pub struct OnChangeEventMeta {
    pub event_type: InternedString,
    pub observed_fields: Vec<FieldPath>,
    pub unchanged_copy_outs: Vec<CopyOutSpec>,
    pub changed_copy_outs: Vec<CopyOutSpec>,
}

/// Meta: committing an insertion of the carrier type emits an event.
#[derive(Clone, Debug)]
pub struct OnInsertEventMeta {
    pub event_type: InternedString,
    pub copy_outs: Vec<CopyOutSpec>,
}

/// Meta: deleting a record of the carrier type emits an event.
#[derive(Clone, Debug)]
pub struct OnDeleteEventMeta {
    pub event_type: InternedString,
    pub copy_outs: Vec<CopyOutSpec>,
}

/// Meta: deleting a record of the carrier type deletes every record of
/// `child_type` whose `child_key` equals the parent's `parent_key`.
#[derive(Clone, Debug)]
pub struct CascadeDeletionMeta {
    pub parent_key: FieldPath,
    pub child_type: InternedString,
    pub child_key: FieldPath,
}

/// One contiguous byte range of the observation snapshot.
#[derive(Clone, Debug)]
pub(crate) struct ScenarioChunk {
    pub record_offset: u32,
    pub size: u32,
    pub snapshot_offset: u32,
}

/// Per-storage observation layout: the merged, ordered byte ranges that write
/// accesses snapshot on open and diff on close. Shared by all accesses; each
/// access owns only its snapshot buffer.
#[derive(Clone, Debug, Default)]
pub(crate) struct Scenario {
    pub chunks: Vec<ScenarioChunk>,
    pub snapshot_size: u32,
}

impl Scenario {
    pub fn build(mut ranges: Vec<(u32, u32)>) -> Scenario {
        ranges.retain(|(_, size)| *size > 0);
        ranges.sort_by_key(|(offset, _)| *offset);

        let mut chunks: Vec<ScenarioChunk> = Vec::new();
        for (offset, size) in ranges {
            if let Some(last) = chunks.last_mut() {
                let last_end = last.record_offset + last.size;
                if offset <= last_end {
                    let end = (offset + size).max(last_end);
                    last.size = end - last.record_offset;
                    continue;
                }
            }
            chunks.push(ScenarioChunk {
                record_offset: offset,
                size,
                snapshot_offset: 0,
            });
        }

        let mut snapshot_size = 0;
        for chunk in &mut chunks {
            chunk.snapshot_offset = snapshot_size;
            snapshot_size += chunk.size;
        }

        Scenario {
            chunks,
            snapshot_size,
        }
    }

    /// # Safety
    /// `record` must cover every chunk range.
    pub unsafe fn snapshot(&self, record: *const u8, buffer: &mut Vec<u8>) {
        buffer.clear();
        buffer.resize(self.snapshot_size as usize, 0);
        for chunk in &self.chunks {
            std::ptr::copy_nonoverlapping(
                record.add(chunk.record_offset as usize),
                buffer.as_mut_ptr().add(chunk.snapshot_offset as usize),
                chunk.size as usize,
            );
        }
    }

    /// Indices of chunks whose bytes differ between the snapshot and the
    /// current record contents.
    ///
    /// # Safety
    /// `record` must cover every chunk range and `buffer` must be a snapshot
    /// taken through this scenario.
    pub unsafe fn changed_chunks(&self, record: *const u8, buffer: &[u8]) -> SmallVec<[u32; 8]> {
        let mut changed = SmallVec::new();
        for (index, chunk) in self.chunks.iter().enumerate() {
            let current =
                std::slice::from_raw_parts(record.add(chunk.record_offset as usize), chunk.size as usize);
            let snapshot = &buffer[chunk.snapshot_offset as usize
                ..(chunk.snapshot_offset + chunk.size) as usize];
            if current != snapshot {
                changed.push(index as u32);
            }
        }
        changed
    }

    pub fn chunks_overlapping(&self, offset: u32, size: u32) -> SmallVec<[u32; 4]> {
        let end = offset + size;
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, chunk)| chunk.record_offset < end && offset < chunk.record_offset + chunk.size)
            .map(|(index, _)| index as u32)
            .collect()
    }

    /// Snapshot-relative offset of a record range, when the range is fully
    /// covered by one chunk.
    pub fn snapshot_offset_of(&self, offset: u32, size: u32) -> Option<u32> {
        self.chunks
            .iter()
            .find(|chunk| {
                offset >= chunk.record_offset && offset + size <= chunk.record_offset + chunk.size
            })
            .map(|chunk| chunk.snapshot_offset + (offset - chunk.record_offset))
    }
}

/// Resolved byte copy between two records.
#[derive(Clone, Debug)]
pub(crate) struct CopyOut {
    pub source_offset: u32,
    pub target_offset: u32,
    pub size: u32,
}

impl CopyOut {
    unsafe fn run(&self, source: *const u8, target: *mut u8) {
        std::ptr::copy_nonoverlapping(
            source.add(self.source_offset as usize),
            target.add(self.target_offset as usize),
            self.size as usize,
        );
    }
}

/// Trigger derived from [`OnChangeEventMeta`], fired on write-access close.
pub(crate) struct ChangeTrigger {
    pub event: Arc<EventStorage>,
    pub watched_chunks: SmallVec<[u32; 4]>,
    /// Sources are snapshot-relative: pre-change values.
    pub buffer_copy_outs: Vec<CopyOut>,
    /// Sources are record-relative: post-change values.
    pub record_copy_outs: Vec<CopyOut>,
}

impl ChangeTrigger {
    /// # Safety
    /// `record` must be the storage record and `buffer` its snapshot.
    pub unsafe fn fire_if_changed(&self, changed: &[u32], record: *const u8, buffer: &[u8]) {
        if !self
            .watched_chunks
            .iter()
            .any(|chunk| changed.contains(chunk))
        {
            return;
        }

        self.event.insert_with(|event, _| {
            for copy in &self.buffer_copy_outs {
                copy.run(buffer.as_ptr(), event);
            }
            for copy in &self.record_copy_outs {
                copy.run(record, event);
            }
        });
    }
}

/// Trigger derived from [`OnInsertEventMeta`] / [`OnDeleteEventMeta`]:
/// fired unconditionally with copy-outs from the record.
pub(crate) struct EventCopyTrigger {
    pub event: Arc<EventStorage>,
    pub copy_outs: Vec<CopyOut>,
}

impl EventCopyTrigger {
    /// # Safety
    /// `record` must be a valid record of the trigger's source type.
    pub unsafe fn fire(&self, record: *const u8) {
        self.event.insert_with(|event, _| {
            for copy in &self.copy_outs {
                copy.run(record, event);
            }
        });
    }
}

/// Observation artifacts of one storage, rebuilt on every planning-to-serving
/// transition.
#[derive(Default)]
pub(crate) struct ObservationPlan {
    pub scenario: Scenario,
    pub change_triggers: Vec<ChangeTrigger>,
    pub insert_triggers: Vec<EventCopyTrigger>,
    pub delete_triggers: Vec<EventCopyTrigger>,
}

impl ObservationPlan {
    pub fn is_empty(&self) -> bool {
        self.change_triggers.is_empty()
            && self.insert_triggers.is_empty()
            && self.delete_triggers.is_empty()
    }
}

fn resolve_copy_outs(
    registry: &Registry,
    source_description: &StructDescription,
    event_description: &StructDescription,
    specs: &[CopyOutSpec],
) -> Vec<CopyOut> {
    let mut resolved = Vec::with_capacity(specs.len());
    for spec in specs {
        let source = match registry.resolve_path(source_description, &spec.source) {
            Ok(resolution) => resolution,
            Err(error) => {
                tracing::error!(
                    source_type = source_description.name.as_str(),
                    %error,
                    "copy-out source path failed to resolve, skipping"
                );
                continue;
            }
        };
        let target = match registry.resolve_path(event_description, &spec.target) {
            Ok(resolution) => resolution,
            Err(error) => {
                tracing::error!(
                    event_type = event_description.name.as_str(),
                    %error,
                    "copy-out target path failed to resolve, skipping"
                );
                continue;
            }
        };
        if source.size != target.size {
            tracing::error!(
                source_type = source_description.name.as_str(),
                event_type = event_description.name.as_str(),
                "copy-out size mismatch, skipping"
            );
            continue;
        }

        resolved.push(CopyOut {
            source_offset: source.offset,
            target_offset: target.offset,
            size: source.size,
        });
    }
    resolved
}

/// Builds the observation plan for one storage type from registry meta.
/// `open_event` resolves an event storage, walking the repository tree.
pub(crate) fn build_observation(
    registry: &Registry,
    description: &StructDescription,
    open_event: &mut dyn FnMut(InternedString) -> Option<Arc<EventStorage>>,
) -> ObservationPlan {
    // The snapshot must cover observed fields (for change detection) plus
    // every pre-change copy-out source.
    let mut ranges: Vec<(u32, u32)> = Vec::new();
    let change_metas: Vec<OnChangeEventMeta> = registry
        .struct_meta::<OnChangeEventMeta>(description.name)
        .cloned()
        .collect();

    for meta in &change_metas {
        for path in meta
            .observed_fields
            .iter()
            .chain(meta.unchanged_copy_outs.iter().map(|spec| &spec.source))
        {
            match registry.resolve_path(description, path) {
                Ok(resolution) => ranges.push((resolution.offset, resolution.size)),
                Err(error) => tracing::error!(
                    type_name = description.name.as_str(),
                    %error,
                    "observed field path failed to resolve"
                ),
            }
        }
    }

    let scenario = Scenario::build(ranges);
    let mut plan = ObservationPlan {
        scenario,
        change_triggers: Vec::new(),
        insert_triggers: Vec::new(),
        delete_triggers: Vec::new(),
    };

    for meta in &change_metas {
        let event = match open_event(meta.event_type) {
            Some(event) => event,
            None => continue,
        };
        let event_description = event.description();

        let mut watched_chunks: SmallVec<[u32; 4]> = SmallVec::new();
        for path in &meta.observed_fields {
            if let Ok(resolution) = registry.resolve_path(description, path) {
                for chunk in plan
                    .scenario
                    .chunks_overlapping(resolution.offset, resolution.size)
                {
                    if !watched_chunks.contains(&chunk) {
                        watched_chunks.push(chunk);
                    }
                }
            }
        }

        // Pre-change copy-outs read out of the snapshot buffer, so their
        // source offsets are remapped into snapshot space.
        let buffer_copy_outs =
            resolve_copy_outs(registry, description, &event_description, &meta.unchanged_copy_outs)
                .into_iter()
                .filter_map(|copy| {
                    plan.scenario
                        .snapshot_offset_of(copy.source_offset, copy.size)
                        .map(|snapshot_offset| CopyOut {
                            source_offset: snapshot_offset,
                            ..copy
                        })
                })
                .collect();

        plan.change_triggers.push(ChangeTrigger {
            event,
            watched_chunks,
            buffer_copy_outs,
            record_copy_outs: resolve_copy_outs(
                registry,
                description,
                &event_description,
                &meta.changed_copy_outs,
            ),
        });
    }

    for meta in registry.struct_meta::<OnInsertEventMeta>(description.name) {
        if let Some(event) = open_event(meta.event_type) {
            let event_description = event.description();
            plan.insert_triggers.push(EventCopyTrigger {
                copy_outs: resolve_copy_outs(registry, description, &event_description, &meta.copy_outs),
                event,
            });
        }
    }

    for meta in registry.struct_meta::<OnDeleteEventMeta>(description.name) {
        if let Some(event) = open_event(meta.event_type) {
            let event_description = event.description();
            plan.delete_triggers.push(EventCopyTrigger {
                copy_outs: resolve_copy_outs(registry, description, &event_description, &meta.copy_outs),
                event,
            });
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_merges_overlapping_ranges() {
        let scenario = Scenario::build(vec![(8, 4), (0, 4), (10, 6), (32, 8)]);
        assert_eq!(scenario.chunks.len(), 3);
        assert_eq!(scenario.chunks[0].record_offset, 0);
        assert_eq!(scenario.chunks[0].size, 4);
        assert_eq!(scenario.chunks[1].record_offset, 8);
        assert_eq!(scenario.chunks[1].size, 8);
        assert_eq!(scenario.chunks[2].record_offset, 32);
        assert_eq!(scenario.snapshot_size, 4 + 8 + 8);
    }

    #[test]
    fn scenario_merges_adjacent_ranges() {
        let scenario = Scenario::build(vec![(0, 4), (4, 4)]);
        assert_eq!(scenario.chunks.len(), 1);
        assert_eq!(scenario.chunks[0].size, 8);
    }

    #[test]
    fn diff_reports_changed_chunk_only() {
        let scenario = Scenario::build(vec![(0, 4), (8, 4)]);
        let mut record = [0u8; 12];
        let mut buffer = Vec::new();
        unsafe {
            scenario.snapshot(record.as_ptr(), &mut buffer);
            record[9] = 7;
            let changed = scenario.changed_chunks(record.as_ptr(), &buffer);
            assert_eq!(changed.as_slice(), &[1]);
        }
    }

    #[test]
    fn snapshot_offset_mapping() {
        let scenario = Scenario::build(vec![(16, 8), (64, 4)]);
        assert_eq!(scenario.snapshot_offset_of(16, 8), Some(0));
        assert_eq!(scenario.snapshot_offset_of(20, 4), Some(4));
        assert_eq!(scenario.snapshot_offset_of(64, 4), Some(8));
        assert_eq!(scenario.snapshot_offset_of(60, 4), None);
    }
}

//! The runtime resource provider.
//!
//! A mutator group that keeps the repository populated with the resources
//! the rest of the universe asked for. Inserting a [`ResourceUsage`] record
//! pins a resource: the provider loads it into a typed container record and
//! announces it with a loaded event. Deleting the last usage unloads it at
//! the next frame boundary. File-system changes propagate as updated events
//! and trigger reloads that replace containers atomically from the readers'
//! perspective: the old container stays addressable until the new load
//! commits.
//!
//! For every resource type `T` the provider synthesizes repository types:
//! a typed entry (`resource_provider_typed_entry_<T>`) carrying the loaded
//! and loading container ids, a container (`resource_provider_container_<T>`)
//! whose payload starts at a field aligned for `T`, and registered / updated
//! / loaded event types.

pub mod types;

pub use types::{
    next_blob_id, next_usage_id, register_provider_types, ResourceGenericEntry,
    ResourceProviderConfiguration, ResourceProviderSingleton, ResourceThirdPartyBlob,
    ResourceThirdPartyBlobAvailable, ResourceThirdPartyBlobFailed, ResourceThirdPartyEntry,
    ResourceThirdPartyUpdatedEvent, ResourceUsage, ResourceUsageDeleted, ResourceUsageInserted,
};

use crate::project::{classify_file, read_native_type, ResourceFileKind};
use fxhash::FxHashMap;
use parking_lot::Mutex;
use plinth_core::interner::{intern, InternedString};
use plinth_core::reflection::dynarray::DynArray;
use plinth_core::reflection::{FieldValue, Registry, StructDescription};
use plinth_core::repository::{
    EventFetchQuery, EventInsertQuery, IndexedInsertQuery, IndexedReadAccess,
    IndexedValueReadQuery, IndexedValueWriteQuery, RepositoryError, SingletonWriteQuery,
};
use plinth_core::serial::{binary, rd};
use plinth_core::Repository;
use plinth_universe::mutator::{DeployContext, ExecuteContext, Mutator, MutatorRegistry};
use plinth_universe::DeployError;
use smallvec::SmallVec;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Group under which all provider mutators register.
pub const RESOURCE_PROVIDER_MUTATOR_GROUP: &str = "resource_provider";

/// World configuration slot name consumed by the provider.
pub const RESOURCE_PROVIDER_CONFIGURATION: &str = "resource_provider";

/// Checkpoint after which provider mutators execute.
pub const RESOURCE_PROVIDER_BEGIN_CHECKPOINT: &str = "resource_provider_begin";

/// Checkpoint hit after all provider mutators finished.
pub const RESOURCE_PROVIDER_END_CHECKPOINT: &str = "resource_provider_end";

pub fn typed_entry_type(resource: InternedString) -> InternedString {
    intern(&format!("resource_provider_typed_entry_{}", resource))
}

pub fn container_type(resource: InternedString) -> InternedString {
    intern(&format!("resource_provider_container_{}", resource))
}

pub fn registered_event_type(resource: InternedString) -> InternedString {
    intern(&format!("resource_provider_registered_event_{}", resource))
}

pub fn updated_event_type(resource: InternedString) -> InternedString {
    intern(&format!("resource_provider_updated_event_{}", resource))
}

pub fn loaded_event_type(resource: InternedString) -> InternedString {
    intern(&format!("resource_provider_loaded_event_{}", resource))
}

/// File-system change feed consumed by the provider. The watcher
/// implementation itself lives outside the core; tests drive a manual one.
pub trait ResourceWatcher: Send + Sync {
    fn drain(&self) -> Vec<WatcherEvent>;
}

#[derive(Clone, Debug)]
pub enum WatcherEvent {
    Added(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
}

/// Watcher double fed by hand; used by tests and tools.
#[derive(Default)]
pub struct ManualWatcher {
    queue: Mutex<Vec<WatcherEvent>>,
}

impl ManualWatcher {
    pub fn push(&self, event: WatcherEvent) {
        self.queue.lock().push(event);
    }
}

impl ResourceWatcher for ManualWatcher {
    fn drain(&self) -> Vec<WatcherEvent> {
        std::mem::take(&mut *self.queue.lock())
    }
}

/// Registers the provider mutator group. The watcher is optional; without
/// one, hot reload is disabled and the provider only scans at startup.
pub fn register_resource_provider(
    mutators: &mut MutatorRegistry,
    watcher: Option<Arc<dyn ResourceWatcher>>,
) {
    mutators.register_in_group(RESOURCE_PROVIDER_MUTATOR_GROUP, "resource_provider_serve", move || {
        Box::new(ResourceProviderMutator::new(watcher.clone()))
    });
}

struct TypeQueries {
    resource_type: InternedString,
    resource_description: Arc<StructDescription>,
    payload_offset: u32,
    typed_insert: IndexedInsertQuery,
    typed_by_name: IndexedValueWriteQuery,
    container_insert: IndexedInsertQuery,
    container_by_id: IndexedValueWriteQuery,
    registered_insert: EventInsertQuery,
    updated_insert: EventInsertQuery,
    loaded_insert: EventInsertQuery,
    typed_offsets: TypedEntryOffsets,
}

#[derive(Clone, Copy)]
struct TypedEntryOffsets {
    entry_id: u32,
    name: u32,
    loaded_container_id: u32,
    loading_pending: u32,
    loading_container_id: u32,
}

struct ProviderQueries {
    singleton_write: SingletonWriteQuery,
    generic_insert: IndexedInsertQuery,
    generic_by_name: IndexedValueWriteQuery,
    third_party_insert: IndexedInsertQuery,
    third_party_by_name: IndexedValueWriteQuery,
    usage_inserted_fetch: EventFetchQuery,
    usage_deleted_fetch: EventFetchQuery,
    blob_inserted_fetch: EventFetchQuery,
    blob_by_id: IndexedValueWriteQuery,
    third_party_updated_insert: EventInsertQuery,
    blob_available_insert: EventInsertQuery,
    blob_failed_insert: EventInsertQuery,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum LoadRequest {
    Resource {
        type_name: InternedString,
        name: InternedString,
        priority: u64,
    },
    Blob {
        blob_id: u64,
        name: InternedString,
        priority: u64,
    },
}

impl LoadRequest {
    fn priority(&self) -> u64 {
        match self {
            LoadRequest::Resource { priority, .. } | LoadRequest::Blob { priority, .. } => *priority,
        }
    }

    /// Deterministic tie-break within one priority level.
    fn tie_break(&self) -> (InternedString, InternedString) {
        match self {
            LoadRequest::Resource { type_name, name, .. } => (*type_name, *name),
            LoadRequest::Blob { name, .. } => (InternedString::default(), *name),
        }
    }
}

struct ResourceProviderMutator {
    watcher: Option<Arc<dyn ResourceWatcher>>,
    registry: Option<Arc<Registry>>,
    queries: Option<ProviderQueries>,
    per_type: FxHashMap<InternedString, TypeQueries>,
    serve_budget_ns: u64,
    resource_directory: PathBuf,
    scan_done: bool,
    next_entry_id: u64,
    next_container_id: u64,
    load_queue: Vec<LoadRequest>,
    /// `(resource type, name)` unloads scheduled for the next frame so that
    /// in-flight reads complete first.
    pending_unloads: Vec<(InternedString, InternedString)>,
    /// Containers replaced by a reload, destroyed at the next frame boundary.
    retired_containers: Vec<(InternedString, u64)>,
    /// Path bookkeeping for watcher events.
    native_by_path: FxHashMap<PathBuf, (InternedString, InternedString)>,
    third_party_by_path: FxHashMap<PathBuf, InternedString>,
    content_hashes: FxHashMap<PathBuf, u64>,
}

impl ResourceProviderMutator {
    fn new(watcher: Option<Arc<dyn ResourceWatcher>>) -> Self {
        ResourceProviderMutator {
            watcher,
            registry: None,
            queries: None,
            per_type: FxHashMap::default(),
            serve_budget_ns: u64::MAX,
            resource_directory: PathBuf::new(),
            scan_done: false,
            next_entry_id: 1,
            next_container_id: 1,
            load_queue: Vec::new(),
            pending_unloads: Vec::new(),
            retired_containers: Vec::new(),
            native_by_path: FxHashMap::default(),
            third_party_by_path: FxHashMap::default(),
            content_hashes: FxHashMap::default(),
        }
    }

    fn queries(&self) -> &ProviderQueries {
        self.queries.as_ref().expect("provider deployed")
    }

    fn enqueue_load(&mut self, type_name: InternedString, name: InternedString, priority: u64) {
        let already_queued = self.load_queue.iter().any(|request| {
            matches!(request, LoadRequest::Resource { type_name: queued_type, name: queued_name, .. }
                if *queued_type == type_name && *queued_name == name)
        });
        if already_queued {
            return;
        }
        self.load_queue.push(LoadRequest::Resource {
            type_name,
            name,
            priority,
        });
        if let Some(queries) = self.per_type.get(&type_name) {
            let mut cursor = queries.typed_by_name.execute(FieldValue::Str(name));
            if let Some(mut access) = cursor.next() {
                unsafe {
                    write_bool(access.data(), queries.typed_offsets.loading_pending, true);
                }
            }
        }
    }

    fn cancel_load(&mut self, type_name: InternedString, name: InternedString) {
        self.load_queue.retain(|request| {
            !matches!(request, LoadRequest::Resource { type_name: queued_type, name: queued_name, .. }
                if *queued_type == type_name && *queued_name == name)
        });
        if let Some(queries) = self.per_type.get(&type_name) {
            let mut cursor = queries.typed_by_name.execute(FieldValue::Str(name));
            if let Some(mut access) = cursor.next() {
                unsafe {
                    write_bool(access.data(), queries.typed_offsets.loading_pending, false);
                }
            }
        }
    }

    fn register_entry(&mut self, path: &Path) {
        let kind = classify_file(path);
        let name = intern(
            path.file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or_default(),
        );
        let content_hash = std::fs::read(path).map(|bytes| fxhash::hash64(&bytes)).unwrap_or(0);
        self.content_hashes.insert(path.to_path_buf(), content_hash);

        if kind == ResourceFileKind::ThirdParty {
            let entry_id = self.next_entry_id;
            self.next_entry_id += 1;
            let queries = self.queries.as_ref().expect("provider deployed");
            if let Some(mut package) = queries.third_party_insert.execute() {
                let entry: &mut ResourceThirdPartyEntry = package.get();
                entry.entry_id = entry_id;
                entry.name = name;
                entry.path = intern(path.to_string_lossy().as_ref());
                package.submit();
            }
            self.third_party_by_path.insert(path.to_path_buf(), name);
            return;
        }

        let type_name = match read_native_type(path, kind) {
            Some(type_name) => type_name,
            None => {
                tracing::warn!(path = %path.display(), "resource file has no readable type header");
                return;
            }
        };
        if !self.per_type.contains_key(&type_name) {
            tracing::warn!(
                path = %path.display(),
                type_name = type_name.as_str(),
                "resource type is not provider-registered, file ignored"
            );
            return;
        }

        let entry_id = self.next_entry_id;
        self.next_entry_id += 1;

        let queries = self.queries.as_ref().expect("provider deployed");
        if let Some(mut package) = queries.generic_insert.execute() {
            let entry: &mut ResourceGenericEntry = package.get();
            entry.entry_id = entry_id;
            entry.type_name = type_name;
            entry.name = name;
            entry.usage_counter = 0;
            entry.removal_mark = false;
            entry.path = intern(path.to_string_lossy().as_ref());
            package.submit();
        }

        let type_queries = &self.per_type[&type_name];
        if let Some(mut package) = type_queries.typed_insert.execute() {
            unsafe {
                let data = package.data();
                write_u64(data, type_queries.typed_offsets.entry_id, entry_id);
                write_interned(data, type_queries.typed_offsets.name, name);
            }
            package.submit();
        }

        if let Some(mut package) = type_queries.registered_insert.execute() {
            unsafe {
                let data = package.data();
                write_u64(data, types::EVENT_ENTRY_ID_OFFSET, entry_id);
                write_interned(data, types::EVENT_NAME_OFFSET, name);
            }
            package.submit();
        }

        self.native_by_path
            .insert(path.to_path_buf(), (type_name, name));
    }

    fn scan(&mut self) {
        let directory = self.resource_directory.clone();
        if !directory.exists() {
            tracing::error!(
                directory = %directory.display(),
                "resource directory does not exist, provider serves nothing"
            );
            return;
        }

        let mut files = Vec::new();
        for walked in walkdir::WalkDir::new(&directory) {
            match walked {
                Ok(walked) if walked.file_type().is_file() => files.push(walked.path().to_path_buf()),
                Ok(_) => {}
                Err(error) => {
                    tracing::error!(%error, "resource scan failed to enumerate, continuing");
                }
            }
        }
        files.sort();

        for file in files {
            self.register_entry(&file);
        }
        tracing::info!(
            directory = %directory.display(),
            native = self.native_by_path.len(),
            third_party = self.third_party_by_path.len(),
            "resource scan done"
        );
    }

    fn process_watcher(&mut self) {
        let events = match &self.watcher {
            Some(watcher) => watcher.drain(),
            None => return,
        };

        for event in events {
            match event {
                WatcherEvent::Added(path) => {
                    if !self.native_by_path.contains_key(&path)
                        && !self.third_party_by_path.contains_key(&path)
                    {
                        self.register_entry(&path);
                    } else {
                        self.handle_modified(&path);
                    }
                }
                WatcherEvent::Modified(path) => self.handle_modified(&path),
                WatcherEvent::Removed(path) => self.handle_removed(&path),
            }
        }
    }

    fn handle_modified(&mut self, path: &Path) {
        let new_hash = match std::fs::read(path) {
            Ok(bytes) => fxhash::hash64(&bytes),
            Err(_) => return,
        };
        if self.content_hashes.get(path) == Some(&new_hash) {
            return;
        }
        self.content_hashes.insert(path.to_path_buf(), new_hash);

        if let Some((type_name, name)) = self.native_by_path.get(path).copied() {
            let type_queries = &self.per_type[&type_name];
            if let Some(mut package) = type_queries.updated_insert.execute() {
                unsafe {
                    let data = package.data();
                    write_u64(data, types::EVENT_ENTRY_ID_OFFSET, 0);
                    write_interned(data, types::EVENT_NAME_OFFSET, name);
                }
                package.submit();
            }

            // Reload if anything holds the resource right now.
            let mut usage_counter = 0;
            {
                let queries = self.queries.as_ref().expect("provider deployed");
                let mut cursor = queries.generic_by_name.execute(FieldValue::Str(name));
                while let Some(access) = cursor.next() {
                    let entry: &ResourceGenericEntry = access.get();
                    if entry.type_name == type_name {
                        usage_counter = entry.usage_counter;
                        break;
                    }
                }
            }
            if usage_counter > 0 {
                self.enqueue_load(type_name, name, 0);
            }
        } else if let Some(name) = self.third_party_by_path.get(path).copied() {
            let queries = self.queries.as_ref().expect("provider deployed");
            if let Some(mut package) = queries.third_party_updated_insert.execute() {
                package.get::<ResourceThirdPartyUpdatedEvent>().name = name;
                package.submit();
            }
        }
    }

    fn handle_removed(&mut self, path: &Path) {
        if let Some((type_name, name)) = self.native_by_path.get(path).copied() {
            let queries = self.queries.as_ref().expect("provider deployed");
            let mut cursor = queries.generic_by_name.execute(FieldValue::Str(name));
            while let Some(mut access) = cursor.next() {
                if access.get::<ResourceGenericEntry>().type_name == type_name {
                    access.get_mut::<ResourceGenericEntry>().removal_mark = true;
                    break;
                }
            }
        }
    }

    fn process_usage_events(&mut self) {
        let mut increments: SmallVec<[(InternedString, InternedString, u64); 8]> = SmallVec::new();
        let mut decrements: SmallVec<[(InternedString, InternedString); 8]> = SmallVec::new();

        {
            let queries = self.queries();
            if let Some(mut access) = queries.usage_inserted_fetch.execute() {
                while let Some(event) = access.next() {
                    let inserted: &ResourceUsageInserted = event.get();
                    increments.push((inserted.type_name, inserted.name, inserted.priority));
                }
            }
            if let Some(mut access) = queries.usage_deleted_fetch.execute() {
                while let Some(event) = access.next() {
                    let deleted: &ResourceUsageDeleted = event.get();
                    decrements.push((deleted.type_name, deleted.name));
                }
            }
        }

        for (type_name, name, priority) in increments {
            let mut previous = None;
            {
                let queries = self.queries();
                let mut cursor = queries.generic_by_name.execute(FieldValue::Str(name));
                while let Some(mut access) = cursor.next() {
                    if access.get::<ResourceGenericEntry>().type_name == type_name {
                        let entry: &mut ResourceGenericEntry = access.get_mut();
                        previous = Some(entry.usage_counter);
                        entry.usage_counter += 1;
                        break;
                    }
                }
            }
            match previous {
                Some(0) => self.enqueue_load(type_name, name, priority),
                Some(_) => {}
                None => tracing::error!(
                    type_name = type_name.as_str(),
                    name = name.as_str(),
                    "usage references a resource no entry matches"
                ),
            }
        }

        for (type_name, name) in decrements {
            let mut now_zero = false;
            {
                let queries = self.queries();
                let mut cursor = queries.generic_by_name.execute(FieldValue::Str(name));
                while let Some(mut access) = cursor.next() {
                    if access.get::<ResourceGenericEntry>().type_name == type_name {
                        let entry: &mut ResourceGenericEntry = access.get_mut();
                        entry.usage_counter = entry.usage_counter.saturating_sub(1);
                        now_zero = entry.usage_counter == 0;
                        break;
                    }
                }
            }
            if now_zero {
                self.cancel_load(type_name, name);
                self.pending_unloads.push((type_name, name));
            }
        }
    }

    fn process_blob_events(&mut self) {
        let mut requests: SmallVec<[(u64, InternedString, u64); 4]> = SmallVec::new();
        {
            let queries = self.queries();
            if let Some(mut access) = queries.blob_inserted_fetch.execute() {
                while let Some(event) = access.next() {
                    let inserted: &types::ResourceBlobInserted = event.get();
                    requests.push((inserted.blob_id, inserted.name, inserted.priority));
                }
            }
        }
        for (blob_id, name, priority) in requests {
            self.load_queue.push(LoadRequest::Blob {
                blob_id,
                name,
                priority,
            });
        }
    }

    fn destroy_container(&mut self, resource_type: InternedString, container_id: u64) {
        if let Some(queries) = self.per_type.get(&resource_type) {
            let mut cursor = queries
                .container_by_id
                .execute(FieldValue::Unsigned(container_id));
            if let Some(access) = cursor.next() {
                access.delete();
            }
        }
    }

    fn process_frame_boundary(&mut self) {
        let retired = std::mem::take(&mut self.retired_containers);
        for (resource_type, container_id) in retired {
            self.destroy_container(resource_type, container_id);
        }

        let unloads = std::mem::take(&mut self.pending_unloads);
        for (type_name, name) in unloads {
            // Re-check: a usage may have reappeared since the unload was
            // scheduled.
            let mut still_unused = false;
            {
                let queries = self.queries();
                let mut cursor = queries.generic_by_name.execute(FieldValue::Str(name));
                while let Some(access) = cursor.next() {
                    if access.get::<ResourceGenericEntry>().type_name == type_name {
                        still_unused = access.get::<ResourceGenericEntry>().usage_counter == 0;
                        break;
                    }
                }
            }
            if !still_unused {
                continue;
            }

            let mut doomed_container = 0;
            if let Some(queries) = self.per_type.get(&type_name) {
                let mut cursor = queries.typed_by_name.execute(FieldValue::Str(name));
                if let Some(mut access) = cursor.next() {
                    unsafe {
                        let data = access.data();
                        doomed_container =
                            read_u64(data, queries.typed_offsets.loaded_container_id);
                        write_u64(data, queries.typed_offsets.loaded_container_id, 0);
                        write_u64(data, queries.typed_offsets.loading_container_id, 0);
                        write_bool(data, queries.typed_offsets.loading_pending, false);
                    }
                }
            }
            if doomed_container != 0 {
                self.destroy_container(type_name, doomed_container);
            }
        }
    }

    /// Serves queued loads in descending priority order until the frame
    /// budget runs out.
    fn serve(&mut self) {
        if self.load_queue.is_empty() {
            return;
        }

        self.load_queue.sort_by(|a, b| {
            b.priority()
                .cmp(&a.priority())
                .then_with(|| a.tie_break().cmp(&b.tie_break()))
        });

        let started = Instant::now();
        let mut position = 0;
        while position < self.load_queue.len() {
            if started.elapsed().as_nanos() as u64 > self.serve_budget_ns {
                break;
            }
            let request = self.load_queue[position].clone();
            position += 1;
            match request {
                LoadRequest::Resource { type_name, name, .. } => self.load_resource(type_name, name),
                LoadRequest::Blob { blob_id, name, .. } => self.load_blob(blob_id, name),
            }
        }
        self.load_queue.drain(0..position);
    }

    fn load_resource(&mut self, type_name: InternedString, name: InternedString) {
        let registry = self.registry.clone().expect("provider deployed");

        // Resolve the entry path and its removal state.
        let mut path = None;
        let mut removed = false;
        let mut entry_id = 0;
        {
            let queries = self.queries();
            let mut cursor = queries.generic_by_name.execute(FieldValue::Str(name));
            while let Some(access) = cursor.next() {
                let entry: &ResourceGenericEntry = access.get();
                if entry.type_name == type_name {
                    path = Some(PathBuf::from(entry.path.as_str()));
                    removed = entry.removal_mark;
                    entry_id = entry.entry_id;
                    break;
                }
            }
        }

        let clear_pending = |mutator: &Self| {
            if let Some(queries) = mutator.per_type.get(&type_name) {
                let mut cursor = queries.typed_by_name.execute(FieldValue::Str(name));
                if let Some(mut access) = cursor.next() {
                    unsafe {
                        write_bool(access.data(), queries.typed_offsets.loading_pending, false);
                    }
                }
            }
        };

        let path = match (path, removed) {
            (Some(path), false) if path.exists() => path,
            _ => {
                tracing::error!(
                    type_name = type_name.as_str(),
                    name = name.as_str(),
                    "resource cannot be loaded: entry missing or file removed"
                );
                clear_pending(self);
                return;
            }
        };

        let instance = match classify_file(&path) {
            ResourceFileKind::ReadableData => std::fs::read_to_string(&path)
                .map_err(|error| error.to_string())
                .and_then(|text| {
                    rd::read_rd(&text, &registry, Some(type_name)).map_err(|error| error.to_string())
                }),
            _ => std::fs::File::open(&path)
                .map_err(|error| error.to_string())
                .and_then(|file| {
                    binary::read_binary(file, &registry, Some(type_name))
                        .map_err(|error| error.to_string())
                }),
        };
        let instance = match instance {
            Ok(instance) => instance,
            Err(error) => {
                tracing::error!(
                    type_name = type_name.as_str(),
                    name = name.as_str(),
                    error,
                    "resource deserialization failed"
                );
                clear_pending(self);
                return;
            }
        };

        let container_id = self.next_container_id;
        self.next_container_id += 1;

        let type_queries = &self.per_type[&type_name];
        if let Some(mut package) = type_queries.container_insert.execute() {
            unsafe {
                let data = package.data();
                write_u64(data, 0, container_id);
                let payload = data.add(type_queries.payload_offset as usize);
                for field in &type_queries.resource_description.fields {
                    registry.copy_field(
                        &field.archetype,
                        field.size,
                        instance.data().add(field.offset as usize),
                        payload.add(field.offset as usize),
                    );
                }
            }
            package.submit();
        }

        // Commit: the new container id replaces the old one under the typed
        // entry's write access; readers see one or the other, never a mix.
        let mut replaced = 0;
        {
            let mut cursor = type_queries.typed_by_name.execute(FieldValue::Str(name));
            if let Some(mut access) = cursor.next() {
                unsafe {
                    let data = access.data();
                    replaced = read_u64(data, type_queries.typed_offsets.loaded_container_id);
                    write_u64(
                        data,
                        type_queries.typed_offsets.loaded_container_id,
                        container_id,
                    );
                    write_u64(data, type_queries.typed_offsets.loading_container_id, 0);
                    write_bool(data, type_queries.typed_offsets.loading_pending, false);
                }
            }
        }

        if let Some(mut package) = type_queries.loaded_insert.execute() {
            unsafe {
                let data = package.data();
                write_u64(data, types::EVENT_ENTRY_ID_OFFSET, entry_id);
                write_interned(data, types::EVENT_NAME_OFFSET, name);
            }
            package.submit();
        }

        if replaced != 0 {
            self.retired_containers.push((type_name, replaced));
        }

        tracing::debug!(
            type_name = type_name.as_str(),
            name = name.as_str(),
            container_id,
            "resource loaded"
        );
    }

    fn load_blob(&mut self, blob_id: u64, name: InternedString) {
        let mut path = None;
        {
            let queries = self.queries();
            let mut cursor = queries.third_party_by_name.execute(FieldValue::Str(name));
            if let Some(access) = cursor.next() {
                path = Some(PathBuf::from(
                    access.get::<ResourceThirdPartyEntry>().path.as_str(),
                ));
            }
        }

        let bytes = path.and_then(|path| std::fs::read(path).ok());
        let queries = self.queries();
        match bytes {
            Some(bytes) => {
                let mut cursor = queries.blob_by_id.execute(FieldValue::Unsigned(blob_id));
                if let Some(mut access) = cursor.next() {
                    let blob: &mut ResourceThirdPartyBlob = access.get_mut();
                    blob.data = DynArray::of::<u8>();
                    for byte in &bytes {
                        blob.data.push_copy(*byte);
                    }
                    blob.available = true;
                }
                if let Some(mut package) = queries.blob_available_insert.execute() {
                    package.get::<ResourceThirdPartyBlobAvailable>().blob_id = blob_id;
                    package.submit();
                }
            }
            None => {
                tracing::error!(
                    name = name.as_str(),
                    blob_id,
                    "third party blob failed to load"
                );
                if let Some(mut package) = queries.blob_failed_insert.execute() {
                    package.get::<ResourceThirdPartyBlobFailed>().blob_id = blob_id;
                    package.submit();
                }
            }
        }
    }
}

unsafe fn write_u64(data: *mut u8, offset: u32, value: u64) {
    data.add(offset as usize).cast::<u64>().write_unaligned(value);
}

unsafe fn read_u64(data: *const u8, offset: u32) -> u64 {
    data.add(offset as usize).cast::<u64>().read_unaligned()
}

unsafe fn write_bool(data: *mut u8, offset: u32, value: bool) {
    data.add(offset as usize).write(value as u8);
}

unsafe fn write_interned(data: *mut u8, offset: u32, value: InternedString) {
    data.add(offset as usize)
        .cast::<InternedString>()
        .write_unaligned(value);
}

impl Mutator for ResourceProviderMutator {
    fn deploy(&mut self, context: &mut DeployContext<'_>) -> Result<(), DeployError> {
        let repository = context.repository;
        let registry = repository.registry();

        let configuration = context
            .configuration::<ResourceProviderConfiguration>(intern(RESOURCE_PROVIDER_CONFIGURATION));
        match configuration {
            Some(configuration) => {
                self.serve_budget_ns = configuration.serve_budget_ns;
                self.resource_directory = PathBuf::from(configuration.resource_directory.as_str());
            }
            None => {
                tracing::warn!("resource provider deployed without configuration");
            }
        }
        context.run_after(RESOURCE_PROVIDER_BEGIN_CHECKPOINT);
        context.run_before(RESOURCE_PROVIDER_END_CHECKPOINT);

        let singleton = repository.open_singleton(intern("resource_provider_singleton"))?;
        let generic = repository.open_indexed(intern("resource_generic_entry"))?;
        let third_party = repository.open_indexed(intern("resource_third_party_entry"))?;
        // Opening the usage storage here guarantees its automatic events are
        // wired even before the first consumer deploys.
        let _usages = repository.open_indexed(intern("resource_usage"))?;
        let blobs = repository.open_indexed(intern("resource_third_party_blob"))?;

        let usage_inserted = repository.open_event(intern("resource_usage_inserted"))?;
        let usage_deleted = repository.open_event(intern("resource_usage_deleted"))?;
        let blob_inserted = repository.open_event(intern("resource_blob_inserted"))?;
        let third_party_updated =
            repository.open_event(intern("resource_third_party_updated_event"))?;
        let blob_available = repository.open_event(intern("resource_third_party_blob_available"))?;
        let blob_failed = repository.open_event(intern("resource_third_party_blob_failed"))?;

        let name_path = plinth_core::field_path(&["name"]);
        self.queries = Some(ProviderQueries {
            singleton_write: singleton.write_query()?,
            generic_insert: generic.insert_query()?,
            generic_by_name: generic.value_write_query(&name_path)?,
            third_party_insert: third_party.insert_query()?,
            third_party_by_name: third_party.value_write_query(&name_path)?,
            usage_inserted_fetch: usage_inserted.fetch_query()?,
            usage_deleted_fetch: usage_deleted.fetch_query()?,
            blob_inserted_fetch: blob_inserted.fetch_query()?,
            blob_by_id: blobs.value_write_query(&plinth_core::field_path(&["blob_id"]))?,
            third_party_updated_insert: third_party_updated.insert_query()?,
            blob_available_insert: blob_available.insert_query()?,
            blob_failed_insert: blob_failed.insert_query()?,
        });

        let resource_types: Vec<InternedString> = registry
            .structs_with_meta::<crate::meta::ResourceTypeMeta>()
            .map(|(type_name, _)| type_name)
            .collect();

        for resource_type in resource_types {
            let typed_type = typed_entry_type(resource_type);
            let container = container_type(resource_type);
            if registry.find_struct(typed_type).is_none() {
                // Type was registered after provider-type synthesis; skip.
                tracing::warn!(
                    type_name = resource_type.as_str(),
                    "resource type has no synthesized provider types"
                );
                continue;
            }

            let typed_storage = repository.open_indexed(typed_type)?;
            let container_storage = repository.open_indexed(container)?;
            let registered = repository.open_event(registered_event_type(resource_type))?;
            let updated = repository.open_event(updated_event_type(resource_type))?;
            let loaded = repository.open_event(loaded_event_type(resource_type))?;

            let typed_description = registry
                .find_struct(typed_type)
                .expect("checked above")
                .clone();
            let offset_of = |field: &str| -> u32 {
                typed_description
                    .field(intern(field))
                    .map(|field| field.offset)
                    .unwrap_or(0)
            };
            let typed_offsets = TypedEntryOffsets {
                entry_id: offset_of("entry_id"),
                name: offset_of("name"),
                loaded_container_id: offset_of("loaded_container_id"),
                loading_pending: offset_of("loading_pending"),
                loading_container_id: offset_of("loading_container_id"),
            };

            let container_description = registry.find_struct(container).expect("synthesized").clone();
            let payload_offset = container_description
                .field(intern("payload"))
                .map(|field| field.offset)
                .unwrap_or(8);

            let resource_description = registry
                .find_struct(resource_type)
                .ok_or(RepositoryError::UnknownType {
                    name: resource_type,
                })?
                .clone();

            self.per_type.insert(
                resource_type,
                TypeQueries {
                    resource_type,
                    resource_description,
                    payload_offset,
                    typed_insert: typed_storage.insert_query()?,
                    typed_by_name: typed_storage.value_write_query(&name_path)?,
                    container_insert: container_storage.insert_query()?,
                    container_by_id: container_storage
                        .value_write_query(&plinth_core::field_path(&["container_id"]))?,
                    registered_insert: registered.insert_query()?,
                    updated_insert: updated.insert_query()?,
                    loaded_insert: loaded.insert_query()?,
                    typed_offsets,
                },
            );
        }

        self.registry = Some(registry);
        Ok(())
    }

    fn execute(&mut self, _context: &ExecuteContext<'_, '_>) {
        // Frame id first: event-triggered merge logic keys off it.
        {
            let queries = self.queries();
            if let Some(mut access) = queries.singleton_write.execute() {
                let singleton: &mut ResourceProviderSingleton = access.get();
                singleton.logic_deduplication_frame_id += 1;
                singleton.scan_done = self.scan_done;
            }
        }

        self.process_frame_boundary();

        if !self.scan_done {
            self.scan();
            self.scan_done = true;
            let queries = self.queries();
            if let Some(mut access) = queries.singleton_write.execute() {
                access.get::<ResourceProviderSingleton>().scan_done = true;
            }
        }

        self.process_watcher();
        self.process_usage_events();
        self.process_blob_events();
        self.serve();
    }

    fn undeploy(&mut self) {
        self.queries = None;
        self.per_type.clear();
        self.load_queue.clear();
        self.pending_unloads.clear();
        self.retired_containers.clear();
    }
}

/// Scope-guarded typed view of a loaded resource. Holds the container read
/// access, so the container stays pinned until the guard drops.
pub struct ResourceRef<T: 'static> {
    access: IndexedReadAccess,
    payload_offset: u32,
    _marker: std::marker::PhantomData<T>,
}

impl<T: 'static> std::ops::Deref for ResourceRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.access.data().add(self.payload_offset as usize).cast::<T>() }
    }
}

/// Per-resource-type query bundle for consumers: resolves typed entries by
/// name and opens read accesses on loaded containers.
pub struct ResourceQueries<T: plinth_core::reflection::Reflected> {
    typed_by_name: IndexedValueReadQuery,
    container_by_id: IndexedValueReadQuery,
    typed_offsets: TypedEntryOffsets,
    payload_offset: u32,
    _marker: std::marker::PhantomData<T>,
}

impl<T: plinth_core::reflection::Reflected> ResourceQueries<T> {
    pub fn open(repository: &Repository) -> Result<Self, RepositoryError> {
        let registry = repository.registry();
        let resource_type = T::type_name();
        let typed_type = typed_entry_type(resource_type);
        let container = container_type(resource_type);

        let typed_storage = repository.open_indexed(typed_type)?;
        let container_storage = repository.open_indexed(container)?;

        let typed_description = registry
            .find_struct(typed_type)
            .ok_or(RepositoryError::UnknownType { name: typed_type })?
            .clone();
        let offset_of = |field: &str| -> u32 {
            typed_description
                .field(intern(field))
                .map(|field| field.offset)
                .unwrap_or(0)
        };

        let container_description = registry
            .find_struct(container)
            .ok_or(RepositoryError::UnknownType { name: container })?
            .clone();

        Ok(ResourceQueries {
            typed_by_name: typed_storage
                .value_read_query(&plinth_core::field_path(&["name"]))?,
            container_by_id: container_storage
                .value_read_query(&plinth_core::field_path(&["container_id"]))?,
            typed_offsets: TypedEntryOffsets {
                entry_id: offset_of("entry_id"),
                name: offset_of("name"),
                loaded_container_id: offset_of("loaded_container_id"),
                loading_pending: offset_of("loading_pending"),
                loading_container_id: offset_of("loading_container_id"),
            },
            payload_offset: container_description
                .field(intern("payload"))
                .map(|field| field.offset)
                .unwrap_or(8),
            _marker: std::marker::PhantomData,
        })
    }

    fn retrieve(&self, name: InternedString, require_fresh: bool) -> Option<ResourceRef<T>> {
        let mut cursor = self.typed_by_name.execute(FieldValue::Str(name));
        let entry_access = cursor.next()?;
        let (loaded, pending) = unsafe {
            let data = entry_access.data();
            (
                read_u64(data, self.typed_offsets.loaded_container_id),
                data.add(self.typed_offsets.loading_pending as usize).read() != 0,
            )
        };
        drop(entry_access);

        if loaded == 0 || (require_fresh && pending) {
            return None;
        }

        let mut cursor = self.container_by_id.execute(FieldValue::Unsigned(loaded));
        let access = cursor.next()?;
        Some(ResourceRef {
            access,
            payload_offset: self.payload_offset,
            _marker: std::marker::PhantomData,
        })
    }

    /// Opens a read access on the loaded container, if the resource is
    /// currently loaded.
    pub fn retrieve_if_loaded(&self, name: InternedString) -> Option<ResourceRef<T>> {
        self.retrieve(name, false)
    }

    /// Like [`Self::retrieve_if_loaded`], but only while no newer load is
    /// pending.
    pub fn retrieve_if_loaded_and_fresh(&self, name: InternedString) -> Option<ResourceRef<T>> {
        self.retrieve(name, true)
    }
}

use parking_lot::Mutex;
use plinth_core::interner::{intern, InternedString};
use plinth_core::reflection::patch::Patch;
use plinth_core::reflection::{
    FieldArchetype, Reflected, Registry, RegistryBuilder, StructDescription,
    StructDescriptionBuilder,
};
use plinth_core::repository::{
    EventFetchQuery, IndexedInsertQuery, IndexedValueReadQuery, IndexedValueWriteQuery,
    SingletonReadQuery,
};
use plinth_resource::provider::{
    loaded_event_type, updated_event_type, ManualWatcher, ResourceWatcher, WatcherEvent,
};
use plinth_resource::{
    next_blob_id, next_usage_id, register_provider_types, register_resource_provider,
    ResourceProviderConfiguration, ResourceProviderSingleton, ResourceQueries, ResourceTypeMeta,
    ResourceUsage, RESOURCE_PROVIDER_END_CHECKPOINT,
};
use plinth_resource::provider::types::{
    ResourceThirdPartyBlob, ResourceThirdPartyBlobAvailable, ResourceThirdPartyBlobFailed,
};
use plinth_universe::mutator::{DeployContext, ExecuteContext, Mutator, MutatorRegistry};
use plinth_universe::{
    DeployError, PipelineDefinition, SchedulerRegistry, Universe, WorldConfigurationDefinition,
    WorldDefinition,
};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Default)]
#[repr(C)]
struct Note {
    body: InternedString,
}

impl Reflected for Note {
    fn type_name() -> InternedString {
        intern("note")
    }

    fn describe() -> StructDescription {
        StructDescriptionBuilder::for_type::<Note>("note")
            .field("body", std::mem::offset_of!(Note, body), FieldArchetype::InternedString)
            .build()
    }
}

fn registry() -> Arc<Registry> {
    let mut builder = RegistryBuilder::new();
    builder.add_type::<Note>();
    builder.add_struct_meta(intern("note"), ResourceTypeMeta { root: true });
    register_provider_types(&mut builder);
    builder.build()
}

#[derive(Clone)]
enum Command {
    InsertUsage { name: &'static str, priority: u64 },
    DeleteUsage { name: &'static str },
    ReadNote { name: &'static str },
    InsertBlob { name: &'static str },
}

#[derive(Default)]
struct Observations {
    frames: VecDeque<Vec<Command>>,
    loaded: Vec<String>,
    updated: Vec<String>,
    reads: Vec<(String, Option<String>)>,
    blob_bytes: Vec<Vec<u8>>,
    blobs_failed: u64,
}

struct Driver {
    shared: Arc<Mutex<Observations>>,
    usage_insert: Option<IndexedInsertQuery>,
    usage_by_name: Option<IndexedValueWriteQuery>,
    blob_insert: Option<IndexedInsertQuery>,
    blob_by_id: Option<IndexedValueReadQuery>,
    singleton_read: Option<SingletonReadQuery>,
    loaded_fetch: Option<EventFetchQuery>,
    updated_fetch: Option<EventFetchQuery>,
    blob_available_fetch: Option<EventFetchQuery>,
    blob_failed_fetch: Option<EventFetchQuery>,
    notes: Option<ResourceQueries<Note>>,
}

impl Driver {
    fn new(shared: Arc<Mutex<Observations>>) -> Self {
        Driver {
            shared,
            usage_insert: None,
            usage_by_name: None,
            blob_insert: None,
            blob_by_id: None,
            singleton_read: None,
            loaded_fetch: None,
            updated_fetch: None,
            blob_available_fetch: None,
            blob_failed_fetch: None,
            notes: None,
        }
    }
}

impl Mutator for Driver {
    fn deploy(&mut self, context: &mut DeployContext<'_>) -> Result<(), DeployError> {
        context.run_after(RESOURCE_PROVIDER_END_CHECKPOINT);

        let repository = context.repository;
        let usages = repository.open_indexed(intern("resource_usage"))?;
        let blobs = repository.open_indexed(intern("resource_third_party_blob"))?;
        let singleton = repository.open_singleton(intern("resource_provider_singleton"))?;
        let loaded = repository.open_event(loaded_event_type(intern("note")))?;
        let updated = repository.open_event(updated_event_type(intern("note")))?;
        let blob_available =
            repository.open_event(intern("resource_third_party_blob_available"))?;
        let blob_failed = repository.open_event(intern("resource_third_party_blob_failed"))?;

        self.usage_insert = Some(usages.insert_query()?);
        self.usage_by_name = Some(usages.value_write_query(&plinth_core::field_path(&["name"]))?);
        self.blob_insert = Some(blobs.insert_query()?);
        self.blob_by_id =
            Some(blobs.value_read_query(&plinth_core::field_path(&["blob_id"]))?);
        self.singleton_read = Some(singleton.read_query()?);
        self.loaded_fetch = Some(loaded.fetch_query()?);
        self.updated_fetch = Some(updated.fetch_query()?);
        self.blob_available_fetch = Some(blob_available.fetch_query()?);
        self.blob_failed_fetch = Some(blob_failed.fetch_query()?);
        self.notes = Some(ResourceQueries::<Note>::open(repository)?);
        Ok(())
    }

    fn execute(&mut self, _context: &ExecuteContext<'_, '_>) {
        let mut shared = self.shared.lock();

        if let Some(mut access) = self.loaded_fetch.as_ref().unwrap().execute() {
            while let Some(event) = access.next() {
                // Synthesized event layout: entry id, then name.
                let name = unsafe {
                    event
                        .bytes()
                        .as_ptr()
                        .add(8)
                        .cast::<InternedString>()
                        .read_unaligned()
                };
                shared.loaded.push(name.as_str().to_string());
            }
        }
        if let Some(mut access) = self.updated_fetch.as_ref().unwrap().execute() {
            while let Some(event) = access.next() {
                let name = unsafe {
                    event
                        .bytes()
                        .as_ptr()
                        .add(8)
                        .cast::<InternedString>()
                        .read_unaligned()
                };
                shared.updated.push(name.as_str().to_string());
            }
        }
        if let Some(mut access) = self.blob_available_fetch.as_ref().unwrap().execute() {
            while let Some(event) = access.next() {
                let blob_id = event.get::<ResourceThirdPartyBlobAvailable>().blob_id;
                let mut cursor = self
                    .blob_by_id
                    .as_ref()
                    .unwrap()
                    .execute(plinth_core::FieldValue::Unsigned(blob_id));
                if let Some(blob_access) = cursor.next() {
                    let blob: &ResourceThirdPartyBlob = blob_access.get();
                    assert!(blob.available);
                    shared.blob_bytes.push(blob.data.as_slice::<u8>().to_vec());
                }
            }
        }
        if let Some(mut access) = self.blob_failed_fetch.as_ref().unwrap().execute() {
            while let Some(event) = access.next() {
                let _ = event.get::<ResourceThirdPartyBlobFailed>();
                shared.blobs_failed += 1;
            }
        }

        let commands = shared.frames.pop_front().unwrap_or_default();
        for command in commands {
            match command {
                Command::InsertUsage { name, priority } => {
                    let usage_id = {
                        let access = self.singleton_read.as_ref().unwrap().execute().unwrap();
                        next_usage_id(access.get::<ResourceProviderSingleton>())
                    };
                    let mut package = self.usage_insert.as_ref().unwrap().execute().unwrap();
                    {
                        let usage: &mut ResourceUsage = package.get();
                        usage.usage_id = usage_id;
                        usage.type_name = intern("note");
                        usage.name = intern(name);
                        usage.priority = priority;
                    }
                    package.submit();
                }
                Command::DeleteUsage { name } => {
                    let mut cursor = self
                        .usage_by_name
                        .as_ref()
                        .unwrap()
                        .execute(plinth_core::FieldValue::Str(intern(name)));
                    if let Some(access) = cursor.next() {
                        access.delete();
                    }
                }
                Command::ReadNote { name } => {
                    let body = self
                        .notes
                        .as_ref()
                        .unwrap()
                        .retrieve_if_loaded(intern(name))
                        .map(|note| note.body.as_str().to_string());
                    shared.reads.push((name.to_string(), body));
                }
                Command::InsertBlob { name } => {
                    let blob_id = {
                        let access = self.singleton_read.as_ref().unwrap().execute().unwrap();
                        next_blob_id(access.get::<ResourceProviderSingleton>())
                    };
                    let mut package = self.blob_insert.as_ref().unwrap().execute().unwrap();
                    {
                        let blob: &mut ResourceThirdPartyBlob = package.get();
                        blob.blob_id = blob_id;
                        blob.name = intern(name);
                        blob.priority = 1;
                    }
                    package.submit();
                }
            }
        }
    }
}

struct ProviderFixture {
    _directory: tempfile::TempDir,
    resources: PathBuf,
    universe: Universe,
    shared: Arc<Mutex<Observations>>,
    watcher: Arc<ManualWatcher>,
}

fn deploy_fixture(frames: Vec<Vec<Command>>) -> ProviderFixture {
    let _ = env_logger::builder().is_test(true).try_init();

    let directory = tempfile::tempdir().unwrap();
    let resources = directory.path().join("resources");
    std::fs::create_dir_all(&resources).unwrap();
    std::fs::write(
        resources.join("hello.rd"),
        "//! type = note\nbody = \"first words\"\n",
    )
    .unwrap();
    std::fs::write(resources.join("font.dat"), b"glyph tables").unwrap();

    let registry = registry();
    let watcher = Arc::new(ManualWatcher::default());
    let shared = Arc::new(Mutex::new(Observations {
        frames: frames.into(),
        ..Observations::default()
    }));

    let mut mutators = MutatorRegistry::new();
    register_resource_provider(
        &mut mutators,
        Some(watcher.clone() as Arc<dyn ResourceWatcher>),
    );
    {
        let shared = shared.clone();
        mutators.register("driver", move || Box::new(Driver::new(shared.clone())));
    }

    let mut configuration_patch = Patch::new(intern("resource_provider_configuration"));
    configuration_patch
        .set_field(
            &registry,
            &plinth_core::field_path(&["resource_directory"]),
            intern(resources.to_string_lossy().as_ref()),
        )
        .unwrap();

    let definition = WorldDefinition {
        world_name: intern("root"),
        scheduler_name: intern("single_pipeline"),
        configuration: vec![WorldConfigurationDefinition {
            name: intern("resource_provider"),
            patch: configuration_patch,
        }],
        pipelines: vec![PipelineDefinition {
            name: intern("update"),
            mutators: vec![intern("driver")],
            mutator_groups: vec![intern("resource_provider")],
        }],
        children: vec![],
    };

    let universe = Universe::deploy_root(
        &definition,
        registry,
        &mutators,
        &SchedulerRegistry::new(),
    )
    .unwrap();

    ProviderFixture {
        _directory: directory,
        resources,
        universe,
        shared,
        watcher,
    }
}

#[test]
fn usage_driven_load_and_unload() {
    let mut fixture = deploy_fixture(vec![
        vec![Command::InsertUsage {
            name: "hello",
            priority: 5,
        }],
        vec![],
        vec![
            Command::ReadNote { name: "hello" },
            Command::DeleteUsage { name: "hello" },
        ],
        vec![],
        vec![Command::ReadNote { name: "hello" }],
    ]);

    for _ in 0..5 {
        fixture.universe.update();
    }

    let shared = fixture.shared.lock();
    assert_eq!(shared.loaded, vec!["hello"]);
    assert_eq!(
        shared.reads,
        vec![
            ("hello".to_string(), Some("first words".to_string())),
            // Deleting the last usage unloads within two frames.
            ("hello".to_string(), None),
        ]
    );
}

#[test]
fn hot_reload_replaces_container_atomically() {
    let mut fixture = deploy_fixture(vec![
        vec![Command::InsertUsage {
            name: "hello",
            priority: 1,
        }],
        vec![],
        vec![Command::ReadNote { name: "hello" }],
        vec![],
        vec![Command::ReadNote { name: "hello" }],
        vec![],
    ]);

    for _ in 0..3 {
        fixture.universe.update();
    }

    // Edit between frames; the watcher tick lands in the next frame.
    std::fs::write(
        fixture.resources.join("hello.rd"),
        "//! type = note\nbody = \"rewritten\"\n",
    )
    .unwrap();
    fixture
        .watcher
        .push(WatcherEvent::Modified(fixture.resources.join("hello.rd")));

    for _ in 0..3 {
        fixture.universe.update();
    }

    let shared = fixture.shared.lock();
    assert_eq!(shared.updated, vec!["hello"]);
    assert_eq!(shared.loaded, vec!["hello", "hello"]);
    assert_eq!(
        shared.reads,
        vec![
            ("hello".to_string(), Some("first words".to_string())),
            ("hello".to_string(), Some("rewritten".to_string())),
        ]
    );
}

#[test]
fn third_party_blob_lifecycle() {
    let mut fixture = deploy_fixture(vec![
        vec![Command::InsertBlob { name: "font" }],
        vec![],
        vec![],
    ]);

    for _ in 0..3 {
        fixture.universe.update();
    }

    let shared = fixture.shared.lock();
    assert_eq!(shared.blobs_failed, 0);
    assert_eq!(shared.blob_bytes, vec![b"glyph tables".to_vec()]);
}

#[test]
fn missing_resource_never_produces_loaded_event() {
    let mut fixture = deploy_fixture(vec![
        vec![Command::InsertUsage {
            name: "ghost",
            priority: 9,
        }],
        vec![],
        vec![Command::ReadNote { name: "ghost" }],
    ]);

    for _ in 0..3 {
        fixture.universe.update();
    }

    let shared = fixture.shared.lock();
    assert!(shared.loaded.is_empty());
    assert_eq!(shared.reads, vec![("ghost".to_string(), None)]);
}

use plinth_core::interner::{intern, InternedString};
use plinth_core::reflection::dynarray::DynArray;
use plinth_core::reflection::{
    FieldArchetype, Reflected, Registry, RegistryBuilder, StructDescription,
    StructDescriptionBuilder,
};
use plinth_core::serial::binary;
use plinth_resource::{
    build, BuildOutcome, BuildRuleMeta, BuildRuleResult, BuildSetup, ByproductTypeMeta, Project,
    ResourceReferenceMeta, ResourceTypeMeta, Target,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Default)]
#[repr(C)]
struct SumParsedSource {
    source_number: u64,
}

impl Reflected for SumParsedSource {
    fn type_name() -> InternedString {
        intern("sum_parsed_source")
    }

    fn describe() -> StructDescription {
        StructDescriptionBuilder::for_type::<SumParsedSource>("sum_parsed_source")
            .field(
                "source_number",
                std::mem::offset_of!(SumParsedSource, source_number),
                FieldArchetype::U64,
            )
            .build()
    }
}

#[derive(Default)]
#[repr(C)]
struct SumResourceRaw {
    sources: DynArray,
}

impl Reflected for SumResourceRaw {
    fn type_name() -> InternedString {
        intern("sum_resource_raw")
    }

    fn describe() -> StructDescription {
        StructDescriptionBuilder::for_type::<SumResourceRaw>("sum_resource_raw")
            .field(
                "sources",
                std::mem::offset_of!(SumResourceRaw, sources),
                FieldArchetype::Array {
                    element: Box::new(FieldArchetype::InternedString),
                    element_size: std::mem::size_of::<InternedString>() as u32,
                    element_align: std::mem::align_of::<InternedString>() as u32,
                },
            )
            .build()
    }
}

#[derive(Default)]
#[repr(C)]
struct SumResource {
    sum: u64,
}

impl Reflected for SumResource {
    fn type_name() -> InternedString {
        intern("sum_resource")
    }

    fn describe() -> StructDescription {
        StructDescriptionBuilder::for_type::<SumResource>("sum_resource")
            .field("sum", std::mem::offset_of!(SumResource, sum), FieldArchetype::U64)
            .build()
    }
}

#[derive(Default)]
#[repr(C)]
struct RootResource {
    needed_sums: DynArray,
}

impl Reflected for RootResource {
    fn type_name() -> InternedString {
        intern("root_resource")
    }

    fn describe() -> StructDescription {
        StructDescriptionBuilder::for_type::<RootResource>("root_resource")
            .field(
                "needed_sums",
                std::mem::offset_of!(RootResource, needed_sums),
                FieldArchetype::Array {
                    element: Box::new(FieldArchetype::InternedString),
                    element_size: std::mem::size_of::<InternedString>() as u32,
                    element_align: std::mem::align_of::<InternedString>() as u32,
                },
            )
            .build()
    }
}

fn sum_registry() -> Arc<Registry> {
    let mut builder = RegistryBuilder::new();
    builder.add_type::<SumParsedSource>();
    builder.add_type::<SumResourceRaw>();
    builder.add_type::<SumResource>();
    builder.add_type::<RootResource>();

    builder.add_struct_meta(intern("sum_parsed_source"), ResourceTypeMeta { root: false });
    builder.add_struct_meta(intern("sum_resource_raw"), ResourceTypeMeta { root: false });
    builder.add_struct_meta(intern("sum_resource"), ResourceTypeMeta { root: false });
    builder.add_struct_meta(intern("root_resource"), ResourceTypeMeta { root: true });

    builder.add_field_meta(
        intern("sum_resource_raw"),
        intern("sources"),
        ResourceReferenceMeta {
            type_name: intern("sum_parsed_source"),
        },
    );
    builder.add_field_meta(
        intern("root_resource"),
        intern("needed_sums"),
        ResourceReferenceMeta {
            type_name: intern("sum_resource"),
        },
    );

    builder.add_struct_meta(
        intern("sum_parsed_source"),
        BuildRuleMeta {
            primary_input_type: None,
            platform_configuration_type: None,
            state_type: None,
            secondary_types: vec![],
            functor: Arc::new(|state| {
                let bytes = match state.third_party_input() {
                    Some(bytes) => bytes.to_vec(),
                    None => return BuildRuleResult::Failed,
                };
                let text = match std::str::from_utf8(&bytes) {
                    Ok(text) => text.trim(),
                    Err(_) => return BuildRuleResult::Failed,
                };
                match text.parse::<u64>() {
                    Ok(number) => {
                        state.output::<SumParsedSource>().source_number = number;
                        BuildRuleResult::Finished
                    }
                    Err(_) => BuildRuleResult::Failed,
                }
            }),
        },
    );

    builder.add_struct_meta(
        intern("sum_resource"),
        BuildRuleMeta {
            primary_input_type: Some(intern("sum_resource_raw")),
            platform_configuration_type: None,
            state_type: None,
            secondary_types: vec![intern("sum_parsed_source")],
            functor: Arc::new(|state| {
                let total: u64 = state
                    .secondaries()
                    .iter()
                    .map(|secondary| secondary.get::<SumParsedSource>().source_number)
                    .sum();
                state.output::<SumResource>().sum = total;
                BuildRuleResult::Finished
            }),
        },
    );

    builder.build()
}

struct Fixture {
    _directory: tempfile::TempDir,
    content: PathBuf,
    project: Project,
}

fn sum_fixture() -> Fixture {
    let directory = tempfile::tempdir().unwrap();
    let content = directory.path().join("content");
    std::fs::create_dir_all(&content).unwrap();
    let platform = directory.path().join("platform_configuration");
    std::fs::create_dir_all(&platform).unwrap();

    std::fs::write(content.join("1.txt"), "1").unwrap();
    std::fs::write(content.join("2.txt"), "2").unwrap();
    std::fs::write(content.join("3.txt"), "3").unwrap();
    std::fs::write(
        content.join("test_1_2.rd"),
        "//! type = sum_resource_raw\n+sources = \"1\"\n+sources = \"2\"\n",
    )
    .unwrap();
    std::fs::write(
        content.join("test_2_3.rd"),
        "//! type = sum_resource_raw\n+sources = \"2\"\n+sources = \"3\"\n",
    )
    .unwrap();
    std::fs::write(
        content.join("root.rd"),
        "//! type = root_resource\n+needed_sums = \"test_1_2\"\n+needed_sums = \"test_2_3\"\n",
    )
    .unwrap();

    let project = Project {
        workspace_directory: directory.path().join("workspace"),
        platform_configuration_directory: platform,
        targets: vec![Target {
            name: intern("game"),
            roots: vec![content.clone()],
            visible_targets: vec![],
        }],
    };

    Fixture {
        _directory: directory,
        content,
        project,
    }
}

fn read_sum(registry: &Registry, path: &Path) -> u64 {
    let file = std::fs::File::open(path).unwrap();
    let record = binary::read_binary(file, registry, Some(intern("sum_resource"))).unwrap();
    let resource: &SumResource = unsafe { record.typed() };
    resource.sum
}

fn mtime(path: &Path) -> std::time::SystemTime {
    std::fs::metadata(path).unwrap().modified().unwrap()
}

#[test]
fn sum_of_sums_build_and_incremental_rebuild() {
    let _ = env_logger::builder().is_test(true).try_init();

    let fixture = sum_fixture();
    let registry = sum_registry();
    let setup = BuildSetup {
        project: fixture.project.clone(),
        registry: registry.clone(),
        targets_to_build: vec![intern("game")],
        pack: false,
    };

    let report = build(&setup);
    assert_eq!(report.outcome, BuildOutcome::Success, "{:?}", report.diagnostics);

    let deploy = fixture.project.deploy_directory(intern("game"));
    let first = deploy.join("sum_resource").join("test_1_2.bin");
    let second = deploy.join("sum_resource").join("test_2_3.bin");
    assert_eq!(read_sum(&registry, &first), 3);
    assert_eq!(read_sum(&registry, &second), 5);
    assert!(deploy.join("root_resource").join("root.bin").exists());

    // Build idempotence: an immediate rebuild with no filesystem changes
    // performs no deploy writes.
    let first_mtime = mtime(&first);
    let second_mtime = mtime(&second);
    let report = build(&setup);
    assert_eq!(report.outcome, BuildOutcome::Success);
    assert!(report.built.is_empty(), "rebuild rebuilt {:?}", report.built);
    assert_eq!(mtime(&first), first_mtime);
    assert_eq!(mtime(&second), second_mtime);

    // Editing one source invalidates only the sums that depend on it.
    std::fs::write(fixture.content.join("1.txt"), "10").unwrap();
    let report = build(&setup);
    assert_eq!(report.outcome, BuildOutcome::Success, "{:?}", report.diagnostics);
    assert_eq!(read_sum(&registry, &first), 12);
    assert_eq!(read_sum(&registry, &second), 5);
    assert_ne!(mtime(&first), first_mtime);
    assert_eq!(mtime(&second), second_mtime);
}

#[test]
fn failed_source_fails_dependents_only() {
    let _ = env_logger::builder().is_test(true).try_init();

    let fixture = sum_fixture();
    std::fs::write(fixture.content.join("1.txt"), "not a number").unwrap();

    let setup = BuildSetup {
        project: fixture.project.clone(),
        registry: sum_registry(),
        targets_to_build: vec![intern("game")],
        pack: false,
    };

    let report = build(&setup);
    assert_eq!(report.outcome, BuildOutcome::PartialFailure);
    assert!(report
        .failed
        .contains(&(intern("sum_parsed_source"), intern("1"))));
    assert!(report.failed.contains(&(intern("sum_resource"), intern("test_1_2"))));

    // The untouched chain still builds.
    let deploy = fixture.project.deploy_directory(intern("game"));
    assert!(deploy.join("sum_resource").join("test_2_3.bin").exists());
    assert!(!deploy.join("sum_resource").join("test_1_2.bin").exists());
}

#[test]
fn pack_writes_indexed_container() {
    let _ = env_logger::builder().is_test(true).try_init();

    let fixture = sum_fixture();
    let setup = BuildSetup {
        project: fixture.project.clone(),
        registry: sum_registry(),
        targets_to_build: vec![intern("game")],
        pack: true,
    };

    let report = build(&setup);
    assert_eq!(report.outcome, BuildOutcome::Success, "{:?}", report.diagnostics);

    let pack = fixture
        .project
        .workspace_directory
        .join("deploy")
        .join("game.pack");
    let bytes = std::fs::read(&pack).unwrap();
    assert_eq!(&bytes[0..4], b"PLPK");
    let count = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    assert_eq!(count, 3);
}

// Byproduct sharing: two materials with identical shadow passes share one
// shadow pipeline byproduct, while differing visible passes get distinct
// byproducts.

#[derive(Clone, Default)]
#[repr(C)]
struct PipelineInstance {
    pass: InternedString,
    options: u64,
}

impl Reflected for PipelineInstance {
    fn type_name() -> InternedString {
        intern("pipeline_instance")
    }

    fn describe() -> StructDescription {
        StructDescriptionBuilder::for_type::<PipelineInstance>("pipeline_instance")
            .field(
                "pass",
                std::mem::offset_of!(PipelineInstance, pass),
                FieldArchetype::InternedString,
            )
            .field(
                "options",
                std::mem::offset_of!(PipelineInstance, options),
                FieldArchetype::U64,
            )
            .build()
    }
}

#[derive(Default)]
#[repr(C)]
struct MaterialRaw {
    visible_options: u64,
    shadow_options: u64,
}

impl Reflected for MaterialRaw {
    fn type_name() -> InternedString {
        intern("material_raw")
    }

    fn describe() -> StructDescription {
        StructDescriptionBuilder::for_type::<MaterialRaw>("material_raw")
            .field(
                "visible_options",
                std::mem::offset_of!(MaterialRaw, visible_options),
                FieldArchetype::U64,
            )
            .field(
                "shadow_options",
                std::mem::offset_of!(MaterialRaw, shadow_options),
                FieldArchetype::U64,
            )
            .build()
    }
}

#[derive(Default)]
#[repr(C)]
struct Material {
    visible_pipeline: InternedString,
    shadow_pipeline: InternedString,
}

impl Reflected for Material {
    fn type_name() -> InternedString {
        intern("material")
    }

    fn describe() -> StructDescription {
        StructDescriptionBuilder::for_type::<Material>("material")
            .field(
                "visible_pipeline",
                std::mem::offset_of!(Material, visible_pipeline),
                FieldArchetype::InternedString,
            )
            .field(
                "shadow_pipeline",
                std::mem::offset_of!(Material, shadow_pipeline),
                FieldArchetype::InternedString,
            )
            .build()
    }
}

fn material_registry() -> Arc<Registry> {
    let mut builder = RegistryBuilder::new();
    builder.add_type::<PipelineInstance>();
    builder.add_type::<MaterialRaw>();
    builder.add_type::<Material>();

    builder.add_struct_meta(intern("material_raw"), ResourceTypeMeta { root: false });
    builder.add_struct_meta(intern("material"), ResourceTypeMeta { root: true });
    builder.add_struct_meta(intern("pipeline_instance"), ByproductTypeMeta::default());

    builder.add_struct_meta(
        intern("material"),
        BuildRuleMeta {
            primary_input_type: Some(intern("material_raw")),
            platform_configuration_type: None,
            state_type: None,
            secondary_types: vec![],
            functor: Arc::new(|state| {
                let (visible_options, shadow_options) = {
                    let raw = state.input::<MaterialRaw>();
                    (raw.visible_options, raw.shadow_options)
                };
                let visible = state.register_byproduct(&PipelineInstance {
                    pass: intern("visible_world"),
                    options: visible_options,
                });
                let shadow = state.register_byproduct(&PipelineInstance {
                    pass: intern("shadow"),
                    options: shadow_options,
                });
                let output = state.output::<Material>();
                output.visible_pipeline = visible;
                output.shadow_pipeline = shadow;
                BuildRuleResult::Finished
            }),
        },
    );

    builder.build()
}

#[test]
fn byproducts_deduplicate_by_content() {
    let _ = env_logger::builder().is_test(true).try_init();

    let directory = tempfile::tempdir().unwrap();
    let content = directory.path().join("content");
    std::fs::create_dir_all(&content).unwrap();
    std::fs::create_dir_all(directory.path().join("platform_configuration")).unwrap();

    // Identical shadow options, different visible options.
    std::fs::write(
        content.join("m1.rd"),
        "//! type = material_raw\nvisible_options = 10\nshadow_options = 77\n",
    )
    .unwrap();
    std::fs::write(
        content.join("m2.rd"),
        "//! type = material_raw\nvisible_options = 20\nshadow_options = 77\n",
    )
    .unwrap();

    let project = Project {
        workspace_directory: directory.path().join("workspace"),
        platform_configuration_directory: directory.path().join("platform_configuration"),
        targets: vec![Target {
            name: intern("game"),
            roots: vec![content],
            visible_targets: vec![],
        }],
    };

    let registry = material_registry();
    let setup = BuildSetup {
        project: project.clone(),
        registry: registry.clone(),
        targets_to_build: vec![intern("game")],
        pack: false,
    };

    let report = build(&setup);
    assert_eq!(report.outcome, BuildOutcome::Success, "{:?}", report.diagnostics);

    let deploy = project.deploy_directory(intern("game"));
    let read_material = |name: &str| -> (InternedString, InternedString) {
        let path = deploy.join("material").join(format!("{}.bin", name));
        let file = std::fs::File::open(path).unwrap();
        let record = binary::read_binary(file, &registry, Some(intern("material"))).unwrap();
        let material: &Material = unsafe { record.typed() };
        (material.visible_pipeline, material.shadow_pipeline)
    };

    let (visible_one, shadow_one) = read_material("m1");
    let (visible_two, shadow_two) = read_material("m2");

    assert_eq!(shadow_one, shadow_two, "identical shadow passes share a byproduct");
    assert_ne!(visible_one, visible_two, "differing visible passes do not");

    // Byproducts land in the cache, not the deploy directory.
    let cache = project.cache_directory(intern("game")).join("pipeline_instance");
    assert!(cache.join(format!("{}.bin", shadow_one)).exists());
    assert!(!deploy.join("pipeline_instance").exists());
}

// In-progress rules: the unit is re-entered with its state preserved.

#[derive(Default)]
#[repr(C)]
struct ChunkedState {
    steps: u64,
}

impl Reflected for ChunkedState {
    fn type_name() -> InternedString {
        intern("chunked_state")
    }

    fn describe() -> StructDescription {
        StructDescriptionBuilder::for_type::<ChunkedState>("chunked_state")
            .field("steps", std::mem::offset_of!(ChunkedState, steps), FieldArchetype::U64)
            .build()
    }
}

#[derive(Default)]
#[repr(C)]
struct ChunkedResource {
    steps_taken: u64,
}

impl Reflected for ChunkedResource {
    fn type_name() -> InternedString {
        intern("chunked_resource")
    }

    fn describe() -> StructDescription {
        StructDescriptionBuilder::for_type::<ChunkedResource>("chunked_resource")
            .field(
                "steps_taken",
                std::mem::offset_of!(ChunkedResource, steps_taken),
                FieldArchetype::U64,
            )
            .build()
    }
}

#[derive(Default)]
#[repr(C)]
struct ChunkedRoot {
    wanted: DynArray,
}

impl Reflected for ChunkedRoot {
    fn type_name() -> InternedString {
        intern("chunked_root")
    }

    fn describe() -> StructDescription {
        StructDescriptionBuilder::for_type::<ChunkedRoot>("chunked_root")
            .field(
                "wanted",
                std::mem::offset_of!(ChunkedRoot, wanted),
                FieldArchetype::Array {
                    element: Box::new(FieldArchetype::InternedString),
                    element_size: std::mem::size_of::<InternedString>() as u32,
                    element_align: std::mem::align_of::<InternedString>() as u32,
                },
            )
            .build()
    }
}

#[test]
fn in_progress_rules_preserve_state_across_reentry() {
    let _ = env_logger::builder().is_test(true).try_init();

    let directory = tempfile::tempdir().unwrap();
    let content = directory.path().join("content");
    std::fs::create_dir_all(&content).unwrap();
    std::fs::create_dir_all(directory.path().join("platform_configuration")).unwrap();

    std::fs::write(content.join("payload.dat"), "raw").unwrap();
    std::fs::write(
        content.join("root.rd"),
        "//! type = chunked_root\n+wanted = \"payload\"\n",
    )
    .unwrap();

    let mut builder = RegistryBuilder::new();
    builder.add_type::<ChunkedState>();
    builder.add_type::<ChunkedResource>();
    builder.add_type::<ChunkedRoot>();
    builder.add_struct_meta(intern("chunked_resource"), ResourceTypeMeta { root: false });
    builder.add_struct_meta(intern("chunked_root"), ResourceTypeMeta { root: true });
    builder.add_field_meta(
        intern("chunked_root"),
        intern("wanted"),
        ResourceReferenceMeta {
            type_name: intern("chunked_resource"),
        },
    );
    builder.add_struct_meta(
        intern("chunked_resource"),
        BuildRuleMeta {
            primary_input_type: None,
            platform_configuration_type: None,
            state_type: Some(intern("chunked_state")),
            secondary_types: vec![],
            functor: Arc::new(|state| {
                state.state::<ChunkedState>().steps += 1;
                if state.state::<ChunkedState>().steps < 3 {
                    return BuildRuleResult::InProgress;
                }
                let steps = state.state::<ChunkedState>().steps;
                state.output::<ChunkedResource>().steps_taken = steps;
                BuildRuleResult::Finished
            }),
        },
    );
    let registry = builder.build();

    let project = Project {
        workspace_directory: directory.path().join("workspace"),
        platform_configuration_directory: directory.path().join("platform_configuration"),
        targets: vec![Target {
            name: intern("game"),
            roots: vec![content],
            visible_targets: vec![],
        }],
    };

    let report = build(&BuildSetup {
        project: project.clone(),
        registry: registry.clone(),
        targets_to_build: vec![intern("game")],
        pack: false,
    });
    assert_eq!(report.outcome, BuildOutcome::Success, "{:?}", report.diagnostics);

    let path = project
        .deploy_directory(intern("game"))
        .join("chunked_resource")
        .join("payload.bin");
    let file = std::fs::File::open(path).unwrap();
    let record = binary::read_binary(file, &registry, Some(intern("chunked_resource"))).unwrap();
    let resource: &ChunkedResource = unsafe { record.typed() };
    assert_eq!(resource.steps_taken, 3);
}

//! The offline resource build graph.
//!
//! Scanning walks every target's resource roots and records one entry per
//! discovered file. Planning walks the reference closure of every
//! root-marked entry and schedules build rules over it. Execution runs the
//! scheduled units in dependency waves, independent units in parallel,
//! with a content-hash build cache, byproduct deduplication and atomic
//! output writes. Deployment writes valid outputs under
//! `workspace/deploy/<target>/<type>/<name>.bin`, optionally packed into a
//! single indexed container.

pub mod cache;

use crate::meta::{BuildRuleMeta, BuildRuleResult, ByproductTypeMeta, ResourceReferenceMeta, ResourceTypeMeta};
use crate::project::{
    classify_file, load_platform_configuration, read_native_type, Project, ResourceFileKind,
};
use byteorder::{LittleEndian, WriteBytesExt};
use cache::{CacheEntry, CacheIndex, SecondaryFingerprint};
use fxhash::{FxHashMap, FxHashSet};
use parking_lot::Mutex;
use plinth_core::interner::{intern, InternedString};
use plinth_core::reflection::dynarray::DynArray;
use plinth_core::reflection::{FieldArchetype, Registry, StructDescription};
use plinth_core::repository::record::RecordBox;
use plinth_core::serial::{binary, rd};
use rayon::prelude::*;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildOutcome {
    Success,
    PartialFailure,
    Fatal,
}

#[derive(Debug)]
pub struct BuildReport {
    pub outcome: BuildOutcome,
    pub built: Vec<(InternedString, InternedString)>,
    pub failed: Vec<(InternedString, InternedString)>,
    pub skipped: usize,
    pub diagnostics: Vec<String>,
}

pub struct BuildSetup {
    pub project: Project,
    pub registry: Arc<Registry>,
    /// Empty list builds every target of the project.
    pub targets_to_build: Vec<InternedString>,
    pub pack: bool,
}

/// One discovered resource file.
#[derive(Clone, Debug)]
struct Entry {
    target: InternedString,
    type_name: InternedString,
    name: InternedString,
    path: PathBuf,
    kind: ResourceFileKind,
    mtime_ns: u64,
    content_hash: u64,
}

type UnitKey = (InternedString, InternedString);

#[derive(Clone)]
enum UnitInput {
    Native(usize),
    ThirdParty(usize),
    Byproduct(Arc<RecordBox>),
}

struct UnitPlan {
    output_type: InternedString,
    name: InternedString,
    rule: BuildRuleMeta,
    input: UnitInput,
    secondary_refs: Vec<UnitKey>,
    dependencies: Vec<UnitKey>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum UnitStatus {
    Pending,
    Done,
    Skipped,
    Failed,
}

struct UnitRuntime {
    plan: UnitPlan,
    status: UnitStatus,
    state: Option<RecordBox>,
    rebuilt: bool,
}

/// Secondary input handed to a build functor.
pub struct SecondaryInput {
    pub type_name: InternedString,
    pub name: InternedString,
    instance: Arc<RecordBox>,
}

impl SecondaryInput {
    pub fn get<T: 'static>(&self) -> &T {
        unsafe { self.instance.typed() }
    }

    pub fn data(&self) -> *const u8 {
        self.instance.data()
    }

    pub fn description(&self) -> &Arc<StructDescription> {
        self.instance.description()
    }
}

/// Per-invocation scratch passed to a build functor.
pub struct CompileState<'a> {
    pub target: InternedString,
    pub name: InternedString,
    primary_input: Option<Arc<RecordBox>>,
    third_party_input: Option<Arc<Vec<u8>>>,
    primary_output: &'a RecordBox,
    secondaries: Vec<SecondaryInput>,
    platform_configuration: Option<Arc<RecordBox>>,
    state: Option<&'a RecordBox>,
    byproducts: &'a ByproductTable,
}

impl<'a> CompileState<'a> {
    /// Typed primary input; panics when the rule declared none.
    pub fn input<T: 'static>(&self) -> &T {
        unsafe {
            self.primary_input
                .as_ref()
                .expect("rule declared no primary input type")
                .typed()
        }
    }

    /// Raw bytes of the third-party input file.
    pub fn third_party_input(&self) -> Option<&[u8]> {
        self.third_party_input.as_ref().map(|bytes| bytes.as_slice())
    }

    pub fn output<T: 'static>(&mut self) -> &mut T {
        unsafe { self.primary_output.typed_mut() }
    }

    pub fn output_data(&mut self) -> *mut u8 {
        self.primary_output.data()
    }

    pub fn secondaries(&self) -> &[SecondaryInput] {
        &self.secondaries
    }

    pub fn secondary<T: 'static>(&self, name: InternedString) -> Option<&T> {
        self.secondaries
            .iter()
            .find(|secondary| secondary.name == name)
            .map(|secondary| secondary.get::<T>())
    }

    pub fn platform_configuration<T: 'static>(&self) -> Option<&T> {
        self.platform_configuration
            .as_ref()
            .map(|configuration| unsafe { configuration.typed::<T>() })
    }

    /// Scratch preserved across `InProgress` re-entries.
    pub fn state<T: 'static>(&mut self) -> &mut T {
        unsafe {
            self.state
                .expect("rule declared no state type")
                .typed_mut()
        }
    }

    /// Registers a content-addressed byproduct and returns the interned name
    /// of the canonical instance. Equal values always return the same name;
    /// a new value is scheduled through the byproduct type's own build rule.
    pub fn register_byproduct<T: plinth_core::reflection::Reflected>(
        &mut self,
        value: &T,
    ) -> InternedString {
        self.byproducts
            .register(T::type_name(), (value as *const T).cast())
    }
}

struct ByproductTableInner {
    by_fingerprint: FxHashMap<(InternedString, u64), InternedString>,
    new_units: Vec<(InternedString, InternedString, Arc<RecordBox>)>,
}

pub(crate) struct ByproductTable {
    registry: Arc<Registry>,
    inner: Mutex<ByproductTableInner>,
}

impl ByproductTable {
    fn new(registry: Arc<Registry>) -> Self {
        ByproductTable {
            registry,
            inner: Mutex::new(ByproductTableInner {
                by_fingerprint: FxHashMap::default(),
                new_units: Vec::new(),
            }),
        }
    }

    fn register(&self, type_name: InternedString, data: *const u8) -> InternedString {
        let description = match self.registry.find_struct(type_name) {
            Some(description) => description.clone(),
            None => {
                tracing::error!(
                    type_name = type_name.as_str(),
                    "byproduct type is not registered"
                );
                return InternedString::default();
            }
        };

        let custom_hash = self
            .registry
            .struct_meta::<ByproductTypeMeta>(type_name)
            .find_map(|meta| meta.hash.clone());
        let fingerprint = match custom_hash {
            Some(hash) => hash(data),
            None => unsafe { self.registry.hash_instance(&description, data) },
        };

        let mut inner = self.inner.lock();
        if let Some(existing) = inner.by_fingerprint.get(&(type_name, fingerprint)) {
            return *existing;
        }

        let name = intern(&format!("{}_{:016x}", type_name, fingerprint));
        let instance = clone_record(&self.registry, &description, data);
        inner.by_fingerprint.insert((type_name, fingerprint), name);
        inner.new_units.push((type_name, name, Arc::new(instance)));
        tracing::debug!(
            type_name = type_name.as_str(),
            name = name.as_str(),
            "byproduct registered"
        );
        name
    }

    fn drain_new(&self) -> Vec<(InternedString, InternedString, Arc<RecordBox>)> {
        std::mem::take(&mut self.inner.lock().new_units)
    }
}

fn clone_record(registry: &Registry, description: &Arc<StructDescription>, source: *const u8) -> RecordBox {
    let clone = RecordBox::new(description.clone());
    for field in &description.fields {
        unsafe {
            registry.copy_field(
                &field.archetype,
                field.size,
                source.add(field.offset as usize),
                clone.data().add(field.offset as usize),
            );
        }
    }
    clone
}

/// Runs the whole build.
pub fn build(setup: &BuildSetup) -> BuildReport {
    let mut report = BuildReport {
        outcome: BuildOutcome::Success,
        built: Vec::new(),
        failed: Vec::new(),
        skipped: 0,
        diagnostics: Vec::new(),
    };

    if let Err(error) = std::fs::create_dir_all(&setup.project.workspace_directory) {
        tracing::error!(%error, "workspace directory is not creatable");
        report.outcome = BuildOutcome::Fatal;
        return report;
    }

    let entries = match scan_entries(setup) {
        Ok(entries) => entries,
        Err(message) => {
            report.diagnostics.push(message);
            report.outcome = BuildOutcome::Fatal;
            return report;
        }
    };
    tracing::info!(entry_count = entries.len(), "resource scan finished");

    let targets: Vec<InternedString> = if setup.targets_to_build.is_empty() {
        setup.project.targets.iter().map(|target| target.name).collect()
    } else {
        setup.targets_to_build.clone()
    };

    for target in targets {
        if setup.project.target(target).is_none() {
            report
                .diagnostics
                .push(format!("target {} is not part of the project", target));
            report.outcome = BuildOutcome::Fatal;
            return report;
        }
        build_target(setup, target, &entries, &mut report);
        if report.outcome == BuildOutcome::Fatal {
            return report;
        }
    }

    if !report.failed.is_empty() && report.outcome == BuildOutcome::Success {
        report.outcome = BuildOutcome::PartialFailure;
    }
    report
}

fn scan_entries(setup: &BuildSetup) -> Result<Vec<Entry>, String> {
    let mut entries = Vec::new();
    for target in &setup.project.targets {
        for root in &target.roots {
            if !root.exists() {
                return Err(format!(
                    "resource root {} of target {} does not exist",
                    root.display(),
                    target.name
                ));
            }
            for walked in walkdir::WalkDir::new(root) {
                let walked = match walked {
                    Ok(walked) => walked,
                    Err(error) => return Err(format!("walking {}: {}", root.display(), error)),
                };
                if !walked.file_type().is_file() {
                    continue;
                }

                let path = walked.path().to_path_buf();
                let kind = classify_file(&path);
                let name = intern(
                    path.file_stem()
                        .and_then(|stem| stem.to_str())
                        .unwrap_or_default(),
                );
                let type_name = match kind {
                    ResourceFileKind::ThirdParty => InternedString::default(),
                    native => match read_native_type(&path, native) {
                        Some(type_name) => type_name,
                        None => {
                            tracing::warn!(
                                path = %path.display(),
                                "native resource file has no readable type header, skipped"
                            );
                            continue;
                        }
                    },
                };

                let bytes = std::fs::read(&path)
                    .map_err(|error| format!("reading {}: {}", path.display(), error))?;
                let mtime_ns = file_mtime_ns(&path);
                entries.push(Entry {
                    target: target.name,
                    type_name,
                    name,
                    path,
                    kind,
                    mtime_ns,
                    content_hash: fxhash::hash64(&bytes),
                });
            }
        }
    }
    Ok(entries)
}

fn file_mtime_ns(path: &Path) -> u64 {
    std::fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|modified| modified.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|duration| duration.as_nanos() as u64)
        .unwrap_or(0)
}

/// Index over scanned entries for one target and its visible targets.
struct EntryView<'a> {
    entries: &'a [Entry],
    native: FxHashMap<UnitKey, usize>,
    third_party: FxHashMap<InternedString, usize>,
}

impl<'a> EntryView<'a> {
    fn new(entries: &'a [Entry], project: &Project, target: InternedString) -> Self {
        let mut scope: Vec<InternedString> = vec![target];
        if let Some(target) = project.target(target) {
            scope.extend(target.visible_targets.iter().copied());
        }

        let mut native = FxHashMap::default();
        let mut third_party = FxHashMap::default();
        // Own target wins over visible targets on name collisions.
        for scope_target in scope.iter().rev() {
            for (index, entry) in entries.iter().enumerate() {
                if entry.target != *scope_target {
                    continue;
                }
                match entry.kind {
                    ResourceFileKind::ThirdParty => {
                        third_party.insert(entry.name, index);
                    }
                    _ => {
                        native.insert((entry.type_name, entry.name), index);
                    }
                }
            }
        }

        EntryView {
            entries,
            native,
            third_party,
        }
    }

    fn native(&self, type_name: InternedString, name: InternedString) -> Option<usize> {
        self.native.get(&(type_name, name)).copied()
    }

    fn third_party(&self, name: InternedString) -> Option<usize> {
        self.third_party.get(&name).copied()
    }

    fn entry(&self, index: usize) -> &Entry {
        &self.entries[index]
    }
}

/// Loaded native entry instances, memoized.
struct InstanceLoader {
    registry: Arc<Registry>,
    loaded: Mutex<FxHashMap<usize, Arc<RecordBox>>>,
}

impl InstanceLoader {
    fn load(&self, view: &EntryView, index: usize) -> Result<Arc<RecordBox>, String> {
        if let Some(instance) = self.loaded.lock().get(&index) {
            return Ok(instance.clone());
        }

        let entry = view.entry(index);
        let instance = match entry.kind {
            ResourceFileKind::ReadableData => {
                let text = std::fs::read_to_string(&entry.path)
                    .map_err(|error| format!("reading {}: {}", entry.path.display(), error))?;
                rd::read_rd(&text, &self.registry, Some(entry.type_name))
                    .map_err(|error| format!("parsing {}: {}", entry.path.display(), error))?
            }
            ResourceFileKind::Binary => {
                let file = std::fs::File::open(&entry.path)
                    .map_err(|error| format!("opening {}: {}", entry.path.display(), error))?;
                binary::read_binary(file, &self.registry, Some(entry.type_name))
                    .map_err(|error| format!("reading {}: {}", entry.path.display(), error))?
            }
            ResourceFileKind::ThirdParty => {
                return Err(format!("{} is not a native resource", entry.path.display()))
            }
        };

        let instance = Arc::new(instance);
        self.loaded.lock().insert(index, instance.clone());
        Ok(instance)
    }
}

/// Collects `(referenced type, referenced name)` pairs by walking fields
/// annotated with [`ResourceReferenceMeta`], descending nested structs.
fn walk_references(
    registry: &Registry,
    description: &StructDescription,
    data: *const u8,
    output: &mut Vec<UnitKey>,
) {
    for field in &description.fields {
        let reference = registry
            .field_meta::<ResourceReferenceMeta>(description.name, field.name)
            .next()
            .map(|meta| meta.type_name);

        unsafe {
            match &field.archetype {
                FieldArchetype::InternedString => {
                    if let Some(reference_type) = reference {
                        let name = data
                            .add(field.offset as usize)
                            .cast::<InternedString>()
                            .read_unaligned();
                        if !name.is_empty() {
                            output.push((reference_type, name));
                        }
                    }
                }
                FieldArchetype::Array { element, .. } => {
                    if let (Some(reference_type), FieldArchetype::InternedString) =
                        (reference, element.as_ref())
                    {
                        let array = &*data.add(field.offset as usize).cast::<DynArray>();
                        for name in array.as_slice::<InternedString>() {
                            if !name.is_empty() {
                                output.push((reference_type, *name));
                            }
                        }
                    }
                }
                FieldArchetype::Struct { type_name } => {
                    if let Some(nested) = registry.find_struct(*type_name) {
                        walk_references(registry, nested, data.add(field.offset as usize), output);
                    }
                }
                _ => {}
            }
        }
    }
}

struct TargetPlan {
    units: FxHashMap<UnitKey, UnitPlan>,
    passthrough: Vec<usize>,
}

fn plan_target(
    setup: &BuildSetup,
    target: InternedString,
    view: &EntryView,
    loader: &InstanceLoader,
    diagnostics: &mut Vec<String>,
) -> Result<TargetPlan, String> {
    let registry = &setup.registry;
    let rules: FxHashMap<InternedString, BuildRuleMeta> = registry
        .structs_with_meta::<BuildRuleMeta>()
        .map(|(type_name, rule)| (type_name, rule.clone()))
        .collect();

    let mut plan = TargetPlan {
        units: FxHashMap::default(),
        passthrough: Vec::new(),
    };
    let mut visited: FxHashSet<UnitKey> = FxHashSet::default();
    let mut queue: Vec<UnitKey> = Vec::new();

    for entry in view.entries.iter() {
        if entry.target != target || entry.kind == ResourceFileKind::ThirdParty {
            continue;
        }
        let is_root = registry
            .struct_meta::<ResourceTypeMeta>(entry.type_name)
            .any(|meta| meta.root);
        if is_root {
            queue.push((entry.type_name, entry.name));
        }
    }

    while let Some((type_name, name)) = queue.pop() {
        if !visited.insert((type_name, name)) {
            continue;
        }

        if let Some(index) = view.native(type_name, name) {
            // Present as-is: passthrough unless something compiles into it.
            plan.passthrough.push(index);
            let instance = loader.load(view, index)?;
            let mut references = Vec::new();
            walk_references(
                registry,
                instance.description(),
                instance.data(),
                &mut references,
            );
            queue.extend(references);
            continue;
        }

        let rule = match rules.get(&type_name) {
            Some(rule) => rule.clone(),
            None => {
                diagnostics.push(format!(
                    "reference to {} \"{}\" resolves to nothing in target {}",
                    type_name, name, target
                ));
                continue;
            }
        };

        let (input, references) = match rule.primary_input_type {
            None => match view.third_party(name) {
                Some(index) => (UnitInput::ThirdParty(index), Vec::new()),
                None => {
                    diagnostics.push(format!(
                        "rule for {} \"{}\" needs a third-party file, none found in target {}",
                        type_name, name, target
                    ));
                    continue;
                }
            },
            Some(primary_type) => match view.native(primary_type, name) {
                Some(index) => {
                    let instance = loader.load(view, index)?;
                    let mut references = Vec::new();
                    walk_references(
                        registry,
                        instance.description(),
                        instance.data(),
                        &mut references,
                    );
                    (UnitInput::Native(index), references)
                }
                None => {
                    diagnostics.push(format!(
                        "reference to {} \"{}\" has no {} source in target {}",
                        type_name, name, primary_type, target
                    ));
                    continue;
                }
            },
        };

        let mut unit = UnitPlan {
            output_type: type_name,
            name,
            rule,
            input,
            secondary_refs: Vec::new(),
            dependencies: Vec::new(),
        };
        for reference in &references {
            if unit.rule.secondary_types.contains(&reference.0) {
                unit.secondary_refs.push(*reference);
                unit.dependencies.push(*reference);
            }
        }
        queue.extend(references);
        plan.units.insert((type_name, name), unit);
    }

    detect_cycles(&plan.units)?;
    Ok(plan)
}

fn detect_cycles(units: &FxHashMap<UnitKey, UnitPlan>) -> Result<(), String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Grey,
        Black,
    }

    let mut colors: FxHashMap<UnitKey, Color> =
        units.keys().map(|key| (*key, Color::White)).collect();

    fn visit(
        key: UnitKey,
        units: &FxHashMap<UnitKey, UnitPlan>,
        colors: &mut FxHashMap<UnitKey, Color>,
    ) -> Result<(), String> {
        match colors.get(&key) {
            Some(Color::Black) | None => return Ok(()),
            Some(Color::Grey) => {
                return Err(format!("reference cycle through {} \"{}\"", key.0, key.1))
            }
            Some(Color::White) => {}
        }
        colors.insert(key, Color::Grey);
        if let Some(unit) = units.get(&key) {
            for dependency in &unit.dependencies {
                visit(*dependency, units, colors)?;
            }
        }
        colors.insert(key, Color::Black);
        Ok(())
    }

    let keys: Vec<UnitKey> = units.keys().copied().collect();
    for key in keys {
        visit(key, units, &mut colors)?;
    }
    Ok(())
}

enum RunOutcome {
    Finished { output: Arc<RecordBox>, bytes: Vec<u8>, hash: u64 },
    Cached { hash: u64 },
    InProgress { state: Option<RecordBox> },
    Failed(String),
}

struct TargetBuild<'a> {
    setup: &'a BuildSetup,
    target: InternedString,
    cache_directory: PathBuf,
    cache_index: Mutex<CacheIndex>,
    byproducts: ByproductTable,
    outputs: Mutex<FxHashMap<UnitKey, Arc<RecordBox>>>,
    output_hashes: Mutex<FxHashMap<UnitKey, u64>>,
    platform_configurations: Mutex<FxHashMap<InternedString, (Arc<RecordBox>, u64)>>,
}

impl<'a> TargetBuild<'a> {
    fn cache_path(&self, type_name: InternedString, name: InternedString) -> PathBuf {
        self.cache_directory
            .join(type_name.as_str())
            .join(format!("{}.bin", name))
    }

    fn platform_configuration(
        &self,
        type_name: InternedString,
    ) -> Result<(Arc<RecordBox>, u64), String> {
        if let Some(found) = self.platform_configurations.lock().get(&type_name) {
            return Ok(found.clone());
        }

        let layered = load_platform_configuration(
            &self.setup.project.platform_configuration_directory,
            &self.setup.registry,
            type_name,
        )
        .map_err(|error| error.to_string())?;

        let description = self
            .setup
            .registry
            .find_struct(type_name)
            .expect("checked by load_platform_configuration")
            .clone();
        let record = RecordBox::new(description.clone());
        for layer in &layered.layers {
            unsafe {
                layer
                    .patch
                    .apply(record.data(), description.size)
                    .map_err(|error| error.to_string())?;
            }
        }

        let realised = (Arc::new(record), layered.combined_hash());
        self.platform_configurations
            .lock()
            .insert(type_name, realised.clone());
        Ok(realised)
    }

    /// Output instance of a completed unit, loading lazily from the cache
    /// file when the unit was skipped.
    fn output_instance(&self, key: UnitKey) -> Result<Arc<RecordBox>, String> {
        if let Some(instance) = self.outputs.lock().get(&key) {
            return Ok(instance.clone());
        }

        let path = self.cache_path(key.0, key.1);
        let file = std::fs::File::open(&path)
            .map_err(|error| format!("opening cached {}: {}", path.display(), error))?;
        let instance = binary::read_binary(file, &self.setup.registry, Some(key.0))
            .map_err(|error| format!("reading cached {}: {}", path.display(), error))?;
        let instance = Arc::new(instance);
        self.outputs.lock().insert(key, instance.clone());
        Ok(instance)
    }
}

fn build_target(
    setup: &BuildSetup,
    target: InternedString,
    entries: &[Entry],
    report: &mut BuildReport,
) {
    tracing::info!(target = target.as_str(), "building target");
    let view = EntryView::new(entries, &setup.project, target);
    let loader = InstanceLoader {
        registry: setup.registry.clone(),
        loaded: Mutex::new(FxHashMap::default()),
    };

    let plan = match plan_target(setup, target, &view, &loader, &mut report.diagnostics) {
        Ok(plan) => plan,
        Err(message) => {
            report.diagnostics.push(message);
            report.outcome = BuildOutcome::Fatal;
            return;
        }
    };

    let cache_directory = setup.project.cache_directory(target);
    let index_path = cache_directory.join("build_index.json");
    let context = TargetBuild {
        setup,
        target,
        cache_index: Mutex::new(CacheIndex::load(&index_path)),
        cache_directory,
        byproducts: ByproductTable::new(setup.registry.clone()),
        outputs: Mutex::new(FxHashMap::default()),
        output_hashes: Mutex::new(FxHashMap::default()),
        platform_configurations: Mutex::new(FxHashMap::default()),
    };

    let mut runtime: FxHashMap<UnitKey, UnitRuntime> = plan
        .units
        .into_iter()
        .map(|(key, plan)| {
            (
                key,
                UnitRuntime {
                    plan,
                    status: UnitStatus::Pending,
                    state: None,
                    rebuilt: false,
                },
            )
        })
        .collect();

    // Execute in dependency waves; byproducts registered by one wave become
    // units of a later wave.
    loop {
        let mut ready: Vec<UnitKey> = Vec::new();
        let mut progressed = false;

        let keys: Vec<UnitKey> = runtime.keys().copied().collect();
        for key in &keys {
            if runtime[key].status != UnitStatus::Pending {
                continue;
            }
            let dependencies = runtime[key].plan.dependencies.clone();
            let mut failed_dependency = false;
            let mut satisfied = true;
            for dependency in &dependencies {
                match runtime.get(dependency).map(|unit| unit.status) {
                    Some(UnitStatus::Done) | Some(UnitStatus::Skipped) => {}
                    Some(UnitStatus::Failed) | None => failed_dependency = true,
                    Some(UnitStatus::Pending) => satisfied = false,
                }
            }
            if failed_dependency {
                runtime.get_mut(key).unwrap().status = UnitStatus::Failed;
                report.failed.push(*key);
                progressed = true;
            } else if satisfied {
                ready.push(*key);
            }
        }

        if ready.is_empty() {
            if !progressed {
                break;
            }
            continue;
        }

        // Pull each ready unit's pieces together sequentially, then run the
        // functors in parallel.
        let mut batch = Vec::new();
        for key in ready {
            let unit = runtime.get_mut(&key).unwrap();
            let state = unit.state.take();
            batch.push((key, state));
        }

        let results: Vec<(UnitKey, RunOutcome)> = batch
            .into_par_iter()
            .map(|(key, state)| {
                let outcome = run_unit(&context, &view, &loader, &runtime[&key].plan, state);
                (key, outcome)
            })
            .collect();

        for (key, outcome) in results {
            let unit = runtime.get_mut(&key).unwrap();
            match outcome {
                RunOutcome::Finished { output, bytes, hash } => {
                    context.outputs.lock().insert(key, output);
                    context.output_hashes.lock().insert(key, hash);
                    write_cache_output(&context, key, &bytes, hash, report);
                    unit.status = UnitStatus::Done;
                    unit.rebuilt = true;
                    report.built.push(key);
                }
                RunOutcome::Cached { hash } => {
                    context.output_hashes.lock().insert(key, hash);
                    unit.status = UnitStatus::Skipped;
                    report.skipped += 1;
                }
                RunOutcome::InProgress { state } => {
                    unit.state = state;
                    tracing::trace!(
                        type_name = key.0.as_str(),
                        name = key.1.as_str(),
                        "unit rescheduled"
                    );
                }
                RunOutcome::Failed(message) => {
                    report.diagnostics.push(message);
                    unit.status = UnitStatus::Failed;
                    report.failed.push(key);
                }
            }
        }

        for (type_name, name, instance) in context.byproducts.drain_new() {
            let key = (type_name, name);
            if runtime.contains_key(&key) {
                continue;
            }
            let rule = setup
                .registry
                .struct_meta::<BuildRuleMeta>(type_name)
                .next()
                .cloned();
            let rule = match rule {
                Some(rule) => rule,
                None => {
                    // No rule: the byproduct instance itself is the output.
                    let mut bytes = Vec::new();
                    let description = instance.description().clone();
                    if let Err(error) = unsafe {
                        binary::write_binary(&mut bytes, &setup.registry, &description, instance.data())
                    } {
                        report.diagnostics.push(format!(
                            "serializing byproduct {} \"{}\": {}",
                            type_name, name, error
                        ));
                        report.failed.push(key);
                        continue;
                    }
                    let hash = fxhash::hash64(&bytes);
                    context.outputs.lock().insert(key, instance);
                    context.output_hashes.lock().insert(key, hash);
                    write_cache_output(&context, key, &bytes, hash, report);
                    report.built.push(key);
                    continue;
                }
            };

            runtime.insert(
                key,
                UnitRuntime {
                    plan: UnitPlan {
                        output_type: type_name,
                        name,
                        rule,
                        input: UnitInput::Byproduct(instance),
                        secondary_refs: Vec::new(),
                        dependencies: Vec::new(),
                    },
                    status: UnitStatus::Pending,
                    state: None,
                    rebuilt: false,
                },
            );
        }
    }

    deploy_target(&context, &view, &loader, &runtime, &plan.passthrough, report);

    if setup.pack {
        if let Err(message) = pack_target(setup, target) {
            report.diagnostics.push(message);
            report.outcome = BuildOutcome::Fatal;
            return;
        }
    }

    let save_result = context.cache_index.lock().save(&index_path);
    if let Err(error) = save_result {
        tracing::warn!(%error, "build cache index not persisted");
    }
}

fn run_unit(
    context: &TargetBuild,
    view: &EntryView,
    loader: &InstanceLoader,
    plan: &UnitPlan,
    state: Option<RecordBox>,
) -> RunOutcome {
    let registry = &context.setup.registry;

    let (input_mtime, input_hash, primary_input, third_party_input) = match &plan.input {
        UnitInput::Native(index) => {
            let entry = view.entry(*index);
            match loader.load(view, *index) {
                Ok(instance) => (entry.mtime_ns, entry.content_hash, Some(instance), None),
                Err(message) => return RunOutcome::Failed(message),
            }
        }
        UnitInput::ThirdParty(index) => {
            let entry = view.entry(*index);
            match std::fs::read(&entry.path) {
                Ok(bytes) => (
                    entry.mtime_ns,
                    entry.content_hash,
                    None,
                    Some(Arc::new(bytes)),
                ),
                Err(error) => {
                    return RunOutcome::Failed(format!(
                        "reading {}: {}",
                        entry.path.display(),
                        error
                    ))
                }
            }
        }
        UnitInput::Byproduct(instance) => {
            let hash = unsafe { registry.hash_instance(instance.description(), instance.data()) };
            (0, hash, Some(instance.clone()), None)
        }
    };

    let platform = match plan.rule.platform_configuration_type {
        Some(type_name) => match context.platform_configuration(type_name) {
            Ok(platform) => Some(platform),
            Err(message) => return RunOutcome::Failed(message),
        },
        None => None,
    };
    let platform_hash = platform.as_ref().map(|(_, hash)| *hash).unwrap_or(0);

    let mut secondary_fingerprints = Vec::new();
    let mut secondaries = Vec::new();
    for (secondary_type, secondary_name) in &plan.secondary_refs {
        let output_hash = context
            .output_hashes
            .lock()
            .get(&(*secondary_type, *secondary_name))
            .copied()
            .unwrap_or(0);
        secondary_fingerprints.push(SecondaryFingerprint {
            type_name: secondary_type.as_str().to_string(),
            name: secondary_name.as_str().to_string(),
            output_hash,
        });
        match context.output_instance((*secondary_type, *secondary_name)) {
            Ok(instance) => secondaries.push(SecondaryInput {
                type_name: *secondary_type,
                name: *secondary_name,
                instance,
            }),
            Err(message) => return RunOutcome::Failed(message),
        }
    }

    // Cache check: inputs, platform layers and the secondary set must all
    // match the recorded fingerprints, and the cached output must exist.
    if state.is_none() {
        let cache_index = context.cache_index.lock();
        if let Some(cached) = cache_index.get(plan.output_type.as_str(), plan.name.as_str()) {
            let valid = cached.input_mtime_ns == input_mtime
                && cached.input_hash == input_hash
                && cached.platform_hash == platform_hash
                && cached.secondary == secondary_fingerprints
                && context.cache_path(plan.output_type, plan.name).exists();
            if valid {
                return RunOutcome::Cached {
                    hash: cached.output_hash,
                };
            }
        }
    }

    let output_description = match registry.find_struct(plan.output_type) {
        Some(description) => description.clone(),
        None => {
            return RunOutcome::Failed(format!(
                "output type {} is not registered",
                plan.output_type
            ))
        }
    };
    let output = RecordBox::new(output_description.clone());

    let state = match (&state, plan.rule.state_type) {
        (Some(_), _) => state,
        (None, Some(state_type)) => match registry.find_struct(state_type) {
            Some(description) => Some(RecordBox::new(description.clone())),
            None => {
                return RunOutcome::Failed(format!("state type {} is not registered", state_type))
            }
        },
        (None, None) => None,
    };

    let mut compile = CompileState {
        target: context.target,
        name: plan.name,
        primary_input,
        third_party_input,
        primary_output: &output,
        secondaries,
        platform_configuration: platform.map(|(instance, _)| instance),
        state: state.as_ref(),
        byproducts: &context.byproducts,
    };

    match (plan.rule.functor)(&mut compile) {
        BuildRuleResult::Finished => {
            let mut bytes = Vec::new();
            if let Err(error) = unsafe {
                binary::write_binary(&mut bytes, registry, &output_description, output.data())
            } {
                return RunOutcome::Failed(format!(
                    "serializing {} \"{}\": {}",
                    plan.output_type, plan.name, error
                ));
            }
            let hash = fxhash::hash64(&bytes);

            let mut cache_index = context.cache_index.lock();
            cache_index.put(
                plan.output_type.as_str(),
                plan.name.as_str(),
                CacheEntry {
                    input_mtime_ns: input_mtime,
                    input_hash,
                    platform_hash,
                    secondary: secondary_fingerprints,
                    output_hash: hash,
                },
            );

            RunOutcome::Finished {
                output: Arc::new(output),
                bytes,
                hash,
            }
        }
        BuildRuleResult::InProgress => {
            drop(output);
            RunOutcome::InProgress { state }
        }
        BuildRuleResult::Failed => RunOutcome::Failed(format!(
            "build rule for {} \"{}\" failed",
            plan.output_type, plan.name
        )),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let temporary = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&temporary)?;
        file.write_all(bytes)?;
    }
    std::fs::rename(&temporary, path)
}

fn write_cache_output(
    context: &TargetBuild,
    key: UnitKey,
    bytes: &[u8],
    hash: u64,
    report: &mut BuildReport,
) {
    let path = context.cache_path(key.0, key.1);
    let unchanged = path.exists()
        && std::fs::read(&path)
            .map(|existing| fxhash::hash64(&existing) == hash)
            .unwrap_or(false);
    if unchanged {
        return;
    }
    if let Err(error) = write_atomic(&path, bytes) {
        report
            .diagnostics
            .push(format!("writing {}: {}", path.display(), error));
    }
}

fn deploy_target(
    context: &TargetBuild,
    view: &EntryView,
    loader: &InstanceLoader,
    runtime: &FxHashMap<UnitKey, UnitRuntime>,
    passthrough: &[usize],
    report: &mut BuildReport,
) {
    let deploy_directory = context.setup.project.deploy_directory(context.target);
    let registry = &context.setup.registry;

    for (key, unit) in runtime {
        if unit.status != UnitStatus::Done && unit.status != UnitStatus::Skipped {
            continue;
        }
        // Byproducts stay in the cache; only primary outputs deploy.
        if registry.struct_meta::<ByproductTypeMeta>(key.0).next().is_some() {
            continue;
        }

        let deploy_path = deploy_directory
            .join(key.0.as_str())
            .join(format!("{}.bin", key.1));
        if !unit.rebuilt && deploy_path.exists() {
            continue;
        }

        let cache_path = context.cache_path(key.0, key.1);
        match std::fs::read(&cache_path) {
            Ok(bytes) => {
                if let Err(error) = write_atomic(&deploy_path, &bytes) {
                    report
                        .diagnostics
                        .push(format!("deploying {}: {}", deploy_path.display(), error));
                }
            }
            Err(error) => report
                .diagnostics
                .push(format!("reading {}: {}", cache_path.display(), error)),
        }
    }

    // Natives without build rules deploy as serialized binaries.
    for index in passthrough {
        let entry = view.entry(*index);
        let instance = match loader.load(view, *index) {
            Ok(instance) => instance,
            Err(message) => {
                report.diagnostics.push(message);
                report.failed.push((entry.type_name, entry.name));
                continue;
            }
        };

        let mut bytes = Vec::new();
        let description = instance.description().clone();
        if let Err(error) =
            unsafe { binary::write_binary(&mut bytes, registry, &description, instance.data()) }
        {
            report.diagnostics.push(format!(
                "serializing {} \"{}\": {}",
                entry.type_name, entry.name, error
            ));
            report.failed.push((entry.type_name, entry.name));
            continue;
        }

        let hash = fxhash::hash64(&bytes);
        let deploy_path = deploy_directory
            .join(entry.type_name.as_str())
            .join(format!("{}.bin", entry.name));

        let mut cache_index = context.cache_index.lock();
        let unchanged = cache_index
            .get(entry.type_name.as_str(), entry.name.as_str())
            .map(|cached| cached.output_hash == hash)
            .unwrap_or(false)
            && deploy_path.exists();
        if unchanged {
            report.skipped += 1;
            continue;
        }

        cache_index.put(
            entry.type_name.as_str(),
            entry.name.as_str(),
            CacheEntry {
                input_mtime_ns: entry.mtime_ns,
                input_hash: entry.content_hash,
                platform_hash: 0,
                secondary: Vec::new(),
                output_hash: hash,
            },
        );
        drop(cache_index);

        if let Err(error) = write_atomic(&deploy_path, &bytes) {
            report
                .diagnostics
                .push(format!("deploying {}: {}", deploy_path.display(), error));
        } else {
            report.built.push((entry.type_name, entry.name));
        }
    }
}

/// Concatenates deployed outputs into `deploy/<target>.pack` with an index
/// header. Loose files stay in place; the pack is an additional layout.
fn pack_target(setup: &BuildSetup, target: InternedString) -> Result<(), String> {
    let deploy_directory = setup.project.deploy_directory(target);
    let mut blobs: Vec<(String, String, Vec<u8>)> = Vec::new();

    if deploy_directory.exists() {
        for walked in walkdir::WalkDir::new(&deploy_directory) {
            let walked = walked.map_err(|error| error.to_string())?;
            if !walked.file_type().is_file() {
                continue;
            }
            let path = walked.path();
            if path.extension().and_then(|extension| extension.to_str()) != Some("bin") {
                continue;
            }
            let type_name = path
                .parent()
                .and_then(|parent| parent.file_name())
                .and_then(|name| name.to_str())
                .unwrap_or_default()
                .to_string();
            let name = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or_default()
                .to_string();
            let bytes =
                std::fs::read(path).map_err(|error| format!("{}: {}", path.display(), error))?;
            blobs.push((type_name, name, bytes));
        }
    }

    blobs.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));

    let pack_path = setup
        .project
        .workspace_directory
        .join("deploy")
        .join(format!("{}.pack", target));
    let mut pack = Vec::new();
    pack.extend_from_slice(b"PLPK");
    pack.write_u32::<LittleEndian>(blobs.len() as u32)
        .expect("vec write");

    let mut offset = 0u64;
    for (type_name, name, bytes) in &blobs {
        pack.write_u16::<LittleEndian>(type_name.len() as u16).expect("vec write");
        pack.extend_from_slice(type_name.as_bytes());
        pack.write_u16::<LittleEndian>(name.len() as u16).expect("vec write");
        pack.extend_from_slice(name.as_bytes());
        pack.write_u64::<LittleEndian>(offset).expect("vec write");
        pack.write_u64::<LittleEndian>(bytes.len() as u64).expect("vec write");
        offset += bytes.len() as u64;
    }
    for (_, _, bytes) in &blobs {
        pack.extend_from_slice(bytes);
    }

    let unchanged = std::fs::read(&pack_path)
        .map(|existing| existing == pack)
        .unwrap_or(false);
    if unchanged {
        return Ok(());
    }
    write_atomic(&pack_path, &pack).map_err(|error| format!("{}: {}", pack_path.display(), error))
}

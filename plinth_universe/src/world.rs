//! Worlds, world definitions and universe deployment.
//!
//! A universe is a tree of worlds, each owning a repository node, a set of
//! pipelines and exactly one scheduler. Deployment consumes a declarative
//! [`WorldDefinition`] tree: configurations are realised from reflection
//! patches, mutators are instantiated from the registry and wired into
//! workflow graphs, and children deploy recursively onto child repositories.

use crate::mutator::{DeployContext, MutatorRegistry};
use crate::pipeline::{NodeKind, NodeOrdering, Pipeline, PipelineNode};
use crate::scheduler::{SchedulerInterface, SchedulerRegistry, WorldScheduler};
use crate::DeployError;
use fxhash::FxHashMap;
use parking_lot::Mutex;
use plinth_core::interner::InternedString;
use plinth_core::reflection::patch::Patch;
use plinth_core::reflection::Registry;
use plinth_core::repository::record::RecordBox;
use plinth_core::{Repository, ServingRepository};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct WorldConfigurationDefinition {
    pub name: InternedString,
    /// Typed patch applied over a value-initialised instance of the
    /// configuration type at deployment.
    pub patch: Patch,
}

#[derive(Clone, Debug, Default)]
pub struct PipelineDefinition {
    pub name: InternedString,
    pub mutators: Vec<InternedString>,
    pub mutator_groups: Vec<InternedString>,
}

#[derive(Clone, Debug, Default)]
pub struct WorldDefinition {
    pub world_name: InternedString,
    pub scheduler_name: InternedString,
    pub configuration: Vec<WorldConfigurationDefinition>,
    pub pipelines: Vec<PipelineDefinition>,
    pub children: Vec<WorldDefinition>,
}

/// A realised configuration slot: the patch applied over a value-initialised
/// instance. Immutable for the lifetime of the deployment.
pub struct ConfigurationInstance {
    record: RecordBox,
}

impl ConfigurationInstance {
    pub fn get<T: 'static>(&self) -> &T {
        unsafe { self.record.typed() }
    }

    pub fn data(&self) -> *const u8 {
        self.record.data()
    }

    pub fn type_name(&self) -> InternedString {
        self.record.description().name
    }
}

pub struct World {
    name: InternedString,
    pipelines: Vec<Pipeline>,
    scheduler: Option<Box<dyn WorldScheduler>>,
    configurations: FxHashMap<InternedString, ConfigurationInstance>,
    children: Vec<World>,
}

impl World {
    pub fn name(&self) -> InternedString {
        self.name
    }

    pub(crate) fn pipeline(&self, name: InternedString) -> Option<&Pipeline> {
        self.pipelines.iter().find(|pipeline| pipeline.name() == name)
    }

    pub(crate) fn children_mut(&mut self) -> impl Iterator<Item = &mut World> {
        self.children.iter_mut()
    }

    pub fn child(&self, name: InternedString) -> Option<&World> {
        self.children.iter().find(|child| child.name == name)
    }

    /// Realised configuration of the named slot, or `None`.
    pub fn configuration<T: 'static>(&self, name: InternedString) -> Option<&T> {
        self.configurations.get(&name).map(|instance| instance.get::<T>())
    }

    pub(crate) fn update(&mut self, pool: &rayon::ThreadPool) {
        let mut scheduler = match self.scheduler.take() {
            Some(scheduler) => scheduler,
            None => {
                tracing::error!(world = self.name.as_str(), "world has no scheduler");
                return;
            }
        };
        scheduler.update(&mut SchedulerInterface { world: self, pool });
        self.scheduler = Some(scheduler);
    }

    /// Tears down children first, then this world's pipelines and scheduler.
    fn undeploy(&mut self) {
        for child in &mut self.children {
            child.undeploy();
        }
        self.children.clear();
        for pipeline in &mut self.pipelines {
            pipeline.undeploy();
        }
        if let Some(scheduler) = &mut self.scheduler {
            scheduler.undeploy();
        }
    }
}

enum RepositoryState {
    Planning(Repository),
    Serving(ServingRepository),
}

/// The deployed world tree plus the repository tree underneath it.
pub struct Universe {
    root: World,
    repository: Option<RepositoryState>,
    pool: rayon::ThreadPool,
}

impl Universe {
    /// Deploys a world definition tree. Missing schedulers, mutators, groups
    /// or configuration types are fatal deployment errors reported before
    /// any pipeline runs.
    pub fn deploy_root(
        definition: &WorldDefinition,
        registry: Arc<Registry>,
        mutators: &MutatorRegistry,
        schedulers: &SchedulerRegistry,
    ) -> Result<Universe, DeployError> {
        let repository = Repository::new(definition.world_name.as_str(), registry.clone());
        let root = deploy_world(definition, &repository, &registry, mutators, schedulers)?;
        let pool = rayon::ThreadPoolBuilder::new().build()?;
        tracing::info!(
            world = definition.world_name.as_str(),
            "universe deployed"
        );
        Ok(Universe {
            root,
            repository: Some(RepositoryState::Planning(repository)),
            pool,
        })
    }

    pub fn root(&self) -> &World {
        &self.root
    }

    /// Runs one update of the root world's scheduler, transitioning the
    /// repository tree to serving if needed.
    pub fn update(&mut self) {
        match self.repository.take() {
            Some(RepositoryState::Planning(repository)) => {
                self.repository = Some(RepositoryState::Serving(repository.serve()));
            }
            other => self.repository = other,
        }
        self.root.update(&self.pool);
    }

    /// Transitions to planning mode and hands the repository to the callback,
    /// e.g. for reflection migration. The next update re-serves.
    pub fn plan<R>(&mut self, operation: impl FnOnce(&Repository) -> R) -> R {
        let repository = match self.repository.take() {
            Some(RepositoryState::Serving(serving)) => serving.plan(),
            Some(RepositoryState::Planning(planning)) => planning,
            None => unreachable!("universe always holds a repository"),
        };
        let result = operation(&repository);
        self.repository = Some(RepositoryState::Planning(repository));
        result
    }

    /// Runs every mutator's and scheduler's undeploy, children first.
    pub fn undeploy(mut self) {
        if let Some(RepositoryState::Serving(serving)) = self.repository.take() {
            self.repository = Some(RepositoryState::Planning(serving.plan()));
        }
        self.root.undeploy();
        tracing::info!(world = self.root.name.as_str(), "universe undeployed");
    }
}

fn deploy_world(
    definition: &WorldDefinition,
    repository: &Repository,
    registry: &Arc<Registry>,
    mutators: &MutatorRegistry,
    schedulers: &SchedulerRegistry,
) -> Result<World, DeployError> {
    let mut configurations = FxHashMap::default();
    for configuration in &definition.configuration {
        let type_name = configuration.patch.type_name();
        let description = registry
            .find_struct(type_name)
            .ok_or(DeployError::UnknownConfigurationType {
                world: definition.world_name,
                name: configuration.name,
                type_name,
            })?
            .clone();
        let record = RecordBox::new(description.clone());
        unsafe {
            configuration
                .patch
                .apply(record.data(), description.size)
                .map_err(DeployError::Reflection)?;
        }
        configurations.insert(configuration.name, ConfigurationInstance { record });
    }

    let mut scheduler = schedulers.instantiate(definition.scheduler_name).ok_or(
        DeployError::MissingScheduler {
            world: definition.world_name,
            scheduler: definition.scheduler_name,
        },
    )?;
    {
        let mut context = DeployContext::new(repository, &configurations);
        scheduler.deploy(&mut context)?;
    }

    let mut pipelines = Vec::new();
    for pipeline_definition in &definition.pipelines {
        pipelines.push(deploy_pipeline(
            pipeline_definition,
            repository,
            &configurations,
            mutators,
        )?);
    }

    let mut children = Vec::new();
    for child_definition in &definition.children {
        let child_repository = repository.create_child(child_definition.world_name.as_str());
        children.push(deploy_world(
            child_definition,
            &child_repository,
            registry,
            mutators,
            schedulers,
        )?);
    }

    tracing::debug!(world = definition.world_name.as_str(), "world deployed");
    Ok(World {
        name: definition.world_name,
        pipelines,
        scheduler: Some(scheduler),
        configurations,
        children,
    })
}

fn deploy_pipeline(
    definition: &PipelineDefinition,
    repository: &Repository,
    configurations: &FxHashMap<InternedString, ConfigurationInstance>,
    mutators: &MutatorRegistry,
) -> Result<Pipeline, DeployError> {
    // Expand groups, preserving declaration order and dropping duplicates.
    let mut names: Vec<InternedString> = Vec::new();
    let mut group_map: FxHashMap<InternedString, Vec<usize>> = FxHashMap::default();

    for name in &definition.mutators {
        if !names.contains(name) {
            names.push(*name);
        }
    }
    for group in &definition.mutator_groups {
        if !mutators.has_group(*group) {
            return Err(DeployError::MissingMutatorGroup {
                pipeline: definition.name,
                group: *group,
            });
        }
        let mut members = Vec::new();
        for member in mutators.group_members(*group) {
            let index = match names.iter().position(|existing| existing == member) {
                Some(index) => index,
                None => {
                    names.push(*member);
                    names.len() - 1
                }
            };
            members.push(index);
        }
        group_map.insert(*group, members);
    }

    let mut nodes = Vec::new();
    let mut orderings = Vec::new();
    for name in &names {
        let mut mutator = mutators.instantiate(*name).ok_or(DeployError::MissingMutator {
            pipeline: definition.name,
            mutator: *name,
        })?;

        let mut context = DeployContext::new(repository, configurations);
        mutator.deploy(&mut context)?;
        orderings.push(NodeOrdering {
            run_after: context.run_after,
            run_before: context.run_before,
        });
        nodes.push(PipelineNode {
            name: *name,
            kind: NodeKind::Mutator(Mutex::new(mutator)),
        });
    }

    Pipeline::assemble(definition.name, nodes, orderings, &group_map)
}

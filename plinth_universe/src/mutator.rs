//! Mutators: named units of work scheduled within a pipeline.
//!
//! A mutator owns a state struct, opens its repository queries in `deploy`,
//! runs `execute` exactly once per pipeline run and releases everything in
//! `undeploy`. Registration happens through [`MutatorRegistry`], where a
//! mutator may also be declared a member of a named group; pipelines include
//! groups by name and membership is resolved at deploy time.

use crate::world::ConfigurationInstance;
use crate::DeployError;
use fxhash::FxHashMap;
use plinth_core::interner::InternedString;
use plinth_core::Repository;
use std::sync::Arc;

pub trait Mutator: Send {
    /// Runs once at pipeline construction: open queries, read configuration,
    /// declare ordering against other mutators, groups or checkpoints.
    fn deploy(&mut self, _context: &mut DeployContext<'_>) -> Result<(), DeployError> {
        Ok(())
    }

    /// Runs exactly once per pipeline run, possibly on a worker thread.
    fn execute(&mut self, context: &ExecuteContext<'_, '_>);

    /// Runs once when the owning world is torn down.
    fn undeploy(&mut self) {}
}

/// Deploy-time context: the world's planning repository, its realised
/// configurations and the ordering declarations of the current node.
pub struct DeployContext<'a> {
    pub repository: &'a Repository,
    pub(crate) configurations: &'a FxHashMap<InternedString, ConfigurationInstance>,
    pub(crate) run_after: Vec<InternedString>,
    pub(crate) run_before: Vec<InternedString>,
}

impl<'a> DeployContext<'a> {
    pub(crate) fn new(
        repository: &'a Repository,
        configurations: &'a FxHashMap<InternedString, ConfigurationInstance>,
    ) -> Self {
        DeployContext {
            repository,
            configurations,
            run_after: Vec::new(),
            run_before: Vec::new(),
        }
    }

    /// Realised world configuration by slot name, or `None`.
    pub fn configuration<T: 'static>(&self, name: InternedString) -> Option<&T> {
        self.configurations.get(&name).map(|instance| instance.get::<T>())
    }

    /// Declares that this node runs after the named mutator, group or
    /// checkpoint.
    pub fn run_after(&mut self, name: &str) {
        self.run_after.push(InternedString::new(name));
    }

    /// Declares that this node runs before the named mutator, group or
    /// checkpoint.
    pub fn run_before(&mut self, name: &str) {
        self.run_before.push(InternedString::new(name));
    }
}

/// Execute-time context: a handle into the running pipeline's task graph.
pub struct ExecuteContext<'a, 'scope> {
    pub(crate) scope: &'a rayon::Scope<'scope>,
    pub pipeline: InternedString,
    pub mutator: InternedString,
}

impl<'a, 'scope> ExecuteContext<'a, 'scope> {
    /// Detaches an additional task into the current pipeline run. The
    /// pipeline boundary is not reached until every detached task completes.
    pub fn detach<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'scope,
    {
        self.scope.spawn(move |_| task());
    }
}

pub type MutatorFactory = Arc<dyn Fn() -> Box<dyn Mutator> + Send + Sync>;

/// Name-to-factory registry with group membership.
#[derive(Default)]
pub struct MutatorRegistry {
    factories: FxHashMap<InternedString, MutatorFactory>,
    groups: FxHashMap<InternedString, Vec<InternedString>>,
}

impl MutatorRegistry {
    pub fn new() -> Self {
        MutatorRegistry::default()
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Mutator> + Send + Sync + 'static,
    {
        self.factories
            .insert(InternedString::new(name), Arc::new(factory));
    }

    /// Registers a mutator as a member of a named group.
    pub fn register_in_group<F>(&mut self, group: &str, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Mutator> + Send + Sync + 'static,
    {
        let name = InternedString::new(name);
        self.factories.insert(name, Arc::new(factory));
        self.groups
            .entry(InternedString::new(group))
            .or_default()
            .push(name);
    }

    pub fn instantiate(&self, name: InternedString) -> Option<Box<dyn Mutator>> {
        self.factories.get(&name).map(|factory| factory())
    }

    pub fn group_members(&self, group: InternedString) -> &[InternedString] {
        self.groups
            .get(&group)
            .map(|members| members.as_slice())
            .unwrap_or(&[])
    }

    pub fn has_group(&self, group: InternedString) -> bool {
        self.groups.contains_key(&group)
    }
}

//! World schedulers.
//!
//! Every world has exactly one scheduler. It runs on the caller thread, not
//! inside the workflow graph, so it may freely acquire repository accesses
//! between pipeline runs. Child worlds update inside `update_all_children`,
//! strictly after the parent's preceding pipeline runs, and recursively.

use crate::mutator::DeployContext;
use crate::world::World;
use crate::DeployError;
use fxhash::FxHashMap;
use plinth_core::interner::InternedString;
use std::sync::Arc;

pub trait WorldScheduler: Send {
    /// Runs once at world deployment, before any pipeline runs.
    fn deploy(&mut self, _context: &mut DeployContext<'_>) -> Result<(), DeployError> {
        Ok(())
    }

    /// Runs once per world update.
    fn update(&mut self, interface: &mut SchedulerInterface<'_>);

    fn undeploy(&mut self) {}
}

/// Handle given to a scheduler for one update.
pub struct SchedulerInterface<'a> {
    pub(crate) world: &'a mut World,
    pub(crate) pool: &'a rayon::ThreadPool,
}

impl<'a> SchedulerInterface<'a> {
    pub fn world_name(&self) -> InternedString {
        self.world.name()
    }

    /// Runs the named pipeline to completion. Unknown names are logged and
    /// skipped so a misconfigured scheduler degrades instead of panicking.
    pub fn run_pipeline(&mut self, name: InternedString) {
        match self.world.pipeline(name) {
            Some(pipeline) => pipeline.execute(self.pool),
            None => tracing::error!(
                world = self.world.name().as_str(),
                pipeline = name.as_str(),
                "scheduler requested unknown pipeline"
            ),
        }
    }

    /// Updates every child world, recursively, in declaration order.
    pub fn update_all_children(&mut self) {
        let pool = self.pool;
        for child in self.world.children_mut() {
            child.update(pool);
        }
    }

    /// Realised world configuration by slot name.
    pub fn configuration<T: 'static>(&self, name: InternedString) -> Option<&T> {
        self.world.configuration::<T>(name)
    }
}

pub type SchedulerFactory = Arc<dyn Fn() -> Box<dyn WorldScheduler> + Send + Sync>;

#[derive(Default)]
pub struct SchedulerRegistry {
    factories: FxHashMap<InternedString, SchedulerFactory>,
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        let mut registry = SchedulerRegistry::default();
        registry.register(SINGLE_PIPELINE_SCHEDULER, || {
            Box::new(SinglePipelineScheduler::default())
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn WorldScheduler> + Send + Sync + 'static,
    {
        self.factories
            .insert(InternedString::new(name), Arc::new(factory));
    }

    pub fn instantiate(&self, name: InternedString) -> Option<Box<dyn WorldScheduler>> {
        self.factories.get(&name).map(|factory| factory())
    }
}

/// Name under which the stock single-pipeline scheduler is registered.
pub const SINGLE_PIPELINE_SCHEDULER: &str = "single_pipeline";

/// Name of the pipeline the stock scheduler runs.
pub const SINGLE_PIPELINE_NAME: &str = "update";

/// Stock scheduler: runs the `update` pipeline, then updates all children.
pub struct SinglePipelineScheduler {
    pipeline: InternedString,
}

impl Default for SinglePipelineScheduler {
    fn default() -> Self {
        SinglePipelineScheduler {
            pipeline: InternedString::new(SINGLE_PIPELINE_NAME),
        }
    }
}

impl SinglePipelineScheduler {
    pub fn for_pipeline(name: &str) -> Self {
        SinglePipelineScheduler {
            pipeline: InternedString::new(name),
        }
    }
}

impl WorldScheduler for SinglePipelineScheduler {
    fn update(&mut self, interface: &mut SchedulerInterface<'_>) {
        interface.run_pipeline(self.pipeline);
        interface.update_all_children();
    }
}

//! The universe: a pipeline-of-mutators execution model on top of the
//! repository, partitioned into hierarchical worlds and driven by pluggable
//! schedulers over a CPU workflow graph.

pub mod frame;
pub mod mutator;
pub mod pipeline;
pub mod scheduler;
pub mod world;

pub use crate::mutator::{DeployContext, ExecuteContext, Mutator, MutatorRegistry};
pub use crate::pipeline::Pipeline;
pub use crate::scheduler::{
    SchedulerInterface, SchedulerRegistry, SinglePipelineScheduler, WorldScheduler,
    SINGLE_PIPELINE_NAME, SINGLE_PIPELINE_SCHEDULER,
};
pub use crate::world::{
    ConfigurationInstance, PipelineDefinition, Universe, World, WorldConfigurationDefinition,
    WorldDefinition,
};

use plinth_core::interner::InternedString;
use plinth_core::reflection::ReflectionError;
use plinth_core::RepositoryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("world {world} references unknown scheduler {scheduler}")]
    MissingScheduler {
        world: InternedString,
        scheduler: InternedString,
    },

    #[error("pipeline {pipeline} references unknown mutator {mutator}")]
    MissingMutator {
        pipeline: InternedString,
        mutator: InternedString,
    },

    #[error("pipeline {pipeline} references unknown mutator group {group}")]
    MissingMutatorGroup {
        pipeline: InternedString,
        group: InternedString,
    },

    #[error("configuration {name} of world {world} has unregistered type {type_name}")]
    UnknownConfigurationType {
        world: InternedString,
        name: InternedString,
        type_name: InternedString,
    },

    #[error("ordering declarations of pipeline {pipeline} form a cycle")]
    PipelineCycle { pipeline: InternedString },

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Reflection(#[from] ReflectionError),

    #[error("thread pool construction failed: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub mod prelude {
    pub use crate::frame::{FRAME_BEGIN_CHECKPOINT, FRAME_END_CHECKPOINT};
    pub use crate::mutator::{DeployContext, ExecuteContext, Mutator, MutatorRegistry};
    pub use crate::scheduler::{
        SchedulerInterface, SchedulerRegistry, SinglePipelineScheduler, WorldScheduler,
    };
    pub use crate::world::{
        PipelineDefinition, Universe, WorldConfigurationDefinition, WorldDefinition,
    };
    pub use crate::DeployError;
}

//! Resource pipeline of the plinth engine substrate: an offline build graph
//! compiling source assets into deployed artifacts, and a runtime provider
//! mutator group streaming those artifacts into the repository on demand.

pub mod build;
pub mod meta;
pub mod project;
pub mod provider;

pub use crate::build::{build, BuildOutcome, BuildReport, BuildSetup, CompileState, SecondaryInput};
pub use crate::meta::{
    BuildFunctor, BuildRuleMeta, BuildRuleResult, ByproductTypeMeta, ResourceReferenceMeta,
    ResourceTypeMeta,
};
pub use crate::project::{Project, ProjectError, Target};
pub use crate::provider::{
    next_blob_id, next_usage_id, register_provider_types, register_resource_provider,
    ManualWatcher, ResourceProviderConfiguration, ResourceProviderSingleton, ResourceQueries,
    ResourceRef, ResourceUsage, ResourceWatcher, WatcherEvent, RESOURCE_PROVIDER_BEGIN_CHECKPOINT,
    RESOURCE_PROVIDER_CONFIGURATION, RESOURCE_PROVIDER_END_CHECKPOINT,
    RESOURCE_PROVIDER_MUTATOR_GROUP,
};

pub mod prelude {
    pub use crate::build::{build, BuildOutcome, BuildSetup, CompileState};
    pub use crate::meta::{
        BuildRuleMeta, BuildRuleResult, ByproductTypeMeta, ResourceReferenceMeta, ResourceTypeMeta,
    };
    pub use crate::project::{Project, Target};
    pub use crate::provider::{
        register_provider_types, register_resource_provider, ResourceProviderConfiguration,
        ResourceQueries, ResourceUsage, RESOURCE_PROVIDER_CONFIGURATION,
        RESOURCE_PROVIDER_MUTATOR_GROUP,
    };
}

//! plinth: a reflection-driven game engine substrate.
//!
//! Three tightly coupled subsystems form the core:
//!
//! * `plinth_core`: the reflection registry and the concurrency-safe record
//!   repository (singletons, indexed records, event streams, automatic
//!   change events, cascade deletion), plus readable-data and binary
//!   serialization.
//! * `plinth_universe`: hierarchical worlds running pipelines of mutators
//!   over a CPU workflow graph, driven by pluggable schedulers.
//! * `plinth_resource`: the offline resource build graph and the runtime
//!   resource provider that streams built artifacts into the repository.

pub use plinth_core;
pub use plinth_resource;
pub use plinth_universe;

pub mod prelude {
    pub use plinth_core::prelude::*;
    pub use plinth_resource::prelude::*;
    pub use plinth_universe::prelude::*;
}

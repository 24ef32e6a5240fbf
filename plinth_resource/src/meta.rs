//! Meta records that parameterise the resource pipeline.
//!
//! All of these are registered into the reflection registry: type meta on
//! resource structs, reference meta on fields, build rules on the struct the
//! rule produces. The build graph and the runtime provider discover them
//! through registry iteration and never hardcode resource types.

use plinth_core::interner::InternedString;
use std::sync::Arc;

/// Struct meta marking a type as a resource type. Root-marked resources seed
/// the build closure.
#[derive(Clone, Debug, Default)]
pub struct ResourceTypeMeta {
    pub root: bool,
}

/// Field meta: the field (an interned string or an array of interned
/// strings) names resources of `type_name`.
#[derive(Clone, Debug)]
pub struct ResourceReferenceMeta {
    pub type_name: InternedString,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildRuleResult {
    Finished,
    /// The unit is rescheduled and re-entered with its state preserved.
    InProgress,
    Failed,
}

pub type BuildFunctor =
    Arc<dyn Fn(&mut crate::build::CompileState<'_>) -> BuildRuleResult + Send + Sync>;

/// Struct meta on a resource type `T`: how to build an instance of `T`.
///
/// With `primary_input_type = Some(P)`, the rule fires for every scheduled
/// entry of type `P` with the parsed instance as primary input. With `None`,
/// the rule consumes the raw bytes of the third-party file of the same name.
#[derive(Clone)]
pub struct BuildRuleMeta {
    pub primary_input_type: Option<InternedString>,
    pub platform_configuration_type: Option<InternedString>,
    /// Scratch record preserved across `InProgress` re-entries.
    pub state_type: Option<InternedString>,
    /// Additional pull-in inputs: referenced entries of these types are
    /// built before this rule runs and handed in as secondary inputs.
    pub secondary_types: Vec<InternedString>,
    pub functor: BuildFunctor,
}

impl std::fmt::Debug for BuildRuleMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BuildRuleMeta")
            .field("primary_input_type", &self.primary_input_type)
            .field("platform_configuration_type", &self.platform_configuration_type)
            .field("state_type", &self.state_type)
            .field("secondary_types", &self.secondary_types)
            .finish()
    }
}

/// Struct meta marking a type as a byproduct type: instances are
/// content-addressed and deduplicated across compilations. Without a custom
/// hash hook the reflection-driven byte-wise fingerprint is used.
#[derive(Clone, Default)]
pub struct ByproductTypeMeta {
    pub hash: Option<Arc<dyn Fn(*const u8) -> u64 + Send + Sync>>,
}

impl std::fmt::Debug for ByproductTypeMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ByproductTypeMeta")
            .field("hash", &self.hash.as_ref().map(|_| "custom"))
            .finish()
    }
}

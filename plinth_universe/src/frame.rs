//! Contract surface consumed by the render foundation.
//!
//! The core only guarantees the frame checkpoints in the workflow graph and
//! a repository singleton carrying the render context handle; everything
//! GPU-side lives outside this crate.

use plinth_core::interner::{intern, InternedString};
use plinth_core::reflection::{
    FieldArchetype, Reflected, RegistryBuilder, StructDescription, StructDescriptionBuilder,
};

/// Checkpoint hit before any frame-scoped mutator executes.
pub const FRAME_BEGIN_CHECKPOINT: &str = "frame_begin";

/// Checkpoint hit after all frame-scoped mutators finished. Per-frame
/// temporary allocations are reset here.
pub const FRAME_END_CHECKPOINT: &str = "frame_end";

/// Singleton mutated between pipeline runs by a render-aware scheduler.
#[derive(Default)]
#[repr(C)]
pub struct RenderStateSingleton {
    /// Opaque render context handle owned by the render backend.
    pub context_handle: u64,
    /// Set when the scheduler decided this update produces a frame.
    pub frame_scheduled: bool,
}

impl Reflected for RenderStateSingleton {
    fn type_name() -> InternedString {
        intern("render_state_singleton")
    }

    fn describe() -> StructDescription {
        StructDescriptionBuilder::for_type::<RenderStateSingleton>("render_state_singleton")
            .field(
                "context_handle",
                std::mem::offset_of!(RenderStateSingleton, context_handle),
                FieldArchetype::U64,
            )
            .field(
                "frame_scheduled",
                std::mem::offset_of!(RenderStateSingleton, frame_scheduled),
                FieldArchetype::Bool,
            )
            .build()
    }
}

pub fn register_frame_types(builder: &mut RegistryBuilder) {
    builder.add_type::<RenderStateSingleton>();
}

//! Core of the plinth engine substrate: the string interner, the reflection
//! registry and the concurrency-safe record repository, plus the readable-
//! data and binary serialization formats driven by reflection.

pub mod borrow;
pub mod interner;
pub mod reflection;
pub mod repository;
pub mod serial;

pub use crate::interner::{intern, InternedString};
pub use crate::reflection::{
    field_path, read_field_value, write_field_value, EnumDescription, FieldArchetype,
    FieldDescription, FieldValue, PathResolution, Reflected, ReflectionError, Registry,
    RegistryBuilder, StructDescription, StructDescriptionBuilder,
};
pub use crate::repository::{Repository, RepositoryError, ServingRepository};

pub mod prelude {
    pub use crate::interner::{intern, InternedString};
    pub use crate::reflection::dynarray::DynArray;
    pub use crate::reflection::patch::Patch;
    pub use crate::reflection::{
        field_path, FieldArchetype, FieldValue, Reflected, Registry, RegistryBuilder,
        StructDescriptionBuilder,
    };
    pub use crate::repository::{
        CascadeDeletionMeta, CopyOutSpec, OnChangeEventMeta, OnDeleteEventMeta, OnInsertEventMeta,
        Repository, ServingRepository,
    };
}

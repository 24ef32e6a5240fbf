//! Reflected record types of the resource provider, plus runtime synthesis
//! of the per-resource-type repository types.

use crate::meta::ResourceTypeMeta;
use plinth_core::interner::{intern, InternedString};
use plinth_core::reflection::dynarray::DynArray;
use plinth_core::reflection::{
    align_up, FieldArchetype, Reflected, RegistryBuilder, StructDescription,
    StructDescriptionBuilder,
};
use plinth_core::repository::{CopyOutSpec, OnDeleteEventMeta, OnInsertEventMeta};
use std::sync::atomic::{AtomicU64, Ordering};

/// Byte layout of synthesized `(entry_id, name)` event types.
pub(crate) const EVENT_ENTRY_ID_OFFSET: u32 = 0;
pub(crate) const EVENT_NAME_OFFSET: u32 = 8;

/// World-level configuration of the provider.
#[repr(C)]
pub struct ResourceProviderConfiguration {
    /// How much time in nanoseconds one update may spend loading resources.
    pub serve_budget_ns: u64,
    /// Root directory the provider scans and serves from.
    pub resource_directory: InternedString,
}

impl Default for ResourceProviderConfiguration {
    fn default() -> Self {
        ResourceProviderConfiguration {
            serve_budget_ns: u64::MAX,
            resource_directory: InternedString::default(),
        }
    }
}

impl Reflected for ResourceProviderConfiguration {
    fn type_name() -> InternedString {
        intern("resource_provider_configuration")
    }

    fn describe() -> StructDescription {
        StructDescriptionBuilder::for_type::<ResourceProviderConfiguration>(
            "resource_provider_configuration",
        )
        .field(
            "serve_budget_ns",
            std::mem::offset_of!(ResourceProviderConfiguration, serve_budget_ns),
            FieldArchetype::U64,
        )
        .field(
            "resource_directory",
            std::mem::offset_of!(ResourceProviderConfiguration, resource_directory),
            FieldArchetype::InternedString,
        )
        .build()
    }
}

/// Provider-global counters and flags.
///
/// The id counters are atomic so that any mutator holding a read access can
/// draw fresh usage and blob ids without write contention.
#[derive(Default)]
#[repr(C)]
pub struct ResourceProviderSingleton {
    pub usage_id_counter: AtomicU64,
    pub blob_id_counter: AtomicU64,
    /// Whether the initial resource scan finished and the entry list is
    /// complete.
    pub scan_done: bool,
    /// Monotonic per-update id. Guaranteed different every frame and stable
    /// within one frame; lets event-triggered merge logic deduplicate its
    /// own recalculations without global coordination.
    pub logic_deduplication_frame_id: u64,
}

impl Reflected for ResourceProviderSingleton {
    fn type_name() -> InternedString {
        intern("resource_provider_singleton")
    }

    fn describe() -> StructDescription {
        StructDescriptionBuilder::for_type::<ResourceProviderSingleton>(
            "resource_provider_singleton",
        )
        .field(
            "usage_id_counter",
            std::mem::offset_of!(ResourceProviderSingleton, usage_id_counter),
            FieldArchetype::U64,
        )
        .field(
            "blob_id_counter",
            std::mem::offset_of!(ResourceProviderSingleton, blob_id_counter),
            FieldArchetype::U64,
        )
        .field(
            "scan_done",
            std::mem::offset_of!(ResourceProviderSingleton, scan_done),
            FieldArchetype::Bool,
        )
        .field(
            "logic_deduplication_frame_id",
            std::mem::offset_of!(ResourceProviderSingleton, logic_deduplication_frame_id),
            FieldArchetype::U64,
        )
        .build()
    }
}

/// Draws a fresh usage id; safe from any thread holding a read access.
pub fn next_usage_id(singleton: &ResourceProviderSingleton) -> u64 {
    singleton.usage_id_counter.fetch_add(1, Ordering::Relaxed) + 1
}

/// Draws a fresh third-party blob id; safe from any thread holding a read
/// access.
pub fn next_blob_id(singleton: &ResourceProviderSingleton) -> u64 {
    singleton.blob_id_counter.fetch_add(1, Ordering::Relaxed) + 1
}

/// Public record per discovered native resource file.
#[derive(Default)]
#[repr(C)]
pub struct ResourceGenericEntry {
    pub entry_id: u64,
    pub type_name: InternedString,
    pub name: InternedString,
    pub usage_counter: u64,
    /// Set when the file vanished during hot reload. Loaded data stays
    /// usable, but new loads fail until the file reappears.
    pub removal_mark: bool,
    pub path: InternedString,
}

impl Reflected for ResourceGenericEntry {
    fn type_name() -> InternedString {
        intern("resource_generic_entry")
    }

    fn describe() -> StructDescription {
        StructDescriptionBuilder::for_type::<ResourceGenericEntry>("resource_generic_entry")
            .field(
                "entry_id",
                std::mem::offset_of!(ResourceGenericEntry, entry_id),
                FieldArchetype::U64,
            )
            .field(
                "type_name",
                std::mem::offset_of!(ResourceGenericEntry, type_name),
                FieldArchetype::InternedString,
            )
            .field(
                "name",
                std::mem::offset_of!(ResourceGenericEntry, name),
                FieldArchetype::InternedString,
            )
            .field(
                "usage_counter",
                std::mem::offset_of!(ResourceGenericEntry, usage_counter),
                FieldArchetype::U64,
            )
            .field(
                "removal_mark",
                std::mem::offset_of!(ResourceGenericEntry, removal_mark),
                FieldArchetype::Bool,
            )
            .field(
                "path",
                std::mem::offset_of!(ResourceGenericEntry, path),
                FieldArchetype::InternedString,
            )
            .build()
    }
}

/// Record per discovered third-party (opaque) resource file.
#[derive(Default)]
#[repr(C)]
pub struct ResourceThirdPartyEntry {
    pub entry_id: u64,
    pub name: InternedString,
    pub removal_mark: bool,
    pub path: InternedString,
}

impl Reflected for ResourceThirdPartyEntry {
    fn type_name() -> InternedString {
        intern("resource_third_party_entry")
    }

    fn describe() -> StructDescription {
        StructDescriptionBuilder::for_type::<ResourceThirdPartyEntry>("resource_third_party_entry")
            .field(
                "entry_id",
                std::mem::offset_of!(ResourceThirdPartyEntry, entry_id),
                FieldArchetype::U64,
            )
            .field(
                "name",
                std::mem::offset_of!(ResourceThirdPartyEntry, name),
                FieldArchetype::InternedString,
            )
            .field(
                "removal_mark",
                std::mem::offset_of!(ResourceThirdPartyEntry, removal_mark),
                FieldArchetype::Bool,
            )
            .field(
                "path",
                std::mem::offset_of!(ResourceThirdPartyEntry, path),
                FieldArchetype::InternedString,
            )
            .build()
    }
}

/// Caller-inserted pin: while at least one usage references a resource, the
/// provider keeps it loaded. Usages are immutable after insertion; to change
/// one, delete it and insert a replacement.
#[derive(Default)]
#[repr(C)]
pub struct ResourceUsage {
    pub usage_id: u64,
    pub type_name: InternedString,
    pub name: InternedString,
    /// Higher is more urgent.
    pub priority: u64,
}

impl Reflected for ResourceUsage {
    fn type_name() -> InternedString {
        intern("resource_usage")
    }

    fn describe() -> StructDescription {
        StructDescriptionBuilder::for_type::<ResourceUsage>("resource_usage")
            .field(
                "usage_id",
                std::mem::offset_of!(ResourceUsage, usage_id),
                FieldArchetype::U64,
            )
            .field(
                "type_name",
                std::mem::offset_of!(ResourceUsage, type_name),
                FieldArchetype::InternedString,
            )
            .field(
                "name",
                std::mem::offset_of!(ResourceUsage, name),
                FieldArchetype::InternedString,
            )
            .field(
                "priority",
                std::mem::offset_of!(ResourceUsage, priority),
                FieldArchetype::U64,
            )
            .build()
    }
}

/// Opaque byte blob for formats the engine does not interpret. The provider
/// never mutates a blob after it became available; hot reload is the
/// consumer's business via third-party-updated events.
#[derive(Default)]
#[repr(C)]
pub struct ResourceThirdPartyBlob {
    pub blob_id: u64,
    pub name: InternedString,
    pub priority: u64,
    /// Data is only valid once this is set.
    pub available: bool,
    pub data: DynArray,
}

impl Reflected for ResourceThirdPartyBlob {
    fn type_name() -> InternedString {
        intern("resource_third_party_blob")
    }

    fn describe() -> StructDescription {
        StructDescriptionBuilder::for_type::<ResourceThirdPartyBlob>("resource_third_party_blob")
            .field(
                "blob_id",
                std::mem::offset_of!(ResourceThirdPartyBlob, blob_id),
                FieldArchetype::U64,
            )
            .field(
                "name",
                std::mem::offset_of!(ResourceThirdPartyBlob, name),
                FieldArchetype::InternedString,
            )
            .field(
                "priority",
                std::mem::offset_of!(ResourceThirdPartyBlob, priority),
                FieldArchetype::U64,
            )
            .field(
                "available",
                std::mem::offset_of!(ResourceThirdPartyBlob, available),
                FieldArchetype::Bool,
            )
            .field(
                "data",
                std::mem::offset_of!(ResourceThirdPartyBlob, data),
                FieldArchetype::Array {
                    element: Box::new(FieldArchetype::U8),
                    element_size: 1,
                    element_align: 1,
                },
            )
            .build()
    }
}

/// Automatic event mirrored from usage insertion.
#[derive(Default)]
#[repr(C)]
pub struct ResourceUsageInserted {
    pub usage_id: u64,
    pub type_name: InternedString,
    pub name: InternedString,
    pub priority: u64,
}

impl Reflected for ResourceUsageInserted {
    fn type_name() -> InternedString {
        intern("resource_usage_inserted")
    }

    fn describe() -> StructDescription {
        StructDescriptionBuilder::for_type::<ResourceUsageInserted>("resource_usage_inserted")
            .field(
                "usage_id",
                std::mem::offset_of!(ResourceUsageInserted, usage_id),
                FieldArchetype::U64,
            )
            .field(
                "type_name",
                std::mem::offset_of!(ResourceUsageInserted, type_name),
                FieldArchetype::InternedString,
            )
            .field(
                "name",
                std::mem::offset_of!(ResourceUsageInserted, name),
                FieldArchetype::InternedString,
            )
            .field(
                "priority",
                std::mem::offset_of!(ResourceUsageInserted, priority),
                FieldArchetype::U64,
            )
            .build()
    }
}

/// Automatic event mirrored from usage deletion.
#[derive(Default)]
#[repr(C)]
pub struct ResourceUsageDeleted {
    pub usage_id: u64,
    pub type_name: InternedString,
    pub name: InternedString,
}

impl Reflected for ResourceUsageDeleted {
    fn type_name() -> InternedString {
        intern("resource_usage_deleted")
    }

    fn describe() -> StructDescription {
        StructDescriptionBuilder::for_type::<ResourceUsageDeleted>("resource_usage_deleted")
            .field(
                "usage_id",
                std::mem::offset_of!(ResourceUsageDeleted, usage_id),
                FieldArchetype::U64,
            )
            .field(
                "type_name",
                std::mem::offset_of!(ResourceUsageDeleted, type_name),
                FieldArchetype::InternedString,
            )
            .field(
                "name",
                std::mem::offset_of!(ResourceUsageDeleted, name),
                FieldArchetype::InternedString,
            )
            .build()
    }
}

/// Automatic event mirrored from third-party blob insertion.
#[derive(Default)]
#[repr(C)]
pub struct ResourceBlobInserted {
    pub blob_id: u64,
    pub name: InternedString,
    pub priority: u64,
}

impl Reflected for ResourceBlobInserted {
    fn type_name() -> InternedString {
        intern("resource_blob_inserted")
    }

    fn describe() -> StructDescription {
        StructDescriptionBuilder::for_type::<ResourceBlobInserted>("resource_blob_inserted")
            .field(
                "blob_id",
                std::mem::offset_of!(ResourceBlobInserted, blob_id),
                FieldArchetype::U64,
            )
            .field(
                "name",
                std::mem::offset_of!(ResourceBlobInserted, name),
                FieldArchetype::InternedString,
            )
            .field(
                "priority",
                std::mem::offset_of!(ResourceBlobInserted, priority),
                FieldArchetype::U64,
            )
            .build()
    }
}

/// Fired when a third-party resource file change is detected.
#[derive(Default)]
#[repr(C)]
pub struct ResourceThirdPartyUpdatedEvent {
    pub name: InternedString,
}

impl Reflected for ResourceThirdPartyUpdatedEvent {
    fn type_name() -> InternedString {
        intern("resource_third_party_updated_event")
    }

    fn describe() -> StructDescription {
        StructDescriptionBuilder::for_type::<ResourceThirdPartyUpdatedEvent>(
            "resource_third_party_updated_event",
        )
        .field(
            "name",
            std::mem::offset_of!(ResourceThirdPartyUpdatedEvent, name),
            FieldArchetype::InternedString,
        )
        .build()
    }
}

/// Fired when a blob finished loading and its bytes can be consumed.
#[derive(Default)]
#[repr(C)]
pub struct ResourceThirdPartyBlobAvailable {
    pub blob_id: u64,
}

impl Reflected for ResourceThirdPartyBlobAvailable {
    fn type_name() -> InternedString {
        intern("resource_third_party_blob_available")
    }

    fn describe() -> StructDescription {
        StructDescriptionBuilder::for_type::<ResourceThirdPartyBlobAvailable>(
            "resource_third_party_blob_available",
        )
        .field(
            "blob_id",
            std::mem::offset_of!(ResourceThirdPartyBlobAvailable, blob_id),
            FieldArchetype::U64,
        )
        .build()
    }
}

/// Fired when blob loading failed and the consumer should discard the blob.
#[derive(Default)]
#[repr(C)]
pub struct ResourceThirdPartyBlobFailed {
    pub blob_id: u64,
}

impl Reflected for ResourceThirdPartyBlobFailed {
    fn type_name() -> InternedString {
        intern("resource_third_party_blob_failed")
    }

    fn describe() -> StructDescription {
        StructDescriptionBuilder::for_type::<ResourceThirdPartyBlobFailed>(
            "resource_third_party_blob_failed",
        )
        .field(
            "blob_id",
            std::mem::offset_of!(ResourceThirdPartyBlobFailed, blob_id),
            FieldArchetype::U64,
        )
        .build()
    }
}

fn paths(fields: &[&str]) -> Vec<CopyOutSpec> {
    fields
        .iter()
        .map(|field| CopyOutSpec {
            source: vec![intern(field)],
            target: vec![intern(field)],
        })
        .collect()
}

/// Registers every generic provider type, the usage/blob automatic events
/// and the per-resource-type synthesized types (typed entries, containers,
/// registered/updated/loaded events).
///
/// Call after all resource types (meta [`ResourceTypeMeta`]) are registered.
pub fn register_provider_types(builder: &mut RegistryBuilder) {
    builder.add_type::<ResourceProviderConfiguration>();
    builder.add_type::<ResourceProviderSingleton>();
    builder.add_type::<ResourceGenericEntry>();
    builder.add_type::<ResourceThirdPartyEntry>();
    builder.add_type::<ResourceUsage>();
    builder.add_type::<ResourceThirdPartyBlob>();
    builder.add_type::<ResourceUsageInserted>();
    builder.add_type::<ResourceUsageDeleted>();
    builder.add_type::<ResourceBlobInserted>();
    builder.add_type::<ResourceThirdPartyUpdatedEvent>();
    builder.add_type::<ResourceThirdPartyBlobAvailable>();
    builder.add_type::<ResourceThirdPartyBlobFailed>();

    builder.add_struct_meta(
        intern("resource_usage"),
        OnInsertEventMeta {
            event_type: intern("resource_usage_inserted"),
            copy_outs: paths(&["usage_id", "type_name", "name", "priority"]),
        },
    );
    builder.add_struct_meta(
        intern("resource_usage"),
        OnDeleteEventMeta {
            event_type: intern("resource_usage_deleted"),
            copy_outs: paths(&["usage_id", "type_name", "name"]),
        },
    );
    builder.add_struct_meta(
        intern("resource_third_party_blob"),
        OnInsertEventMeta {
            event_type: intern("resource_blob_inserted"),
            copy_outs: paths(&["blob_id", "name", "priority"]),
        },
    );

    let resource_types: Vec<(InternedString, u32, u32)> = builder
        .current()
        .structs_with_meta::<ResourceTypeMeta>()
        .filter_map(|(type_name, _)| {
            builder
                .current()
                .find_struct(type_name)
                .map(|description| (type_name, description.size, description.align))
        })
        .collect();

    for (resource_type, payload_size, payload_align) in resource_types {
        synthesize_for_resource_type(builder, resource_type, payload_size, payload_align);
    }
}

fn synthesize_for_resource_type(
    builder: &mut RegistryBuilder,
    resource_type: InternedString,
    payload_size: u32,
    payload_align: u32,
) {
    let typed_entry = StructDescriptionBuilder::dynamic(
        super::typed_entry_type(resource_type),
        40,
        8,
    )
    .sized_field("entry_id", 0, 8, FieldArchetype::U64)
    .sized_field("name", 8, 4, FieldArchetype::InternedString)
    .sized_field("loaded_container_id", 16, 8, FieldArchetype::U64)
    .sized_field("loading_container_id", 24, 8, FieldArchetype::U64)
    .sized_field("loading_pending", 32, 1, FieldArchetype::Bool)
    .build();
    builder.add_dynamic_struct(typed_entry);

    // Container payload starts at the first offset past the header that
    // satisfies the resource type's alignment.
    let payload_offset = align_up(8, payload_align.max(1));
    let container_align = payload_align.max(8);
    let container_size = align_up(payload_offset + payload_size.max(1), container_align);
    let container = StructDescriptionBuilder::dynamic(
        super::container_type(resource_type),
        container_size,
        container_align,
    )
    .sized_field("container_id", 0, 8, FieldArchetype::U64)
    .sized_field(
        "payload",
        payload_offset as usize,
        payload_size as usize,
        FieldArchetype::Struct {
            type_name: resource_type,
        },
    )
    .build();
    builder.add_dynamic_struct(container);

    for event_type in [
        super::registered_event_type(resource_type),
        super::updated_event_type(resource_type),
        super::loaded_event_type(resource_type),
    ] {
        let event = StructDescriptionBuilder::dynamic(event_type, 16, 8)
            .sized_field("entry_id", EVENT_ENTRY_ID_OFFSET as usize, 8, FieldArchetype::U64)
            .sized_field("name", EVENT_NAME_OFFSET as usize, 4, FieldArchetype::InternedString)
            .build();
        builder.add_dynamic_struct(event);
    }
}

//! Record migration between reflection registries.
//!
//! Called while the repository tree is in planning mode, after the old
//! registry was invalidated. Every record of every storage is rewritten in
//! place: fields present in both layouts are copied by name, fields missing
//! from the new layout are dropped with the old shutdown, new fields come
//! out value-initialised.

use super::record::RecordBox;
use super::RepositoryNode;
use crate::reflection::{Registry, StructDescription};
use std::sync::Arc;

/// Copies every name-matched, layout-compatible field from an old record
/// into a freshly value-initialised new record.
///
/// # Safety
/// `old_data` must be a valid instance of `old_description` and `new_data` a
/// valid initialised instance of `new_description`.
pub(crate) unsafe fn migrate_record_contents(
    new_registry: &Registry,
    old_description: &StructDescription,
    old_data: *const u8,
    new_description: &StructDescription,
    new_data: *mut u8,
) {
    for new_field in &new_description.fields {
        let old_field = match old_description.field(new_field.name) {
            Some(field) => field,
            None => continue,
        };

        if !old_field.archetype.compatible_with(&new_field.archetype)
            || old_field.size != new_field.size
        {
            tracing::debug!(
                type_name = new_description.name.as_str(),
                field = new_field.name.as_str(),
                "field layout changed, value reset during migration"
            );
            continue;
        }

        new_registry.copy_field(
            &new_field.archetype,
            new_field.size,
            old_data.add(old_field.offset as usize),
            new_data.add(new_field.offset as usize),
        );
    }
}

pub(crate) fn migrate_node(node: &Arc<RepositoryNode>, new_registry: Arc<Registry>) {
    assert!(
        !node.serving.load(std::sync::atomic::Ordering::Acquire),
        "migration requires planning mode"
    );

    *node.registry.write() = new_registry.clone();

    {
        let mut singletons = node.singletons.write();
        singletons.retain(|type_name, storage| {
            let new_description = match new_registry.find_struct(*type_name) {
                Some(description) => description.clone(),
                None => {
                    tracing::warn!(
                        type_name = type_name.as_str(),
                        "singleton type vanished from registry, storage dropped"
                    );
                    return false;
                }
            };

            let old_description = storage.description();
            let replacement = RecordBox::new(new_description.clone());
            unsafe {
                migrate_record_contents(
                    &new_registry,
                    &old_description,
                    storage.record_data(),
                    &new_description,
                    replacement.data(),
                );
                storage.replace_record(replacement);
            }
            true
        });
    }

    {
        let mut indexed = node.indexed.write();
        indexed.retain(|type_name, storage| {
            let new_description = match new_registry.find_struct(*type_name) {
                Some(description) => description.clone(),
                None => {
                    tracing::warn!(
                        type_name = type_name.as_str(),
                        "indexed type vanished from registry, storage dropped"
                    );
                    return false;
                }
            };

            storage.migrate(new_registry.clone(), new_description);
            true
        });
    }

    {
        let mut events = node.events.write();
        events.retain(|type_name, storage| match new_registry.find_struct(*type_name) {
            Some(description) => {
                storage.replace_description(description.clone());
                true
            }
            None => {
                tracing::warn!(
                    type_name = type_name.as_str(),
                    "event type vanished from registry, storage dropped"
                );
                false
            }
        });
    }

    for child in node.children.read().iter() {
        migrate_node(child, new_registry.clone());
    }
}

//! The repository: a reflection-driven, concurrency-safe in-memory data
//! plane holding singletons, indexed records and event streams.
//!
//! Repositories form a tree. Singleton and event storages are inherited
//! upward through the tree; indexed storages are strictly local. A
//! repository is either *planning* (storages and queries may be opened) or
//! *serving* (accesses may be executed); the two states are distinct types
//! and the transition is a consuming operation on the tree root.

pub mod event;
pub mod indexed;
pub mod migration;
pub mod observation;
pub mod record;
pub mod singleton;

pub use event::{
    EventFetchAccess, EventFetchQuery, EventInsertQuery, EventInsertionPackage, EventRead,
    EventStorage,
};
pub use indexed::{
    IndexedInsertQuery, IndexedInsertionPackage, IndexedIntervalReadQuery,
    IndexedIntervalWriteQuery, IndexedReadAccess, IndexedReadCursor, IndexedSequenceReadQuery,
    IndexedSequenceWriteQuery, IndexedSignalReadQuery, IndexedSignalWriteQuery, IndexedStorage,
    IndexedValueReadQuery, IndexedValueWriteQuery, IndexedWriteAccess, IndexedWriteCursor,
    RecordId,
};
pub use observation::{
    CascadeDeletionMeta, CopyOutSpec, FieldPath, OnChangeEventMeta, OnDeleteEventMeta,
    OnInsertEventMeta,
};
pub use singleton::{
    SingletonReadAccess, SingletonReadQuery, SingletonStorage, SingletonWriteAccess,
    SingletonWriteQuery,
};

use crate::interner::InternedString;
use crate::reflection::{ReflectionError, Registry};
use fxhash::FxHashMap;
use indexed::CascadeRule;
use observation::build_observation;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("type {name} is not registered in the reflection registry")]
    UnknownType { name: InternedString },

    #[error("operation on {type_name} storage is only legal in planning mode")]
    NotInPlanning { type_name: InternedString },

    #[error(transparent)]
    Reflection(#[from] ReflectionError),
}

pub(crate) struct RepositoryNode {
    name: InternedString,
    parent: Weak<RepositoryNode>,
    children: RwLock<Vec<Arc<RepositoryNode>>>,
    registry: RwLock<Arc<Registry>>,
    serving: Arc<AtomicBool>,
    singletons: RwLock<FxHashMap<InternedString, Arc<SingletonStorage>>>,
    indexed: RwLock<FxHashMap<InternedString, Arc<IndexedStorage>>>,
    events: RwLock<FxHashMap<InternedString, Arc<EventStorage>>>,
}

impl RepositoryNode {
    fn new(name: InternedString, parent: Weak<RepositoryNode>, registry: Arc<Registry>) -> Self {
        RepositoryNode {
            name,
            parent,
            children: RwLock::new(Vec::new()),
            registry: RwLock::new(registry),
            serving: Arc::new(AtomicBool::new(false)),
            singletons: RwLock::new(FxHashMap::default()),
            indexed: RwLock::new(FxHashMap::default()),
            events: RwLock::new(FxHashMap::default()),
        }
    }

    fn registry(&self) -> Arc<Registry> {
        self.registry.read().clone()
    }

    fn find_singleton_up(&self, type_name: InternedString) -> Option<Arc<SingletonStorage>> {
        if let Some(storage) = self.singletons.read().get(&type_name) {
            return Some(storage.clone());
        }
        self.parent
            .upgrade()
            .and_then(|parent| parent.find_singleton_up(type_name))
    }

    fn find_event_up(&self, type_name: InternedString) -> Option<Arc<EventStorage>> {
        if let Some(storage) = self.events.read().get(&type_name) {
            return Some(storage.clone());
        }
        self.parent
            .upgrade()
            .and_then(|parent| parent.find_event_up(type_name))
    }

    fn open_singleton(&self, type_name: InternedString) -> Result<Arc<SingletonStorage>, RepositoryError> {
        if let Some(storage) = self.find_singleton_up(type_name) {
            return Ok(storage);
        }

        let registry = self.registry();
        let description = registry
            .find_struct(type_name)
            .ok_or_else(|| {
                tracing::error!(
                    type_name = type_name.as_str(),
                    "singleton storage requested for unregistered type"
                );
                RepositoryError::UnknownType { name: type_name }
            })?
            .clone();
        let storage = Arc::new(SingletonStorage::new(description, self.serving.clone()));
        self.singletons.write().insert(type_name, storage.clone());
        Ok(storage)
    }

    fn open_indexed(&self, type_name: InternedString) -> Result<Arc<IndexedStorage>, RepositoryError> {
        if let Some(storage) = self.indexed.read().get(&type_name) {
            return Ok(storage.clone());
        }

        let registry = self.registry();
        let description = registry
            .find_struct(type_name)
            .ok_or_else(|| {
                tracing::error!(
                    type_name = type_name.as_str(),
                    "indexed storage requested for unregistered type"
                );
                RepositoryError::UnknownType { name: type_name }
            })?
            .clone();
        let storage = Arc::new(IndexedStorage::new(
            description,
            registry,
            self.serving.clone(),
        ));
        self.indexed.write().insert(type_name, storage.clone());
        Ok(storage)
    }

    fn open_event(&self, type_name: InternedString) -> Result<Arc<EventStorage>, RepositoryError> {
        if let Some(storage) = self.find_event_up(type_name) {
            return Ok(storage);
        }

        let registry = self.registry();
        let description = registry
            .find_struct(type_name)
            .ok_or_else(|| {
                tracing::error!(
                    type_name = type_name.as_str(),
                    "event storage requested for unregistered type"
                );
                RepositoryError::UnknownType { name: type_name }
            })?
            .clone();
        let storage = Arc::new(EventStorage::new(description, self.serving.clone()));
        self.events.write().insert(type_name, storage.clone());
        Ok(storage)
    }

    /// Builds observation scenarios, triggers and cascade tables for every
    /// storage in the subtree. Runs while the tree is still planning.
    fn build_derived(self: &Arc<Self>) {
        let registry = self.registry();

        let singletons: Vec<_> = self.singletons.read().values().cloned().collect();
        for storage in singletons {
            let description = storage.description();
            let mut open_event = |event_type: InternedString| match self.open_event(event_type) {
                Ok(event) => Some(event),
                Err(error) => {
                    tracing::error!(
                        type_name = description.name.as_str(),
                        %error,
                        "automatic event target failed to open"
                    );
                    None
                }
            };
            let plan = build_observation(&registry, &description, &mut open_event);
            storage.install_observation(if plan.is_empty() && plan.scenario.chunks.is_empty() {
                None
            } else {
                Some(Arc::new(plan))
            });
        }

        let indexed: Vec<_> = self.indexed.read().values().cloned().collect();
        for storage in &indexed {
            let description = storage.description();
            let mut open_event = |event_type: InternedString| match self.open_event(event_type) {
                Ok(event) => Some(event),
                Err(error) => {
                    tracing::error!(
                        type_name = description.name.as_str(),
                        %error,
                        "automatic event target failed to open"
                    );
                    None
                }
            };
            let plan = build_observation(&registry, &description, &mut open_event);

            let mut cascades = Vec::new();
            for meta in registry.struct_meta::<CascadeDeletionMeta>(description.name) {
                let child_storage = match self.indexed.read().get(&meta.child_type) {
                    Some(child) => child.clone(),
                    None => {
                        // No storage for the child type means no child records
                        // can exist; the rule is inert this cycle.
                        continue;
                    }
                };

                let parent_path = match registry.resolve_path(&description, &meta.parent_key) {
                    Ok(resolution) => resolution,
                    Err(error) => {
                        tracing::error!(
                            type_name = description.name.as_str(),
                            %error,
                            "cascade parent key failed to resolve"
                        );
                        continue;
                    }
                };
                let child_description = child_storage.description();
                let child_path = match registry.resolve_path(&child_description, &meta.child_key) {
                    Ok(resolution) => resolution,
                    Err(error) => {
                        tracing::error!(
                            type_name = meta.child_type.as_str(),
                            %error,
                            "cascade child key failed to resolve"
                        );
                        continue;
                    }
                };
                if parent_path.size != child_path.size {
                    tracing::error!(
                        parent = description.name.as_str(),
                        child = meta.child_type.as_str(),
                        "cascade key size mismatch, rule skipped"
                    );
                    continue;
                }

                cascades.push(CascadeRule {
                    parent_path,
                    child_storage,
                    child_path,
                });
            }

            let empty = plan.is_empty() && plan.scenario.chunks.is_empty() && cascades.is_empty();
            storage.install_observation(if empty {
                None
            } else {
                Some(Arc::new(indexed::IndexedObservation { plan, cascades }))
            });
        }

        let children: Vec<_> = self.children.read().clone();
        for child in children {
            child.build_derived();
        }
    }

    fn set_serving(&self, serving: bool) {
        self.serving.store(serving, Ordering::Release);
        for child in self.children.read().iter() {
            child.set_serving(serving);
        }
    }

    /// Drops derived artifacts and reports leaked accesses.
    fn release_derived(&self) {
        for storage in self.singletons.read().values() {
            if !storage.is_idle() {
                tracing::error!(
                    type_name = storage.type_name().as_str(),
                    "singleton access leaked across serving-to-planning transition"
                );
            }
            storage.install_observation(None);
        }
        for storage in self.indexed.read().values() {
            if !storage.is_idle() {
                tracing::error!(
                    type_name = storage.type_name().as_str(),
                    "indexed access leaked across serving-to-planning transition"
                );
            }
            storage.install_observation(None);
        }
        for child in self.children.read().iter() {
            child.release_derived();
        }
    }
}

/// Planning-mode handle: storages may be opened and queries constructed.
pub struct Repository {
    node: Arc<RepositoryNode>,
}

impl Repository {
    pub fn new(name: &str, registry: Arc<Registry>) -> Repository {
        let name = InternedString::new(name);
        tracing::info!(repository = name.as_str(), "creating repository root");
        Repository {
            node: Arc::new(RepositoryNode::new(name, Weak::new(), registry)),
        }
    }

    pub fn name(&self) -> InternedString {
        self.node.name
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.node.registry()
    }

    pub fn create_child(&self, name: &str) -> Repository {
        let name = InternedString::new(name);
        let child = Arc::new(RepositoryNode::new(
            name,
            Arc::downgrade(&self.node),
            self.node.registry(),
        ));
        self.node.children.write().push(child.clone());
        tracing::debug!(
            repository = self.node.name.as_str(),
            child = name.as_str(),
            "created child repository"
        );
        Repository { node: child }
    }

    pub fn child(&self, name: InternedString) -> Option<Repository> {
        self.node
            .children
            .read()
            .iter()
            .find(|child| child.name == name)
            .map(|child| Repository { node: child.clone() })
    }

    /// Destroys a child repository together with its storages and children.
    pub fn drop_child(&self, name: InternedString) {
        self.node.children.write().retain(|child| child.name != name);
    }

    /// Opens (or inherits) the singleton storage for a type.
    pub fn open_singleton(
        &self,
        type_name: InternedString,
    ) -> Result<Arc<SingletonStorage>, RepositoryError> {
        self.node.open_singleton(type_name)
    }

    /// Opens the local indexed storage for a type.
    pub fn open_indexed(
        &self,
        type_name: InternedString,
    ) -> Result<Arc<IndexedStorage>, RepositoryError> {
        self.node.open_indexed(type_name)
    }

    /// Opens (or inherits) the event storage for a type.
    pub fn open_event(
        &self,
        type_name: InternedString,
    ) -> Result<Arc<EventStorage>, RepositoryError> {
        self.node.open_event(type_name)
    }

    /// Rewrites every stored record against a new reflection registry.
    /// Fields are matched by name; fields missing from the new layout are
    /// dropped, new fields are value-initialised. Derived artifacts are
    /// rebuilt on the next serving transition.
    pub fn migrate(&self, new_registry: Arc<Registry>) {
        migration::migrate_node(&self.node, new_registry);
    }

    /// Transitions the whole tree to serving mode, rebuilding observation
    /// buffers and trigger tables. Only legal on the tree root.
    pub fn serve(self) -> ServingRepository {
        assert!(
            self.node.parent.upgrade().is_none(),
            "serve() must be called on the repository tree root"
        );
        self.node.build_derived();
        self.node.set_serving(true);
        tracing::debug!(repository = self.node.name.as_str(), "repository now serving");
        ServingRepository { node: self.node }
    }
}

/// Serving-mode handle: queries constructed during planning may now execute
/// accesses. Holds no storage-opening surface.
pub struct ServingRepository {
    node: Arc<RepositoryNode>,
}

impl ServingRepository {
    pub fn name(&self) -> InternedString {
        self.node.name
    }

    /// Transitions back to planning, releasing derived artifacts. Leaked
    /// accesses are reported.
    pub fn plan(self) -> Repository {
        self.node.set_serving(false);
        self.node.release_derived();
        tracing::debug!(repository = self.node.name.as_str(), "repository now planning");
        Repository { node: self.node }
    }
}

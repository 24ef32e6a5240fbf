use super::observation::ObservationPlan;
use super::record::RecordBox;
use super::RepositoryError;
use crate::borrow::{AccessState, ConflictLatch};
use crate::interner::InternedString;
use crate::reflection::StructDescription;
use parking_lot::RwLock;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Storage holding exactly one record of its type per repository.
///
/// Reads are shared, writes are exclusive; a write access snapshots the
/// observed byte ranges on open and diffs them on close to drive automatic
/// change events.
pub struct SingletonStorage {
    type_name: InternedString,
    record: UnsafeCell<RecordBox>,
    access: AccessState,
    conflict: ConflictLatch,
    serving: Arc<AtomicBool>,
    observation: RwLock<Option<Arc<ObservationPlan>>>,
}

// Aliasing into the record is governed by `access`, not by references.
unsafe impl Sync for SingletonStorage {}
unsafe impl Send for SingletonStorage {}

impl SingletonStorage {
    pub(crate) fn new(description: Arc<StructDescription>, serving: Arc<AtomicBool>) -> Self {
        SingletonStorage {
            type_name: description.name,
            record: UnsafeCell::new(RecordBox::new(description)),
            access: AccessState::new(),
            conflict: ConflictLatch::new(),
            serving,
            observation: RwLock::new(None),
        }
    }

    pub fn type_name(&self) -> InternedString {
        self.type_name
    }

    pub(crate) fn description(&self) -> Arc<StructDescription> {
        unsafe { (*self.record.get()).description().clone() }
    }

    pub(crate) fn install_observation(&self, plan: Option<Arc<ObservationPlan>>) {
        *self.observation.write() = plan;
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.access.is_idle()
    }

    /// # Safety
    /// Only legal in planning mode with no live accesses (migration).
    pub(crate) unsafe fn replace_record(&self, record: RecordBox) {
        debug_assert!(self.is_idle());
        *self.record.get() = record;
    }

    pub(crate) fn record_data(&self) -> *mut u8 {
        unsafe { (*self.record.get()).data() }
    }

    pub fn read_query(self: &Arc<Self>) -> Result<SingletonReadQuery, RepositoryError> {
        if self.serving.load(Ordering::Acquire) {
            return Err(RepositoryError::NotInPlanning {
                type_name: self.type_name,
            });
        }
        Ok(SingletonReadQuery {
            storage: self.clone(),
        })
    }

    pub fn write_query(self: &Arc<Self>) -> Result<SingletonWriteQuery, RepositoryError> {
        if self.serving.load(Ordering::Acquire) {
            return Err(RepositoryError::NotInPlanning {
                type_name: self.type_name,
            });
        }
        Ok(SingletonWriteQuery {
            storage: self.clone(),
        })
    }
}

pub struct SingletonReadQuery {
    storage: Arc<SingletonStorage>,
}

impl SingletonReadQuery {
    /// Acquires a shared access, or `None` on conflict with a live writer.
    pub fn execute(&self) -> Option<SingletonReadAccess<'_>> {
        let storage = &*self.storage;
        if !storage.serving.load(Ordering::Acquire) {
            storage.conflict.report(storage.type_name, "singleton_read_in_planning");
            return None;
        }
        if !storage.access.try_read() {
            storage.conflict.report(storage.type_name, "singleton_read");
            return None;
        }
        Some(SingletonReadAccess { storage })
    }
}

pub struct SingletonReadAccess<'a> {
    storage: &'a SingletonStorage,
}

impl<'a> SingletonReadAccess<'a> {
    pub fn get<T: 'static>(&self) -> &T {
        unsafe { (*self.storage.record.get()).typed() }
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { (*self.storage.record.get()).bytes() }
    }
}

impl<'a> Drop for SingletonReadAccess<'a> {
    fn drop(&mut self) {
        self.storage.access.release_read();
    }
}

pub struct SingletonWriteQuery {
    storage: Arc<SingletonStorage>,
}

impl SingletonWriteQuery {
    /// Acquires the exclusive access, snapshotting observed fields before
    /// the record pointer is handed out.
    pub fn execute(&self) -> Option<SingletonWriteAccess<'_>> {
        let storage = &*self.storage;
        if !storage.serving.load(Ordering::Acquire) {
            storage.conflict.report(storage.type_name, "singleton_write_in_planning");
            return None;
        }
        if !storage.access.try_write() {
            storage.conflict.report(storage.type_name, "singleton_write");
            return None;
        }

        let plan = storage.observation.read().clone();
        let mut snapshot = Vec::new();
        if let Some(plan) = &plan {
            unsafe { plan.scenario.snapshot(storage.record_data(), &mut snapshot) };
        }

        Some(SingletonWriteAccess {
            storage,
            plan,
            snapshot,
        })
    }
}

pub struct SingletonWriteAccess<'a> {
    storage: &'a SingletonStorage,
    plan: Option<Arc<ObservationPlan>>,
    snapshot: Vec<u8>,
}

impl<'a> SingletonWriteAccess<'a> {
    pub fn get<T: 'static>(&mut self) -> &mut T {
        unsafe { (*self.storage.record.get()).typed_mut() }
    }

    pub fn data(&mut self) -> *mut u8 {
        self.storage.record_data()
    }
}

impl<'a> Drop for SingletonWriteAccess<'a> {
    fn drop(&mut self) {
        if let Some(plan) = &self.plan {
            unsafe {
                let record = self.storage.record_data();
                let changed = plan.scenario.changed_chunks(record, &self.snapshot);
                if !changed.is_empty() {
                    for trigger in &plan.change_triggers {
                        trigger.fire_if_changed(&changed, record, &self.snapshot);
                    }
                }
            }
        }
        // Event insertion happened under the event storages' own locks; the
        // release below publishes the record writes to later readers.
        self.storage.access.release_write();
    }
}

use super::record::RecordBox;
use super::RepositoryError;
use crate::borrow::ConflictLatch;
use crate::interner::InternedString;
use crate::reflection::StructDescription;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Storage for one event type.
///
/// Events are produced through insertion packages and delivered to every live
/// fetch query; a fetch query only sees events inserted after it was created.
/// When no fetch query exists, insertion is elided entirely: `insert` hands
/// out no package and allocates nothing.
pub struct EventStorage {
    type_name: InternedString,
    description: RwLock<Arc<StructDescription>>,
    serving: Arc<AtomicBool>,
    subscribers: Mutex<Vec<Subscriber>>,
    subscriber_count: AtomicUsize,
    // Safeguard: insertion while a fetch access is open on the same storage
    // is a conflict.
    fetch_accesses: AtomicI32,
    conflict: ConflictLatch,
}

struct Subscriber {
    sender: Sender<Arc<RecordBox>>,
    dead: Arc<AtomicBool>,
}

impl EventStorage {
    pub(crate) fn new(description: Arc<StructDescription>, serving: Arc<AtomicBool>) -> Self {
        EventStorage {
            type_name: description.name,
            description: RwLock::new(description),
            serving,
            subscribers: Mutex::new(Vec::new()),
            subscriber_count: AtomicUsize::new(0),
            fetch_accesses: AtomicI32::new(0),
            conflict: ConflictLatch::new(),
        }
    }

    pub fn type_name(&self) -> InternedString {
        self.type_name
    }

    pub(crate) fn description(&self) -> Arc<StructDescription> {
        self.description.read().clone()
    }

    pub(crate) fn replace_description(&self, description: Arc<StructDescription>) {
        *self.description.write() = description;
    }

    pub(crate) fn has_subscribers(&self) -> bool {
        self.subscriber_count.load(Ordering::Acquire) > 0
    }

    /// Fires an event through a fill callback, skipping all work when nobody
    /// listens. Used by automatic triggers and internal producers.
    pub(crate) fn insert_with(&self, fill: impl FnOnce(*mut u8, &StructDescription)) -> bool {
        if !self.has_subscribers() {
            return false;
        }

        let description = self.description();
        let record = RecordBox::new(description.clone());
        fill(record.data(), &description);
        self.publish(Arc::new(record));
        true
    }

    fn publish(&self, record: Arc<RecordBox>) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| !subscriber.dead.load(Ordering::Acquire));
        for subscriber in subscribers.iter() {
            // A dropped receiver is pruned on the next publish.
            let _ = subscriber.sender.send(record.clone());
        }
    }

    pub fn insert_query(self: &Arc<Self>) -> Result<EventInsertQuery, RepositoryError> {
        if self.serving.load(Ordering::Acquire) {
            return Err(RepositoryError::NotInPlanning {
                type_name: self.type_name,
            });
        }
        Ok(EventInsertQuery {
            storage: self.clone(),
        })
    }

    pub fn fetch_query(self: &Arc<Self>) -> Result<EventFetchQuery, RepositoryError> {
        if self.serving.load(Ordering::Acquire) {
            return Err(RepositoryError::NotInPlanning {
                type_name: self.type_name,
            });
        }

        let (sender, receiver) = unbounded();
        let dead = Arc::new(AtomicBool::new(false));
        self.subscribers.lock().push(Subscriber {
            sender,
            dead: dead.clone(),
        });
        self.subscriber_count.fetch_add(1, Ordering::AcqRel);

        Ok(EventFetchQuery {
            storage: self.clone(),
            receiver,
            dead,
        })
    }
}

pub struct EventInsertQuery {
    storage: Arc<EventStorage>,
}

impl EventInsertQuery {
    /// Opens an insertion package, or `None` when insertion is elided (no
    /// subscribers), illegal (planning mode) or conflicting with an open
    /// fetch access.
    pub fn execute(&self) -> Option<EventInsertionPackage> {
        let storage = &self.storage;
        if !storage.serving.load(Ordering::Acquire) {
            storage.conflict.report(storage.type_name, "event_insert_in_planning");
            return None;
        }

        if storage.fetch_accesses.load(Ordering::Acquire) > 0 {
            storage.conflict.report(storage.type_name, "event_insert_during_fetch");
            return None;
        }

        if !storage.has_subscribers() {
            return None;
        }

        let description = storage.description();
        Some(EventInsertionPackage {
            storage: storage.clone(),
            record: Some(RecordBox::new(description)),
        })
    }
}

/// Scope-guarded event builder: `submit` publishes, dropping without submit
/// undoes the insertion.
pub struct EventInsertionPackage {
    storage: Arc<EventStorage>,
    record: Option<RecordBox>,
}

impl EventInsertionPackage {
    pub fn get<T: 'static>(&mut self) -> &mut T {
        unsafe { self.record.as_ref().unwrap().typed_mut() }
    }

    pub fn data(&mut self) -> *mut u8 {
        self.record.as_ref().unwrap().data()
    }

    pub fn submit(mut self) {
        let record = self.record.take().unwrap();
        self.storage.publish(Arc::new(record));
    }
}

pub struct EventFetchQuery {
    storage: Arc<EventStorage>,
    receiver: Receiver<Arc<RecordBox>>,
    dead: Arc<AtomicBool>,
}

impl EventFetchQuery {
    pub fn execute(&self) -> Option<EventFetchAccess<'_>> {
        if !self.storage.serving.load(Ordering::Acquire) {
            self.storage
                .conflict
                .report(self.storage.type_name, "event_fetch_in_planning");
            return None;
        }

        self.storage.fetch_accesses.fetch_add(1, Ordering::AcqRel);
        Some(EventFetchAccess {
            storage: &self.storage,
            receiver: &self.receiver,
        })
    }
}

impl Drop for EventFetchQuery {
    fn drop(&mut self) {
        self.dead.store(true, Ordering::Release);
        self.storage.subscriber_count.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct EventFetchAccess<'a> {
    storage: &'a EventStorage,
    receiver: &'a Receiver<Arc<RecordBox>>,
}

impl<'a> EventFetchAccess<'a> {
    /// Pops the next pending event, if any.
    pub fn next(&mut self) -> Option<EventRead> {
        self.receiver.try_recv().ok().map(|record| EventRead { record })
    }
}

impl<'a> Drop for EventFetchAccess<'a> {
    fn drop(&mut self) {
        self.storage.fetch_accesses.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One consumed event. Shared between subscribers, hence read-only.
pub struct EventRead {
    record: Arc<RecordBox>,
}

impl EventRead {
    pub fn get<T: 'static>(&self) -> &T {
        unsafe { self.record.typed() }
    }

    pub fn bytes(&self) -> &[u8] {
        self.record.bytes()
    }

    pub fn description(&self) -> &Arc<StructDescription> {
        self.record.description()
    }
}

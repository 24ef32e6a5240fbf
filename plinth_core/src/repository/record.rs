use crate::reflection::StructDescription;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

/// Heap allocation holding one record laid out per its struct description.
///
/// Memory is zeroed, then the description's init hook runs; the shutdown hook
/// runs on drop. The box never moves its payload, so raw pointers handed out
/// by accesses stay valid for the lifetime of the box. Aliasing is governed
/// by the access counters in the owning storage, not by Rust references.
pub struct RecordBox {
    data: NonNull<u8>,
    description: Arc<StructDescription>,
}

unsafe impl Send for RecordBox {}
unsafe impl Sync for RecordBox {}

impl RecordBox {
    pub fn new(description: Arc<StructDescription>) -> Self {
        let data = if description.size == 0 {
            NonNull::<u8>::dangling()
        } else {
            let layout = Self::layout(&description);
            let raw = unsafe { alloc_zeroed(layout) };
            NonNull::new(raw).expect("record allocation failed")
        };

        if let Some(init) = &description.init {
            init(data.as_ptr());
        }

        RecordBox { data, description }
    }

    fn layout(description: &StructDescription) -> Layout {
        Layout::from_size_align(description.size as usize, description.align.max(1) as usize)
            .expect("record layout")
    }

    pub fn description(&self) -> &Arc<StructDescription> {
        &self.description
    }

    pub fn data(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.description.size as usize) }
    }

    /// # Safety
    /// Caller must hold a read or write token covering this record.
    pub unsafe fn typed<T: 'static>(&self) -> &T {
        assert!(
            self.description.is_bound_to::<T>(),
            "record type {} is not bound to the requested Rust type",
            self.description.name
        );
        &*self.data.as_ptr().cast::<T>()
    }

    /// # Safety
    /// Caller must hold the write token covering this record.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn typed_mut<T: 'static>(&self) -> &mut T {
        assert!(
            self.description.is_bound_to::<T>(),
            "record type {} is not bound to the requested Rust type",
            self.description.name
        );
        &mut *self.data.as_ptr().cast::<T>()
    }
}

impl Drop for RecordBox {
    fn drop(&mut self) {
        if let Some(shutdown) = &self.description.shutdown {
            shutdown(self.data.as_ptr());
        }

        if self.description.size > 0 {
            unsafe { dealloc(self.data.as_ptr(), Self::layout(&self.description)) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interner::{intern, InternedString};
    use crate::reflection::{FieldArchetype, Reflected, StructDescriptionBuilder};

    #[derive(Default)]
    #[repr(C)]
    struct Sample {
        count: u64,
        label: InternedString,
    }

    impl Reflected for Sample {
        fn type_name() -> InternedString {
            intern("sample")
        }

        fn describe() -> crate::reflection::StructDescription {
            StructDescriptionBuilder::for_type::<Sample>("sample")
                .field("count", std::mem::offset_of!(Sample, count), FieldArchetype::U64)
                .field(
                    "label",
                    std::mem::offset_of!(Sample, label),
                    FieldArchetype::InternedString,
                )
                .build()
        }
    }

    #[test]
    fn init_produces_default() {
        let record = RecordBox::new(Arc::new(Sample::describe()));
        let sample: &Sample = unsafe { record.typed() };
        assert_eq!(sample.count, 0);
        assert!(sample.label.is_empty());
    }

    #[test]
    fn mutation_through_raw_pointer() {
        let record = RecordBox::new(Arc::new(Sample::describe()));
        unsafe {
            let sample: &mut Sample = record.typed_mut();
            sample.count = 11;
            sample.label = intern("granite");
        }
        let sample: &Sample = unsafe { record.typed() };
        assert_eq!(sample.count, 11);
        assert_eq!(sample.label, intern("granite"));
    }
}

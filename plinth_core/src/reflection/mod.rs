//! Read-only descriptions of record layouts and the typed meta registry.
//!
//! The repository, universe and resource pipeline never hardcode the types
//! they operate on: storage layouts, change-event triggers, cascade rules and
//! build rules are all discovered through `Registry` lookups. Descriptions
//! may be backed by a Rust type (via [`Reflected`]) or synthesized at runtime
//! with no backing type at all, which is how the resource provider creates
//! per-resource container records.

pub mod dynarray;
pub mod patch;

use crate::interner::InternedString;
use dynarray::DynArray;
use fxhash::{FxHashMap, FxHasher};
use patch::Patch;
use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ReflectionError {
    #[error("type {name} is not registered")]
    UnknownType { name: InternedString },

    #[error("type {type_name} has no field {field}")]
    UnknownField {
        type_name: InternedString,
        field: InternedString,
    },

    #[error("field path descends through non-struct field {field} of {type_name}")]
    PathThroughNonStruct {
        type_name: InternedString,
        field: InternedString,
    },

    #[error("field of {type_name} has size {expected}, value has size {actual}")]
    FieldSizeMismatch {
        type_name: InternedString,
        expected: u32,
        actual: u32,
    },

    #[error("patch chunk at {offset}+{size} does not fit into {type_name}")]
    PatchOutOfBounds {
        type_name: InternedString,
        offset: u32,
        size: u32,
    },
}

/// Classification of a reflected field, driving index keys, serialization
/// and migration compatibility.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldArchetype {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    InternedString,
    Enum {
        type_name: InternedString,
    },
    Struct {
        type_name: InternedString,
    },
    /// Dynamic array of trivially copyable elements.
    Array {
        element: Box<FieldArchetype>,
        element_size: u32,
        element_align: u32,
    },
    Patch,
}

impl FieldArchetype {
    pub fn scalar_size(&self) -> Option<u32> {
        match self {
            FieldArchetype::Bool | FieldArchetype::I8 | FieldArchetype::U8 => Some(1),
            FieldArchetype::I16 | FieldArchetype::U16 => Some(2),
            FieldArchetype::I32
            | FieldArchetype::U32
            | FieldArchetype::F32
            | FieldArchetype::InternedString
            | FieldArchetype::Enum { .. } => Some(4),
            FieldArchetype::I64 | FieldArchetype::U64 | FieldArchetype::F64 => Some(8),
            _ => None,
        }
    }

    pub fn is_scalar(&self) -> bool {
        self.scalar_size().is_some()
    }

    /// Whether two archetypes describe migration-compatible storage.
    pub fn compatible_with(&self, other: &FieldArchetype) -> bool {
        match (self, other) {
            (FieldArchetype::Struct { type_name: a }, FieldArchetype::Struct { type_name: b }) => {
                a == b
            }
            (
                FieldArchetype::Array { element: a, .. },
                FieldArchetype::Array { element: b, .. },
            ) => a.compatible_with(b),
            (a, b) => a == b,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FieldDescription {
    pub name: InternedString,
    pub offset: u32,
    pub size: u32,
    pub archetype: FieldArchetype,
}

/// Erased hook invoked with a pointer to record memory.
pub type RecordHook = Arc<dyn Fn(*mut u8) + Send + Sync>;

/// Layout and lifecycle description of one record type.
pub struct StructDescription {
    pub name: InternedString,
    pub size: u32,
    pub align: u32,
    pub fields: Vec<FieldDescription>,
    /// Present when the description is backed by a Rust type.
    pub type_id: Option<TypeId>,
    /// Runs over zeroed memory to produce a value-initialised record.
    pub init: Option<RecordHook>,
    /// Runs before record memory is released.
    pub shutdown: Option<RecordHook>,
}

impl StructDescription {
    pub fn field(&self, name: InternedString) -> Option<&FieldDescription> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn is_bound_to<T: 'static>(&self) -> bool {
        self.type_id == Some(TypeId::of::<T>())
    }
}

impl fmt::Debug for StructDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StructDescription")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("align", &self.align)
            .field("fields", &self.fields)
            .finish()
    }
}

/// Description of a `#[repr(u32)]` enum: variant value is variant index.
#[derive(Clone, Debug)]
pub struct EnumDescription {
    pub name: InternedString,
    pub variants: Vec<InternedString>,
}

impl EnumDescription {
    pub fn variant_index(&self, name: InternedString) -> Option<u32> {
        self.variants
            .iter()
            .position(|variant| *variant == name)
            .map(|index| index as u32)
    }
}

/// Rust types that expose their layout to the registry.
pub trait Reflected: Default + Send + Sync + 'static {
    fn type_name() -> InternedString;
    fn describe() -> StructDescription;
}

pub struct StructDescriptionBuilder {
    description: StructDescription,
}

impl StructDescriptionBuilder {
    /// Starts a description backed by a Rust type; size, alignment, init and
    /// shutdown are derived from the type itself.
    pub fn for_type<T: Default + Send + Sync + 'static>(name: &str) -> Self {
        StructDescriptionBuilder {
            description: StructDescription {
                name: InternedString::new(name),
                size: std::mem::size_of::<T>() as u32,
                align: std::mem::align_of::<T>() as u32,
                fields: Vec::new(),
                type_id: Some(TypeId::of::<T>()),
                init: Some(Arc::new(|target| unsafe {
                    target.cast::<T>().write(T::default());
                })),
                shutdown: Some(Arc::new(|target| unsafe {
                    std::ptr::drop_in_place(target.cast::<T>());
                })),
            },
        }
    }

    /// Starts a runtime-synthesized description with no backing Rust type.
    pub fn dynamic(name: InternedString, size: u32, align: u32) -> Self {
        StructDescriptionBuilder {
            description: StructDescription {
                name,
                size,
                align,
                fields: Vec::new(),
                type_id: None,
                init: None,
                shutdown: None,
            },
        }
    }

    pub fn field(mut self, name: &str, offset: usize, archetype: FieldArchetype) -> Self {
        let size = match &archetype {
            FieldArchetype::Array { .. } => std::mem::size_of::<DynArray>() as u32,
            FieldArchetype::Patch => std::mem::size_of::<Patch>() as u32,
            other => other
                .scalar_size()
                .expect("struct fields need explicit size, use sized_field"),
        };
        self.description.fields.push(FieldDescription {
            name: InternedString::new(name),
            offset: offset as u32,
            size,
            archetype,
        });
        self
    }

    /// For nested struct fields whose size the builder cannot derive.
    pub fn sized_field(
        mut self,
        name: &str,
        offset: usize,
        size: usize,
        archetype: FieldArchetype,
    ) -> Self {
        self.description.fields.push(FieldDescription {
            name: InternedString::new(name),
            offset: offset as u32,
            size: size as u32,
            archetype,
        });
        self
    }

    pub fn init(mut self, hook: RecordHook) -> Self {
        self.description.init = Some(hook);
        self
    }

    pub fn shutdown(mut self, hook: RecordHook) -> Self {
        self.description.shutdown = Some(hook);
        self
    }

    pub fn build(mut self) -> StructDescription {
        self.description
            .fields
            .sort_by_key(|field| field.offset);
        self.description
    }
}

struct MetaRecord {
    meta_type: TypeId,
    value: Arc<dyn Any + Send + Sync>,
}

/// Immutable snapshot of every known struct, enum and meta record.
///
/// Swapping in a new snapshot (after e.g. a plugin reload) is what drives
/// repository migration.
#[derive(Default)]
pub struct Registry {
    structs: FxHashMap<InternedString, Arc<StructDescription>>,
    enums: FxHashMap<InternedString, Arc<EnumDescription>>,
    struct_meta: FxHashMap<InternedString, Vec<MetaRecord>>,
    field_meta: FxHashMap<(InternedString, InternedString), Vec<MetaRecord>>,
}

impl Registry {
    pub fn find_struct(&self, name: InternedString) -> Option<&Arc<StructDescription>> {
        self.structs.get(&name)
    }

    pub fn find_enum(&self, name: InternedString) -> Option<&Arc<EnumDescription>> {
        self.enums.get(&name)
    }

    pub fn structs(&self) -> impl Iterator<Item = &Arc<StructDescription>> {
        self.structs.values()
    }

    /// All meta records of type `M` attached to the given struct.
    pub fn struct_meta<M: Send + Sync + 'static>(
        &self,
        type_name: InternedString,
    ) -> impl Iterator<Item = &M> {
        self.struct_meta
            .get(&type_name)
            .into_iter()
            .flatten()
            .filter(|record| record.meta_type == TypeId::of::<M>())
            .filter_map(|record| record.value.downcast_ref::<M>())
    }

    /// All meta records of type `M` attached to the given field.
    pub fn field_meta<M: Send + Sync + 'static>(
        &self,
        type_name: InternedString,
        field: InternedString,
    ) -> impl Iterator<Item = &M> {
        self.field_meta
            .get(&(type_name, field))
            .into_iter()
            .flatten()
            .filter(|record| record.meta_type == TypeId::of::<M>())
            .filter_map(|record| record.value.downcast_ref::<M>())
    }

    /// Every struct that carries at least one meta record of type `M`.
    pub fn structs_with_meta<M: Send + Sync + 'static>(
        &self,
    ) -> impl Iterator<Item = (InternedString, &M)> {
        self.struct_meta.iter().flat_map(|(type_name, records)| {
            records
                .iter()
                .filter(|record| record.meta_type == TypeId::of::<M>())
                .filter_map(|record| record.value.downcast_ref::<M>())
                .map(move |meta| (*type_name, meta))
        })
    }

    /// Every `(field, meta)` pair of meta type `M` on fields of the struct.
    pub fn fields_with_meta<M: Send + Sync + 'static>(
        &self,
        type_name: InternedString,
    ) -> impl Iterator<Item = (InternedString, &M)> {
        self.field_meta
            .iter()
            .filter(move |((owner, _), _)| *owner == type_name)
            .flat_map(|((_, field), records)| {
                records
                    .iter()
                    .filter(|record| record.meta_type == TypeId::of::<M>())
                    .filter_map(|record| record.value.downcast_ref::<M>())
                    .map(move |meta| (*field, meta))
            })
    }

    /// Resolves a dotted field path to an absolute offset within the root
    /// struct. Paths descend struct fields only; dynamic arrays are not
    /// addressable.
    pub fn resolve_path(
        &self,
        root: &StructDescription,
        path: &[InternedString],
    ) -> Result<PathResolution, ReflectionError> {
        assert!(!path.is_empty(), "field path cannot be empty");
        let mut offset = 0u32;
        let mut current = root.name;
        let mut current_fields: &[FieldDescription] = &root.fields;

        for (position, segment) in path.iter().enumerate() {
            let field = current_fields
                .iter()
                .find(|field| field.name == *segment)
                .ok_or(ReflectionError::UnknownField {
                    type_name: current,
                    field: *segment,
                })?;
            offset += field.offset;

            if position + 1 == path.len() {
                return Ok(PathResolution {
                    offset,
                    size: field.size,
                    archetype: field.archetype.clone(),
                });
            }

            match &field.archetype {
                FieldArchetype::Struct { type_name } => {
                    let nested =
                        self.find_struct(*type_name)
                            .ok_or(ReflectionError::UnknownType { name: *type_name })?;
                    current = nested.name;
                    current_fields = &nested.fields;
                }
                _ => {
                    return Err(ReflectionError::PathThroughNonStruct {
                        type_name: current,
                        field: *segment,
                    })
                }
            }
        }

        unreachable!()
    }

    /// Content fingerprint of an instance: stable for equal values regardless
    /// of interner id assignment, used for byproduct deduplication and value
    /// index keys.
    ///
    /// # Safety
    /// `bytes` must be a valid instance of `description`.
    pub unsafe fn hash_instance(&self, description: &StructDescription, bytes: *const u8) -> u64 {
        let mut hasher = FxHasher::default();
        self.hash_struct_contents(description, bytes, &mut hasher);
        hasher.finish()
    }

    unsafe fn hash_struct_contents(
        &self,
        description: &StructDescription,
        bytes: *const u8,
        hasher: &mut FxHasher,
    ) {
        for field in &description.fields {
            self.hash_field(&field.archetype, field.size, bytes.add(field.offset as usize), hasher);
        }
    }

    unsafe fn hash_field(
        &self,
        archetype: &FieldArchetype,
        size: u32,
        bytes: *const u8,
        hasher: &mut FxHasher,
    ) {
        match archetype {
            FieldArchetype::InternedString => {
                let handle = bytes.cast::<InternedString>().read_unaligned();
                handle.as_str().hash(hasher);
            }
            FieldArchetype::Struct { type_name } => {
                if let Some(nested) = self.find_struct(*type_name) {
                    self.hash_struct_contents(nested, bytes, hasher);
                }
            }
            FieldArchetype::Array {
                element,
                element_size,
                ..
            } => {
                let array = &*bytes.cast::<DynArray>();
                array.len().hash(hasher);
                for index in 0..array.len() {
                    self.hash_field(element, *element_size, array.at(index), hasher);
                }
            }
            FieldArchetype::Patch => {
                let patch = &*bytes.cast::<Patch>();
                patch.type_name().as_str().hash(hasher);
                for chunk in patch.chunks() {
                    chunk.offset.hash(hasher);
                    chunk.data.hash(hasher);
                }
            }
            _ => {
                std::slice::from_raw_parts(bytes, size as usize).hash(hasher);
            }
        }
    }

    /// Deep equality of two instances of the same description.
    ///
    /// # Safety
    /// Both pointers must be valid instances of `description`.
    pub unsafe fn instances_equal(
        &self,
        description: &StructDescription,
        left: *const u8,
        right: *const u8,
    ) -> bool {
        description.fields.iter().all(|field| {
            self.fields_equal(
                &field.archetype,
                field.size,
                left.add(field.offset as usize),
                right.add(field.offset as usize),
            )
        })
    }

    unsafe fn fields_equal(
        &self,
        archetype: &FieldArchetype,
        size: u32,
        left: *const u8,
        right: *const u8,
    ) -> bool {
        match archetype {
            FieldArchetype::Struct { type_name } => match self.find_struct(*type_name) {
                Some(nested) => self.instances_equal(nested, left, right),
                None => false,
            },
            FieldArchetype::Array {
                element,
                element_size,
                ..
            } => {
                let left = &*left.cast::<DynArray>();
                let right = &*right.cast::<DynArray>();
                left.len() == right.len()
                    && (0..left.len()).all(|index| {
                        self.fields_equal(element, *element_size, left.at(index), right.at(index))
                    })
            }
            FieldArchetype::Patch => *left.cast::<Patch>() == *right.cast::<Patch>(),
            _ => {
                std::slice::from_raw_parts(left, size as usize)
                    == std::slice::from_raw_parts(right, size as usize)
            }
        }
    }

    /// Copies one field between two records, cloning reflection-managed
    /// payloads. The destination field must already be value-initialised.
    ///
    /// # Safety
    /// Pointers must address valid fields of the given archetype.
    pub unsafe fn copy_field(
        &self,
        archetype: &FieldArchetype,
        size: u32,
        source: *const u8,
        target: *mut u8,
    ) {
        match archetype {
            FieldArchetype::Struct { type_name } => {
                if let Some(nested) = self.find_struct(*type_name) {
                    for field in &nested.fields {
                        self.copy_field(
                            &field.archetype,
                            field.size,
                            source.add(field.offset as usize),
                            target.add(field.offset as usize),
                        );
                    }
                }
            }
            FieldArchetype::Array { .. } => {
                let source = &*source.cast::<DynArray>();
                let target = &mut *target.cast::<DynArray>();
                *target = source.clone();
            }
            FieldArchetype::Patch => {
                let source = &*source.cast::<Patch>();
                let target = &mut *target.cast::<Patch>();
                *target = source.clone();
            }
            _ => {
                std::ptr::copy_nonoverlapping(source, target, size as usize);
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct PathResolution {
    pub offset: u32,
    pub size: u32,
    pub archetype: FieldArchetype,
}

#[derive(Default)]
pub struct RegistryBuilder {
    registry: Registry,
}

enum DynamicHook {
    ArrayLayout {
        offset: u32,
        element_size: u32,
        element_align: u32,
    },
    PatchDefault {
        offset: u32,
    },
    Nested {
        offset: u32,
        hook: RecordHook,
    },
    ArrayDrop {
        offset: u32,
    },
    PatchDrop {
        offset: u32,
    },
}

impl RegistryBuilder {
    pub fn new() -> Self {
        RegistryBuilder::default()
    }

    pub fn add_type<T: Reflected>(&mut self) -> &mut Self {
        let description = T::describe();
        debug_assert!(description.is_bound_to::<T>());
        self.registry
            .structs
            .insert(description.name, Arc::new(description));
        self
    }

    /// Registers a runtime-synthesized struct, composing init and shutdown
    /// hooks for reflection-managed fields (arrays, patches, nested structs
    /// with hooks of their own). Nested struct types must be registered
    /// before the types that embed them.
    pub fn add_dynamic_struct(&mut self, description: StructDescription) -> &mut Self {
        let mut init_hooks = Vec::new();
        let mut shutdown_hooks = Vec::new();

        for field in &description.fields {
            match &field.archetype {
                FieldArchetype::Array {
                    element_size,
                    element_align,
                    ..
                } => {
                    init_hooks.push(DynamicHook::ArrayLayout {
                        offset: field.offset,
                        element_size: *element_size,
                        element_align: *element_align,
                    });
                    shutdown_hooks.push(DynamicHook::ArrayDrop {
                        offset: field.offset,
                    });
                }
                FieldArchetype::Patch => {
                    init_hooks.push(DynamicHook::PatchDefault {
                        offset: field.offset,
                    });
                    shutdown_hooks.push(DynamicHook::PatchDrop {
                        offset: field.offset,
                    });
                }
                FieldArchetype::Struct { type_name } => {
                    if let Some(nested) = self.registry.find_struct(*type_name) {
                        if let Some(hook) = nested.init.clone() {
                            init_hooks.push(DynamicHook::Nested {
                                offset: field.offset,
                                hook,
                            });
                        }
                        if let Some(hook) = nested.shutdown.clone() {
                            shutdown_hooks.push(DynamicHook::Nested {
                                offset: field.offset,
                                hook,
                            });
                        }
                    }
                }
                _ => {}
            }
        }

        let mut description = description;
        if description.init.is_none() && !init_hooks.is_empty() {
            description.init = Some(Arc::new(move |target: *mut u8| {
                for hook in &init_hooks {
                    unsafe {
                        match hook {
                            DynamicHook::ArrayLayout {
                                offset,
                                element_size,
                                element_align,
                            } => {
                                target
                                    .add(*offset as usize)
                                    .cast::<DynArray>()
                                    .write(DynArray::with_layout(*element_size, *element_align));
                            }
                            DynamicHook::PatchDefault { offset } => {
                                target
                                    .add(*offset as usize)
                                    .cast::<Patch>()
                                    .write(Patch::default());
                            }
                            DynamicHook::Nested { offset, hook } => {
                                hook(target.add(*offset as usize));
                            }
                            _ => {}
                        }
                    }
                }
            }));
        }

        if description.shutdown.is_none() && !shutdown_hooks.is_empty() {
            description.shutdown = Some(Arc::new(move |target: *mut u8| {
                for hook in &shutdown_hooks {
                    unsafe {
                        match hook {
                            DynamicHook::ArrayDrop { offset } => {
                                std::ptr::drop_in_place(
                                    target.add(*offset as usize).cast::<DynArray>(),
                                );
                            }
                            DynamicHook::PatchDrop { offset } => {
                                std::ptr::drop_in_place(
                                    target.add(*offset as usize).cast::<Patch>(),
                                );
                            }
                            DynamicHook::Nested { offset, hook } => {
                                hook(target.add(*offset as usize));
                            }
                            _ => {}
                        }
                    }
                }
            }));
        }

        self.registry
            .structs
            .insert(description.name, Arc::new(description));
        self
    }

    pub fn add_enum(&mut self, description: EnumDescription) -> &mut Self {
        self.registry
            .enums
            .insert(description.name, Arc::new(description));
        self
    }

    pub fn add_struct_meta<M: Send + Sync + 'static>(
        &mut self,
        type_name: InternedString,
        meta: M,
    ) -> &mut Self {
        self.registry
            .struct_meta
            .entry(type_name)
            .or_default()
            .push(MetaRecord {
                meta_type: TypeId::of::<M>(),
                value: Arc::new(meta),
            });
        self
    }

    pub fn add_field_meta<M: Send + Sync + 'static>(
        &mut self,
        type_name: InternedString,
        field: InternedString,
        meta: M,
    ) -> &mut Self {
        self.registry
            .field_meta
            .entry((type_name, field))
            .or_default()
            .push(MetaRecord {
                meta_type: TypeId::of::<M>(),
                value: Arc::new(meta),
            });
        self
    }

    /// View of everything registered so far, e.g. for derived-type
    /// synthesis that keys off already-registered meta.
    pub fn current(&self) -> &Registry {
        &self.registry
    }

    pub fn build(self) -> Arc<Registry> {
        Arc::new(self.registry)
    }
}

pub fn align_up(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Scalar value read out of a record field, used by index keys and the
/// readable-data format.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Str(InternedString),
    Enum(u32),
}

impl FieldValue {
    pub fn hash_key(&self) -> u64 {
        let mut hasher = FxHasher::default();
        match self {
            FieldValue::Bool(value) => value.hash(&mut hasher),
            FieldValue::Signed(value) => value.hash(&mut hasher),
            FieldValue::Unsigned(value) => value.hash(&mut hasher),
            FieldValue::Float(value) => value.to_bits().hash(&mut hasher),
            FieldValue::Str(value) => value.as_str().hash(&mut hasher),
            FieldValue::Enum(value) => value.hash(&mut hasher),
        }
        hasher.finish()
    }
}

/// Reads a scalar field value; `None` for non-scalar archetypes.
///
/// # Safety
/// `bytes` must address a valid field of the given archetype.
pub unsafe fn read_field_value(archetype: &FieldArchetype, bytes: *const u8) -> Option<FieldValue> {
    Some(match archetype {
        FieldArchetype::Bool => FieldValue::Bool(bytes.read() != 0),
        FieldArchetype::I8 => FieldValue::Signed(bytes.cast::<i8>().read_unaligned() as i64),
        FieldArchetype::I16 => FieldValue::Signed(bytes.cast::<i16>().read_unaligned() as i64),
        FieldArchetype::I32 => FieldValue::Signed(bytes.cast::<i32>().read_unaligned() as i64),
        FieldArchetype::I64 => FieldValue::Signed(bytes.cast::<i64>().read_unaligned()),
        FieldArchetype::U8 => FieldValue::Unsigned(bytes.read() as u64),
        FieldArchetype::U16 => FieldValue::Unsigned(bytes.cast::<u16>().read_unaligned() as u64),
        FieldArchetype::U32 => FieldValue::Unsigned(bytes.cast::<u32>().read_unaligned() as u64),
        FieldArchetype::U64 => FieldValue::Unsigned(bytes.cast::<u64>().read_unaligned()),
        FieldArchetype::F32 => FieldValue::Float(bytes.cast::<f32>().read_unaligned() as f64),
        FieldArchetype::F64 => FieldValue::Float(bytes.cast::<f64>().read_unaligned()),
        FieldArchetype::InternedString => {
            FieldValue::Str(bytes.cast::<InternedString>().read_unaligned())
        }
        FieldArchetype::Enum { .. } => FieldValue::Enum(bytes.cast::<u32>().read_unaligned()),
        _ => return None,
    })
}

/// Writes a scalar field value with numeric coercion.
///
/// # Safety
/// `bytes` must address a valid, writable field of the given archetype.
pub unsafe fn write_field_value(
    archetype: &FieldArchetype,
    bytes: *mut u8,
    value: FieldValue,
) -> bool {
    let as_signed = |value: FieldValue| -> Option<i64> {
        match value {
            FieldValue::Signed(inner) => Some(inner),
            FieldValue::Unsigned(inner) => Some(inner as i64),
            _ => None,
        }
    };
    let as_unsigned = |value: FieldValue| -> Option<u64> {
        match value {
            FieldValue::Unsigned(inner) => Some(inner),
            FieldValue::Signed(inner) if inner >= 0 => Some(inner as u64),
            _ => None,
        }
    };
    let as_float = |value: FieldValue| -> Option<f64> {
        match value {
            FieldValue::Float(inner) => Some(inner),
            FieldValue::Signed(inner) => Some(inner as f64),
            FieldValue::Unsigned(inner) => Some(inner as f64),
            _ => None,
        }
    };

    match archetype {
        FieldArchetype::Bool => match value {
            FieldValue::Bool(inner) => bytes.write(inner as u8),
            _ => return false,
        },
        FieldArchetype::I8 => match as_signed(value) {
            Some(inner) => bytes.cast::<i8>().write_unaligned(inner as i8),
            None => return false,
        },
        FieldArchetype::I16 => match as_signed(value) {
            Some(inner) => bytes.cast::<i16>().write_unaligned(inner as i16),
            None => return false,
        },
        FieldArchetype::I32 => match as_signed(value) {
            Some(inner) => bytes.cast::<i32>().write_unaligned(inner as i32),
            None => return false,
        },
        FieldArchetype::I64 => match as_signed(value) {
            Some(inner) => bytes.cast::<i64>().write_unaligned(inner),
            None => return false,
        },
        FieldArchetype::U8 => match as_unsigned(value) {
            Some(inner) => bytes.write(inner as u8),
            None => return false,
        },
        FieldArchetype::U16 => match as_unsigned(value) {
            Some(inner) => bytes.cast::<u16>().write_unaligned(inner as u16),
            None => return false,
        },
        FieldArchetype::U32 => match as_unsigned(value) {
            Some(inner) => bytes.cast::<u32>().write_unaligned(inner as u32),
            None => return false,
        },
        FieldArchetype::U64 => match as_unsigned(value) {
            Some(inner) => bytes.cast::<u64>().write_unaligned(inner),
            None => return false,
        },
        FieldArchetype::F32 => match as_float(value) {
            Some(inner) => bytes.cast::<f32>().write_unaligned(inner as f32),
            None => return false,
        },
        FieldArchetype::F64 => match as_float(value) {
            Some(inner) => bytes.cast::<f64>().write_unaligned(inner),
            None => return false,
        },
        FieldArchetype::InternedString => match value {
            FieldValue::Str(inner) => bytes.cast::<InternedString>().write_unaligned(inner),
            _ => return false,
        },
        FieldArchetype::Enum { .. } => match value {
            FieldValue::Enum(inner) => bytes.cast::<u32>().write_unaligned(inner),
            FieldValue::Unsigned(inner) => bytes.cast::<u32>().write_unaligned(inner as u32),
            _ => return false,
        },
        _ => return false,
    }
    true
}

/// Builds a field path from string literals.
pub fn field_path(segments: &[&str]) -> Vec<InternedString> {
    segments
        .iter()
        .map(|segment| InternedString::new(segment))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interner::intern;

    #[derive(Default)]
    #[repr(C)]
    struct Inner {
        value: u64,
        weight: f32,
    }

    impl Reflected for Inner {
        fn type_name() -> InternedString {
            intern("inner")
        }

        fn describe() -> StructDescription {
            StructDescriptionBuilder::for_type::<Inner>("inner")
                .field("value", std::mem::offset_of!(Inner, value), FieldArchetype::U64)
                .field(
                    "weight",
                    std::mem::offset_of!(Inner, weight),
                    FieldArchetype::F32,
                )
                .build()
        }
    }

    #[derive(Default)]
    #[repr(C)]
    struct Outer {
        id: u32,
        name: InternedString,
        inner: Inner,
        tags: DynArray,
    }

    impl Reflected for Outer {
        fn type_name() -> InternedString {
            intern("outer")
        }

        fn describe() -> StructDescription {
            StructDescriptionBuilder::for_type::<Outer>("outer")
                .field("id", std::mem::offset_of!(Outer, id), FieldArchetype::U32)
                .field(
                    "name",
                    std::mem::offset_of!(Outer, name),
                    FieldArchetype::InternedString,
                )
                .sized_field(
                    "inner",
                    std::mem::offset_of!(Outer, inner),
                    std::mem::size_of::<Inner>(),
                    FieldArchetype::Struct {
                        type_name: intern("inner"),
                    },
                )
                .field(
                    "tags",
                    std::mem::offset_of!(Outer, tags),
                    FieldArchetype::Array {
                        element: Box::new(FieldArchetype::InternedString),
                        element_size: std::mem::size_of::<InternedString>() as u32,
                        element_align: std::mem::align_of::<InternedString>() as u32,
                    },
                )
                .build()
        }
    }

    fn registry() -> Arc<Registry> {
        let mut builder = RegistryBuilder::new();
        builder.add_type::<Inner>();
        builder.add_type::<Outer>();
        builder.build()
    }

    #[test]
    fn path_resolution_descends_structs() {
        let registry = registry();
        let outer = registry.find_struct(intern("outer")).unwrap();

        let resolved = registry
            .resolve_path(outer, &field_path(&["inner", "value"]))
            .unwrap();
        assert_eq!(
            resolved.offset as usize,
            std::mem::offset_of!(Outer, inner) + std::mem::offset_of!(Inner, value)
        );
        assert_eq!(resolved.archetype, FieldArchetype::U64);
    }

    #[test]
    fn path_through_scalar_fails() {
        let registry = registry();
        let outer = registry.find_struct(intern("outer")).unwrap();
        let result = registry.resolve_path(outer, &field_path(&["id", "value"]));
        assert!(matches!(
            result,
            Err(ReflectionError::PathThroughNonStruct { .. })
        ));
    }

    #[test]
    fn struct_meta_lookup() {
        struct Marker {
            priority: u32,
        }

        let mut builder = RegistryBuilder::new();
        builder.add_type::<Inner>();
        builder.add_struct_meta(intern("inner"), Marker { priority: 3 });
        let registry = builder.build();

        let metas: Vec<_> = registry.struct_meta::<Marker>(intern("inner")).collect();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].priority, 3);

        let all: Vec<_> = registry.structs_with_meta::<Marker>().collect();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, intern("inner"));
    }

    #[test]
    fn instance_hash_tracks_content() {
        let registry = registry();
        let description = registry.find_struct(intern("outer")).unwrap().clone();

        let mut first = Outer::default();
        first.id = 9;
        first.name = intern("rock");
        first.tags.push_copy(intern("stone"));

        let mut second = Outer::default();
        second.id = 9;
        second.name = intern("rock");
        second.tags.push_copy(intern("stone"));

        unsafe {
            let first_ptr = (&first as *const Outer).cast::<u8>();
            let second_ptr = (&second as *const Outer).cast::<u8>();
            assert_eq!(
                registry.hash_instance(&description, first_ptr),
                registry.hash_instance(&description, second_ptr)
            );
            assert!(registry.instances_equal(&description, first_ptr, second_ptr));

            second.tags.push_copy(intern("iron"));
            assert!(!registry.instances_equal(&description, first_ptr, second_ptr));
        }
    }

    #[test]
    fn scalar_value_round_trip() {
        let mut value = 0u32;
        unsafe {
            let pointer = (&mut value as *mut u32).cast::<u8>();
            assert!(write_field_value(
                &FieldArchetype::U32,
                pointer,
                FieldValue::Unsigned(42)
            ));
            assert_eq!(
                read_field_value(&FieldArchetype::U32, pointer),
                Some(FieldValue::Unsigned(42))
            );
        }
    }
}

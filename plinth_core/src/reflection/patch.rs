use super::{PathResolution, ReflectionError, Registry, StructDescription};
use crate::interner::InternedString;

/// One contiguous byte override inside a patch.
#[derive(Clone, Debug, PartialEq)]
pub struct PatchChunk {
    pub offset: u32,
    pub data: Vec<u8>,
}

/// A partial override of a reflected struct, expressed as an ordered list of
/// byte chunks. Applying a patch over a value-initialised instance realises
/// the described value; this is how world configurations and declarative
/// resource data carry "only the fields that differ".
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Patch {
    type_name: InternedString,
    chunks: Vec<PatchChunk>,
}

impl Patch {
    pub fn new(type_name: InternedString) -> Self {
        Patch {
            type_name,
            chunks: Vec::new(),
        }
    }

    pub fn type_name(&self) -> InternedString {
        self.type_name
    }

    pub fn chunks(&self) -> &[PatchChunk] {
        &self.chunks
    }

    /// Adds an override chunk, keeping chunks ordered by offset.
    pub fn add_chunk(&mut self, offset: u32, data: Vec<u8>) {
        let position = self
            .chunks
            .iter()
            .position(|chunk| chunk.offset > offset)
            .unwrap_or(self.chunks.len());
        self.chunks.insert(position, PatchChunk { offset, data });
    }

    /// Records an override of a scalar field addressed by path.
    pub fn set_field<T: Copy>(
        &mut self,
        registry: &Registry,
        path: &[InternedString],
        value: T,
    ) -> Result<(), ReflectionError> {
        let description = registry
            .find_struct(self.type_name)
            .ok_or(ReflectionError::UnknownType {
                name: self.type_name,
            })?;
        let resolved: PathResolution = registry.resolve_path(description, path)?;
        if resolved.size as usize != std::mem::size_of::<T>() {
            return Err(ReflectionError::FieldSizeMismatch {
                type_name: self.type_name,
                expected: resolved.size,
                actual: std::mem::size_of::<T>() as u32,
            });
        }

        let mut data = vec![0u8; resolved.size as usize];
        unsafe {
            std::ptr::copy_nonoverlapping(
                (&value as *const T).cast::<u8>(),
                data.as_mut_ptr(),
                data.len(),
            );
        }
        self.add_chunk(resolved.offset, data);
        Ok(())
    }

    /// Applies the chunks over an already-initialised instance.
    ///
    /// # Safety
    /// `target` must point at least `target_size` writable bytes laid out as
    /// the patch's target type.
    pub unsafe fn apply(&self, target: *mut u8, target_size: u32) -> Result<(), ReflectionError> {
        for chunk in &self.chunks {
            let end = chunk.offset as usize + chunk.data.len();
            if end > target_size as usize {
                return Err(ReflectionError::PatchOutOfBounds {
                    type_name: self.type_name,
                    offset: chunk.offset,
                    size: chunk.data.len() as u32,
                });
            }

            std::ptr::copy_nonoverlapping(
                chunk.data.as_ptr(),
                target.add(chunk.offset as usize),
                chunk.data.len(),
            );
        }

        Ok(())
    }

    pub fn target_description<'a>(
        &self,
        registry: &'a Registry,
    ) -> Result<&'a std::sync::Arc<StructDescription>, ReflectionError> {
        registry
            .find_struct(self.type_name)
            .ok_or(ReflectionError::UnknownType {
                name: self.type_name,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interner::intern;
    use crate::reflection::{FieldArchetype, RegistryBuilder, StructDescriptionBuilder};

    #[derive(Default)]
    #[repr(C)]
    struct Settings {
        width: u32,
        height: u32,
        scale: f32,
    }

    impl crate::reflection::Reflected for Settings {
        fn type_name() -> InternedString {
            intern("settings")
        }

        fn describe() -> crate::reflection::StructDescription {
            StructDescriptionBuilder::for_type::<Settings>("settings")
                .field(
                    "width",
                    std::mem::offset_of!(Settings, width),
                    FieldArchetype::U32,
                )
                .field(
                    "height",
                    std::mem::offset_of!(Settings, height),
                    FieldArchetype::U32,
                )
                .field(
                    "scale",
                    std::mem::offset_of!(Settings, scale),
                    FieldArchetype::F32,
                )
                .build()
        }
    }

    #[test]
    fn apply_over_default() {
        let mut builder = RegistryBuilder::new();
        builder.add_type::<Settings>();
        let registry = builder.build();

        let mut patch = Patch::new(intern("settings"));
        patch
            .set_field(&registry, &[intern("height")], 720u32)
            .unwrap();
        patch
            .set_field(&registry, &[intern("scale")], 1.5f32)
            .unwrap();

        let mut instance = Settings::default();
        unsafe {
            patch
                .apply(
                    (&mut instance as *mut Settings).cast::<u8>(),
                    std::mem::size_of::<Settings>() as u32,
                )
                .unwrap();
        }

        assert_eq!(instance.width, 0);
        assert_eq!(instance.height, 720);
        assert!((instance.scale - 1.5).abs() < f32::EPSILON);
    }

    #[test]
    fn out_of_bounds_chunk_is_rejected() {
        let mut patch = Patch::new(intern("settings"));
        patch.add_chunk(64, vec![0u8; 16]);
        let mut byte = 0u8;
        let result = unsafe { patch.apply(&mut byte as *mut u8, 1) };
        assert!(result.is_err());
    }
}

//! Chunked binary record format.
//!
//! Layout: a four-byte magic, the interned type name (length-prefixed utf8),
//! then one chunk per field, `(field ordinal: u16, payload length: u32,
//! payload)`, terminated by ordinal `0xFFFF`. The reader is streamable: one
//! top-level chunk is consumed per `read_chunk` call until `Finished`.
//! Interned strings travel as text, never as process-local ids.

use crate::interner::{intern, InternedString};
use crate::reflection::{
    dynarray::DynArray, patch::Patch, FieldArchetype, Registry, StructDescription,
};
use crate::repository::record::RecordBox;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::sync::Arc;
use thiserror::Error;

const MAGIC: &[u8; 4] = b"PLRB";
const END_MARKER: u16 = 0xFFFF;

#[derive(Debug, Error)]
pub enum BinaryError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad magic, not a plinth binary resource")]
    BadMagic,

    #[error("document type {found} does not match expected type {expected}")]
    TypeMismatch {
        expected: InternedString,
        found: InternedString,
    },

    #[error("type {name} is not registered")]
    UnknownType { name: InternedString },

    #[error("chunk references field ordinal {ordinal} outside of type {type_name}")]
    UnknownField {
        type_name: InternedString,
        ordinal: u16,
    },

    #[error("malformed payload for field {field} of {type_name}")]
    MalformedPayload {
        type_name: InternedString,
        field: InternedString,
    },
}

fn write_string(writer: &mut impl Write, text: &str) -> Result<(), BinaryError> {
    writer.write_u16::<LittleEndian>(text.len() as u16)?;
    writer.write_all(text.as_bytes())?;
    Ok(())
}

fn read_string(reader: &mut impl Read) -> Result<InternedString, BinaryError> {
    let length = reader.read_u16::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; length];
    reader.read_exact(&mut bytes)?;
    Ok(intern(std::str::from_utf8(&bytes).map_err(|_| BinaryError::BadMagic)?))
}

/// Serializes a record.
///
/// # Safety
/// `data` must be a valid instance of `description`.
pub unsafe fn write_binary(
    writer: &mut impl Write,
    registry: &Registry,
    description: &StructDescription,
    data: *const u8,
) -> Result<(), BinaryError> {
    writer.write_all(MAGIC)?;
    write_string(writer, description.name.as_str())?;
    write_struct_chunks(writer, registry, description, data)?;
    Ok(())
}

unsafe fn write_struct_chunks(
    writer: &mut impl Write,
    registry: &Registry,
    description: &StructDescription,
    data: *const u8,
) -> Result<(), BinaryError> {
    for (ordinal, field) in description.fields.iter().enumerate() {
        let mut payload = Vec::new();
        write_field_payload(
            &mut payload,
            registry,
            &field.archetype,
            field.size,
            data.add(field.offset as usize),
        )?;
        writer.write_u16::<LittleEndian>(ordinal as u16)?;
        writer.write_u32::<LittleEndian>(payload.len() as u32)?;
        writer.write_all(&payload)?;
    }
    writer.write_u16::<LittleEndian>(END_MARKER)?;
    Ok(())
}

unsafe fn write_field_payload(
    writer: &mut Vec<u8>,
    registry: &Registry,
    archetype: &FieldArchetype,
    size: u32,
    data: *const u8,
) -> Result<(), BinaryError> {
    match archetype {
        FieldArchetype::InternedString => {
            let handle = data.cast::<InternedString>().read_unaligned();
            write_string(writer, handle.as_str())?;
        }
        FieldArchetype::Struct { type_name } => {
            let nested = registry
                .find_struct(*type_name)
                .ok_or(BinaryError::UnknownType { name: *type_name })?;
            write_struct_chunks(writer, registry, nested, data)?;
        }
        FieldArchetype::Array {
            element,
            element_size,
            ..
        } => {
            let array = &*data.cast::<DynArray>();
            writer.write_u32::<LittleEndian>(array.len() as u32)?;
            for index in 0..array.len() {
                write_field_payload(writer, registry, element, *element_size, array.at(index))?;
            }
        }
        FieldArchetype::Patch => {
            let patch = &*data.cast::<Patch>();
            write_string(writer, patch.type_name().as_str())?;
            writer.write_u32::<LittleEndian>(patch.chunks().len() as u32)?;
            for chunk in patch.chunks() {
                writer.write_u32::<LittleEndian>(chunk.offset)?;
                writer.write_u32::<LittleEndian>(chunk.data.len() as u32)?;
                writer.write_all(&chunk.data)?;
            }
        }
        _ => {
            // Scalars are stored little-endian; in-memory layout already is
            // on every supported platform.
            writer.write_all(std::slice::from_raw_parts(data, size as usize))?;
        }
    }
    Ok(())
}

pub enum ReadState {
    InProgress,
    Finished,
}

/// Streamable reader: call [`BinaryReader::read_chunk`] until `Finished`.
pub struct BinaryReader<'a, R: Read> {
    reader: R,
    registry: &'a Registry,
    description: Arc<StructDescription>,
    record: Option<RecordBox>,
    finished: bool,
}

impl<'a, R: Read> BinaryReader<'a, R> {
    pub fn new(
        mut reader: R,
        registry: &'a Registry,
        expected_type: Option<InternedString>,
    ) -> Result<Self, BinaryError> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(BinaryError::BadMagic);
        }

        let type_name = read_string(&mut reader)?;
        if let Some(expected) = expected_type {
            if expected != type_name {
                return Err(BinaryError::TypeMismatch {
                    expected,
                    found: type_name,
                });
            }
        }

        let description = registry
            .find_struct(type_name)
            .ok_or(BinaryError::UnknownType { name: type_name })?
            .clone();
        let record = RecordBox::new(description.clone());

        Ok(BinaryReader {
            reader,
            registry,
            description,
            record: Some(record),
            finished: false,
        })
    }

    pub fn type_name(&self) -> InternedString {
        self.description.name
    }

    /// Consumes one top-level field chunk.
    pub fn read_chunk(&mut self) -> Result<ReadState, BinaryError> {
        if self.finished {
            return Ok(ReadState::Finished);
        }

        let ordinal = self.reader.read_u16::<LittleEndian>()?;
        if ordinal == END_MARKER {
            self.finished = true;
            return Ok(ReadState::Finished);
        }

        let length = self.reader.read_u32::<LittleEndian>()? as usize;
        let mut payload = vec![0u8; length];
        self.reader.read_exact(&mut payload)?;

        let field = self.description.fields.get(ordinal as usize).ok_or(
            BinaryError::UnknownField {
                type_name: self.description.name,
                ordinal,
            },
        )?;

        let record = self.record.as_ref().expect("record already taken");
        let mut cursor = std::io::Cursor::new(payload.as_slice());
        unsafe {
            read_field_payload(
                &mut cursor,
                self.registry,
                &field.archetype,
                field.size,
                record.data().add(field.offset as usize),
                self.description.name,
                field.name,
            )?;
        }
        Ok(ReadState::InProgress)
    }

    /// Finishes reading and takes the populated record.
    pub fn finish(mut self) -> Result<RecordBox, BinaryError> {
        loop {
            match self.read_chunk()? {
                ReadState::InProgress => continue,
                ReadState::Finished => break,
            }
        }
        Ok(self.record.take().expect("record already taken"))
    }
}

unsafe fn read_field_payload(
    reader: &mut impl Read,
    registry: &Registry,
    archetype: &FieldArchetype,
    size: u32,
    target: *mut u8,
    type_name: InternedString,
    field_name: InternedString,
) -> Result<(), BinaryError> {
    match archetype {
        FieldArchetype::InternedString => {
            let handle = read_string(reader)?;
            target.cast::<InternedString>().write_unaligned(handle);
        }
        FieldArchetype::Struct { type_name: nested_name } => {
            let nested = registry
                .find_struct(*nested_name)
                .ok_or(BinaryError::UnknownType { name: *nested_name })?
                .clone();
            loop {
                let ordinal = reader.read_u16::<LittleEndian>()?;
                if ordinal == END_MARKER {
                    break;
                }
                let length = reader.read_u32::<LittleEndian>()? as usize;
                let mut payload = vec![0u8; length];
                reader.read_exact(&mut payload)?;
                let field = nested.fields.get(ordinal as usize).ok_or(
                    BinaryError::UnknownField {
                        type_name: *nested_name,
                        ordinal,
                    },
                )?;
                let mut cursor = std::io::Cursor::new(payload.as_slice());
                read_field_payload(
                    &mut cursor,
                    registry,
                    &field.archetype,
                    field.size,
                    target.add(field.offset as usize),
                    *nested_name,
                    field.name,
                )?;
            }
        }
        FieldArchetype::Array {
            element,
            element_size,
            element_align,
        } => {
            let count = reader.read_u32::<LittleEndian>()?;
            let array = &mut *target.cast::<DynArray>();
            array.ensure_layout(*element_size, *element_align);
            array.reserve(count);
            for _ in 0..count {
                let slot = array.push_zeroed();
                read_field_payload(
                    reader,
                    registry,
                    element,
                    *element_size,
                    slot,
                    type_name,
                    field_name,
                )?;
            }
        }
        FieldArchetype::Patch => {
            let patch_type = read_string(reader)?;
            let count = reader.read_u32::<LittleEndian>()?;
            let mut patch = Patch::new(patch_type);
            for _ in 0..count {
                let offset = reader.read_u32::<LittleEndian>()?;
                let length = reader.read_u32::<LittleEndian>()? as usize;
                let mut data = vec![0u8; length];
                reader.read_exact(&mut data)?;
                patch.add_chunk(offset, data);
            }
            *target.cast::<Patch>() = patch;
        }
        _ => {
            let mut bytes = vec![0u8; size as usize];
            reader.read_exact(&mut bytes).map_err(|_| {
                BinaryError::MalformedPayload {
                    type_name,
                    field: field_name,
                }
            })?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), target, size as usize);
        }
    }
    Ok(())
}

/// Convenience wrapper reading a whole record at once.
pub fn read_binary(
    reader: impl Read,
    registry: &Registry,
    expected_type: Option<InternedString>,
) -> Result<RecordBox, BinaryError> {
    BinaryReader::new(reader, registry, expected_type)?.finish()
}

//! Readable-data text format.
//!
//! A document begins with a `//! type = <name>` header followed by a
//! `key = value` block matching the struct's reflection. Nested structs use
//! `name { ... }` blocks, dynamic arrays repeat `+name` entries. The writer
//! is the parser's left inverse up to formatting.

use crate::interner::{intern, InternedString};
use crate::reflection::{
    dynarray::DynArray, write_field_value, FieldArchetype, FieldDescription, FieldValue, Registry,
    StructDescription,
};
use crate::repository::record::RecordBox;
use std::fmt::Write as _;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RdError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("document type {found} does not match expected type {expected}")]
    TypeMismatch {
        expected: InternedString,
        found: InternedString,
    },

    #[error("type {name} is not registered")]
    UnknownType { name: InternedString },

    #[error("type {type_name} has no field {field}")]
    UnknownField {
        type_name: InternedString,
        field: String,
    },

    #[error("field {field} of {type_name} cannot be represented in readable data")]
    Unrepresentable {
        type_name: InternedString,
        field: InternedString,
    },
}

fn syntax(line: usize, message: impl Into<String>) -> RdError {
    RdError::Syntax {
        line,
        message: message.into(),
    }
}

/// Parses a readable-data document into a freshly value-initialised record.
pub fn read_rd(
    text: &str,
    registry: &Registry,
    expected_type: Option<InternedString>,
) -> Result<RecordBox, RdError> {
    let type_name = read_rd_type_header(text).ok_or_else(|| syntax(1, "missing `//! type =` header"))?;
    if let Some(expected) = expected_type {
        if expected != type_name {
            return Err(RdError::TypeMismatch {
                expected,
                found: type_name,
            });
        }
    }

    let description = registry
        .find_struct(type_name)
        .ok_or(RdError::UnknownType { name: type_name })?
        .clone();

    let record = RecordBox::new(description.clone());
    let lines: Vec<(usize, &str)> = text
        .lines()
        .enumerate()
        .map(|(number, line)| (number + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with("//"))
        .collect();

    let mut position = 0;
    parse_block(&lines, &mut position, registry, &description, record.data(), false)?;
    Ok(record)
}

/// Reads only the type header, used by resource scanning to classify files
/// without fully parsing them.
pub fn read_rd_type_header(text: &str) -> Option<InternedString> {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let rest = line.strip_prefix("//!")?.trim();
        let value = rest.strip_prefix("type")?.trim().strip_prefix('=')?.trim();
        return Some(intern(value));
    }
    None
}

fn parse_block(
    lines: &[(usize, &str)],
    position: &mut usize,
    registry: &Registry,
    description: &Arc<StructDescription>,
    base: *mut u8,
    nested: bool,
) -> Result<(), RdError> {
    while *position < lines.len() {
        let (number, line) = lines[*position];
        *position += 1;

        if line == "}" {
            if nested {
                return Ok(());
            }
            return Err(syntax(number, "unbalanced closing brace"));
        }

        let (is_array, body) = match line.strip_prefix('+') {
            Some(rest) => (true, rest.trim_start()),
            None => (false, line),
        };

        if let Some(name) = body.strip_suffix('{').map(str::trim) {
            let field = find_field(description, name)?;
            if is_array {
                parse_array_struct_element(lines, position, registry, field, base, number)?;
            } else {
                match &field.archetype {
                    FieldArchetype::Struct { type_name } => {
                        let nested_description = registry
                            .find_struct(*type_name)
                            .ok_or(RdError::UnknownType { name: *type_name })?
                            .clone();
                        parse_block(lines, position, registry, &nested_description, unsafe {
                            base.add(field.offset as usize)
                        }, true)?;
                    }
                    _ => {
                        return Err(syntax(
                            number,
                            format!("field {} is not a nested struct", name),
                        ))
                    }
                }
            }
            continue;
        }

        let (name, value_text) = body
            .split_once('=')
            .ok_or_else(|| syntax(number, "expected `key = value` or `key {`"))?;
        let name = name.trim();
        let value_text = value_text.trim();
        let field = find_field(description, name)?;

        if is_array {
            let (element, element_size, element_align) = match &field.archetype {
                FieldArchetype::Array {
                    element,
                    element_size,
                    element_align,
                } => (element.as_ref(), *element_size, *element_align),
                _ => return Err(syntax(number, format!("field {} is not an array", name))),
            };
            let array = unsafe { &mut *base.add(field.offset as usize).cast::<DynArray>() };
            array.ensure_layout(element_size, element_align);
            let slot = array.push_zeroed();
            write_scalar(registry, element, slot, value_text, number)?;
        } else {
            let target = unsafe { base.add(field.offset as usize) };
            write_scalar(registry, &field.archetype, target, value_text, number)?;
        }
    }

    if nested {
        return Err(syntax(0, "unterminated block"));
    }
    Ok(())
}

fn parse_array_struct_element(
    lines: &[(usize, &str)],
    position: &mut usize,
    registry: &Registry,
    field: &FieldDescription,
    base: *mut u8,
    number: usize,
) -> Result<(), RdError> {
    let (element, element_size, element_align) = match &field.archetype {
        FieldArchetype::Array {
            element,
            element_size,
            element_align,
        } => (element.as_ref(), *element_size, *element_align),
        _ => {
            return Err(syntax(
                number,
                format!("field {} is not an array", field.name),
            ))
        }
    };
    let element_type = match element {
        FieldArchetype::Struct { type_name } => *type_name,
        _ => {
            return Err(syntax(
                number,
                format!("array {} holds scalars, use `+{} = value`", field.name, field.name),
            ))
        }
    };

    let element_description = registry
        .find_struct(element_type)
        .ok_or(RdError::UnknownType { name: element_type })?
        .clone();
    let array = unsafe { &mut *base.add(field.offset as usize).cast::<DynArray>() };
    array.ensure_layout(element_size, element_align);
    let slot = array.push_zeroed();
    parse_block(lines, position, registry, &element_description, slot, true)
}

fn find_field<'a>(
    description: &'a StructDescription,
    name: &str,
) -> Result<&'a FieldDescription, RdError> {
    description.field(intern(name)).ok_or_else(|| RdError::UnknownField {
        type_name: description.name,
        field: name.to_string(),
    })
}

fn write_scalar(
    registry: &Registry,
    archetype: &FieldArchetype,
    target: *mut u8,
    text: &str,
    number: usize,
) -> Result<(), RdError> {
    let value = parse_value(registry, archetype, text, number)?;
    if unsafe { !write_field_value(archetype, target, value) } {
        return Err(syntax(number, format!("value `{}` does not fit field", text)));
    }
    Ok(())
}

fn parse_value(
    registry: &Registry,
    archetype: &FieldArchetype,
    text: &str,
    number: usize,
) -> Result<FieldValue, RdError> {
    if text.starts_with('"') {
        return Ok(FieldValue::Str(intern(&unescape(text, number)?)));
    }
    if text == "true" {
        return Ok(FieldValue::Bool(true));
    }
    if text == "false" {
        return Ok(FieldValue::Bool(false));
    }

    let first = text.chars().next().ok_or_else(|| syntax(number, "empty value"))?;
    if first.is_ascii_digit() || first == '-' || first == '+' || first == '.' {
        if text.contains('.') || text.contains('e') || text.contains('E') {
            let value: f64 = text
                .parse()
                .map_err(|_| syntax(number, format!("malformed float `{}`", text)))?;
            return Ok(FieldValue::Float(value));
        }
        if let Ok(value) = text.parse::<i64>() {
            return Ok(if value >= 0 {
                FieldValue::Unsigned(value as u64)
            } else {
                FieldValue::Signed(value)
            });
        }
        let value: u64 = text
            .parse()
            .map_err(|_| syntax(number, format!("malformed integer `{}`", text)))?;
        return Ok(FieldValue::Unsigned(value));
    }

    // Bare identifier: an enum variant.
    if let FieldArchetype::Enum { type_name } = archetype {
        if let Some(description) = registry.find_enum(*type_name) {
            if let Some(index) = description.variant_index(intern(text)) {
                return Ok(FieldValue::Enum(index));
            }
            return Err(syntax(
                number,
                format!("unknown variant `{}` of enum {}", text, type_name),
            ));
        }
    }

    Err(syntax(number, format!("unparseable value `{}`", text)))
}

fn unescape(text: &str, number: usize) -> Result<String, RdError> {
    let inner = text
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .ok_or_else(|| syntax(number, "unterminated string"))?;

    let mut result = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(current) = chars.next() {
        if current != '\\' {
            result.push(current);
            continue;
        }
        match chars.next() {
            Some('n') => result.push('\n'),
            Some('t') => result.push('\t'),
            Some(other) => result.push(other),
            None => return Err(syntax(number, "dangling escape")),
        }
    }
    Ok(result)
}

fn escape(text: &str) -> String {
    let mut result = String::with_capacity(text.len() + 2);
    for current in text.chars() {
        match current {
            '"' => result.push_str("\\\""),
            '\\' => result.push_str("\\\\"),
            '\n' => result.push_str("\\n"),
            '\t' => result.push_str("\\t"),
            other => result.push(other),
        }
    }
    result
}

/// Writes a record as a readable-data document.
///
/// # Safety
/// `data` must be a valid instance of `description`.
pub unsafe fn write_rd(
    registry: &Registry,
    description: &StructDescription,
    data: *const u8,
) -> Result<String, RdError> {
    let mut output = String::new();
    let _ = writeln!(output, "//! type = {}", description.name);
    let _ = writeln!(output);
    write_fields(registry, description, data, &mut output, 0)?;
    Ok(output)
}

unsafe fn write_fields(
    registry: &Registry,
    description: &StructDescription,
    data: *const u8,
    output: &mut String,
    depth: usize,
) -> Result<(), RdError> {
    let pad = "    ".repeat(depth);
    for field in &description.fields {
        let pointer = data.add(field.offset as usize);
        match &field.archetype {
            FieldArchetype::Struct { type_name } => {
                let nested = registry
                    .find_struct(*type_name)
                    .ok_or(RdError::UnknownType { name: *type_name })?;
                let _ = writeln!(output, "{}{} {{", pad, field.name);
                write_fields(registry, nested, pointer, output, depth + 1)?;
                let _ = writeln!(output, "{}}}", pad);
            }
            FieldArchetype::Array { element, .. } => {
                let array = &*pointer.cast::<DynArray>();
                for index in 0..array.len() {
                    let element_pointer = array.at(index);
                    match element.as_ref() {
                        FieldArchetype::Struct { type_name } => {
                            let nested = registry
                                .find_struct(*type_name)
                                .ok_or(RdError::UnknownType { name: *type_name })?;
                            let _ = writeln!(output, "{}+{} {{", pad, field.name);
                            write_fields(registry, nested, element_pointer, output, depth + 1)?;
                            let _ = writeln!(output, "{}}}", pad);
                        }
                        scalar => {
                            let text =
                                format_scalar(registry, scalar, element_pointer, description, field)?;
                            let _ = writeln!(output, "{}+{} = {}", pad, field.name, text);
                        }
                    }
                }
            }
            FieldArchetype::Patch => {
                return Err(RdError::Unrepresentable {
                    type_name: description.name,
                    field: field.name,
                });
            }
            scalar => {
                let text = format_scalar(registry, scalar, pointer, description, field)?;
                let _ = writeln!(output, "{}{} = {}", pad, field.name, text);
            }
        }
    }
    Ok(())
}

unsafe fn format_scalar(
    registry: &Registry,
    archetype: &FieldArchetype,
    pointer: *const u8,
    description: &StructDescription,
    field: &FieldDescription,
) -> Result<String, RdError> {
    match archetype {
        FieldArchetype::F32 => return Ok(format!("{}", pointer.cast::<f32>().read_unaligned())),
        FieldArchetype::F64 => return Ok(format!("{}", pointer.cast::<f64>().read_unaligned())),
        _ => {}
    }

    let value = crate::reflection::read_field_value(archetype, pointer).ok_or(
        RdError::Unrepresentable {
            type_name: description.name,
            field: field.name,
        },
    )?;
    Ok(match value {
        FieldValue::Bool(inner) => inner.to_string(),
        FieldValue::Signed(inner) => inner.to_string(),
        FieldValue::Unsigned(inner) => inner.to_string(),
        FieldValue::Float(inner) => format!("{}", inner),
        FieldValue::Str(inner) => format!("\"{}\"", escape(inner.as_str())),
        FieldValue::Enum(index) => match archetype {
            FieldArchetype::Enum { type_name } => registry
                .find_enum(*type_name)
                .and_then(|description| description.variants.get(index as usize).copied())
                .map(|variant| variant.as_str().to_string())
                .unwrap_or_else(|| index.to_string()),
            _ => index.to_string(),
        },
    })
}

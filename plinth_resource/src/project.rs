//! Project and target model, plus platform-configuration layering.
//!
//! A project names a workspace directory, a platform-configuration directory
//! and an ordered list of targets; each target owns resource root
//! directories and a visibility list of other targets it may reference.
//!
//! Platform configuration is an ordered list of *layers*. Each layer is a
//! readable-data document of partial overrides; layers are parsed into
//! reflection patches and applied in order over a value-initialised
//! configuration instance.

use plinth_core::interner::{intern, InternedString};
use plinth_core::reflection::patch::Patch;
use plinth_core::reflection::{FieldArchetype, FieldValue, Registry, StructDescription};
use plinth_core::serial::rd::read_rd_type_header;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed project manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("platform configuration layer {layer}, line {line}: {message}")]
    Layer {
        layer: String,
        line: usize,
        message: String,
    },

    #[error("platform configuration type {name} is not registered")]
    UnknownConfigurationType { name: InternedString },
}

#[derive(Clone, Debug)]
pub struct Target {
    pub name: InternedString,
    pub roots: Vec<PathBuf>,
    /// Other targets whose entries this target's references may resolve to.
    pub visible_targets: Vec<InternedString>,
}

#[derive(Clone, Debug)]
pub struct Project {
    pub workspace_directory: PathBuf,
    pub platform_configuration_directory: PathBuf,
    pub targets: Vec<Target>,
}

#[derive(Deserialize, Serialize)]
struct TargetManifest {
    name: String,
    roots: Vec<PathBuf>,
    #[serde(default)]
    visible_targets: Vec<String>,
}

#[derive(Deserialize, Serialize)]
struct ProjectManifest {
    workspace_directory: PathBuf,
    platform_configuration_directory: PathBuf,
    targets: Vec<TargetManifest>,
}

impl Project {
    /// Loads a project manifest (json), resolving relative paths against the
    /// manifest's directory.
    pub fn load(path: &Path) -> Result<Project, ProjectError> {
        let text = std::fs::read_to_string(path).map_err(|source| ProjectError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest: ProjectManifest =
            serde_json::from_str(&text).map_err(|source| ProjectError::Manifest {
                path: path.to_path_buf(),
                source,
            })?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let resolve = |relative: &Path| -> PathBuf {
            if relative.is_absolute() {
                relative.to_path_buf()
            } else {
                base.join(relative)
            }
        };

        Ok(Project {
            workspace_directory: resolve(&manifest.workspace_directory),
            platform_configuration_directory: resolve(&manifest.platform_configuration_directory),
            targets: manifest
                .targets
                .into_iter()
                .map(|target| Target {
                    name: intern(&target.name),
                    roots: target.roots.iter().map(|root| resolve(root)).collect(),
                    visible_targets: target
                        .visible_targets
                        .iter()
                        .map(|name| intern(name))
                        .collect(),
                })
                .collect(),
        })
    }

    pub fn target(&self, name: InternedString) -> Option<&Target> {
        self.targets.iter().find(|target| target.name == name)
    }

    pub fn cache_directory(&self, target: InternedString) -> PathBuf {
        self.workspace_directory.join("cache").join(target.as_str())
    }

    pub fn deploy_directory(&self, target: InternedString) -> PathBuf {
        self.workspace_directory.join("deploy").join(target.as_str())
    }
}

/// One platform-configuration layer: its name, its parsed patch and a
/// content hash used for cache invalidation.
pub struct PlatformLayer {
    pub name: InternedString,
    pub patch: Patch,
    pub content_hash: u64,
}

/// The ordered layer stack for one configuration type.
pub struct PlatformConfiguration {
    pub type_name: InternedString,
    pub layers: Vec<PlatformLayer>,
}

impl PlatformConfiguration {
    pub fn combined_hash(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = fxhash::FxHasher::default();
        for layer in &self.layers {
            layer.name.as_str().hash(&mut hasher);
            layer.content_hash.hash(&mut hasher);
        }
        hasher.finish()
    }
}

/// Reads `platform_configuration.rd` (the layer list) and every named layer
/// document for the given configuration type. A missing list file means an
/// empty stack, which realises to the plain value-initialised configuration.
pub fn load_platform_configuration(
    directory: &Path,
    registry: &Registry,
    type_name: InternedString,
) -> Result<PlatformConfiguration, ProjectError> {
    let description = registry
        .find_struct(type_name)
        .ok_or(ProjectError::UnknownConfigurationType { name: type_name })?;

    let list_path = directory.join("platform_configuration.rd");
    let layer_names = match std::fs::read_to_string(&list_path) {
        Ok(text) => parse_layer_list(&text),
        Err(_) => Vec::new(),
    };

    let mut layers = Vec::new();
    for layer_name in layer_names {
        let layer_path = directory.join(format!("{}.rd", layer_name));
        let text = std::fs::read_to_string(&layer_path).map_err(|source| ProjectError::Io {
            path: layer_path.clone(),
            source,
        })?;
        let patch = parse_layer_patch(&text, registry, description, layer_name)?;
        layers.push(PlatformLayer {
            name: layer_name,
            content_hash: fxhash::hash64(text.as_bytes()),
            patch,
        });
    }

    Ok(PlatformConfiguration { type_name, layers })
}

/// The layer list is a readable-data document with repeated `+layer = name`
/// entries.
fn parse_layer_list(text: &str) -> Vec<InternedString> {
    let mut layers = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("+layer") {
            if let Some(value) = rest.trim_start().strip_prefix('=') {
                let value = value.trim().trim_matches('"');
                layers.push(intern(value));
            }
        }
    }
    layers
}

/// Parses one layer document into a reflection patch: every `key = value`
/// assignment becomes one byte chunk. Nested struct blocks are supported,
/// dynamic arrays are not overridable by layers.
fn parse_layer_patch(
    text: &str,
    registry: &Registry,
    description: &StructDescription,
    layer: InternedString,
) -> Result<Patch, ProjectError> {
    let mut patch = Patch::new(description.name);
    let mut path: Vec<InternedString> = Vec::new();

    for (number, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        let number = number + 1;
        if line.is_empty() || line.starts_with("//") {
            continue;
        }

        if line == "}" {
            if path.pop().is_none() {
                return Err(ProjectError::Layer {
                    layer: layer.as_str().to_string(),
                    line: number,
                    message: "unbalanced closing brace".to_string(),
                });
            }
            continue;
        }

        if let Some(name) = line.strip_suffix('{').map(str::trim) {
            path.push(intern(name));
            continue;
        }

        let (key, value_text) = match line.split_once('=') {
            Some(pair) => pair,
            None => {
                return Err(ProjectError::Layer {
                    layer: layer.as_str().to_string(),
                    line: number,
                    message: "expected `key = value`".to_string(),
                })
            }
        };

        let mut full_path = path.clone();
        full_path.push(intern(key.trim()));
        let resolution = registry.resolve_path(description, &full_path).map_err(|error| {
            ProjectError::Layer {
                layer: layer.as_str().to_string(),
                line: number,
                message: error.to_string(),
            }
        })?;

        let value_text = value_text.trim();
        let value = parse_scalar(value_text, &resolution.archetype, registry).ok_or_else(|| {
            ProjectError::Layer {
                layer: layer.as_str().to_string(),
                line: number,
                message: format!("unparseable value `{}`", value_text),
            }
        })?;

        let mut bytes = vec![0u8; resolution.size as usize];
        if unsafe {
            !plinth_core::reflection::write_field_value(
                &resolution.archetype,
                bytes.as_mut_ptr(),
                value,
            )
        } {
            return Err(ProjectError::Layer {
                layer: layer.as_str().to_string(),
                line: number,
                message: format!("value `{}` does not fit field", value_text),
            });
        }
        patch.add_chunk(resolution.offset, bytes);
    }

    Ok(patch)
}

fn parse_scalar(
    text: &str,
    archetype: &FieldArchetype,
    registry: &Registry,
) -> Option<FieldValue> {
    if text.starts_with('"') {
        return Some(FieldValue::Str(intern(text.trim_matches('"'))));
    }
    if text == "true" {
        return Some(FieldValue::Bool(true));
    }
    if text == "false" {
        return Some(FieldValue::Bool(false));
    }
    if text.contains('.') {
        return text.parse::<f64>().ok().map(FieldValue::Float);
    }
    if let Ok(value) = text.parse::<i64>() {
        return Some(if value >= 0 {
            FieldValue::Unsigned(value as u64)
        } else {
            FieldValue::Signed(value)
        });
    }
    if let FieldArchetype::Enum { type_name } = archetype {
        if let Some(description) = registry.find_enum(*type_name) {
            return description.variant_index(intern(text)).map(FieldValue::Enum);
        }
    }
    None
}

/// Classifies a resource file by extension; everything that is neither
/// readable data nor serialized binary is a third-party resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceFileKind {
    ReadableData,
    Binary,
    ThirdParty,
}

pub fn classify_file(path: &Path) -> ResourceFileKind {
    match path.extension().and_then(|extension| extension.to_str()) {
        Some("rd") => ResourceFileKind::ReadableData,
        Some("bin") => ResourceFileKind::Binary,
        _ => ResourceFileKind::ThirdParty,
    }
}

/// Reads the resource type of a native file without fully parsing it.
pub fn read_native_type(path: &Path, kind: ResourceFileKind) -> Option<InternedString> {
    match kind {
        ResourceFileKind::ReadableData => {
            let text = std::fs::read_to_string(path).ok()?;
            read_rd_type_header(&text)
        }
        ResourceFileKind::Binary => {
            let file = std::fs::File::open(path).ok()?;
            header::read_binary_type_header(file)
        }
        ResourceFileKind::ThirdParty => None,
    }
}

mod header {
    use plinth_core::interner::{intern, InternedString};
    use std::io::Read;

    /// Reads the magic and type-name header of a plinth binary file.
    pub fn read_binary_type_header(mut reader: impl Read) -> Option<InternedString> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).ok()?;
        if &magic != b"PLRB" {
            return None;
        }
        let mut length_bytes = [0u8; 2];
        reader.read_exact(&mut length_bytes).ok()?;
        let length = u16::from_le_bytes(length_bytes) as usize;
        let mut name = vec![0u8; length];
        reader.read_exact(&mut name).ok()?;
        Some(intern(std::str::from_utf8(&name).ok()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_list_parses_in_order() {
        let text = "//! type = platform_configuration_list\n+layer = \"base\"\n+layer = \"mobile\"\n";
        let layers = parse_layer_list(text);
        assert_eq!(layers, vec![intern("base"), intern("mobile")]);
    }

    #[test]
    fn classification_by_extension() {
        assert_eq!(classify_file(Path::new("a/b.rd")), ResourceFileKind::ReadableData);
        assert_eq!(classify_file(Path::new("a/b.bin")), ResourceFileKind::Binary);
        assert_eq!(classify_file(Path::new("a/b.png")), ResourceFileKind::ThirdParty);
        assert_eq!(classify_file(Path::new("a/noext")), ResourceFileKind::ThirdParty);
    }
}

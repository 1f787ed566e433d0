//! Label schema.
//!
//! Key names are stable: changing one needs a [`SCHEMA_VERSION`] bump.

use std::path::{Path, PathBuf};

use keel_core::GitContext;
use walkdir::WalkDir;

use crate::error::{ManifestError, ManifestResult};

pub const SCHEMA_VERSION: &str = "1.1";

pub const KEY_SCHEMA: &str = "io.keel.schema";
pub const KEY_NAME: &str = "io.keel.name";
pub const KEY_BRANCH: &str = "io.keel.git.branch";
pub const KEY_SHA: &str = "io.keel.git.sha";
pub const KEY_ORIGIN: &str = "io.keel.git.origin";
pub const KEY_ROLE: &str = "io.keel.role";
pub const KEY_POLICY: &str = "io.keel.policy";
pub const KEY_RESOURCES: &str = "io.keel.resources";
pub const KEY_BUS: &str = "io.keel.bus";

/// Trust policy letting the function service assume a role.
pub const LAMBDA_TRUST_POLICY: &str = include_str!("../templates/role.json.tmpl");

/// Build-time inputs a field can draw its content from.
#[derive(Debug, Clone, Copy)]
pub struct BuildInput<'a> {
    pub dir: &'a Path,
    pub function: &'a str,
    pub git: &'a GitContext,
}

/// One piece of content loaded for a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loaded {
    /// Dotted suffix appended to the field key; folder entries only.
    pub suffix: Option<String>,
    pub content: String,
    /// File name or embedded name, used to pick canonicalization.
    pub origin: String,
    pub source: Option<PathBuf>,
}

/// How a field gets its content.
#[derive(Clone, Copy)]
pub enum FieldKind {
    /// A value computed from the build inputs.
    String(fn(&BuildInput<'_>) -> String),
    /// A file relative to the function directory.
    File(&'static str),
    /// A template bundled into the binary.
    EmbeddedFile {
        name: &'static str,
        content: &'static str,
    },
    /// Every file below a folder relative to the function directory.
    FolderOfFiles(&'static str),
}

impl std::fmt::Debug for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldKind::String(_) => f.write_str("String"),
            FieldKind::File(path) => f.debug_tuple("File").field(path).finish(),
            FieldKind::EmbeddedFile { name, .. } => {
                f.debug_struct("EmbeddedFile").field("name", name).finish()
            }
            FieldKind::FolderOfFiles(path) => f.debug_tuple("FolderOfFiles").field(path).finish(),
        }
    }
}

impl FieldKind {
    pub fn is_folder(&self) -> bool {
        matches!(self, FieldKind::FolderOfFiles(_))
    }

    /// Load raw content. Absent sources yield no items.
    pub fn load(&self, input: &BuildInput<'_>) -> ManifestResult<Vec<Loaded>> {
        match self {
            FieldKind::String(value) => {
                let content = value(input);
                if content.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(vec![Loaded {
                    suffix: None,
                    content,
                    origin: String::new(),
                    source: None,
                }])
            }
            FieldKind::File(relative) => {
                let path = input.dir.join(relative);
                match read_optional(&path)? {
                    Some(content) => Ok(vec![Loaded {
                        suffix: None,
                        content,
                        origin: relative.to_string(),
                        source: Some(path),
                    }]),
                    None => Ok(Vec::new()),
                }
            }
            FieldKind::EmbeddedFile { name, content } => Ok(vec![Loaded {
                suffix: None,
                content: content.to_string(),
                origin: name.to_string(),
                source: None,
            }]),
            FieldKind::FolderOfFiles(relative) => load_folder(&input.dir.join(relative)),
        }
    }
}

/// Which stages treat a field as mandatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Required {
    pub encode: bool,
    pub decode: bool,
}

const ALWAYS: Required = Required {
    encode: true,
    decode: true,
};
const OPTIONAL: Required = Required {
    encode: false,
    decode: false,
};

#[derive(Debug, Clone, Copy)]
pub struct LabelField {
    pub key: &'static str,
    pub description: &'static str,
    pub required: Required,
    pub kind: FieldKind,
}

/// Every field of the current schema, in encode order.
pub const SCHEMA: &[LabelField] = &[
    LabelField {
        key: KEY_SCHEMA,
        description: "Schema version",
        required: ALWAYS,
        kind: FieldKind::String(|_| SCHEMA_VERSION.to_string()),
    },
    LabelField {
        key: KEY_NAME,
        description: "Function name",
        required: ALWAYS,
        kind: FieldKind::String(|input| input.function.to_string()),
    },
    LabelField {
        key: KEY_BRANCH,
        description: "Git branch",
        required: ALWAYS,
        kind: FieldKind::String(|input| input.git.branch.clone()),
    },
    LabelField {
        key: KEY_SHA,
        description: "Git commit",
        required: ALWAYS,
        kind: FieldKind::String(|input| input.git.sha.clone()),
    },
    LabelField {
        key: KEY_ORIGIN,
        description: "Git origin URL",
        required: ALWAYS,
        kind: FieldKind::String(|input| input.git.origin.clone()),
    },
    LabelField {
        key: KEY_ROLE,
        description: "Execution role trust policy template",
        required: ALWAYS,
        kind: FieldKind::EmbeddedFile {
            name: "role.json.tmpl",
            content: LAMBDA_TRUST_POLICY,
        },
    },
    LabelField {
        key: KEY_POLICY,
        description: "Permission policy template",
        required: ALWAYS,
        kind: FieldKind::File("policy.json.tmpl"),
    },
    LabelField {
        key: KEY_RESOURCES,
        description: "Resource sizing and HTTP exposure",
        required: OPTIONAL,
        kind: FieldKind::File("resources.json.tmpl"),
    },
    LabelField {
        key: KEY_BUS,
        description: "Event bus rule templates",
        required: OPTIONAL,
        kind: FieldKind::FolderOfFiles("bus"),
    },
];

pub fn field(key: &str) -> Option<&'static LabelField> {
    SCHEMA.iter().find(|f| f.key == key)
}

fn read_optional(path: &Path) -> ManifestResult<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ManifestError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn load_folder(root: &Path) -> ManifestResult<Vec<Loaded>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }

    let mut items = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|source| ManifestError::Walk {
            path: root.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let suffix = dotted_path(relative);
        if suffix.is_empty() {
            continue;
        }
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        items.push(Loaded {
            suffix: Some(suffix),
            content,
            origin: entry.file_name().to_string_lossy().into_owned(),
            source: Some(path.to_path_buf()),
        });
    }
    Ok(items)
}

/// `default/nightly.json.tmpl` → `default.nightly`.
pub fn dotted_path(relative: &Path) -> String {
    let dir = relative
        .parent()
        .map(|p| {
            p.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(".")
        })
        .unwrap_or_default();
    let file = relative
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = file.split('.').next().unwrap_or_default();
    format!("{dir}.{stem}").trim_matches('.').to_string()
}

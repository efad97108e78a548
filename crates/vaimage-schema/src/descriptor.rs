//! Customization descriptors found in a platform directory.
//!
//! Each descriptor is optional and independent. A document is parsed and
//! normalized as a whole before any of its records is acted on, so an
//! unsupported value anywhere in the file rejects the file. String-valued
//! kinds and actions become closed enums here and nowhere else.

use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const PACKAGES_FILE: &str = "packages.xml";
pub const INJECT_ITEMS_FILE: &str = "inject_items.xml";
pub const SERVICES_FILE: &str = "services.xml";
pub const FILES_CONTENT_FILE: &str = "files_content.xml";
/// Directory next to the inject descriptor holding the items to inject.
pub const INJECT_DIR: &str = "inject";

macro_rules! descriptor_enum {
    ($(#[$meta:meta])* $name:ident, $field:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            /// Parse the descriptor text, rejecting anything outside the enum.
            pub fn parse(value: &str) -> Result<Self, SchemaError> {
                match value.trim() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(SchemaError::Unsupported {
                        field: $field,
                        value: other.to_owned(),
                    }),
                }
            }

            /// Like [`Self::parse`], with an empty value meaning "not set".
            pub fn parse_optional(value: &str) -> Result<Option<Self>, SchemaError> {
                if value.trim().is_empty() {
                    Ok(None)
                } else {
                    Self::parse(value).map(Some)
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

descriptor_enum!(
    /// Package format, selecting the package tool.
    PackageManager, "package type" { Rpm => "rpm", Deb => "deb" }
);

descriptor_enum!(
    PackageAction, "package action" { Install => "install", Remove => "remove" }
);

descriptor_enum!(
    InjectAction, "inject action" { Remove => "remove", Upload => "upload", Create => "create" }
);

descriptor_enum!(
    ItemKind, "inject item type" { File => "file", Directory => "directory", Link => "link" }
);

descriptor_enum!(
    /// Init system owning a service.
    ServiceManager, "service type" { SysV => "sysv", Upstart => "upstart" }
);

descriptor_enum!(
    /// Persistent enabled/disabled state.
    ServiceStatus, "service status" { On => "on", Off => "off" }
);

descriptor_enum!(
    /// Action sent to the live service manager.
    ServiceAction, "service action" {
        Start => "start",
        Stop => "stop",
        Restart => "restart",
        Reload => "reload",
    }
);

descriptor_enum!(
    EditAction, "file content action" { Append => "append", Replace => "replace" }
);

impl PackageManager {
    /// Package tool invoked for this format.
    pub fn tool(self) -> &'static str {
        match self {
            Self::Rpm => "yum",
            Self::Deb => "apt-get",
        }
    }
}

// ---------------------------------------------------------------------------
// Packages
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct PackagesDocument {
    #[serde(rename = "Package", default)]
    packages: Vec<PackageRecord>,
}

#[derive(Debug, Default, Deserialize)]
struct PackageRecord {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(rename = "Chroot", default)]
    chroot: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDirective {
    pub name: String,
    pub manager: PackageManager,
    pub action: PackageAction,
    /// Run the package tool inside a chroot into the mounted image.
    pub chroot: bool,
}

pub fn parse_packages(input: &str) -> Result<Vec<PackageDirective>, SchemaError> {
    let doc: PackagesDocument = quick_xml::de::from_str(input)?;
    doc.packages
        .iter()
        .map(|r| {
            Ok(PackageDirective {
                name: required("Package.Name", &r.name)?,
                manager: PackageManager::parse(&r.kind)?,
                action: PackageAction::parse(&r.action)?,
                chroot: parse_flag("Package.Chroot", &r.chroot)?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Inject items
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct InjectItemsDocument {
    #[serde(rename = "InjectItem", default)]
    items: Vec<InjectItemRecord>,
}

#[derive(Debug, Default, Deserialize)]
struct InjectItemRecord {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "BkpName", default)]
    backup_name: String,
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(rename = "Location", default)]
    location: String,
    #[serde(rename = "Permissions", default)]
    permissions: String,
    #[serde(rename = "OwnerId", alias = "OwnerID", default)]
    owner: String,
    #[serde(rename = "GroupId", alias = "GroupID", default)]
    group: String,
}

/// What to do with an injected item, with the combination of action and
/// item type already resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InjectOp {
    /// Delete the target, or rename it to the backup name when one is given.
    Remove { backup: Option<String> },
    /// Copy the source file (`upload`) or create an empty one.
    File { upload: bool, backup: Option<String> },
    /// Create the directory tree, copying the source contents on `upload`.
    Directory { upload: bool, backup: Option<String> },
    /// Create a symbolic link pointing at `target`.
    Link { target: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectDirective {
    pub name: String,
    /// Directory inside the image, relative to its root.
    pub location: String,
    pub op: InjectOp,
    pub permissions: Option<u32>,
    pub owner: Option<u32>,
    pub group: Option<u32>,
}

pub fn parse_inject_items(input: &str) -> Result<Vec<InjectDirective>, SchemaError> {
    let doc: InjectItemsDocument = quick_xml::de::from_str(input)?;
    doc.items.iter().map(normalize_inject_item).collect()
}

fn normalize_inject_item(r: &InjectItemRecord) -> Result<InjectDirective, SchemaError> {
    let name = required("InjectItem.Name", &r.name)?;
    let backup = optional(&r.backup_name);
    let action = InjectAction::parse(&r.action)?;
    let kind = ItemKind::parse_optional(&r.kind)?;

    let op = match (action, kind) {
        (InjectAction::Remove, _) => InjectOp::Remove { backup },
        (_, None) => return Err(SchemaError::MissingField("InjectItem.Type")),
        (action, Some(ItemKind::File)) => InjectOp::File {
            upload: action == InjectAction::Upload,
            backup,
        },
        (action, Some(ItemKind::Directory)) => InjectOp::Directory {
            upload: action == InjectAction::Upload,
            backup,
        },
        (_, Some(ItemKind::Link)) => InjectOp::Link {
            target: backup.ok_or(SchemaError::MissingField("InjectItem.BkpName (link target)"))?,
        },
    };

    Ok(InjectDirective {
        name,
        location: r.location.trim().to_owned(),
        op,
        permissions: parse_mode("InjectItem.Permissions", &r.permissions)?,
        owner: parse_id("InjectItem.OwnerId", &r.owner)?,
        group: parse_id("InjectItem.GroupId", &r.group)?,
    })
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct ServicesDocument {
    #[serde(rename = "Service", default)]
    services: Vec<ServiceRecord>,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceRecord {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "Chroot", default)]
    chroot: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDirective {
    pub name: String,
    pub manager: ServiceManager,
    pub status: Option<ServiceStatus>,
    pub action: Option<ServiceAction>,
    /// Apply the persistent status inside a chroot into the mounted image.
    pub chroot: bool,
}

pub fn parse_services(input: &str) -> Result<Vec<ServiceDirective>, SchemaError> {
    let doc: ServicesDocument = quick_xml::de::from_str(input)?;
    doc.services
        .iter()
        .map(|r| {
            Ok(ServiceDirective {
                name: required("Service.Name", &r.name)?,
                manager: ServiceManager::parse(&r.kind)?,
                status: ServiceStatus::parse_optional(&r.status)?,
                action: ServiceAction::parse_optional(&r.action)?,
                chroot: parse_flag("Service.Chroot", &r.chroot)?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// File content
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct FilesDocument {
    #[serde(rename = "File", default)]
    files: Vec<FileRecord>,
}

#[derive(Debug, Default, Deserialize)]
struct FileRecord {
    #[serde(rename = "Path", default)]
    path: String,
    #[serde(rename = "BkpName", default)]
    backup_name: String,
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(rename = "OldPattern", default)]
    old_pattern: String,
    #[serde(rename = "NewPattern", default)]
    new_pattern: String,
}

/// An in-place edit of a file inside the image.
///
/// Pattern presence is checked when the edit is applied, after the target
/// file is known to exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    pub path: String,
    pub backup: Option<String>,
    pub action: EditAction,
    pub old_pattern: String,
    pub new_pattern: String,
}

pub fn parse_file_edits(input: &str) -> Result<Vec<FileEdit>, SchemaError> {
    let doc: FilesDocument = quick_xml::de::from_str(input)?;
    doc.files
        .iter()
        .map(|r| {
            Ok(FileEdit {
                path: required("File.Path", &r.path)?,
                backup: optional(&r.backup_name),
                action: EditAction::parse(&r.action)?,
                old_pattern: r.old_pattern.clone(),
                new_pattern: r.new_pattern.clone(),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn required(field: &'static str, value: &str) -> Result<String, SchemaError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SchemaError::MissingField(field));
    }
    Ok(trimmed.to_owned())
}

fn optional(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

fn parse_flag(field: &'static str, value: &str) -> Result<bool, SchemaError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "false" | "0" | "no" => Ok(false),
        "true" | "1" | "yes" => Ok(true),
        _ => Err(SchemaError::InvalidValue {
            field,
            value: value.to_owned(),
        }),
    }
}

/// Permission bits are written in octal, e.g. `0755`.
fn parse_mode(field: &'static str, value: &str) -> Result<Option<u32>, SchemaError> {
    let Some(text) = optional(value) else {
        return Ok(None);
    };
    u32::from_str_radix(&text, 8)
        .ok()
        .filter(|mode| *mode <= 0o7777)
        .map(Some)
        .ok_or(SchemaError::InvalidValue {
            field,
            value: value.to_owned(),
        })
}

fn parse_id(field: &'static str, value: &str) -> Result<Option<u32>, SchemaError> {
    let Some(text) = optional(value) else {
        return Ok(None);
    };
    text.parse().map(Some).map_err(|_| SchemaError::InvalidValue {
        field,
        value: value.to_owned(),
    })
}

//! Docker volume plugin protocol messages.
//!
//! The container engine POSTs a JSON body to one endpoint per operation
//! (`/VolumeDriver.Mount`, ...) and expects a JSON reply whose `Err` field
//! is empty on success.  Field names are PascalCase on the wire.
//!
//! [`PluginRequest`] is the decoded form of an incoming call and
//! [`PluginResponse`] the reply; the mapping between them lives in
//! [`dispatch`](crate::transport::server::dispatch).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VolError};
use crate::types::{Capabilities, MountOptions, VolumeInfo};

/// Media type of every plugin request and response body.
pub const PLUGIN_CONTENT_TYPE: &str = "application/vnd.docker.plugins.v1.2+json";

/// Subsystem announced by `/Plugin.Activate`.
pub const VOLUME_DRIVER: &str = "VolumeDriver";

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Body of `/VolumeDriver.Create`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateRequest {
    pub name: String,
    /// `docker volume create -o key=value` pairs; `null` when none.
    #[serde(default)]
    pub opts: Option<BTreeMap<String, String>>,
}

/// Body of `/VolumeDriver.{Remove,Path,Get}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NameRequest {
    pub name: String,
}

/// Body of `/VolumeDriver.{Mount,Unmount}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountRequest {
    pub name: String,
    /// Caller-chosen identifier of this mount request.
    #[serde(rename = "ID", default)]
    pub id: String,
}

/// A decoded plugin call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginRequest {
    Activate,
    Create(CreateRequest),
    Remove(NameRequest),
    Mount(MountRequest),
    Unmount(MountRequest),
    Path(NameRequest),
    Get(NameRequest),
    List,
    Capabilities,
}

impl PluginRequest {
    /// Decode the call addressed to `path` with JSON `body`.
    ///
    /// Endpoints without parameters ignore the body, which the engine may
    /// send empty.
    pub fn decode(path: &str, body: &[u8]) -> Result<Self> {
        fn json<'a, T: Deserialize<'a>>(path: &str, body: &'a [u8]) -> Result<T> {
            serde_json::from_slice(body)
                .map_err(|e| VolError::InvalidArgument(format!("malformed {path} request: {e}")))
        }

        Ok(match path {
            "/Plugin.Activate" => Self::Activate,
            "/VolumeDriver.Create" => Self::Create(json(path, body)?),
            "/VolumeDriver.Remove" => Self::Remove(json(path, body)?),
            "/VolumeDriver.Mount" => Self::Mount(json(path, body)?),
            "/VolumeDriver.Unmount" => Self::Unmount(json(path, body)?),
            "/VolumeDriver.Path" => Self::Path(json(path, body)?),
            "/VolumeDriver.Get" => Self::Get(json(path, body)?),
            "/VolumeDriver.List" => Self::List,
            "/VolumeDriver.Capabilities" => Self::Capabilities,
            other => {
                return Err(VolError::InvalidArgument(format!(
                    "unknown endpoint {other}"
                )));
            }
        })
    }
}

impl CreateRequest {
    /// The requested options as a [`MountOptions`] map.
    pub fn options(&self) -> MountOptions {
        self.opts.clone().unwrap_or_default()
    }
}

impl fmt::Display for PluginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Activate => f.write_str("Activate"),
            Self::Create(req) => write!(f, "Create({})", req.name),
            Self::Remove(req) => write!(f, "Remove({})", req.name),
            Self::Mount(req) => write!(f, "Mount({}, id={})", req.name, req.id),
            Self::Unmount(req) => write!(f, "Unmount({}, id={})", req.name, req.id),
            Self::Path(req) => write!(f, "Path({})", req.name),
            Self::Get(req) => write!(f, "Get({})", req.name),
            Self::List => f.write_str("List"),
            Self::Capabilities => f.write_str("Capabilities"),
        }
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// A volume as shown by `Get` and `List`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeEntry {
    pub name: String,
    pub mountpoint: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub status: BTreeMap<String, serde_json::Value>,
}

impl VolumeEntry {
    /// Entry for `List`: no status.
    pub fn summary(info: VolumeInfo) -> Self {
        Self {
            name: info.name,
            mountpoint: info.mountpoint,
            created_at: info.created_at,
            status: BTreeMap::new(),
        }
    }

    /// Entry for `Get`: status carries the host-local mount count.
    pub fn detailed(info: VolumeInfo) -> Self {
        let mounts = info.mounts;
        let mut entry = Self::summary(info);
        entry.status.insert("mounts".to_owned(), mounts.into());
        entry
    }
}

/// Body of the `Capabilities` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CapabilitiesBody {
    pub scope: String,
}

impl From<Capabilities> for CapabilitiesBody {
    fn from(caps: Capabilities) -> Self {
        Self {
            scope: caps.scope.to_string(),
        }
    }
}

/// Reply to a [`PluginRequest`].
///
/// Every variant but `Activate` and `Capabilities` carries `Err`, empty on
/// success.  A failure is always the bare [`PluginResponse::Error`] shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PluginResponse {
    Activate {
        #[serde(rename = "Implements")]
        implements: Vec<String>,
    },
    Mountpoint {
        #[serde(rename = "Mountpoint")]
        mountpoint: String,
        #[serde(rename = "Err")]
        err: String,
    },
    Volume {
        #[serde(rename = "Volume")]
        volume: VolumeEntry,
        #[serde(rename = "Err")]
        err: String,
    },
    Volumes {
        #[serde(rename = "Volumes")]
        volumes: Vec<VolumeEntry>,
        #[serde(rename = "Err")]
        err: String,
    },
    Capabilities {
        #[serde(rename = "Capabilities")]
        capabilities: CapabilitiesBody,
    },
    /// Success without payload (`err` empty) or a failure.
    Error {
        #[serde(rename = "Err")]
        err: String,
    },
}

impl PluginResponse {
    pub fn ok() -> Self {
        Self::Error { err: String::new() }
    }

    pub fn error(e: &VolError) -> Self {
        Self::Error { err: e.to_string() }
    }

    pub fn activate() -> Self {
        Self::Activate {
            implements: vec![VOLUME_DRIVER.to_owned()],
        }
    }

    pub fn mountpoint(mountpoint: String) -> Self {
        Self::Mountpoint {
            mountpoint,
            err: String::new(),
        }
    }

    pub fn volume(volume: VolumeEntry) -> Self {
        Self::Volume {
            volume,
            err: String::new(),
        }
    }

    pub fn volumes(volumes: Vec<VolumeEntry>) -> Self {
        Self::Volumes {
            volumes,
            err: String::new(),
        }
    }

    /// Whether this reply reports a failure.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { err } if !err.is_empty())
    }

    /// The failure message, if any.
    pub fn err(&self) -> Option<&str> {
        match self {
            Self::Error { err } if !err.is_empty() => Some(err),
            _ => None,
        }
    }
}

//! Resource sizing document (`resources.json.tmpl`).

use serde::{Deserialize, Serialize};

use crate::error::{ManifestError, ManifestResult};

pub const DEFAULT_EPHEMERAL_STORAGE_MB: i32 = 512;
pub const DEFAULT_MEMORY_MB: i32 = 128;
pub const DEFAULT_TIMEOUT_SECS: i32 = 3;

/// Effective sizing and HTTP exposure for a function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    pub ephemeral_storage: i32,
    pub memory_size: i32,
    pub timeout: i32,
    pub http: bool,
    pub public: bool,
    pub route_key: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Overrides {
    ephemeral_storage: Option<i32>,
    memory_size: Option<i32>,
    timeout: Option<i32>,
    http: Option<bool>,
    public: Option<bool>,
    route_key: Option<String>,
}

impl Resources {
    pub fn defaults(route_key: String) -> Self {
        Self {
            ephemeral_storage: DEFAULT_EPHEMERAL_STORAGE_MB,
            memory_size: DEFAULT_MEMORY_MB,
            timeout: DEFAULT_TIMEOUT_SECS,
            http: true,
            public: false,
            route_key,
        }
    }

    /// Overlay a document onto the defaults. Zero numbers and empty route
    /// keys keep the default; booleans apply whenever present.
    pub fn parse(document: Option<&str>, default_route_key: String) -> ManifestResult<Self> {
        let mut resources = Self::defaults(default_route_key);
        let Some(document) = document.filter(|d| !d.trim().is_empty()) else {
            return Ok(resources);
        };

        let overrides: Overrides =
            serde_json::from_str(document).map_err(|source| ManifestError::InvalidJson {
                origin: "resources".to_string(),
                source,
            })?;

        if let Some(v) = overrides.ephemeral_storage.filter(|v| *v != 0) {
            resources.ephemeral_storage = v;
        }
        if let Some(v) = overrides.memory_size.filter(|v| *v != 0) {
            resources.memory_size = v;
        }
        if let Some(v) = overrides.timeout.filter(|v| *v != 0) {
            resources.timeout = v;
        }
        if let Some(v) = overrides.http {
            resources.http = v;
        }
        if let Some(v) = overrides.public {
            resources.public = v;
        }
        if let Some(v) = overrides.route_key.filter(|v| !v.is_empty()) {
            resources.route_key = v;
        }
        Ok(resources)
    }

    /// Path part of the route key, e.g. `/repo/main/svc/{proxy+}`.
    pub fn route_path(&self) -> &str {
        self.route_key
            .split_once(' ')
            .map_or(self.route_key.as_str(), |(_, path)| path)
    }
}

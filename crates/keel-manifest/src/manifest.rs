//! Manifest values and their decode/template stages.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::path::PathBuf;

use keel_core::{RepositoryPrefix, TemplateData};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ManifestResult;
use crate::resources::Resources;
use crate::schema::{
    KEY_BRANCH, KEY_BUS, KEY_NAME, KEY_ORIGIN, KEY_POLICY, KEY_RESOURCES, KEY_ROLE, KEY_SCHEMA,
    KEY_SHA,
};
use crate::template;

/// Flat label map as stored on an image.
pub type Labels = BTreeMap<String, String>;

/// Bus used when a rule file sits directly in the rules folder.
pub const DEFAULT_BUS: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldValue {
    pub content: String,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
}

/// Manifest fields keyed by full label key. Folder entries appear under
/// their expanded keys, e.g. `io.keel.bus.default.nightly`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub fields: BTreeMap<String, FieldValue>,
}

/// One event bus rule declared by a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRule {
    pub key: String,
    pub bus: String,
    pub rule: String,
    pub content: String,
}

impl Manifest {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(|f| f.content.as_str())
    }

    fn required(&self, key: &str) -> &str {
        self.get(key).unwrap_or_default()
    }

    pub fn schema(&self) -> &str {
        self.required(KEY_SCHEMA)
    }

    pub fn name(&self) -> &str {
        self.required(KEY_NAME)
    }

    pub fn branch(&self) -> &str {
        self.required(KEY_BRANCH)
    }

    pub fn sha(&self) -> &str {
        self.required(KEY_SHA)
    }

    pub fn origin(&self) -> &str {
        self.required(KEY_ORIGIN)
    }

    pub fn role(&self) -> &str {
        self.required(KEY_ROLE)
    }

    pub fn policy(&self) -> &str {
        self.required(KEY_POLICY)
    }

    pub fn resources_document(&self) -> Option<&str> {
        self.get(KEY_RESOURCES)
    }

    pub fn repository_prefix(&self) -> ManifestResult<RepositoryPrefix> {
        Ok(RepositoryPrefix::from_origin(self.origin())?)
    }

    /// Sizing and HTTP exposure, with defaults for anything unset.
    pub fn resources(&self, owner_prefix: bool) -> ManifestResult<Resources> {
        let prefix = self.repository_prefix()?;
        let route_key = keel_core::identity::route_key(&prefix, self.branch(), self.name(), owner_prefix);
        Resources::parse(self.resources_document(), route_key)
    }

    /// Declared bus rules. `<bus>.<rule>` suffixes map onto a bus and rule;
    /// a bare `<rule>` lands on [`DEFAULT_BUS`].
    pub fn bus_rules(&self) -> Vec<BusRule> {
        let prefix = format!("{KEY_BUS}.");
        self.fields
            .iter()
            .filter_map(|(key, value)| {
                let suffix = key.strip_prefix(&prefix)?;
                let parts: Vec<&str> = suffix.split('.').collect();
                let (bus, rule) = match parts.as_slice() {
                    [rule] => (DEFAULT_BUS, *rule),
                    [bus, rule] => (*bus, *rule),
                    [bus, rule, ..] => {
                        warn!(%key, "bus rule key has more than two segments, using the first two");
                        (*bus, *rule)
                    }
                    [] => return None,
                };
                Some(BusRule {
                    key: key.clone(),
                    bus: bus.to_string(),
                    rule: rule.to_string(),
                    content: value.content.clone(),
                })
            })
            .collect()
    }
}

/// A manifest straight out of [`crate::decode`], templates unrendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedManifest(pub(crate) Manifest);

/// A manifest with deploy-time values substituted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplatedManifest(Manifest);

impl DecodedManifest {
    /// Render every field once. Consuming `self` keeps templated output from
    /// being rendered a second time.
    pub fn template(self, data: &TemplateData) -> ManifestResult<TemplatedManifest> {
        let mut manifest = self.0;
        for (key, field) in manifest.fields.iter_mut() {
            field.content = template::render(key, &field.content, data)?;
        }
        Ok(TemplatedManifest(manifest))
    }

    pub fn into_inner(self) -> Manifest {
        self.0
    }
}

impl Deref for DecodedManifest {
    type Target = Manifest;

    fn deref(&self) -> &Manifest {
        &self.0
    }
}

impl TemplatedManifest {
    pub fn into_inner(self) -> Manifest {
        self.0
    }
}

impl Deref for TemplatedManifest {
    type Target = Manifest;

    fn deref(&self) -> &Manifest {
        &self.0
    }
}

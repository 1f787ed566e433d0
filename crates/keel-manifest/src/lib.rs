//! keel-manifest — the deployment manifest carried as image labels.
//!
//! At build time [`encode`] reads a function directory and produces a flat
//! label map. At deploy time [`decode`] turns the labels back into a
//! [`DecodedManifest`], which is templated exactly once into a
//! [`TemplatedManifest`] with the deploy account and region.

pub mod canonical;
pub mod decode;
pub mod encode;
pub mod error;
pub mod manifest;
pub mod resources;
pub mod schema;
pub mod template;

pub use decode::decode;
pub use encode::{EncodedManifest, encode};
pub use error::{ManifestError, ManifestResult};
pub use manifest::{BusRule, DecodedManifest, FieldValue, Labels, Manifest, TemplatedManifest};
pub use resources::Resources;
pub use schema::{FieldKind, LabelField, SCHEMA, SCHEMA_VERSION};

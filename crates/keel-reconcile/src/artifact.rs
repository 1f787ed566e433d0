//! Artifact resolution: registry image → templated manifest.

use keel_core::KeelConfig;
use keel_manifest::{TemplatedManifest, decode};
use keel_platform::{Artifact, Deployment, ImageRef, Platform};
use tracing::debug;

use crate::error::{ReconcileError, ReconcileResult};

/// Decode and template the labels an artifact carries.
pub fn manifest_of(config: &KeelConfig, artifact: &Artifact) -> ReconcileResult<TemplatedManifest> {
    let manifest = decode(&artifact.labels)?.template(&config.template_data())?;
    debug!(repository = %artifact.repository, digest = %artifact.digest, "resolved manifest");
    Ok(manifest)
}

pub async fn resolve(
    platform: &Platform,
    config: &KeelConfig,
    repository: &str,
    reference: &ImageRef,
) -> ReconcileResult<(Artifact, TemplatedManifest)> {
    let artifact = platform.registry.inspect(repository, reference).await?;
    let manifest = manifest_of(config, &artifact)?;
    Ok((artifact, manifest))
}

/// Re-resolve the manifest of the image a deployment is running.
pub async fn manifest_for(
    platform: &Platform,
    config: &KeelConfig,
    deployment: &Deployment,
) -> ReconcileResult<TemplatedManifest> {
    let repository = deployment
        .repository()
        .ok_or_else(|| ReconcileError::InvalidImageUri(deployment.code.image_uri.clone()))?;
    let reference = ImageRef::Digest(deployment.code_digest.clone());
    let (_, manifest) = resolve(platform, config, repository, &reference).await?;
    Ok(manifest)
}

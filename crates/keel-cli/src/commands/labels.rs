use std::path::Path;

use keel_core::GitContext;
use keel_manifest::encode::{EncodedManifest, encode, encode_function};

pub fn labels(
    path: &Path,
    function: Option<&str>,
    git: GitContext,
    format: &str,
) -> anyhow::Result<()> {
    let encoded = match function {
        Some(name) => encode_function(path, name, &git)?,
        None => encode(path, &git)?,
    };

    match format {
        "docker" => println!("{}", docker_args(&encoded)),
        _ => println!("{}", serde_json::to_string_pretty(&encoded.labels)?),
    }
    Ok(())
}

/// `--label k=v` arguments for `docker build`, one per line.
fn docker_args(encoded: &EncodedManifest) -> String {
    encoded
        .labels
        .iter()
        .map(|(k, v)| format!("--label {k}={v}"))
        .collect::<Vec<_>>()
        .join(" \\\n")
}

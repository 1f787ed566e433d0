//! Build-time encoding: function directory → label map.

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use keel_core::GitContext;
use tracing::{debug, info};

use crate::canonical::canonicalize;
use crate::error::{ManifestError, ManifestResult};
use crate::manifest::{FieldValue, Labels, Manifest};
use crate::schema::{BuildInput, SCHEMA};

/// Labels for the image plus the canonical manifest they encode.
#[derive(Debug, Clone)]
pub struct EncodedManifest {
    pub manifest: Manifest,
    pub labels: Labels,
}

/// Encode the function in `dir`. The function name is the directory name.
pub fn encode(dir: &Path, git: &GitContext) -> ManifestResult<EncodedManifest> {
    let function = dir
        .canonicalize()
        .ok()
        .as_deref()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    encode_function(dir, &function, git)
}

/// Encode with an explicit function name.
pub fn encode_function(
    dir: &Path,
    function: &str,
    git: &GitContext,
) -> ManifestResult<EncodedManifest> {
    let input = BuildInput { dir, function, git };
    let mut manifest = Manifest::default();
    let mut labels = Labels::new();

    for field in SCHEMA {
        let items = field.kind.load(&input)?;
        if items.is_empty() {
            if field.required.encode {
                return Err(ManifestError::RequiredFieldMissing(field.key.to_string()));
            }
            debug!(key = field.key, "optional field absent");
            continue;
        }

        for item in items {
            let key = match &item.suffix {
                Some(suffix) => format!("{}.{suffix}", field.key),
                None => field.key.to_string(),
            };
            let content = canonicalize(&item.origin, &item.content)?;
            labels.insert(key.clone(), STANDARD.encode(content.as_bytes()));
            manifest.fields.insert(
                key,
                FieldValue {
                    content,
                    required: field.required.decode,
                    source: item.source,
                },
            );
        }
    }

    info!(function, labels = labels.len(), "encoded manifest");
    Ok(EncodedManifest { manifest, labels })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{KEY_BUS, KEY_POLICY, KEY_RESOURCES, KEY_SCHEMA};
    use std::fs;

    fn git() -> GitContext {
        GitContext {
            branch: "main".into(),
            sha: "0123456789abcdef0123456789abcdef01234567".into(),
            origin: "https://github.com/org/repo.git".into(),
        }
    }

    fn function_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("policy.json.tmpl"),
            "{\n  \"Version\": \"2012-10-17\",\n  \"Statement\": []\n}\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn encodes_required_fields() {
        let dir = function_dir();
        let encoded = encode_function(dir.path(), "svc", &git()).unwrap();

        assert_eq!(encoded.manifest.get(KEY_SCHEMA), Some("1.1"));
        assert_eq!(encoded.manifest.name(), "svc");
        assert_eq!(
            encoded.manifest.get(KEY_POLICY),
            Some(r#"{"Version":"2012-10-17","Statement":[]}"#)
        );
        assert!(encoded.manifest.role().contains("lambda.amazonaws.com"));
        assert!(!encoded.labels.contains_key(KEY_RESOURCES));
        assert_eq!(
            STANDARD.decode(&encoded.labels[KEY_SCHEMA]).unwrap(),
            b"1.1".to_vec()
        );
    }

    #[test]
    fn missing_policy_is_required_field_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = encode_function(dir.path(), "svc", &git()).unwrap_err();
        assert!(matches!(err, ManifestError::RequiredFieldMissing(ref k) if k == KEY_POLICY));
    }

    #[test]
    fn empty_git_value_is_required_field_missing() {
        let dir = function_dir();
        let mut git = git();
        git.sha.clear();
        let err = encode_function(dir.path(), "svc", &git).unwrap_err();
        assert!(matches!(err, ManifestError::RequiredFieldMissing(ref k) if k == "io.keel.git.sha"));
    }

    #[test]
    fn bus_folder_expands_to_one_label_per_file() {
        let dir = function_dir();
        let bus = dir.path().join("bus");
        fs::create_dir_all(bus.join("default")).unwrap();
        fs::create_dir_all(bus.join("orders")).unwrap();
        fs::write(bus.join("default/nightly.tmpl"), "cron(0 3 * * ? *)\n").unwrap();
        fs::write(
            bus.join("orders/created.json.tmpl"),
            "{ \"source\": [\"shop\"] }",
        )
        .unwrap();

        let encoded = encode_function(dir.path(), "svc", &git()).unwrap();
        assert_eq!(
            encoded.manifest.get(&format!("{KEY_BUS}.default.nightly")),
            Some("cron(0 3 * * ? *)")
        );
        assert_eq!(
            encoded.manifest.get(&format!("{KEY_BUS}.orders.created")),
            Some(r#"{"source":["shop"]}"#)
        );
    }

    #[test]
    fn invalid_json_file_fails() {
        let dir = function_dir();
        fs::write(dir.path().join("resources.json.tmpl"), "{ memorySize: 1 }").unwrap();
        let err = encode_function(dir.path(), "svc", &git()).unwrap_err();
        assert!(matches!(err, ManifestError::InvalidJson { .. }));
    }

    #[test]
    fn encoding_is_deterministic() {
        let dir = function_dir();
        let a = encode_function(dir.path(), "svc", &git()).unwrap();
        let b = encode_function(dir.path(), "svc", &git()).unwrap();
        assert_eq!(a.labels, b.labels);
    }

    #[test]
    fn encode_uses_directory_name() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("billing");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("policy.json.tmpl"), "{}").unwrap();
        let encoded = encode(&dir, &git()).unwrap();
        assert_eq!(encoded.manifest.name(), "billing");
    }
}

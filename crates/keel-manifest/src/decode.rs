//! Deploy-time decoding: label map → manifest.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::{ManifestError, ManifestResult};
use crate::manifest::{DecodedManifest, FieldValue, Labels, Manifest};
use crate::schema::SCHEMA;

/// Decode every known field. Unknown keys are ignored so manifests written
/// by newer schemas still decode.
pub fn decode(labels: &Labels) -> ManifestResult<DecodedManifest> {
    let mut manifest = Manifest::default();

    for field in SCHEMA {
        if field.kind.is_folder() {
            let prefix = format!("{}.", field.key);
            let mut found = 0;
            for (key, value) in labels.range(prefix.clone()..) {
                if !key.starts_with(&prefix) {
                    break;
                }
                manifest
                    .fields
                    .insert(key.clone(), decode_value(key, value, field.required.decode)?);
                found += 1;
            }
            if found == 0 && field.required.decode {
                return Err(ManifestError::RequiredFieldMissing(field.key.to_string()));
            }
            continue;
        }

        match labels.get(field.key) {
            Some(value) => {
                manifest.fields.insert(
                    field.key.to_string(),
                    decode_value(field.key, value, field.required.decode)?,
                );
            }
            None if field.required.decode => {
                return Err(ManifestError::RequiredFieldMissing(field.key.to_string()));
            }
            None => {}
        }
    }

    Ok(DecodedManifest(manifest))
}

fn decode_value(key: &str, value: &str, required: bool) -> ManifestResult<FieldValue> {
    let bytes = STANDARD
        .decode(value.trim())
        .map_err(|source| ManifestError::Base64 {
            key: key.to_string(),
            source,
        })?;
    let content = String::from_utf8(bytes).map_err(|_| ManifestError::InvalidUtf8 {
        key: key.to_string(),
    })?;
    Ok(FieldValue {
        content,
        required,
        source: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::encode_function;
    use crate::schema::{KEY_BUS, KEY_POLICY, KEY_RESOURCES};
    use keel_core::GitContext;
    use std::fs;

    fn git() -> GitContext {
        GitContext {
            branch: "feature/x".into(),
            sha: "0123456789abcdef0123456789abcdef01234567".into(),
            origin: "git@github.com:org/repo.git".into(),
        }
    }

    fn encoded_labels() -> (tempfile::TempDir, crate::EncodedManifest) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("policy.json.tmpl"),
            r#"{ "Statement": [ { "Resource": "arn:aws:s3:::{{.AccountId}}-data" } ] }"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("resources.json.tmpl"),
            "{\n  \"memorySize\": 256,\n  \"public\": true\n}\n",
        )
        .unwrap();
        fs::create_dir_all(dir.path().join("bus/default")).unwrap();
        fs::write(dir.path().join("bus/default/tick.tmpl"), "rate(5 minutes)\n").unwrap();
        let encoded = encode_function(dir.path(), "svc", &git()).unwrap();
        (dir, encoded)
    }

    #[test]
    fn decode_reproduces_canonical_content() {
        let (_dir, encoded) = encoded_labels();
        let decoded = decode(&encoded.labels).unwrap();

        assert_eq!(decoded.fields.len(), encoded.manifest.fields.len());
        for (key, field) in &encoded.manifest.fields {
            assert_eq!(decoded.get(key), Some(field.content.as_str()), "{key}");
        }
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let (_dir, mut encoded) = encoded_labels();
        encoded
            .labels
            .insert("io.keel.future.field".into(), "!!not base64!!".into());
        encoded
            .labels
            .insert("org.opencontainers.image.title".into(), "svc".into());
        assert!(decode(&encoded.labels).is_ok());
    }

    #[test]
    fn missing_required_key_fails() {
        let (_dir, mut encoded) = encoded_labels();
        encoded.labels.remove(KEY_POLICY);
        let err = decode(&encoded.labels).unwrap_err();
        assert!(matches!(err, ManifestError::RequiredFieldMissing(ref k) if k == KEY_POLICY));
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let (_dir, mut encoded) = encoded_labels();
        encoded.labels.remove(KEY_RESOURCES);
        encoded.labels.retain(|k, _| !k.starts_with(KEY_BUS));
        let decoded = decode(&encoded.labels).unwrap();
        assert!(decoded.resources_document().is_none());
        assert!(decoded.bus_rules().is_empty());
    }

    #[test]
    fn bad_base64_is_schema_error() {
        let (_dir, mut encoded) = encoded_labels();
        encoded.labels.insert(KEY_POLICY.into(), "%%%".into());
        let err = decode(&encoded.labels).unwrap_err();
        assert!(err.is_schema_error());
    }

    #[test]
    fn decode_then_template() {
        let (_dir, encoded) = encoded_labels();
        let data = keel_core::TemplateData {
            account_id: "123456789012".into(),
            region: "us-east-1".into(),
            registry_account_id: "123456789012".into(),
            registry_region: "us-east-1".into(),
        };
        let templated = decode(&encoded.labels).unwrap().template(&data).unwrap();
        assert_eq!(
            templated.policy(),
            r#"{"Statement":[{"Resource":"arn:aws:s3:::123456789012-data"}]}"#
        );
        let resources = templated.resources(false).unwrap();
        assert_eq!(resources.memory_size, 256);
        assert!(resources.public);
        assert_eq!(resources.route_key, "ANY /repo/feature/x/svc/{proxy+}");

        let rules = templated.bus_rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].bus, "default");
        assert_eq!(rules[0].rule, "tick");
        assert_eq!(rules[0].content, "rate(5 minutes)");
    }
}

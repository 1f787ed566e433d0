//! Canonical content form.
//!
//! JSON is validated and compacted so identical input always yields identical
//! label bytes. Key order and number spelling are left as written.

use crate::error::{ManifestError, ManifestResult};

/// Canonicalize content loaded from `origin` (a file or embedded name).
pub fn canonicalize(origin: &str, content: &str) -> ManifestResult<String> {
    if origin.contains(".json") {
        compact_json(origin, content)
    } else {
        Ok(content.trim_matches(['\r', '\n']).to_string())
    }
}

/// Strip whitespace outside string literals after checking the input parses.
pub fn compact_json(origin: &str, content: &str) -> ManifestResult<String> {
    serde_json::from_str::<serde::de::IgnoredAny>(content).map_err(|source| {
        ManifestError::InvalidJson {
            origin: origin.to_string(),
            source,
        }
    })?;

    let mut out = String::with_capacity(content.len());
    let mut in_string = false;
    let mut escaped = false;
    for c in content.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            ' ' | '\t' | '\n' | '\r' => {}
            '"' => {
                in_string = true;
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}

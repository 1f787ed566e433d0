//! Deploy-time template rendering.
//!
//! Supports `{{.Name}}` substitution of the variables in
//! [`TemplateData`]. Any other action is rejected rather than passed
//! through.

use std::sync::LazyLock;

use keel_core::TemplateData;
use regex::Regex;

use crate::error::{ManifestError, ManifestResult};

static ACTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{-?\s*(.*?)\s*-?\}\}").expect("invalid action pattern"));

static VARIABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\.([A-Za-z_][A-Za-z0-9_]*)$").expect("invalid variable pattern")
});

/// Render `content`; `origin` names the field in errors.
pub fn render(origin: &str, content: &str, data: &TemplateData) -> ManifestResult<String> {
    let mut out = String::with_capacity(content.len());
    let mut last = 0;

    for caps in ACTION.captures_iter(content) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let literal = &content[last..whole.start()];
        check_literal(origin, literal)?;
        out.push_str(literal);

        let action = inner.as_str();
        let value = VARIABLE
            .captures(action)
            .and_then(|v| v.get(1))
            .ok_or_else(|| template_error(origin, format!("unsupported action {{{{{action}}}}}")))
            .and_then(|name| {
                data.lookup(name.as_str()).ok_or_else(|| {
                    template_error(origin, format!("unknown variable .{}", name.as_str()))
                })
            })?;
        out.push_str(value);
        last = whole.end();
    }

    let tail = &content[last..];
    check_literal(origin, tail)?;
    out.push_str(tail);
    Ok(out)
}

fn check_literal(origin: &str, literal: &str) -> ManifestResult<()> {
    if literal.contains("{{") {
        return Err(template_error(origin, "unclosed action".to_string()));
    }
    Ok(())
}

fn template_error(origin: &str, reason: String) -> ManifestError {
    ManifestError::Template {
        origin: origin.to_string(),
        reason,
    }
}

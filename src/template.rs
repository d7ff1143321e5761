//! `{{ dotted.path }}` substitution against the definition.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use time::OffsetDateTime;

use crate::definition::Definition;

/// Nested templates are re-rendered at most this many times.
const MAX_PASSES: usize = 8;

/// Build the render context for a definition.
///
/// The context is the serialized definition plus `image.serial`, the UTC build
/// time as `YYYYMMDD_HHMM`.
pub fn context_for(definition: &Definition) -> Result<Value> {
    let mut ctx = serde_json::to_value(definition).context("serializing definition")?;
    if let Some(image) = ctx.get_mut("image").and_then(Value::as_object_mut) {
        image.insert("serial".to_string(), Value::String(build_serial()));
    }
    Ok(ctx)
}

/// Render `template` against `ctx`.
pub fn render(template: &str, ctx: &Value) -> Result<String> {
    let mut current = template.to_string();
    for _ in 0..MAX_PASSES {
        if !current.contains("{{") {
            return Ok(current);
        }
        current = render_once(&current, ctx)?;
    }
    if current.contains("{{") {
        bail!("template nesting too deep: {}", template);
    }
    Ok(current)
}

fn render_once(template: &str, ctx: &Value) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .with_context(|| format!("unterminated placeholder in '{}'", template))?;
        let path = after[..end].trim();
        out.push_str(&lookup(ctx, path)?);
        rest = &after[end + 2..];
    }
    out.push_str(rest);

    Ok(out)
}

fn lookup(ctx: &Value, path: &str) -> Result<String> {
    if path.is_empty() {
        bail!("empty placeholder");
    }

    let mut node = ctx;
    for key in path.split('.') {
        node = match node {
            Value::Object(map) => map.get(key),
            Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
        .with_context(|| format!("unknown template variable '{}'", path))?;
    }

    Ok(match node {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn build_serial() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}_{:02}{:02}",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_substitutes_dotted_paths() {
        let ctx = json!({"image": {"release": "bionic", "architecture": "amd64"}});
        let out = render("deb http://x/{{ image.release }}/{{image.architecture}}", &ctx).unwrap();
        assert_eq!(out, "deb http://x/bionic/amd64");
    }

    #[test]
    fn test_render_without_placeholders_is_identity() {
        let out = render("plain text", &json!({})).unwrap();
        assert_eq!(out, "plain text");
    }

    #[test]
    fn test_render_nested_templates() {
        let ctx = json!({"a": "{{ b }}", "b": "done"});
        assert_eq!(render("{{ a }}", &ctx).unwrap(), "done");
    }

    #[test]
    fn test_render_unknown_variable_fails() {
        let err = render("{{ image.nope }}", &json!({"image": {}})).unwrap_err();
        assert!(err.to_string().contains("image.nope"));
    }

    #[test]
    fn test_render_self_reference_is_bounded() {
        let ctx = json!({"a": "{{ a }}"});
        assert!(render("{{ a }}", &ctx).is_err());
    }

    #[test]
    fn test_context_contains_serial() {
        let def = Definition::parse(
            "[image]\ndistribution = \"ubuntu\"\nrelease = \"bionic\"\n",
        )
        .unwrap();
        let ctx = context_for(&def).unwrap();
        let serial = ctx["image"]["serial"].as_str().unwrap();
        assert_eq!(serial.len(), "YYYYMMDD_HHMM".len());
        assert_eq!(render("{{ image.distribution }}", &ctx).unwrap(), "ubuntu");
    }
}

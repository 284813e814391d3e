//! `{{variable}}` template parsing and rendering.
//!
//! Templates interpolate fields from a node's input map. A token addresses a
//! nested field with dots and array indexes, e.g. `{{user.tags[0]}}`. Tokens
//! whose value is missing render back as their literal text; tokens whose
//! producer was skipped by branch routing render as the empty string.

use serde_json::Value;

use crate::utils::ValueMap;

/// One parsed segment of a template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TemplatePart {
    Literal(String),
    /// An interpolation token: the raw text between the braces plus the
    /// parsed path segments (array indexes become numeric segments).
    Variable { raw: String, segments: Vec<String> },
}

impl TemplatePart {
    /// Root field name of a variable part.
    #[must_use]
    pub fn root(&self) -> Option<&str> {
        match self {
            TemplatePart::Variable { segments, .. } => segments.first().map(String::as_str),
            TemplatePart::Literal(_) => None,
        }
    }
}

/// How a variable token resolved during rendering.
#[derive(Clone, Debug, PartialEq)]
pub enum Rendered {
    Found(Value),
    /// The producing node was skipped; renders as empty.
    Skipped,
    /// No value present; the token renders as its literal text.
    Missing,
}

/// Split a template into literal and variable parts.
///
/// Unterminated `{{` sequences are kept as literals.
#[must_use]
pub fn parse_template(template: &str) -> Vec<TemplatePart> {
    let mut parts = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let Some(end_rel) = rest[start + 2..].find("}}") else {
            break;
        };
        let end = start + 2 + end_rel;
        if start > 0 {
            parts.push(TemplatePart::Literal(rest[..start].to_string()));
        }
        let raw = &rest[start + 2..end];
        parts.push(TemplatePart::Variable {
            raw: raw.to_string(),
            segments: parse_token(raw),
        });
        rest = &rest[end + 2..];
    }
    if !rest.is_empty() {
        parts.push(TemplatePart::Literal(rest.to_string()));
    }
    parts
}

/// Parse `a.b[0].c` into `["a", "b", "0", "c"]`.
fn parse_token(raw: &str) -> Vec<String> {
    let mut segments = Vec::new();
    for piece in raw.trim().split('.') {
        let mut name = piece;
        let mut indexes = Vec::new();
        while let Some(open) = name.rfind('[') {
            if let Some(close) = name[open..].find(']') {
                let idx = &name[open + 1..open + close];
                if idx.chars().all(|c| c.is_ascii_digit()) && !idx.is_empty() {
                    indexes.push(idx.to_string());
                    name = &name[..open];
                    continue;
                }
            }
            break;
        }
        if !name.is_empty() {
            segments.push(name.to_string());
        }
        indexes.reverse();
        segments.extend(indexes);
    }
    segments
}

/// Look a parsed token up in an input map, descending through objects and
/// arrays (numeric segments index arrays).
#[must_use]
pub fn lookup<'a>(map: &'a ValueMap, segments: &[String]) -> Option<&'a Value> {
    let (first, rest) = segments.split_first()?;
    let mut current = map.get(first)?;
    for seg in rest {
        current = match current {
            Value::Object(obj) => obj.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Render a value into template output: strings verbatim, everything else as
/// compact JSON.
#[must_use]
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render a whole template against an input map.
#[must_use]
pub fn render(template: &str, input: &ValueMap) -> String {
    render_with(template, |part| match part {
        TemplatePart::Variable { segments, .. } => match lookup(input, segments) {
            Some(Value::Null) | None => Rendered::Missing,
            Some(value) => Rendered::Found(value.clone()),
        },
        TemplatePart::Literal(_) => Rendered::Missing,
    })
}

/// Render with a custom per-token resolver, e.g. to treat skipped producers
/// specially.
pub fn render_with(template: &str, mut resolve: impl FnMut(&TemplatePart) -> Rendered) -> String {
    let mut out = String::new();
    for part in parse_template(template) {
        match &part {
            TemplatePart::Literal(text) => out.push_str(text),
            TemplatePart::Variable { raw, .. } => match resolve(&part) {
                Rendered::Found(value) => out.push_str(&render_value(&value)),
                Rendered::Skipped => {}
                Rendered::Missing => {
                    out.push_str("{{");
                    out.push_str(raw);
                    out.push_str("}}");
                }
            },
        }
    }
    out
}

//! Template references between resources.
//!
//! Specs may embed `{{ .Keys.name.Field }}`, `{{ .Networks.name.Field }}`
//! and `{{ .VMs.name.Field }}` references. Rendering happens just in
//! time, against an immutable scope of already-ready resource states;
//! the DAG builder uses the same scanner to discover edges without
//! rendering anything.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use testenv_proto::spec::ResourceKind;
use testenv_proto::ProviderError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TemplateRef {
    pub kind: ResourceKind,
    pub name: String,
    pub field: String,
}

impl std::fmt::Display for TemplateRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, ".{}.{}.{}", kind_label(self.kind), self.name, self.field)
    }
}

fn kind_label(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Key => "Keys",
        ResourceKind::Network => "Networks",
        ResourceKind::Vm => "VMs",
    }
}

fn reference_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*\.(Keys|Networks|VMs)\.([A-Za-z0-9_-]+)\.([A-Za-z0-9_]+)\s*\}\}")
            .expect("reference regex")
    })
}

fn kind_from_label(label: &str) -> ResourceKind {
    match label {
        "Keys" => ResourceKind::Key,
        "Networks" => ResourceKind::Network,
        _ => ResourceKind::Vm,
    }
}

/// `PascalCase` reference fields map onto the camelCase state fields.
fn field_key(field: &str) -> String {
    let mut chars = field.chars();
    match chars.next() {
        Some(first) => first.to_ascii_lowercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

/// Collect every reference in a string.
pub fn scan_str(input: &str) -> Vec<TemplateRef> {
    reference_re()
        .captures_iter(input)
        .map(|caps| TemplateRef {
            kind: kind_from_label(&caps[1]),
            name: caps[2].to_string(),
            field: caps[3].to_string(),
        })
        .collect()
}

/// Collect every reference in all string leaves of a JSON value.
pub fn scan_value(value: &Value) -> Vec<TemplateRef> {
    let mut refs = Vec::new();
    collect(value, &mut refs);
    refs
}

fn collect(value: &Value, refs: &mut Vec<TemplateRef>) {
    match value {
        Value::String(s) => refs.extend(scan_str(s)),
        Value::Array(items) => items.iter().for_each(|v| collect(v, refs)),
        Value::Object(map) => map.values().for_each(|v| collect(v, refs)),
        _ => {}
    }
}

/// Immutable render scope: resource states keyed by `(kind, name)`.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    entries: HashMap<(ResourceKind, String), Value>,
}

impl Scope {
    pub fn insert(&mut self, kind: ResourceKind, name: impl Into<String>, state: Value) {
        self.entries.insert((kind, name.into()), state);
    }

    pub fn get(&self, kind: ResourceKind, name: &str) -> Option<&Value> {
        self.entries.get(&(kind, name.to_string()))
    }

    fn resolve(&self, reference: &TemplateRef) -> Result<String, ProviderError> {
        let state = self
            .get(reference.kind, &reference.name)
            .ok_or_else(|| dangling(reference, "resource is not ready in this scope"))?;
        let field = state
            .get(field_key(&reference.field))
            .ok_or_else(|| dangling(reference, "state has no such field"))?;
        match field {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            _ => Err(ProviderError::invalid_spec(format!(
                "template reference {reference} does not resolve to a scalar"
            ))),
        }
    }
}

fn dangling(reference: &TemplateRef, why: &str) -> ProviderError {
    ProviderError::invalid_spec(format!("dangling template reference {reference}: {why}"))
        .with_detail("reference", reference.to_string())
}

/// Render a string, substituting every reference. All dangling
/// references are reported, not just the first.
pub fn render_str(input: &str, scope: &Scope) -> Result<String, ProviderError> {
    let mut failures: Vec<ProviderError> = Vec::new();
    let rendered = reference_re().replace_all(input, |caps: &regex::Captures<'_>| {
        let reference = TemplateRef {
            kind: kind_from_label(&caps[1]),
            name: caps[2].to_string(),
            field: caps[3].to_string(),
        };
        match scope.resolve(&reference) {
            Ok(value) => value,
            Err(e) => {
                failures.push(e);
                String::new()
            }
        }
    });
    match failures.len() {
        0 => Ok(rendered.into_owned()),
        1 => Err(failures.remove(0)),
        n => {
            let mut err = ProviderError::invalid_spec(format!("{n} dangling template references"));
            for (i, failure) in failures.into_iter().enumerate() {
                err = err.with_detail(format!("reference.{i}"), failure.message);
            }
            Err(err)
        }
    }
}

/// Render every string leaf of a JSON value.
pub fn render_value(value: &Value, scope: &Scope) -> Result<Value, ProviderError> {
    match value {
        Value::String(s) => Ok(Value::String(render_str(s, scope)?)),
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|v| render_value(v, scope))
                .collect::<Result<_, _>>()?,
        )),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, v) in map {
                out.insert(key.clone(), render_value(v, scope)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

// SPDX-License-Identifier: MIT

//! Template resolution against layered run context
//!
//! Parameter values may contain placeholders of the form `{{chain.NAME}}`,
//! `{{steps.STEP_ID.output.FIELD}}`, `{{steps.STEP_ID.status}}` or a bare
//! `{{NAME}}` resolved from externally injected context. Resolution is
//! textual substitution: each placeholder is looked up and stringified.
//! Unresolved placeholders become the empty string and a warning is
//! recorded — templates may legitimately reference optional upstream
//! fields, so this is never fatal.

use serde_json::{Map, Value};
use serde::{Deserialize, Serialize};

/// Layered context a run accumulates while executing.
///
/// `chain` holds caller-supplied parameters (plus declared defaults),
/// `steps` holds one entry per finished step keyed by step id, and
/// `injected` holds flattened values supplied by the invocation context
/// (resolvable by bare name).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunContext {
    #[serde(default)]
    pub chain: Map<String, Value>,
    #[serde(default)]
    pub steps: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub injected: Map<String, Value>,
}

impl RunContext {
    pub fn new(chain: Map<String, Value>, injected: Map<String, Value>) -> Self {
        Self {
            chain,
            steps: Map::new(),
            injected,
        }
    }

    /// Record a finished step's context entry under its id
    pub fn record_step(&mut self, step_id: &str, entry: Value) {
        self.steps.insert(step_id.to_string(), entry);
    }

    /// Look up a dotted placeholder path across the context layers.
    ///
    /// `chain.*` and `steps.*` address their layers explicitly; a bare
    /// name resolves from the injected layer first, then chain.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let parts: Vec<&str> = path.split('.').collect();
        match parts.first().copied() {
            Some("chain") => traverse_map(&self.chain, &parts[1..]),
            Some("steps") => traverse_map(&self.steps, &parts[1..]),
            Some(_) => traverse_map(&self.injected, &parts)
                .or_else(|| traverse_map(&self.chain, &parts)),
            None => None,
        }
    }
}

fn traverse_map(map: &Map<String, Value>, parts: &[&str]) -> Option<Value> {
    let (first, rest) = parts.split_first()?;
    let root = map.get(*first)?;
    traverse(root, rest)
}

/// Walk a dotted path into a value. String values are transparently
/// re-parsed as JSON so that `steps.s1.output.mgmt_ip` works whether the
/// step output was stored structured or as raw text.
fn traverse(value: &Value, parts: &[&str]) -> Option<Value> {
    let mut current = value.clone();
    for part in parts {
        current = match current {
            Value::Object(ref obj) => obj.get(*part)?.clone(),
            Value::String(ref s) => lookup_in_text(s, part)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Pull a key out of text output: first try the whole string as a JSON
/// object, then scan for embedded flat `{...}` objects (command output
/// often concatenates several) and use the first one carrying the key.
fn lookup_in_text(text: &str, key: &str) -> Option<Value> {
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(text) {
        return obj.get(key).cloned();
    }
    for candidate in embedded_objects(text) {
        if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(candidate) {
            if let Some(v) = obj.get(key) {
                return Some(v.clone());
            }
        }
    }
    None
}

/// Spans of non-nested `{...}` within text
fn embedded_objects(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    for (i, b) in bytes.iter().enumerate() {
        match b {
            b'{' => start = Some(i),
            b'}' => {
                if let Some(s) = start.take() {
                    spans.push(&text[s..=i]);
                }
            }
            _ => {}
        }
    }
    spans
}

/// Resolve every `{{...}}` placeholder in `template` against `ctx`.
/// Unresolved references substitute the empty string and append a
/// warning to `warnings`.
pub fn resolve(template: &str, ctx: &RunContext, warnings: &mut Vec<String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                let path = after[..close].trim();
                match ctx.lookup(path) {
                    Some(value) => out.push_str(&stringify(&value)),
                    None => {
                        warnings.push(format!("unresolved template reference '{}'", path));
                    }
                }
                rest = &after[close + 2..];
            }
            None => {
                // unbalanced braces; emit the remainder verbatim
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Step ids referenced as `{{steps.<id>...}}` within a template. Used by
/// the validator to reject forward references at save time.
pub fn step_refs(template: &str) -> Vec<String> {
    placeholder_heads(template, "steps")
}

/// Chain parameter names referenced as `{{chain.<name>...}}`. The
/// coordinator uses this to fail a step whose template needs a declared
/// required parameter the caller never supplied.
pub fn chain_refs(template: &str) -> Vec<String> {
    placeholder_heads(template, "chain")
}

fn placeholder_heads(template: &str, layer: &str) -> Vec<String> {
    let mut refs = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else { break };
        let parts: Vec<&str> = after[..close].trim().split('.').collect();
        if parts.len() >= 2 && parts[0] == layer {
            refs.push(parts[1].to_string());
        }
        rest = &after[close + 2..];
    }
    refs
}

/// Stringify a context value the way placeholder substitution does:
/// strings verbatim, null as empty, everything else via JSON rendering.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

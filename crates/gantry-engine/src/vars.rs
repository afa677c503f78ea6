//! Hierarchical build variable scopes and `((var))` interpolation.
//!
//! Each `across` axis introduces a child scope; `load_var` writes into
//! the build's root scope, which stays visible through every child.
//! Bindings carry a redact flag so loaded secrets can be kept out of
//! logs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct VarBinding {
    pub value: serde_json::Value,
    pub redact: bool,
}

#[derive(Debug, Default)]
pub struct VarScope {
    parent: Option<Arc<VarScope>>,
    locals: Mutex<HashMap<String, VarBinding>>,
}

impl VarScope {
    #[must_use]
    pub fn root() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A child scope; lookups fall back to the parent chain.
    #[must_use]
    pub fn child(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            parent: Some(self.clone()),
            locals: Mutex::new(HashMap::new()),
        })
    }

    /// Bind a variable in this scope, shadowing any parent binding.
    pub fn add_local(&self, name: &str, value: serde_json::Value, redact: bool) {
        if let Ok(mut locals) = self.locals.lock() {
            locals.insert(name.to_string(), VarBinding { value, redact });
        }
    }

    /// Resolve a variable, walking up the parent chain.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<VarBinding> {
        if let Ok(locals) = self.locals.lock() {
            if let Some(binding) = locals.get(name) {
                return Some(binding.clone());
            }
        }
        self.parent.as_ref().and_then(|parent| parent.get(name))
    }
}

/// Substitute `((name))` references in a JSON document.
///
/// A string consisting solely of one reference is replaced by the
/// variable's value with its type intact; references embedded in a
/// larger string substitute the value's string form. Unknown variables
/// are left as written.
#[must_use]
pub fn interpolate(value: &serde_json::Value, scope: &VarScope) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => interpolate_string(s, scope),
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items.iter().map(|item| interpolate(item, scope)).collect(),
        ),
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), interpolate(item, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn interpolate_string(raw: &str, scope: &VarScope) -> serde_json::Value {
    if let Some(name) = raw
        .strip_prefix("((")
        .and_then(|rest| rest.strip_suffix("))"))
    {
        if !name.contains("((") {
            if let Some(binding) = scope.get(name.trim()) {
                return binding.value;
            }
            return serde_json::Value::String(raw.to_string());
        }
    }

    let mut result = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(open) = rest.find("((") {
        let (before, tail) = rest.split_at(open);
        result.push_str(before);
        match tail[2..].find("))") {
            Some(close) => {
                let name = tail[2..2 + close].trim();
                match scope.get(name) {
                    Some(binding) => match binding.value {
                        serde_json::Value::String(s) => result.push_str(&s),
                        other => result.push_str(&other.to_string()),
                    },
                    None => result.push_str(&tail[..close + 4]),
                }
                rest = &tail[close + 4..];
            }
            None => {
                result.push_str(tail);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    serde_json::Value::String(result)
}

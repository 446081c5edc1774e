//! Scope rendering and container expansion behind the `variables` and
//! `variable` requests.

use std::collections::HashMap;

use regex::Regex;
use script::Value;
use tracing::warn;
use transport::params::{SetFilter, VarScope, VariableItem};

/// Visibility rules applied when listing a scope. Children of an expanded
/// container are never filtered.
#[derive(Debug)]
pub struct VariableFilters {
    global_patterns: Vec<Regex>,
    local_patterns: Vec<Regex>,
    hide_types: Vec<String>,
    show_hidden: bool,
}

impl Default for VariableFilters {
    fn default() -> Self {
        Self {
            global_patterns: Vec::new(),
            local_patterns: Vec::new(),
            hide_types: vec!["builtin".to_owned()],
            show_hidden: false,
        }
    }
}

impl VariableFilters {
    /// Replace the filter set. A pattern that fails to compile is skipped
    /// with a warning; the rest still apply.
    pub fn update(&mut self, params: &SetFilter) {
        self.global_patterns = compile_patterns(&params.global_patterns);
        self.local_patterns = compile_patterns(&params.local_patterns);
        self.hide_types = params.hide_types.clone();
        self.show_hidden = params.show_hidden;
    }

    fn excluded(&self, name: &str, type_name: &str, scope: VarScope) -> bool {
        if !self.show_hidden && name.starts_with("__") && name.ends_with("__") {
            return true;
        }
        if self.hide_types.iter().any(|hidden| hidden == type_name) {
            return true;
        }
        let patterns = match scope {
            VarScope::Global => &self.global_patterns,
            VarScope::Local => &self.local_patterns,
        };
        patterns.iter().any(|pattern| pattern.is_match(name))
    }
}

fn compile_patterns(raw: &[String]) -> Vec<Regex> {
    raw.iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(compiled) => Some(compiled),
            Err(error) => {
                warn!(%pattern, %error, "ignoring unparseable filter pattern");
                None
            }
        })
        .collect()
}

/// List a scope's bindings, filtered and sorted by name.
pub fn render_scope(
    locals: &HashMap<String, Value>,
    scope: VarScope,
    filters: &VariableFilters,
) -> Vec<VariableItem> {
    let mut names: Vec<&String> = locals.keys().collect();
    names.sort();
    names
        .into_iter()
        .filter(|name| !filters.excluded(name, locals[*name].type_name(), scope))
        .map(|name| item(name.clone(), &locals[name]))
        .collect()
}

/// Walk a `variable` request path down from the scope root. List segments
/// are decimal indices, map segments are keys.
pub fn resolve_path(locals: &HashMap<String, Value>, path: &[String]) -> Option<Value> {
    let (root, rest) = path.split_first()?;
    let mut current = locals.get(root)?.clone();
    for segment in rest {
        current = child_of(&current, segment)?;
    }
    Some(current)
}

fn child_of(value: &Value, segment: &str) -> Option<Value> {
    match value {
        Value::List(items) => {
            let index: usize = segment.parse().ok()?;
            items.borrow().get(index).cloned()
        }
        Value::Map(entries) => entries.borrow().get(segment).cloned(),
        _ => None,
    }
}

/// One level of children of a container value.
pub fn children_of(value: &Value) -> Vec<VariableItem> {
    match value {
        Value::List(items) => items
            .borrow()
            .iter()
            .enumerate()
            .map(|(index, child)| item(index.to_string(), child))
            .collect(),
        Value::Map(entries) => entries
            .borrow()
            .iter()
            .map(|(key, child)| item(key.clone(), child))
            .collect(),
        _ => Vec::new(),
    }
}

fn item(name: String, value: &Value) -> VariableItem {
    VariableItem {
        name,
        type_name: value.type_name().to_owned(),
        value: value.repr(),
        has_children: value.has_children(),
    }
}

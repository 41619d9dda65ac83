//! rc file format.
//!
//! One `key=value` pair per line. Dotted keys nest (`colors.primary=red`),
//! `key[]=value` appends to an array, `#` starts a comment line. Values are
//! read as JSON when they parse as such (`true`, `42`, `[1,2]`), otherwise as
//! plain strings with surrounding quotes removed.

use serde_json::{Map, Value};

/// Parse rc file content into an object.
pub fn parse_rc(content: &str) -> Map<String, Value> {
    let mut root = Map::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let (key, append) = match key.strip_suffix("[]") {
            Some(key) => (key, true),
            None => (key, false),
        };
        let path: Vec<&str> = key.split('.').filter(|s| !s.is_empty()).collect();
        if path.is_empty() {
            continue;
        }
        insert_path(&mut root, &path, parse_value(raw.trim()), append);
    }
    root
}

/// Interpret a raw scalar the way rc and env values are read.
pub fn parse_value(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::String(String::new());
    }
    if let Some(inner) = strip_quotes(raw) {
        return Value::String(inner.to_string());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn strip_quotes(raw: &str) -> Option<&str> {
    ['"', '\''].into_iter().find_map(|quote| {
        raw.strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
    })
}

/// Set `value` at `path` inside `root`, creating intermediate objects.
///
/// A non-object value in the way is replaced.
pub(crate) fn insert_path(root: &mut Map<String, Value>, path: &[&str], value: Value, append: bool) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = root;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else {
            return;
        };
        current = next;
    }

    if append {
        match current.get_mut(*last) {
            Some(Value::Array(items)) => items.push(value),
            _ => {
                current.insert(last.to_string(), Value::Array(vec![value]));
            }
        }
    } else {
        current.insert(last.to_string(), value);
    }
}

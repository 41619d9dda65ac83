//! Deep merge of configuration values.
//!
//! Implements field-by-field merging where higher precedence values override
//! lower precedence ones. Arrays are either concatenated (higher elements
//! first, duplicates dropped) or replaced entirely, depending on the
//! [`ArrayMerge`] strategy of the [`Merger`].

use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// How two arrays at the same key are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArrayMerge {
    /// The higher precedence array replaces the lower one.
    Replace,
    /// Higher precedence elements first, then lower ones, deduplicated.
    #[default]
    Concat,
}

/// Custom merge hook.
///
/// Called for every key present on both sides with the key path, the base
/// (lower precedence) value and the overlay (higher precedence) value.
/// Returning `Some` claims the key and supplies the merged value.
pub type MergeHook = Arc<dyn Fn(&[String], &Value, &Value) -> Option<Value> + Send + Sync>;

/// Configurable deep merger.
///
/// Merging is pure: inputs are borrowed and never modified.
#[derive(Clone, Default)]
pub struct Merger {
    arrays: ArrayMerge,
    hook: Option<MergeHook>,
}

impl fmt::Debug for Merger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Merger")
            .field("arrays", &self.arrays)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

impl Merger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the array strategy.
    pub fn with_arrays(mut self, arrays: ArrayMerge) -> Self {
        self.arrays = arrays;
        self
    }

    /// Install a custom merge hook.
    pub fn with_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&[String], &Value, &Value) -> Option<Value> + Send + Sync + 'static,
    {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// The array strategy in use.
    pub fn arrays(&self) -> ArrayMerge {
        self.arrays
    }

    /// Merge `overlay` over `base`, with `overlay` taking precedence.
    ///
    /// - Objects are merged recursively: keys in overlay override keys in base
    /// - Keys absent from overlay keep the base value
    /// - An explicit `null` in overlay overwrites the base value
    /// - Arrays follow the configured [`ArrayMerge`] strategy
    /// - Any other pairing: overlay replaces base entirely
    ///
    /// # Example
    /// ```
    /// use serde_json::json;
    /// use layerconf::merge::{ArrayMerge, Merger};
    ///
    /// let base = json!({
    ///     "server": { "port": 8080, "host": "localhost" },
    ///     "features": ["a", "b"]
    /// });
    /// let overlay = json!({
    ///     "server": { "port": 9000 },
    ///     "features": ["c"]
    /// });
    /// let merged = Merger::new().with_arrays(ArrayMerge::Replace).merge(&base, &overlay);
    /// assert_eq!(
    ///     merged,
    ///     json!({ "server": { "port": 9000, "host": "localhost" }, "features": ["c"] })
    /// );
    /// ```
    pub fn merge(&self, base: &Value, overlay: &Value) -> Value {
        let mut path = Vec::new();
        self.merge_at(&mut path, base, overlay)
    }

    /// Merge values in order, with later values taking precedence.
    pub fn merge_all<'a>(&self, values: impl IntoIterator<Item = &'a Value>) -> Value {
        values
            .into_iter()
            .fold(Value::Object(Map::new()), |acc, value| self.merge(&acc, value))
    }

    fn merge_at(&self, path: &mut Vec<String>, base: &Value, overlay: &Value) -> Value {
        match (base, overlay) {
            (Value::Object(base_map), Value::Object(overlay_map)) => {
                let mut merged = base_map.clone();
                for (key, overlay_value) in overlay_map {
                    path.push(key.clone());
                    let value = match base_map.get(key) {
                        Some(base_value) => self
                            .hook
                            .as_ref()
                            .and_then(|hook| hook(path, base_value, overlay_value))
                            .unwrap_or_else(|| self.merge_at(path, base_value, overlay_value)),
                        None => overlay_value.clone(),
                    };
                    merged.insert(key.clone(), value);
                    path.pop();
                }
                Value::Object(merged)
            }
            (Value::Array(base_items), Value::Array(overlay_items))
                if self.arrays == ArrayMerge::Concat =>
            {
                let mut items: Vec<Value> = Vec::with_capacity(base_items.len() + overlay_items.len());
                for item in overlay_items.iter().chain(base_items) {
                    if !items.contains(item) {
                        items.push(item.clone());
                    }
                }
                Value::Array(items)
            }
            (_, overlay) => overlay.clone(),
        }
    }
}

/// Merge `overlay` over `base` with the default [`Merger`].
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    Merger::default().merge(base, overlay)
}

/// Merge multiple values in order, with later values taking precedence.
///
/// Equivalent to folding `deep_merge` over the list.
pub fn deep_merge_all<'a>(values: impl IntoIterator<Item = &'a Value>) -> Value {
    Merger::default().merge_all(values)
}

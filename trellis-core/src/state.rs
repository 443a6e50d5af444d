//! The shared, mutable record of a run.

use crate::error::{PathError, RecipeError, Result};
use crate::path;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Keys whose value is always a mapping updated entry by entry.
pub const METRIC_KEYS: [&str; 2] = ["metrics", "test_metrics"];

/// Per-batch keys left out of snapshots.
pub const TRANSIENT_KEYS: [&str; 2] = ["batch", "batch_gpu"];

/// String-keyed state shared by a loop, its step function and its callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State {
    entries: BTreeMap<String, Value>,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    /// Empty state with an empty `metrics` mapping.
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert("metrics".to_string(), Value::empty_map());
        Self { entries }
    }

    /// Partial state without the `metrics` seed, for step outputs and syncs.
    pub fn partial() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Builder-style insert for partial states. Metric keys must hold maps.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Result<Self> {
        self.insert(key, value)?;
        Ok(self)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries.get_mut(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Set `key`, returning the previous value.
    ///
    /// A metric key can only be set to a mapping; anything else is rejected
    /// so a stray scalar never replaces accumulated metrics.
    pub fn insert(&mut self, key: &str, value: impl Into<Value>) -> Result<Option<Value>> {
        let value = value.into();
        guard_metric_key(key, &value)?;
        Ok(self.entries.insert(key.to_string(), value))
    }

    /// Shallow merge of `partial` into this state.
    ///
    /// Plain keys are overwritten. Metric keys are merged entry by entry into
    /// the existing mapping.
    pub fn update(&mut self, partial: State) -> Result<()> {
        for (key, value) in &partial.entries {
            guard_metric_key(key, value)?;
        }
        for (key, value) in partial.entries {
            match value {
                Value::Map(incoming) if is_metric_key(&key) => {
                    self.metric_map_mut(&key).extend(incoming);
                }
                value => {
                    self.entries.insert(key, value);
                }
            }
        }
        Ok(())
    }

    /// Replace a metric mapping wholesale, e.g. with a sub-loop's snapshot.
    pub fn replace_metrics(&mut self, key: &str, metrics: BTreeMap<String, Value>) {
        self.entries.insert(key.to_string(), Value::Map(metrics));
    }

    /// Resolve a dotted path against the whole state.
    pub fn by_key(&self, path: &str) -> Result<&Value, PathError> {
        path::resolve_in_map(&self.entries, path)
    }

    /// The `metrics` mapping, created on first use.
    pub fn metrics_mut(&mut self) -> &mut BTreeMap<String, Value> {
        self.metric_map_mut("metrics")
    }

    /// The `metrics` mapping, or an empty one if none exists yet.
    pub fn metrics(&self) -> BTreeMap<String, Value> {
        self.entries
            .get("metrics")
            .and_then(Value::as_map)
            .cloned()
            .unwrap_or_default()
    }

    fn metric_map_mut(&mut self, key: &str) -> &mut BTreeMap<String, Value> {
        let slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(Value::empty_map);
        if !matches!(slot, Value::Map(_)) {
            *slot = Value::empty_map();
        }
        match slot {
            Value::Map(map) => map,
            _ => unreachable!("metric slot was just normalised to a map"),
        }
    }

    /// Integer entry, erroring if it is missing or not an integer.
    pub fn int(&self, key: &str) -> Result<i64> {
        let value = self.entries.get(key).ok_or_else(|| {
            RecipeError::Path(PathError::KeyNotFound {
                path: key.to_string(),
                segment: key.to_string(),
            })
        })?;
        value.as_int().ok_or(RecipeError::TypeMismatch {
            key: key.to_string(),
            expected: "int",
            actual: value.kind(),
        })
    }

    /// Global iteration counter maintained by the `Counter` callback.
    pub fn iters(&self) -> Result<u64> {
        Ok(self.int("iters")?.max(0) as u64)
    }

    /// Copy of the state without per-batch entries.
    pub fn snapshot(&self) -> Value {
        Value::Map(
            self.entries
                .iter()
                .filter(|(k, _)| !TRANSIENT_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl From<BTreeMap<String, Value>> for State {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Self { entries }
    }
}

impl FromIterator<(String, Value)> for State {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for State {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

fn is_metric_key(key: &str) -> bool {
    METRIC_KEYS.contains(&key)
}

fn guard_metric_key(key: &str, value: &Value) -> Result<()> {
    if is_metric_key(key) && !matches!(value, Value::Map(_)) {
        return Err(RecipeError::ReservedKey {
            key: key.to_string(),
            kind: value.kind(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_new_has_metrics() {
        let state = State::new();
        assert!(state.metrics().is_empty());
        assert!(state.contains("metrics"));
        assert!(!State::partial().contains("metrics"));
    }

    #[test]
    fn test_update_overwrites_plain_keys() {
        let mut state = State::new();
        state.insert("loss", 1.0).unwrap();
        state
            .update(State::partial().with("loss", 0.5).unwrap())
            .unwrap();
        assert_eq!(state.get("loss"), Some(&Value::Float(0.5)));
    }

    #[test]
    fn test_update_merges_metrics() {
        let mut state = State::new();
        state.metrics_mut().insert("acc".into(), Value::Float(0.9));

        let mut incoming = BTreeMap::new();
        incoming.insert("loss".to_string(), Value::Float(0.1));
        state
            .update(State::partial().with("metrics", incoming).unwrap())
            .unwrap();

        let metrics = state.metrics();
        assert_eq!(metrics["acc"], Value::Float(0.9));
        assert_eq!(metrics["loss"], Value::Float(0.1));
    }

    #[test]
    fn test_metric_keys_reject_scalars() {
        let mut state = State::new();
        assert!(matches!(
            state.insert("metrics", 3),
            Err(RecipeError::ReservedKey { .. })
        ));
        let mut partial = State::partial();
        partial
            .entries
            .insert("test_metrics".into(), Value::Float(1.0));
        assert!(state.update(partial).is_err());
        assert!(state.metrics().is_empty());
    }

    #[test]
    fn test_rejected_update_leaves_state_untouched() {
        let mut state = State::new();
        let mut partial = State::partial();
        partial.insert("alpha", 1).unwrap();
        partial.entries.insert("metrics".into(), Value::Float(2.0));
        assert!(matches!(
            state.update(partial),
            Err(RecipeError::ReservedKey { .. })
        ));
        assert!(state.by_key("alpha").is_err());
        assert!(state.metrics().is_empty());
    }

    #[test]
    fn test_by_key() {
        let mut state = State::new();
        state.metrics_mut().insert("loss".into(), Value::Float(0.25));
        state
            .insert(
                "batch",
                Value::Tuple(vec![Value::Tensor(Tensor::scalar(1.0)), Value::Int(3)]),
            )
            .unwrap();
        assert_eq!(state.by_key("metrics.loss").unwrap(), &Value::Float(0.25));
        assert_eq!(state.by_key("batch.1").unwrap(), &Value::Int(3));
        assert!(state.by_key("metrics.acc").is_err());
        assert!(state.by_key("nope").is_err());
    }

    #[test]
    fn test_int_and_iters() {
        let mut state = State::new();
        assert!(state.iters().is_err());
        state.insert("iters", 12).unwrap();
        assert_eq!(state.iters().unwrap(), 12);
        state.insert("iters", "x").unwrap();
        assert!(matches!(
            state.int("iters"),
            Err(RecipeError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_snapshot_drops_batches() {
        let mut state = State::new();
        state.insert("batch", Value::Int(1)).unwrap();
        state.insert("batch_gpu", Value::Int(1)).unwrap();
        state.insert("iters", 4).unwrap();
        let snap = state.snapshot();
        let map = snap.as_map().unwrap();
        assert!(!map.contains_key("batch"));
        assert!(!map.contains_key("batch_gpu"));
        assert_eq!(map["iters"], Value::Int(4));
    }
}

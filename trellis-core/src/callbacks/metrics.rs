//! Metric averaging callbacks.

use crate::callback::Callback;
use crate::error::{RecipeError, Result};
use crate::state::State;
use crate::value::Value;
use std::collections::VecDeque;

/// Moving average over the last `k` logged values.
#[derive(Debug, Clone)]
pub struct WindowAvg {
    k: usize,
    values: VecDeque<f64>,
}

impl WindowAvg {
    pub fn new(k: usize) -> Self {
        let k = k.max(1);
        Self {
            k,
            values: VecDeque::with_capacity(k),
        }
    }

    pub fn log(&mut self, x: f64) {
        if self.values.len() == self.k {
            self.values.pop_front();
        }
        self.values.push_back(x);
    }

    /// Average of the window; 0 before anything was logged.
    pub fn get(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }
}

/// Running weighted average since the last reset.
#[derive(Debug, Clone, Default)]
pub struct RunningAvg {
    total: f64,
    count: f64,
}

impl RunningAvg {
    pub fn log(&mut self, x: f64, n: f64) {
        self.total += x;
        self.count += n;
    }

    pub fn get(&self) -> f64 {
        if self.count == 0.0 {
            0.0
        } else {
            self.total / self.count
        }
    }
}

fn scalar_entry(state: &State, key: &str) -> Result<f64> {
    let value = state.by_key(key)?;
    value.as_scalar().ok_or(RecipeError::TypeMismatch {
        key: key.to_string(),
        expected: "scalar",
        actual: value.kind(),
    })
}

/// Moving average of `state[name]`, published to `metrics[name]`.
#[derive(Debug, Clone)]
pub struct WindowedMetricAvg {
    name: String,
    avg: WindowAvg,
    post_each_batch: bool,
}

impl WindowedMetricAvg {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_window(name, 100)
    }

    pub fn with_window(name: impl Into<String>, window: usize) -> Self {
        Self {
            name: name.into(),
            avg: WindowAvg::new(window),
            post_each_batch: true,
        }
    }

    /// Publish only at epoch end.
    pub fn epoch_end_only(mut self) -> Self {
        self.post_each_batch = false;
        self
    }
}

impl Callback for WindowedMetricAvg {
    fn name(&self) -> &str {
        "WindowedMetricAvg"
    }

    fn on_batch_end(&mut self, state: &mut State) -> Result<()> {
        self.avg.log(scalar_entry(state, &self.name)?);
        if self.post_each_batch {
            state
                .metrics_mut()
                .insert(self.name.clone(), Value::Float(self.avg.get()));
        }
        Ok(())
    }

    fn on_epoch_end(&mut self, state: &mut State) -> Result<()> {
        state
            .metrics_mut()
            .insert(self.name.clone(), Value::Float(self.avg.get()));
        Ok(())
    }
}

/// Average of `state[name]` over the current epoch.
#[derive(Debug, Clone)]
pub struct EpochMetricAvg {
    name: String,
    avg: RunningAvg,
    post_each_batch: bool,
}

impl EpochMetricAvg {
    pub fn new(name: impl Into<String>, post_each_batch: bool) -> Self {
        Self {
            name: name.into(),
            avg: RunningAvg::default(),
            post_each_batch,
        }
    }
}

impl Callback for EpochMetricAvg {
    fn name(&self) -> &str {
        "EpochMetricAvg"
    }

    fn on_epoch_start(&mut self, _state: &mut State) -> Result<()> {
        self.avg = RunningAvg::default();
        Ok(())
    }

    fn on_batch_end(&mut self, state: &mut State) -> Result<()> {
        self.avg.log(scalar_entry(state, &self.name)?, 1.0);
        if self.post_each_batch {
            state
                .metrics_mut()
                .insert(self.name.clone(), Value::Float(self.avg.get()));
        }
        Ok(())
    }

    fn on_epoch_end(&mut self, state: &mut State) -> Result<()> {
        state
            .metrics_mut()
            .insert(self.name.clone(), Value::Float(self.avg.get()));
        Ok(())
    }
}

/// Classification accuracy of `pred` (row-wise argmax of `[N, classes]`
/// scores) against the labels in `batch.1`, averaged over the epoch into
/// `metrics.acc`.
#[derive(Debug, Clone)]
pub struct AccAvg {
    avg: RunningAvg,
    post_each_batch: bool,
}

impl AccAvg {
    pub fn new(post_each_batch: bool) -> Self {
        Self {
            avg: RunningAvg::default(),
            post_each_batch,
        }
    }
}

impl Default for AccAvg {
    fn default() -> Self {
        Self::new(true)
    }
}

fn labels(value: &Value) -> Result<Vec<usize>> {
    let bad = || RecipeError::TypeMismatch {
        key: "batch.1".into(),
        expected: "class labels",
        actual: value.kind(),
    };
    match value {
        Value::Tensor(t) => t.class_indices().ok_or_else(bad),
        Value::List(items) | Value::Tuple(items) => items
            .iter()
            .map(|v| {
                v.as_int()
                    .and_then(|y| usize::try_from(y).ok())
                    .ok_or_else(bad)
            })
            .collect(),
        _ => Err(bad()),
    }
}

impl Callback for AccAvg {
    fn name(&self) -> &str {
        "AccAvg"
    }

    fn on_epoch_start(&mut self, _state: &mut State) -> Result<()> {
        self.avg = RunningAvg::default();
        Ok(())
    }

    fn on_batch_end(&mut self, state: &mut State) -> Result<()> {
        let pred = state.by_key("pred")?;
        let pred = pred.as_tensor().ok_or(RecipeError::TypeMismatch {
            key: "pred".into(),
            expected: "tensor",
            actual: pred.kind(),
        })?;
        let guesses = pred.argmax_rows()?;
        let truth = labels(state.by_key("batch.1")?)?;
        if guesses.len() != truth.len() {
            return Err(RecipeError::callback(format!(
                "AccAvg: {} predictions for {} labels",
                guesses.len(),
                truth.len()
            )));
        }
        let correct = guesses.iter().zip(&truth).filter(|(g, y)| g == y).count();
        self.avg.log(correct as f64, guesses.len() as f64);

        if self.post_each_batch {
            state
                .metrics_mut()
                .insert("acc".into(), Value::Float(self.avg.get()));
        }
        Ok(())
    }

    fn on_epoch_end(&mut self, state: &mut State) -> Result<()> {
        state
            .metrics_mut()
            .insert("acc".into(), Value::Float(self.avg.get()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::Hook;
    use crate::tensor::Tensor;

    fn metric(state: &State, name: &str) -> f64 {
        state.metrics()[name].as_scalar().unwrap()
    }

    #[test]
    fn test_window_avg_drops_old_values() {
        let mut avg = WindowAvg::new(2);
        assert_eq!(avg.get(), 0.0);
        for x in [1.0, 2.0, 4.0] {
            avg.log(x);
        }
        assert_eq!(avg.get(), 3.0);
    }

    #[test]
    fn test_windowed_metric_avg_posts_each_batch() {
        let mut cb = WindowedMetricAvg::with_window("loss", 2);
        let mut state = State::new();
        for loss in [4.0, 2.0, 0.0] {
            state.insert("loss", Tensor::scalar(loss)).unwrap();
            cb.call(Hook::OnBatchEnd, &mut state).unwrap();
        }
        assert_eq!(metric(&state, "loss"), 1.0);
    }

    #[test]
    fn test_windowed_epoch_end_only() {
        let mut cb = WindowedMetricAvg::new("loss").epoch_end_only();
        let mut state = State::new();
        state.insert("loss", 3.0).unwrap();
        cb.call(Hook::OnBatchEnd, &mut state).unwrap();
        assert!(!state.metrics().contains_key("loss"));
        cb.call(Hook::OnEpochEnd, &mut state).unwrap();
        assert_eq!(metric(&state, "loss"), 3.0);
    }

    #[test]
    fn test_epoch_metric_avg_resets() {
        let mut cb = EpochMetricAvg::new("loss", false);
        let mut state = State::new();
        for epoch_losses in [[1.0, 3.0], [10.0, 20.0]] {
            cb.call(Hook::OnEpochStart, &mut state).unwrap();
            for loss in epoch_losses {
                state.insert("loss", loss).unwrap();
                cb.call(Hook::OnBatchEnd, &mut state).unwrap();
            }
            cb.call(Hook::OnEpochEnd, &mut state).unwrap();
        }
        assert_eq!(metric(&state, "loss"), 15.0);
    }

    #[test]
    fn test_missing_metric_is_an_error() {
        let mut cb = EpochMetricAvg::new("loss", true);
        let mut state = State::new();
        assert!(matches!(
            cb.call(Hook::OnBatchEnd, &mut state),
            Err(RecipeError::Path(_))
        ));
    }

    #[test]
    fn test_acc_avg() {
        let mut cb = AccAvg::default();
        let mut state = State::new();
        cb.call(Hook::OnEpochStart, &mut state).unwrap();

        // Rows argmax to 1, 0, 1; labels 1, 1, 1.
        let pred = Tensor::new(vec![0.1, 0.9, 0.8, 0.2, 0.3, 0.7], vec![3, 2]).unwrap();
        state.insert("pred", pred).unwrap();
        state
            .insert(
                "batch",
                Value::Tuple(vec![Value::Null, Value::Tensor(Tensor::from_slice(&[1.0, 1.0, 1.0]))]),
            )
            .unwrap();
        cb.call(Hook::OnBatchEnd, &mut state).unwrap();
        assert!((metric(&state, "acc") - 2.0 / 3.0).abs() < 1e-9);

        state
            .insert(
                "batch",
                Value::Tuple(vec![Value::Null, Value::List(vec![Value::Int(1), Value::Int(0), Value::Int(1)])]),
            )
            .unwrap();
        cb.call(Hook::OnBatchEnd, &mut state).unwrap();
        assert!((metric(&state, "acc") - 5.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_acc_avg_rejects_bad_labels() {
        let mut cb = AccAvg::default();
        let mut state = State::new();
        let pred = Tensor::new(vec![0.1, 0.9, 0.8, 0.2], vec![2, 2]).unwrap();
        state.insert("pred", pred).unwrap();
        for labels in [
            Value::Tensor(Tensor::from_slice(&[1.0, 0.5])),
            Value::List(vec![Value::Int(1), Value::Int(-1)]),
        ] {
            state
                .insert("batch", Value::Tuple(vec![Value::Null, labels]))
                .unwrap();
            assert!(matches!(
                cb.call(Hook::OnBatchEnd, &mut state),
                Err(RecipeError::TypeMismatch { .. })
            ));
        }
    }
}

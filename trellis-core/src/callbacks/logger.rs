//! Periodic metric reporting.

use crate::callback::Callback;
use crate::error::{RecipeError, Result};
use crate::state::State;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::info;

/// One emission of a loop's `metrics`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub prefix: String,
    pub epoch: i64,
    pub iters: i64,
    pub epoch_end: bool,
    pub metrics: BTreeMap<String, Value>,
}

/// Destination for metric reports.
pub trait MetricSink: Send {
    fn emit(&mut self, report: &Report) -> Result<()>;
}

/// Writes each report as one `info` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn emit(&mut self, report: &Report) -> Result<()> {
        let line = report
            .metrics
            .iter()
            .map(|(k, v)| format!("{k}={}", render(v)))
            .collect::<Vec<_>>()
            .join(" ");
        info!(
            prefix = %report.prefix,
            epoch = report.epoch,
            iters = report.iters,
            epoch_end = report.epoch_end,
            "{line}"
        );
        Ok(())
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Float(x) => format!("{x:.4}"),
        Value::Tensor(t) => match t.item() {
            Some(x) => format!("{x:.4}"),
            None => format!("tensor{:?}", t.shape()),
        },
        Value::Map(m) => format!("{{{} entries}}", m.len()),
        Value::List(v) | Value::Tuple(v) => format!("[{} items]", v.len()),
        Value::Int(i) => i.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Str(s) => s.clone(),
        Value::Null => "null".to_string(),
    }
}

/// Keeps every report in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    reports: Arc<Mutex<Vec<Report>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Result<Vec<Report>> {
        let guard = self
            .reports
            .lock()
            .map_err(|e| RecipeError::poisoned("metric sink", e))?;
        Ok(guard.clone())
    }
}

impl MetricSink for MemorySink {
    fn emit(&mut self, report: &Report) -> Result<()> {
        self.reports
            .lock()
            .map_err(|e| RecipeError::poisoned("metric sink", e))?
            .push(report.clone());
        Ok(())
    }
}

/// Emits `metrics` every `log_every` iterations and at the end of every epoch.
///
/// With `log_every <= 0` only the epoch-end report is produced.
pub struct MetricLogger {
    sink: Box<dyn MetricSink>,
    log_every: i64,
    prefix: String,
}

impl MetricLogger {
    /// Logger writing through [`TracingSink`].
    pub fn new(log_every: i64) -> Self {
        Self {
            sink: Box::new(TracingSink),
            log_every,
            prefix: String::new(),
        }
    }

    pub fn with_sink(mut self, sink: impl MetricSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn report(&mut self, state: &State, epoch_end: bool) -> Result<()> {
        let counter = |key| state.get(key).and_then(Value::as_int).unwrap_or(0);
        let report = Report {
            prefix: self.prefix.clone(),
            epoch: counter("epoch"),
            iters: counter("iters"),
            epoch_end,
            metrics: state.metrics(),
        };
        self.sink.emit(&report)
    }
}

impl Callback for MetricLogger {
    fn name(&self) -> &str {
        "MetricLogger"
    }

    fn on_batch_end(&mut self, state: &mut State) -> Result<()> {
        if self.log_every <= 0 {
            return Ok(());
        }
        let iters = state.get("iters").and_then(Value::as_int).unwrap_or(0);
        if iters % self.log_every == 0 {
            self.report(state, false)?;
        }
        Ok(())
    }

    fn on_epoch_end(&mut self, state: &mut State) -> Result<()> {
        self.report(state, true)
    }
}

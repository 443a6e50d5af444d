//! The callback-driven training loop.

use crate::callback::{CallbackRunner, Hook};
use crate::data::DataSource;
use crate::device::{Device, send_to_device};
use crate::error::{RecipeError, Result};
use crate::state::State;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error, info, info_span};

/// User step: one batch in, a partial state to merge out.
///
/// Any `FnMut(&Value, &State) -> Result<State>` closure is a step.
pub trait Step: Send {
    fn step(&mut self, batch: &Value, state: &State) -> Result<State>;
}

impl<F> Step for F
where
    F: FnMut(&Value, &State) -> Result<State> + Send,
{
    fn step(&mut self, batch: &Value, state: &State) -> Result<State> {
        self(batch, state)
    }
}

/// Where a [`Recipe`] currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Idle,
    EpochRunning,
    BatchRunning,
    Done,
}

/// A data source, a step function and a callback pipeline wired into a loop.
///
/// Per epoch: `on_epoch_start`; then for every batch: store `batch` and its
/// device copy `batch_gpu`, `on_batch_start`, the step on `batch_gpu`, merge
/// of the step output (moved back to the CPU), `on_batch_end`; finally
/// `on_epoch_end`. Counters are not maintained here; register a
/// [`Counter`](crate::callbacks::Counter) prologue for that.
pub struct Recipe {
    name: String,
    step: Box<dyn Step>,
    data: Box<dyn DataSource>,
    callbacks: CallbackRunner,
    state: State,
    device: Device,
    phase: LoopPhase,
    nested: bool,
}

impl Recipe {
    pub fn new(name: impl Into<String>, step: impl Step + 'static, data: impl DataSource + 'static) -> Self {
        Self {
            name: name.into(),
            step: Box::new(step),
            data: Box::new(data),
            callbacks: CallbackRunner::new(),
            state: State::new(),
            device: Device::Cpu,
            phase: LoopPhase::Idle,
            nested: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run batches on `device` from now on.
    pub fn to(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Mark this recipe as driven by a parent loop.
    pub fn set_nested(&mut self, nested: bool) {
        self.nested = nested;
    }

    pub fn is_nested(&self) -> bool {
        self.nested
    }

    pub fn set_device(&mut self, device: Device) {
        self.device = device;
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    pub fn callbacks(&self) -> &CallbackRunner {
        &self.callbacks
    }

    pub fn callbacks_mut(&mut self) -> &mut CallbackRunner {
        &mut self.callbacks
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }

    /// Merge `partial` into the loop state, e.g. counters from a parent loop.
    pub fn update_state(&mut self, partial: State) -> Result<()> {
        self.state.update(partial)
    }

    /// Run `epochs` full passes over the data source.
    ///
    /// Errors from the data source, the step or any callback end the run
    /// immediately and are returned unchanged.
    pub fn run(&mut self, epochs: usize) -> Result<&State> {
        let span = info_span!("recipe", name = %self.name);
        let _enter = span.enter();
        debug!(epochs, device = %self.device, "Starting loop");

        for epoch in 0..epochs {
            self.phase = LoopPhase::EpochRunning;
            self.callbacks.invoke(Hook::OnEpochStart, &mut self.state)?;

            let mut batches = 0usize;
            for batch in self.data.batches() {
                let batch = batch?;
                self.phase = LoopPhase::BatchRunning;
                self.run_batch(batch)?;
                self.phase = LoopPhase::EpochRunning;
                batches += 1;
            }

            self.callbacks.invoke(Hook::OnEpochEnd, &mut self.state)?;
            debug!(epoch, batches, "Epoch finished");
        }

        self.phase = LoopPhase::Done;
        if self.nested {
            debug!(recipe = %self.name, epochs, "Sub-loop finished");
        } else {
            info!(recipe = %self.name, epochs, "Loop finished");
        }
        Ok(&self.state)
    }

    fn run_batch(&mut self, batch: Value) -> Result<()> {
        let batch_gpu = send_to_device(&batch, self.device);
        self.state.insert("batch", batch)?;
        self.state.insert("batch_gpu", batch_gpu)?;
        self.callbacks.invoke(Hook::OnBatchStart, &mut self.state)?;

        // Callbacks may have replaced the device batch; step on what is stored.
        let batch_gpu = self
            .state
            .get("batch_gpu")
            .ok_or_else(|| RecipeError::step("'batch_gpu' was removed before the step"))?;
        let out = self
            .step
            .step(batch_gpu, &self.state)
            .inspect_err(|e| error!(recipe = %self.name, error = %e, "Step failed"))?;

        let out: State = out
            .into_iter()
            .map(|(k, v)| {
                let v = send_to_device(&v, Device::Cpu);
                (k, v)
            })
            .collect();
        self.state.update(out)?;

        self.callbacks.invoke(Hook::OnBatchEnd, &mut self.state)
    }
}

impl fmt::Debug for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recipe")
            .field("name", &self.name)
            .field("device", &self.device)
            .field("phase", &self.phase)
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::Callback;
    use crate::data::{Steps, VecSource};
    use crate::tensor::Tensor;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    struct HookLog(Arc<Mutex<Vec<String>>>);

    impl Callback for HookLog {
        fn on_epoch_start(&mut self, _state: &mut State) -> Result<()> {
            self.0.lock().unwrap().push("epoch_start".into());
            Ok(())
        }

        fn on_batch_start(&mut self, state: &mut State) -> Result<()> {
            assert!(state.contains("batch") && state.contains("batch_gpu"));
            self.0.lock().unwrap().push("batch_start".into());
            Ok(())
        }

        fn on_batch_end(&mut self, state: &mut State) -> Result<()> {
            assert!(state.contains("loss"));
            self.0.lock().unwrap().push("batch_end".into());
            Ok(())
        }

        fn on_epoch_end(&mut self, _state: &mut State) -> Result<()> {
            self.0.lock().unwrap().push("epoch_end".into());
            Ok(())
        }
    }

    fn loss_step(_batch: &Value, _state: &State) -> Result<State> {
        State::partial().with("loss", 0.5)
    }

    #[test]
    fn test_event_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut recipe = Recipe::new("order", loss_step, Steps(2));
        recipe.callbacks_mut().add(HookLog(log.clone()));
        assert_eq!(recipe.phase(), LoopPhase::Idle);
        recipe.run(1).unwrap();
        assert_eq!(recipe.phase(), LoopPhase::Done);

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "epoch_start",
                "batch_start",
                "batch_end",
                "batch_start",
                "batch_end",
                "epoch_end"
            ]
        );
    }

    #[test]
    fn test_step_sees_device_batch_and_output_returns_to_cpu() {
        let batch = Value::Tuple(vec![
            Value::Tensor(Tensor::from_slice(&[1.0, 2.0])),
            Value::Int(1),
        ]);
        let step = |b: &Value, _: &State| -> Result<State> {
            let x = b.as_seq().and_then(|s| s[0].as_tensor()).cloned();
            let x = x.ok_or_else(|| RecipeError::step("missing input"))?;
            assert_eq!(x.device(), Device::Cuda(0));
            State::partial().with("pred", x)
        };
        let mut recipe = Recipe::new("devices", step, VecSource::new(vec![batch])).to(Device::Cuda(0));
        let state = recipe.run(1).unwrap();

        let pred = state.get("pred").and_then(Value::as_tensor).unwrap();
        assert_eq!(pred.device(), Device::Cpu);
        let stored = state.by_key("batch.0").unwrap().as_tensor().unwrap();
        assert_eq!(stored.device(), Device::Cpu);
        let on_gpu = state.by_key("batch_gpu.0").unwrap().as_tensor().unwrap();
        assert_eq!(on_gpu.device(), Device::Cuda(0));
    }

    #[test]
    fn test_step_error_propagates_and_stops() {
        let calls = Arc::new(Mutex::new(0));
        let seen = calls.clone();
        let step = move |_: &Value, _: &State| -> Result<State> {
            *seen.lock().unwrap() += 1;
            Err(RecipeError::step("diverged"))
        };
        let mut recipe = Recipe::new("failing", step, Steps(5));
        let err = recipe.run(3).unwrap_err();
        assert!(matches!(err, RecipeError::Step(_)));
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(recipe.phase(), LoopPhase::BatchRunning);
    }

    #[test]
    fn test_step_cannot_clobber_metrics() {
        let step = |_: &Value, _: &State| -> Result<State> {
            Ok(State::from_iter([("metrics".to_string(), Value::Float(1.0))]))
        };
        let mut recipe = Recipe::new("clobber", step, Steps(1));
        assert!(matches!(
            recipe.run(1),
            Err(RecipeError::ReservedKey { .. })
        ));
    }

    #[test]
    fn test_data_error_propagates() {
        let src = crate::data::FnSource::new(|| {
            vec![Ok(Value::Int(0)), Err(RecipeError::data("corrupt shard"))].into_iter()
        });
        let mut recipe = Recipe::new("data", loss_step, src);
        assert!(matches!(recipe.run(1), Err(RecipeError::Data(_))));
        assert_eq!(recipe.state().get("loss"), Some(&Value::Float(0.5)));
    }
}

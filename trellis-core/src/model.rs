//! What a classification recipe expects from a model and its optimizer.

use crate::error::Result;
use crate::module::{Module, Parameter};
use crate::state::State;
use crate::value::Value;

/// Parameter update rule.
pub trait Optimizer: Send {
    /// Apply one update using the gradients stored on `params`.
    fn step(&mut self, params: &mut [&mut Parameter]) -> Result<()>;

    fn zero_grad(&mut self, params: &mut [&mut Parameter]) {
        for p in params.iter_mut() {
            p.zero_grad();
        }
    }

    fn lr(&self) -> f64;

    fn set_lr(&mut self, lr: f64);

    /// Serializable optimizer state for checkpoints.
    fn state_dict(&self) -> Value {
        Value::Null
    }
}

/// A module that knows how to train and evaluate itself on one batch.
pub trait Model: Module {
    /// One optimization step. Returns entries to merge into the loop state,
    /// typically `loss` and `pred`.
    fn train_step(&mut self, batch: &Value, opt: &mut dyn Optimizer) -> Result<State>;

    /// Forward pass without updates.
    fn validation_step(&mut self, batch: &Value) -> Result<State>;

    fn make_optimizer(&self) -> Box<dyn Optimizer>;
}

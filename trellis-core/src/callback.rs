//! Lifecycle hooks and the ordered runner that dispatches them.

use crate::error::Result;
use crate::state::State;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::error;

/// Points in the loop lifecycle at which callbacks fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    OnEpochStart,
    OnBatchStart,
    OnBatchEnd,
    OnEpochEnd,
}

impl Hook {
    pub const ALL: [Hook; 4] = [
        Hook::OnEpochStart,
        Hook::OnBatchStart,
        Hook::OnBatchEnd,
        Hook::OnEpochEnd,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Hook::OnEpochStart => "on_epoch_start",
            Hook::OnBatchStart => "on_batch_start",
            Hook::OnBatchEnd => "on_batch_end",
            Hook::OnEpochEnd => "on_epoch_end",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A pluggable unit of behaviour run at loop lifecycle points.
///
/// Every hook defaults to a no-op; implement only the ones you need.
pub trait Callback: Send {
    /// Name used in logs when a hook fails.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn on_epoch_start(&mut self, _state: &mut State) -> Result<()> {
        Ok(())
    }

    fn on_batch_start(&mut self, _state: &mut State) -> Result<()> {
        Ok(())
    }

    fn on_batch_end(&mut self, _state: &mut State) -> Result<()> {
        Ok(())
    }

    fn on_epoch_end(&mut self, _state: &mut State) -> Result<()> {
        Ok(())
    }

    /// Dispatch `hook` to the matching method.
    fn call(&mut self, hook: Hook, state: &mut State) -> Result<()> {
        match hook {
            Hook::OnEpochStart => self.on_epoch_start(state),
            Hook::OnBatchStart => self.on_batch_start(state),
            Hook::OnBatchEnd => self.on_batch_end(state),
            Hook::OnEpochEnd => self.on_epoch_end(state),
        }
    }
}

/// Ordered callbacks: prologues, then callbacks, then epilogues.
#[derive(Default)]
pub struct CallbackRunner {
    prologues: Vec<Box<dyn Callback>>,
    callbacks: Vec<Box<dyn Callback>>,
    epilogues: Vec<Box<dyn Callback>>,
}

impl CallbackRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_prologue(&mut self, cb: impl Callback + 'static) -> &mut Self {
        self.prologues.push(Box::new(cb));
        self
    }

    pub fn add_prologues(&mut self, cbs: Vec<Box<dyn Callback>>) -> &mut Self {
        self.prologues.extend(cbs);
        self
    }

    pub fn add(&mut self, cb: impl Callback + 'static) -> &mut Self {
        self.callbacks.push(Box::new(cb));
        self
    }

    pub fn add_callbacks(&mut self, cbs: Vec<Box<dyn Callback>>) -> &mut Self {
        self.callbacks.extend(cbs);
        self
    }

    pub fn add_epilogue(&mut self, cb: impl Callback + 'static) -> &mut Self {
        self.epilogues.push(Box::new(cb));
        self
    }

    pub fn add_epilogues(&mut self, cbs: Vec<Box<dyn Callback>>) -> &mut Self {
        self.epilogues.extend(cbs);
        self
    }

    pub fn len(&self) -> usize {
        self.prologues.len() + self.callbacks.len() + self.epilogues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names in invocation order.
    pub fn names(&self) -> Vec<&str> {
        self.iter().map(|cb| cb.name()).collect()
    }

    fn iter(&self) -> impl Iterator<Item = &Box<dyn Callback>> {
        self.prologues
            .iter()
            .chain(self.callbacks.iter())
            .chain(self.epilogues.iter())
    }

    /// Call `hook` on every callback in order.
    ///
    /// The first failure stops the dispatch and is returned as-is.
    pub fn invoke(&mut self, hook: Hook, state: &mut State) -> Result<()> {
        let all = self
            .prologues
            .iter_mut()
            .chain(self.callbacks.iter_mut())
            .chain(self.epilogues.iter_mut());
        for cb in all {
            cb.call(hook, state).inspect_err(|e| {
                error!(callback = cb.name(), hook = hook.name(), error = %e, "Callback failed");
            })?;
        }
        Ok(())
    }
}

impl fmt::Debug for CallbackRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRunner")
            .field("callbacks", &self.names())
            .finish()
    }
}

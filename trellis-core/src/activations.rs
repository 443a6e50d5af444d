//! Capture of named intermediate outputs during a forward pass.

use crate::device::Device;
use crate::error::Result;
use crate::module::{Module, Parameter};
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Wraps a module and records the outputs its layers report while running.
///
/// Host tensors carry no autograd graph, so saved outputs are plain copies
/// that later updates to the model cannot alter. Every forward pass starts
/// from an empty record.
pub struct WithSavedActivations<M> {
    inner: M,
    names: Option<BTreeSet<String>>,
    activations: BTreeMap<String, Value>,
}

impl<M: Module> WithSavedActivations<M> {
    /// Record every layer the wrapped module reports.
    pub fn new(inner: M) -> Self {
        Self {
            inner,
            names: None,
            activations: BTreeMap::new(),
        }
    }

    /// Record only the named layers.
    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Run the wrapped module and return its output with this pass's layer
    /// outputs keyed by layer name.
    pub fn forward_with_activations(&mut self, input: &Value) -> Result<(Value, BTreeMap<String, Value>)> {
        let names = &self.names;
        let mut saved = BTreeMap::new();
        let out = self.inner.forward_recorded(input, &mut |name, value| {
            if names.as_ref().is_none_or(|keep| keep.contains(name)) {
                saved.insert(name.to_string(), value.clone());
            }
        })?;
        self.activations = saved.clone();
        Ok((out, saved))
    }

    /// Layer outputs of the most recent forward pass.
    pub fn activations(&self) -> &BTreeMap<String, Value> {
        &self.activations
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    pub fn into_inner(self) -> M {
        self.inner
    }
}

impl<M: Module> Module for WithSavedActivations<M> {
    fn forward(&mut self, input: &Value) -> Result<Value> {
        Ok(self.forward_with_activations(input)?.0)
    }

    fn forward_recorded(&mut self, input: &Value, record: &mut dyn FnMut(&str, &Value)) -> Result<Value> {
        let (out, saved) = self.forward_with_activations(input)?;
        for (name, value) in &saved {
            record(name.as_str(), value);
        }
        Ok(out)
    }

    fn set_training(&mut self, training: bool) {
        self.inner.set_training(training);
    }

    fn is_training(&self) -> bool {
        self.inner.is_training()
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.inner.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.inner.parameters_mut()
    }

    fn to_device(&mut self, device: Device) {
        self.inner.to_device(device);
    }
}

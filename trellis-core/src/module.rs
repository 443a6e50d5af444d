//! The capability set a recipe needs from a network, and wrappers over it.

use crate::device::Device;
use crate::error::Result;
use crate::tensor::Tensor;
use crate::value::Value;
use std::collections::BTreeMap;

/// A named trainable tensor with an optional gradient buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub data: Tensor,
    pub grad: Option<Tensor>,
    pub requires_grad: bool,
}

impl Parameter {
    pub fn new(name: impl Into<String>, data: Tensor) -> Self {
        Self {
            name: name.into(),
            data,
            grad: None,
            requires_grad: true,
        }
    }

    pub fn numel(&self) -> usize {
        self.data.numel()
    }

    pub fn zero_grad(&mut self) {
        self.grad = None;
    }
}

/// A network component: callable, switchable between train and eval mode,
/// and able to enumerate its parameters.
pub trait Module: Send {
    fn forward(&mut self, input: &Value) -> Result<Value>;

    /// Forward pass that also hands each named layer output to `record`.
    /// Modules without named layers report nothing.
    fn forward_recorded(&mut self, input: &Value, record: &mut dyn FnMut(&str, &Value)) -> Result<Value> {
        let _ = record;
        self.forward(input)
    }

    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    fn parameters(&self) -> Vec<&Parameter>;

    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    fn train(&mut self) {
        self.set_training(true);
    }

    fn eval(&mut self) {
        self.set_training(false);
    }

    fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.zero_grad();
        }
    }

    /// Move every parameter to `device`.
    fn to_device(&mut self, device: Device) {
        for p in self.parameters_mut() {
            p.data = p.data.to(device);
            p.grad = p.grad.as_ref().map(|g| g.to(device));
        }
    }

    /// Parameter tensors keyed by name.
    fn state_dict(&self) -> Value {
        Value::Map(
            self.parameters()
                .into_iter()
                .map(|p| (p.name.clone(), Value::Tensor(p.data.clone())))
                .collect::<BTreeMap<_, _>>(),
        )
    }
}

/// Stop gradient tracking on every parameter of `net`.
pub fn freeze<M: Module + ?Sized>(net: &mut M) {
    for p in net.parameters_mut() {
        p.requires_grad = false;
    }
}

/// Resume gradient tracking on every parameter of `net`.
pub fn unfreeze<M: Module + ?Sized>(net: &mut M) {
    for p in net.parameters_mut() {
        p.requires_grad = true;
    }
}

/// Total number of scalar parameters in `net`.
pub fn nb_parameters<M: Module + ?Sized>(net: &M) -> usize {
    net.parameters().iter().map(|p| p.numel()).sum()
}

/// Look up a parameter by its full dotted name, e.g. `"layer3.0.conv1.weight"`.
pub fn parameter_by_name<'a, M: Module + ?Sized>(net: &'a M, name: &str) -> Option<&'a Parameter> {
    net.parameters().into_iter().find(|p| p.name == name)
}

/// Frozen, eval-mode view of a module that ignores requests to train.
pub struct FrozenModule<M> {
    inner: M,
}

impl<M: Module> FrozenModule<M> {
    pub fn new(mut inner: M) -> Self {
        freeze(&mut inner);
        inner.set_training(false);
        Self { inner }
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    pub fn into_inner(self) -> M {
        self.inner
    }
}

impl<M: Module> Module for FrozenModule<M> {
    fn forward(&mut self, input: &Value) -> Result<Value> {
        self.inner.forward(input)
    }

    fn forward_recorded(&mut self, input: &Value, record: &mut dyn FnMut(&str, &Value)) -> Result<Value> {
        self.inner.forward_recorded(input, record)
    }

    fn set_training(&mut self, _training: bool) {}

    fn is_training(&self) -> bool {
        false
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.inner.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.inner.parameters_mut()
    }
}

/// Like [`FrozenModule`], but also hidden from parameter enumeration so an
/// enclosing module neither counts, checkpoints nor optimizes it.
pub struct DetachedModule<M> {
    inner: M,
}

impl<M: Module> DetachedModule<M> {
    pub fn new(mut inner: M) -> Self {
        freeze(&mut inner);
        inner.set_training(false);
        Self { inner }
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    pub fn into_inner(self) -> M {
        self.inner
    }
}

impl<M: Module> Module for DetachedModule<M> {
    fn forward(&mut self, input: &Value) -> Result<Value> {
        self.inner.forward(input)
    }

    fn forward_recorded(&mut self, input: &Value, record: &mut dyn FnMut(&str, &Value)) -> Result<Value> {
        self.inner.forward_recorded(input, record)
    }

    fn set_training(&mut self, _training: bool) {}

    fn is_training(&self) -> bool {
        false
    }

    fn parameters(&self) -> Vec<&Parameter> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        Vec::new()
    }

    fn to_device(&mut self, device: Device) {
        self.inner.to_device(device);
    }
}

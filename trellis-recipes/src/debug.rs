//! A linear softmax classifier and plain SGD on host tensors.
//!
//! Small enough to train in tests and in the demo binary, while exercising
//! the full `Model` / `Optimizer` surface a recipe relies on.

use rand::Rng;
use std::collections::BTreeMap;
use trellis_core::init::xavier;
use trellis_core::{Model, Module, Optimizer, Parameter, RecipeError, Result, State, Tensor, Value};

/// `logits = x · Wᵀ + b` over `[N, features]` inputs, trained with
/// cross-entropy on `(x, labels)` batches.
pub struct SoftmaxProbe {
    weight: Parameter,
    bias: Parameter,
    training: bool,
    lr: f64,
}

impl SoftmaxProbe {
    /// Zero-initialised probe.
    pub fn new(features: usize, classes: usize) -> Self {
        Self {
            weight: Parameter::new("fc.weight", Tensor::zeros(vec![classes, features])),
            bias: Parameter::new("fc.bias", Tensor::zeros(vec![classes])),
            training: true,
            lr: 0.1,
        }
    }

    /// Xavier-initialised probe.
    pub fn initialized<R: Rng + ?Sized>(features: usize, classes: usize, rng: &mut R) -> Result<Self> {
        let mut probe = Self::new(features, classes);
        xavier(&mut probe, rng)?;
        Ok(probe)
    }

    /// Learning rate of the optimizer built by [`Model::make_optimizer`].
    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    fn logits(&self, x: &Tensor) -> Result<Tensor> {
        let mut out = x.matmul(&self.weight.data.transpose()?)?;
        let classes = self.bias.data.numel();
        let bias = self.bias.data.data().to_vec();
        for (i, v) in out.data_mut().iter_mut().enumerate() {
            *v += bias[i % classes];
        }
        Ok(out)
    }
}

/// Split an `(x, labels)` batch.
fn split_batch(batch: &Value) -> Result<(&Tensor, Vec<usize>)> {
    let items = batch
        .as_seq()
        .filter(|items| items.len() == 2)
        .ok_or_else(|| RecipeError::model(format!("expected an (x, y) batch, got {}", batch.kind())))?;
    let x = items[0]
        .as_tensor()
        .ok_or_else(|| RecipeError::model("batch input must be a tensor"))?;
    let y = items[1]
        .as_tensor()
        .ok_or_else(|| RecipeError::model("batch labels must be a tensor"))?;
    let labels = y.class_indices().ok_or_else(|| RecipeError::TypeMismatch {
        key: "batch.1".into(),
        expected: "non-negative integral class labels",
        actual: "tensor",
    })?;
    Ok((x, labels))
}

/// Mean cross-entropy of row-wise logits and its gradient w.r.t. the logits.
fn cross_entropy(logits: &Tensor, labels: &[usize]) -> Result<(f32, Tensor)> {
    let (n, classes) = logits.dims2()?;
    if labels.len() != n {
        return Err(RecipeError::model(format!("{} labels for {n} rows", labels.len())));
    }
    let mut grad = logits.clone();
    let mut loss = 0.0;
    for (r, &label) in labels.iter().enumerate() {
        if label >= classes {
            return Err(RecipeError::model(format!("label {label} out of range for {classes} classes")));
        }
        let row = &mut grad.data_mut()[r * classes..(r + 1) * classes];
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let z: f32 = row.iter().map(|v| (v - max).exp()).sum();
        loss += z.ln() + max - row[label];
        for v in row.iter_mut() {
            *v = (*v - max).exp() / z / n as f32;
        }
        row[label] -= 1.0 / n as f32;
    }
    Ok((loss / n as f32, grad))
}

impl Module for SoftmaxProbe {
    fn forward(&mut self, input: &Value) -> Result<Value> {
        let x = input
            .as_tensor()
            .ok_or_else(|| RecipeError::model("SoftmaxProbe expects a tensor input"))?;
        Ok(Value::Tensor(self.logits(x)?))
    }

    fn forward_recorded(&mut self, input: &Value, record: &mut dyn FnMut(&str, &Value)) -> Result<Value> {
        let out = self.forward(input)?;
        record("fc", &out);
        Ok(out)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight, &mut self.bias]
    }
}

impl Model for SoftmaxProbe {
    fn train_step(&mut self, batch: &Value, opt: &mut dyn Optimizer) -> Result<State> {
        let (x, labels) = split_batch(batch)?;
        opt.zero_grad(&mut self.parameters_mut());

        let logits = self.logits(x)?;
        let (loss, dlogits) = cross_entropy(&logits, &labels)?;

        let grad_w = dlogits.transpose()?.matmul(x)?;
        let classes = self.bias.data.numel();
        let mut grad_b = vec![0.0; classes];
        for (i, g) in dlogits.data().iter().enumerate() {
            grad_b[i % classes] += g;
        }
        if self.weight.requires_grad {
            self.weight.grad = Some(grad_w);
        }
        if self.bias.requires_grad {
            self.bias.grad = Some(Tensor::new(grad_b, vec![classes])?.to(self.bias.data.device()));
        }
        opt.step(&mut self.parameters_mut())?;

        State::partial().with("loss", loss)?.with("pred", logits)
    }

    fn validation_step(&mut self, batch: &Value) -> Result<State> {
        let (x, labels) = split_batch(batch)?;
        let logits = self.logits(x)?;
        let (loss, _) = cross_entropy(&logits, &labels)?;
        State::partial().with("loss", loss)?.with("pred", logits)
    }

    fn make_optimizer(&self) -> Box<dyn Optimizer> {
        Box::new(Sgd::new(self.lr))
    }
}

/// Stochastic gradient descent with optional momentum.
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f64,
    momentum: f64,
    velocity: BTreeMap<String, Vec<f32>>,
}

impl Sgd {
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            momentum: 0.0,
            velocity: BTreeMap::new(),
        }
    }

    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [&mut Parameter]) -> Result<()> {
        for p in params.iter_mut() {
            let p: &mut Parameter = p;
            if !p.requires_grad {
                continue;
            }
            let Some(grad) = p.grad.as_ref() else {
                continue;
            };
            if grad.numel() != p.data.numel() {
                return Err(RecipeError::model(format!(
                    "gradient of '{}' has {} values for {} weights",
                    p.name,
                    grad.numel(),
                    p.data.numel()
                )));
            }
            let velocity = self
                .velocity
                .entry(p.name.clone())
                .or_insert_with(|| vec![0.0; grad.numel()]);
            let (lr, momentum) = (self.lr as f32, self.momentum as f32);
            for ((w, g), v) in p.data.data_mut().iter_mut().zip(grad.data()).zip(velocity.iter_mut()) {
                *v = momentum * *v + g;
                *w -= lr * *v;
            }
        }
        Ok(())
    }

    fn lr(&self) -> f64 {
        self.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn state_dict(&self) -> Value {
        let mut dict = BTreeMap::new();
        dict.insert("lr".to_string(), Value::Float(self.lr));
        dict.insert("momentum".to_string(), Value::Float(self.momentum));
        Value::Map(dict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use trellis_core::WithSavedActivations;

    fn batch(x: Vec<f32>, n: usize, f: usize, y: &[f32]) -> Value {
        Value::Tuple(vec![
            Value::Tensor(Tensor::new(x, vec![n, f]).unwrap()),
            Value::Tensor(Tensor::from_slice(y)),
        ])
    }

    #[test]
    fn test_cross_entropy_uniform() {
        let logits = Tensor::zeros(vec![2, 4]);
        let (loss, grad) = cross_entropy(&logits, &[0, 3]).unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-6);
        // Each row of the gradient sums to zero.
        assert!(grad.data()[..4].iter().sum::<f32>().abs() < 1e-6);
        assert!(cross_entropy(&logits, &[4, 0]).is_err());
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut probe = SoftmaxProbe::new(2, 2).with_lr(0.5);
        let mut opt = probe.make_optimizer();
        let b = batch(vec![1.0, 0.0, 0.0, 1.0, 0.9, 0.1, 0.1, 0.9], 4, 2, &[0.0, 1.0, 0.0, 1.0]);

        let first = probe.train_step(&b, opt.as_mut()).unwrap();
        for _ in 0..50 {
            probe.train_step(&b, opt.as_mut()).unwrap();
        }
        let last = probe.validation_step(&b).unwrap();
        let loss = |s: &State| s.get("loss").and_then(Value::as_scalar).unwrap();
        assert!(loss(&last) < loss(&first) / 2.0);
        assert!(probe.weight.grad.is_some());
    }

    #[test]
    fn test_frozen_parameters_do_not_move() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut probe = SoftmaxProbe::initialized(2, 2, &mut rng).unwrap();
        trellis_core::module::freeze(&mut probe);
        let before = probe.weight.data.clone();
        let mut opt = Sgd::new(1.0).with_momentum(0.9);
        let b = batch(vec![1.0, 2.0], 1, 2, &[1.0]);
        probe.train_step(&b, &mut opt).unwrap();
        assert_eq!(probe.weight.data, before);
    }

    #[test]
    fn test_malformed_batch() {
        let mut probe = SoftmaxProbe::new(2, 2);
        assert!(probe.validation_step(&Value::Int(3)).is_err());
        assert_eq!(probe.make_optimizer().lr(), 0.1);
    }

    #[test]
    fn test_saved_activations_report_fc() {
        let mut probe = WithSavedActivations::new(SoftmaxProbe::new(2, 3));
        let x = Value::Tensor(Tensor::new(vec![1.0, 2.0], vec![1, 2]).unwrap());
        let (out, acts) = probe.forward_with_activations(&x).unwrap();
        assert_eq!(acts["fc"], out);
        assert_eq!(out.as_tensor().unwrap().shape(), &[1, 3]);
    }

    #[test]
    fn test_fractional_labels_are_rejected() {
        let mut probe = SoftmaxProbe::new(2, 2);
        let b = batch(vec![1.0, 0.0, 0.0, 1.0], 2, 2, &[0.0, 1.5]);
        assert!(matches!(
            probe.validation_step(&b),
            Err(RecipeError::TypeMismatch { .. })
        ));
        let b = batch(vec![1.0, 0.0], 1, 2, &[-1.0]);
        assert!(probe.validation_step(&b).is_err());
    }

    #[test]
    fn test_sgd_state_dict() {
        let opt = Sgd::new(0.01).with_momentum(0.5);
        let dict = opt.state_dict();
        assert_eq!(dict.as_map().unwrap()["momentum"], Value::Float(0.5));
    }
}

//! Host-side tensor handle.
//!
//! Stands in for the external compute framework's tensor type: contiguous
//! row-major `f32` storage, a shape and the device it is attributed to.
//! Only the handful of operations the recipes and utilities need are here.

use crate::device::Device;
use crate::error::{RecipeError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTensor")]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
    device: Device,
}

/// Wire form of a [`Tensor`], validated through [`Tensor::new`] on the way in.
#[derive(Deserialize)]
struct RawTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
    #[serde(default)]
    device: Device,
}

impl TryFrom<RawTensor> for Tensor {
    type Error = RecipeError;

    fn try_from(raw: RawTensor) -> Result<Self> {
        let mut tensor = Tensor::new(raw.data, raw.shape)?;
        tensor.device = raw.device;
        Ok(tensor)
    }
}

impl Tensor {
    /// Build a CPU tensor, checking that `data` matches `shape`.
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(RecipeError::model(format!(
                "shape {shape:?} needs {numel} elements, got {}",
                data.len()
            )));
        }
        Ok(Self {
            shape,
            data,
            device: Device::Cpu,
        })
    }

    pub fn scalar(value: f32) -> Self {
        Self {
            shape: Vec::new(),
            data: vec![value],
            device: Device::Cpu,
        }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let numel = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; numel],
            device: Device::Cpu,
        }
    }

    /// 1-D tensor from a slice.
    pub fn from_slice(values: &[f32]) -> Self {
        Self {
            shape: vec![values.len()],
            data: values.to_vec(),
            device: Device::Cpu,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Copy of this tensor attributed to `device`.
    pub fn to(&self, device: Device) -> Tensor {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.clone(),
            device,
        }
    }

    /// The single value of a one-element tensor.
    pub fn item(&self) -> Option<f32> {
        (self.data.len() == 1).then(|| self.data[0])
    }

    pub fn reshape(&self, shape: Vec<usize>) -> Result<Tensor> {
        let mut out = Tensor::new(self.data.clone(), shape)?;
        out.device = self.device;
        Ok(out)
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&x| f(x)).collect(),
            device: self.device,
        }
    }

    pub fn sum(&self) -> f32 {
        self.data.iter().sum()
    }

    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.sum() / self.data.len() as f32
    }

    /// `(rows, cols)` of a 2-D tensor.
    pub fn dims2(&self) -> Result<(usize, usize)> {
        match self.shape.as_slice() {
            [r, c] => Ok((*r, *c)),
            other => Err(RecipeError::model(format!(
                "expected a 2-D tensor, got shape {other:?}"
            ))),
        }
    }

    pub fn transpose(&self) -> Result<Tensor> {
        let (rows, cols) = self.dims2()?;
        let mut data = vec![0.0; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                data[c * rows + r] = self.data[r * cols + c];
            }
        }
        Ok(Tensor {
            shape: vec![cols, rows],
            data,
            device: self.device,
        })
    }

    /// `(n, k) x (k, m) -> (n, m)`.
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        if self.device != other.device {
            return Err(RecipeError::model(format!(
                "matmul across devices: {} vs {}",
                self.device, other.device
            )));
        }
        let (n, k) = self.dims2()?;
        let (k2, m) = other.dims2()?;
        if k != k2 {
            return Err(RecipeError::model(format!(
                "matmul inner dimensions differ: {k} vs {k2}"
            )));
        }
        let mut data = vec![0.0; n * m];
        for i in 0..n {
            for p in 0..k {
                let a = self.data[i * k + p];
                if a == 0.0 {
                    continue;
                }
                for j in 0..m {
                    data[i * m + j] += a * other.data[p * m + j];
                }
            }
        }
        Ok(Tensor {
            shape: vec![n, m],
            data,
            device: self.device,
        })
    }

    /// Index of the largest value in each row of a 2-D tensor.
    pub fn argmax_rows(&self) -> Result<Vec<usize>> {
        let (rows, cols) = self.dims2()?;
        if cols == 0 {
            return Err(RecipeError::model("argmax over an empty dimension"));
        }
        Ok((0..rows)
            .map(|r| {
                let row = &self.data[r * cols..(r + 1) * cols];
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                        if v > best.1 { (i, v) } else { best }
                    })
                    .0
            })
            .collect())
    }

    /// Values read as class indices; `None` if any is negative, fractional
    /// or not finite.
    pub fn class_indices(&self) -> Option<Vec<usize>> {
        self.data
            .iter()
            .map(|&y| (y.is_finite() && y >= 0.0 && y.fract() == 0.0).then_some(y as usize))
            .collect()
    }
}

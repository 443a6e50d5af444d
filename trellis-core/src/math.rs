//! Small tensor utilities used by losses and metrics.

use crate::error::{RecipeError, Result};
use crate::tensor::Tensor;

/// How [`entropy`] collapses its per-distribution values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reduction {
    None,
    #[default]
    Mean,
    Sum,
}

/// Gram matrix `m·mᵀ / cols` of a 2-D tensor.
pub fn gram(m: &Tensor) -> Result<Tensor> {
    let (_, cols) = m.dims2()?;
    let g = m.matmul(&m.transpose()?)?;
    Ok(g.map(|x| x / cols as f32))
}

/// Batched Gram matrix of a `[B, C, ...]` tensor, trailing dims flattened,
/// each divided by `C * HW`.
pub fn bgram(m: &Tensor) -> Result<Tensor> {
    let shape = m.shape();
    if shape.len() < 2 {
        return Err(RecipeError::model(format!(
            "bgram expects [B, C, ...], got shape {shape:?}"
        )));
    }
    let (b, c) = (shape[0], shape[1]);
    let hw: usize = shape[2..].iter().product();
    let norm = (c * hw) as f32;

    let mut out = Vec::with_capacity(b * c * c);
    for i in 0..b {
        let slice = &m.data()[i * c * hw..(i + 1) * c * hw];
        let item = Tensor::new(slice.to_vec(), vec![c, hw])?.to(m.device());
        let g = item.matmul(&item.transpose()?)?;
        out.extend(g.data().iter().map(|x| x / norm));
    }
    Ok(Tensor::new(out, vec![b, c, c])?.to(m.device()))
}

/// Entropy of the categorical distributions given by `logits` along `dim`.
pub fn entropy(logits: &Tensor, dim: usize, reduce: Reduction) -> Result<Tensor> {
    let shape = logits.shape();
    if dim >= shape.len() {
        return Err(RecipeError::model(format!(
            "entropy dim {dim} out of range for shape {shape:?}"
        )));
    }
    let outer: usize = shape[..dim].iter().product();
    let n = shape[dim];
    let inner: usize = shape[dim + 1..].iter().product();
    let data = logits.data();

    let mut h = Vec::with_capacity(outer * inner);
    for o in 0..outer {
        for i in 0..inner {
            let at = |k: usize| data[(o * n + k) * inner + i];
            let max = (0..n).map(at).fold(f32::NEG_INFINITY, f32::max);
            let log_z = max + (0..n).map(|k| (at(k) - max).exp()).sum::<f32>().ln();
            let value: f32 = (0..n)
                .map(|k| {
                    let log_p = at(k) - log_z;
                    -log_p.exp() * log_p
                })
                .sum();
            h.push(value);
        }
    }

    let mut out_shape = shape.to_vec();
    out_shape.remove(dim);
    let h = Tensor::new(h, out_shape)?.to(logits.device());
    Ok(match reduce {
        Reduction::None => h,
        Reduction::Mean => Tensor::scalar(h.mean()).to(logits.device()),
        Reduction::Sum => Tensor::scalar(h.sum()).to(logits.device()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn test_gram() {
        let m = Tensor::new(vec![1.0, 0.0, 0.0, 2.0], vec![2, 2]).unwrap();
        let g = gram(&m).unwrap();
        assert_eq!(g.data(), &[0.5, 0.0, 0.0, 2.0]);
    }

    #[test]
    fn test_bgram_matches_per_item_gram() {
        // [B=2, C=2, H=1, W=2]
        let data = vec![1.0, 2.0, 3.0, 4.0, 0.0, 1.0, 1.0, 0.0];
        let m = Tensor::new(data, vec![2, 2, 1, 2]).unwrap();
        let g = bgram(&m).unwrap();
        assert_eq!(g.shape(), &[2, 2, 2]);
        // item 0: [[1,2],[3,4]] -> [[5,11],[11,25]] / (2*2)
        assert!(close(g.data()[0], 1.25));
        assert!(close(g.data()[1], 2.75));
        assert!(close(g.data()[3], 6.25));
        // item 1: [[0,1],[1,0]] -> identity / 4
        assert!(close(g.data()[4], 0.25));
        assert!(close(g.data()[5], 0.0));
    }

    #[test]
    fn test_entropy_uniform_is_log_n() {
        let logits = Tensor::zeros(vec![3, 4]);
        let h = entropy(&logits, 1, Reduction::None).unwrap();
        assert_eq!(h.shape(), &[3]);
        assert!(h.data().iter().all(|&x| close(x, 4f32.ln())));
        let mean = entropy(&logits, 1, Reduction::Mean).unwrap();
        assert!(close(mean.item().unwrap(), 4f32.ln()));
        let sum = entropy(&logits, 1, Reduction::Sum).unwrap();
        assert!(close(sum.item().unwrap(), 3.0 * 4f32.ln()));
    }

    #[test]
    fn test_entropy_peaked_is_low_and_dim0_works() {
        let logits = Tensor::new(vec![50.0, 0.0, 0.0, 0.0], vec![2, 2]).unwrap();
        // Along dim 0: column 0 is peaked, column 1 is uniform.
        let h = entropy(&logits, 0, Reduction::None).unwrap();
        assert!(h.data()[0] < 1e-3);
        assert!(close(h.data()[1], 2f32.ln()));
        assert!(entropy(&logits, 2, Reduction::Mean).is_err());
    }
}

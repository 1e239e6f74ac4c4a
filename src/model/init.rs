use candle_core::{Device, Tensor, Var};
use candle_nn::{init, Init, Linear, VarBuilder};

use super::params::{ParamGroup, ParamStore};
use crate::config::InputLayerInit;
use crate::error::{EncoderError, Result};

/// Random `(rows, cols)` matrix with orthonormal rows (rows <= cols) or columns.
///
/// Gram-Schmidt on a standard-normal draw; the triangular factor comes out with a positive
/// diagonal, so the result is uniformly distributed over orthogonal matrices.
pub fn orthogonal(rows: usize, cols: usize, device: &Device) -> Result<Tensor> {
    let transposed = rows < cols;
    let (n, m) = if transposed { (cols, rows) } else { (rows, cols) };
    let draw: Vec<Vec<f32>> = Tensor::randn(0f32, 1f32, (n, m), &Device::Cpu)?.to_vec2()?;

    // Columns of the n x m draw, orthonormalized in place.
    let mut basis: Vec<Vec<f64>> = Vec::with_capacity(m);
    for j in 0..m {
        let mut v: Vec<f64> = draw.iter().map(|row| row[j] as f64).collect();
        for q in &basis {
            let r: f64 = q.iter().zip(&v).map(|(a, b)| a * b).sum();
            v.iter_mut().zip(q).for_each(|(vi, qi)| *vi -= r * qi);
        }
        let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm < 1e-10 {
            return Err(EncoderError::Config(
                "degenerate random draw in orthogonal init".into(),
            ));
        }
        v.iter_mut().for_each(|x| *x /= norm);
        basis.push(v);
    }

    let mut data = vec![0f32; n * m];
    for (j, q) in basis.iter().enumerate() {
        for (i, x) in q.iter().enumerate() {
            data[i * m + j] = *x as f32;
        }
    }
    let q = Tensor::from_vec(data, (n, m), device)?;
    if transposed {
        Ok(q.t()?.contiguous()?)
    } else {
        Ok(q)
    }
}

/// Square projection without bias placed in front of a pretrained stack.
pub fn input_projection(
    size: usize,
    scheme: InputLayerInit,
    vb: VarBuilder<'_>,
    store: &mut ParamStore,
) -> Result<Linear> {
    let group = ParamGroup::InputProjection;
    let weight = match scheme {
        InputLayerInit::None => store.get(
            &vb,
            (size, size),
            "weight",
            init::DEFAULT_KAIMING_NORMAL,
            group,
        )?,
        InputLayerInit::Normal => store.get(
            &vb,
            (size, size),
            "weight",
            Init::Randn {
                mean: 0.,
                stdev: 1.,
            },
            group,
        )?,
        InputLayerInit::Orthogonal => {
            let weight = store.get(&vb, (size, size), "weight", Init::Const(0.), group)?;
            // Weights coming from a file rather than a fresh VarMap keep their values.
            if weight.is_variable() {
                let q = orthogonal(size, size, weight.device())?.to_dtype(weight.dtype())?;
                Var::from_tensor(&weight)?.set(&q)?;
            }
            weight
        }
    };
    Ok(Linear::new(weight, None))
}

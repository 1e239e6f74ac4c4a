use candle_core::Tensor;

use crate::error::Result;

/// A layer that can sit in a depth-indexed encoder stack.
pub trait StackableLayer {
    /// `bias` is the `(batch, 1, 1, len)` additive attention bias.
    fn forward_t(&self, x: &Tensor, bias: &Tensor, train: bool) -> Result<Tensor>;
}

/// One depth slot of a pretrained stack: either the real layer or a no-op.
///
/// Identity slots own no parameters, so the kept layers keep their original
/// depth-indexed names (`layer.{i}` / `layers.{i}`).
pub enum StackLayer<L> {
    Active(L),
    Identity,
}

impl<L: StackableLayer> StackLayer<L> {
    pub fn forward_t(&self, x: &Tensor, bias: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::Active(layer) => layer.forward_t(x, bias, train),
            Self::Identity => Ok(x.clone()),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }
}

/// Build `depth` slots, materializing only the first `keep` of them.
pub fn truncated<L>(
    depth: usize,
    keep: usize,
    mut build: impl FnMut(usize) -> Result<L>,
) -> Result<Vec<StackLayer<L>>> {
    (0..depth)
        .map(|i| {
            if i < keep {
                Ok(StackLayer::Active(build(i)?))
            } else {
                Ok(StackLayer::Identity)
            }
        })
        .collect()
}

/// Run `x` through every slot in depth order.
pub fn run_stack<L: StackableLayer>(
    layers: &[StackLayer<L>],
    x: &Tensor,
    bias: &Tensor,
    train: bool,
) -> Result<Tensor> {
    let mut h = x.clone();
    for layer in layers {
        h = layer.forward_t(&h, bias, train)?;
    }
    Ok(h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    struct AddOne;

    impl StackableLayer for AddOne {
        fn forward_t(&self, x: &Tensor, _bias: &Tensor, _train: bool) -> Result<Tensor> {
            Ok((x + 1.)?)
        }
    }

    #[test]
    fn identity_slots_are_no_ops() {
        let layers = truncated(4, 2, |_| Ok(AddOne)).unwrap();
        assert_eq!(layers.iter().filter(|l| l.is_active()).count(), 2);

        let x = Tensor::zeros((1, 2, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        let bias = Tensor::zeros((1, 1, 1, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
        let out = run_stack(&layers, &x, &bias, false).unwrap();
        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| (*v - 2.).abs() < 1e-6));
    }
}

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Dropout, LayerNorm, Linear, VarBuilder};

use super::params::{ParamGroup, ParamStore};
use crate::error::{EncoderError, Result};

/// Turn a `(batch, len)` padding mask (nonzero = keep) into an additive bias of shape
/// `(batch, 1, 1, len)`: 0 at valid keys, `f32::MIN` at padding.
pub fn additive_attention_bias(mask: &Tensor) -> Result<Tensor> {
    let (b, t) = mask.dims2()?;
    let keep = mask.to_dtype(DType::F32)?;
    let bias = keep.affine(-1., 1.)?.affine(f32::MIN as f64, 0.)?;
    Ok(bias.reshape((b, 1, 1, t))?)
}

/// `[B, T, D] -> [B, num_heads, T, head_dim]`
pub(crate) fn split_heads(x: &Tensor, num_heads: usize, head_dim: usize) -> Result<Tensor> {
    let (b, t, _) = x.dims3()?;
    Ok(x
        .reshape((b, t, num_heads, head_dim))?
        .transpose(1, 2)?
        .contiguous()?)
}

/// `[B, num_heads, T, head_dim] -> [B, T, D]`
pub(crate) fn merge_heads(x: &Tensor) -> Result<Tensor> {
    let (b, h, t, d) = x.dims4()?;
    Ok(x.transpose(1, 2)?.contiguous()?.reshape((b, t, h * d))?)
}

/// Softmax attention over pre-scaled queries. `bias` broadcasts onto `[B, H, T_q, T_kv]`.
pub(crate) fn attend(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    bias: Option<&Tensor>,
    dropout: &Dropout,
    train: bool,
) -> Result<Tensor> {
    let k_t = k.transpose(D::Minus2, D::Minus1)?;
    let mut scores = q.matmul(&k_t)?;
    if let Some(bias) = bias {
        scores = scores.broadcast_add(bias)?;
    }
    let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
    let weights = dropout.forward(&weights, train)?;
    Ok(weights.matmul(v)?)
}

/// Multi-head self-attention with separate key/value/query projections.
pub struct MultiHeadAttention {
    num_heads: usize,
    head_dim: usize,
    k_layer: Linear,
    v_layer: Linear,
    q_layer: Linear,
    output_layer: Linear,
    dropout: Dropout,
}

impl MultiHeadAttention {
    pub fn new(
        vb: VarBuilder<'_>,
        store: &mut ParamStore,
        dim: usize,
        num_heads: usize,
        dropout: f32,
    ) -> Result<Self> {
        if num_heads == 0 || dim % num_heads != 0 {
            return Err(EncoderError::Config(format!(
                "dim {dim} must be divisible by num_heads {num_heads}"
            )));
        }
        let g = ParamGroup::Attention;
        Ok(Self {
            num_heads,
            head_dim: dim / num_heads,
            k_layer: store.linear(dim, dim, vb.pp("k_layer"), g)?,
            v_layer: store.linear(dim, dim, vb.pp("v_layer"), g)?,
            q_layer: store.linear(dim, dim, vb.pp("q_layer"), g)?,
            output_layer: store.linear(dim, dim, vb.pp("output_layer"), g)?,
            dropout: Dropout::new(dropout),
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// `bias` is the `(batch, 1, 1, len)` additive padding bias.
    pub fn forward(&self, x: &Tensor, bias: &Tensor, train: bool) -> Result<Tensor> {
        let k = split_heads(&self.k_layer.forward(x)?, self.num_heads, self.head_dim)?;
        let v = split_heads(&self.v_layer.forward(x)?, self.num_heads, self.head_dim)?;
        let q = split_heads(&self.q_layer.forward(x)?, self.num_heads, self.head_dim)?;
        let q = (q / (self.head_dim as f64).sqrt())?;

        let context = attend(&q, &k, &v, Some(bias), &self.dropout, train)?;
        Ok(self.output_layer.forward(&merge_heads(&context)?)?)
    }
}

/// Pre-norm position-wise feed-forward block with its own residual connection.
pub struct PositionwiseFeedForward {
    layer_norm: LayerNorm,
    expand: Linear,
    contract: Linear,
    dropout: Dropout,
}

impl PositionwiseFeedForward {
    pub fn new(
        vb: VarBuilder<'_>,
        store: &mut ParamStore,
        dim: usize,
        ff_dim: usize,
        dropout: f32,
    ) -> Result<Self> {
        let layer_norm = store.layer_norm(dim, 1e-6, vb.pp("layer_norm"))?;
        let expand = store.linear(dim, ff_dim, vb.pp("pwff_layer.0"), ParamGroup::FeedForward)?;
        let contract = store.linear(ff_dim, dim, vb.pp("pwff_layer.3"), ParamGroup::FeedForward)?;
        Ok(Self {
            layer_norm,
            expand,
            contract,
            dropout: Dropout::new(dropout),
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.layer_norm.forward(x)?;
        let h = self.expand.forward(&h)?.relu()?;
        let h = self.dropout.forward(&h, train)?;
        let h = self.contract.forward(&h)?;
        let h = self.dropout.forward(&h, train)?;
        Ok((h + x)?)
    }
}

/// Transformer encoder layer: pre-norm self-attention and feed-forward, both residual.
pub struct TransformerEncoderLayer {
    layer_norm: LayerNorm,
    src_src_att: MultiHeadAttention,
    feed_forward: PositionwiseFeedForward,
    dropout: Dropout,
}

impl TransformerEncoderLayer {
    pub fn new(
        vb: VarBuilder<'_>,
        store: &mut ParamStore,
        dim: usize,
        ff_dim: usize,
        num_heads: usize,
        dropout: f32,
    ) -> Result<Self> {
        let layer_norm = store.layer_norm(dim, 1e-6, vb.pp("layer_norm"))?;
        let src_src_att =
            MultiHeadAttention::new(vb.pp("src_src_att"), store, dim, num_heads, dropout)?;
        let feed_forward =
            PositionwiseFeedForward::new(vb.pp("feed_forward"), store, dim, ff_dim, dropout)?;

        Ok(Self {
            layer_norm,
            src_src_att,
            feed_forward,
            dropout: Dropout::new(dropout),
        })
    }

    pub fn num_heads(&self) -> usize {
        self.src_src_att.num_heads()
    }

    pub fn forward(&self, x: &Tensor, bias: &Tensor, train: bool) -> Result<Tensor> {
        let normed = self.layer_norm.forward(x)?;
        let h = self.src_src_att.forward(&normed, bias, train)?;
        let h = (self.dropout.forward(&h, train)? + x)?;
        self.feed_forward.forward(&h, train)
    }
}

/// Sinusoidal positional encoding (fixed, not learned), precomputed up to `max_len`.
pub struct PositionalEncoding {
    pe: Tensor,
    max_len: usize,
}

impl PositionalEncoding {
    pub const DEFAULT_MAX_LEN: usize = 5000;

    pub fn new(dim: usize, device: &Device) -> Result<Self> {
        Self::with_max_len(dim, Self::DEFAULT_MAX_LEN, device)
    }

    pub fn with_max_len(dim: usize, max_len: usize, device: &Device) -> Result<Self> {
        if dim % 2 != 0 {
            return Err(EncoderError::Config(format!(
                "cannot use sin/cos positional encoding with odd dim (got dim={dim})"
            )));
        }
        Ok(Self {
            pe: positional_encoding(max_len, dim, device)?,
            max_len,
        })
    }

    /// Add the encoding for the first `T` positions to `[B, T, D]` embeddings.
    pub fn forward(&self, emb: &Tensor) -> Result<Tensor> {
        let (_, t, _) = emb.dims3()?;
        if t > self.max_len {
            return Err(EncoderError::shape(
                "sequence length",
                format!("<= {}", self.max_len),
                t,
            ));
        }
        let pe = self.pe.narrow(1, 0, t)?.to_dtype(emb.dtype())?;
        Ok(emb.broadcast_add(&pe)?)
    }
}

/// `[1, seq_len, dim]` table: sin on even features, cos on odd ones.
pub fn positional_encoding(seq_len: usize, dim: usize, device: &Device) -> Result<Tensor> {
    let mut pe = vec![0f32; seq_len * dim];

    for pos in 0..seq_len {
        for i in 0..dim / 2 {
            let angle = (pos as f64) / (10000f64).powf((2 * i) as f64 / dim as f64);
            pe[pos * dim + 2 * i] = angle.sin() as f32;
            pe[pos * dim + 2 * i + 1] = angle.cos() as f32;
        }
    }

    Ok(Tensor::from_vec(pe, (1, seq_len, dim), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_encoding_first_rows() {
        let pe = positional_encoding(2, 4, &Device::Cpu).unwrap();
        let rows: Vec<Vec<f32>> = pe.squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(rows[0], vec![0., 1., 0., 1.]);
        assert!((rows[1][0] - 1f32.sin()).abs() < 1e-6);
        assert!((rows[1][1] - 1f32.cos()).abs() < 1e-6);
        assert!((rows[1][2] - 0.01f32.sin()).abs() < 1e-6);
    }

    #[test]
    fn odd_dim_is_rejected() {
        assert!(PositionalEncoding::new(5, &Device::Cpu).is_err());
    }

    #[test]
    fn bias_is_zero_at_valid_positions() {
        let mask = Tensor::new(&[[1u8, 1, 0]], &Device::Cpu).unwrap();
        let bias = additive_attention_bias(&mask).unwrap();
        assert_eq!(bias.dims(), &[1, 1, 1, 3]);
        let values: Vec<f32> = bias.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values[0], 0.);
        assert_eq!(values[1], 0.);
        assert_eq!(values[2], f32::MIN);
    }
}

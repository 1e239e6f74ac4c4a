use candle_core::{DType, Device, IndexOp, Tensor, Var};
use candle_nn::rnn::{Direction, GRUState, LSTMState};
use candle_nn::{Dropout, GRUConfig, Init, LSTMConfig, VarBuilder, GRU, LSTM, RNN};
use std::fmt;

use super::shared::check_recurrent_inputs;
use super::{Encoder, EncoderOutput};
use crate::config::{EncoderConfig, RnnType};
use crate::error::Result;
use crate::model::params::{FreezePolicy, ParamGroup, ParamStore, Parameter};

/// One direction of one recurrent layer.
enum Cell {
    Gru(GRU),
    Lstm(LSTM),
}

/// Per-timestep blend weights: `keep` is 1 where the step is inside the sequence.
struct StepMask {
    keep: Tensor,
    skip: Tensor,
}

/// `candle_nn::gru` always asks for `*_l0`; map those names onto layer `k` and direction.
fn gru_builder<'a>(vb: &VarBuilder<'a>, tag: String) -> VarBuilder<'a> {
    let prefix = vb.prefix();
    let renamed = vb.root().rename_f(move |name| match name.strip_suffix("_l0") {
        Some(stem) => format!("{stem}{tag}"),
        None => name.to_string(),
    });
    if prefix.is_empty() {
        renamed
    } else {
        renamed.pp(prefix)
    }
}

impl Cell {
    fn build(
        kind: RnnType,
        in_dim: usize,
        hidden: usize,
        layer_idx: usize,
        backward: bool,
        vb: &VarBuilder<'_>,
        store: &mut ParamStore,
    ) -> Result<Self> {
        let suffix = if backward { "_reverse" } else { "" };
        let bound = 1. / (hidden as f64).sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let (cell, gates) = match kind {
            RnnType::Gru => {
                let config = GRUConfig {
                    w_ih_init: init,
                    w_hh_init: init,
                    b_ih_init: Some(init),
                    b_hh_init: Some(init),
                };
                let vb = gru_builder(vb, format!("_l{layer_idx}{suffix}"));
                (Cell::Gru(candle_nn::gru(in_dim, hidden, config, vb)?), 3)
            }
            RnnType::Lstm => {
                let config = LSTMConfig {
                    w_ih_init: init,
                    w_hh_init: init,
                    b_ih_init: Some(init),
                    b_hh_init: Some(init),
                    layer_idx,
                    direction: if backward {
                        Direction::Backward
                    } else {
                        Direction::Forward
                    },
                };
                (Cell::Lstm(candle_nn::lstm(in_dim, hidden, config, vb.clone())?), 4)
            }
        };

        let name = |stem: &str| format!("{stem}_l{layer_idx}{suffix}");
        let group = ParamGroup::Recurrent;
        store.register(vb, (gates * hidden, in_dim), &name("weight_ih"), group)?;
        store.register(vb, (gates * hidden, hidden), &name("weight_hh"), group)?;
        store.register(vb, gates * hidden, &name("bias_ih"), group)?;
        store.register(vb, gates * hidden, &name("bias_hh"), group)?;
        Ok(cell)
    }
}

/// Recurrent state that can be held in place over padded steps.
trait MaskedState: Sized {
    fn h(&self) -> &Tensor;

    /// Take `next` inside the sequence, keep `self` on padding.
    fn advance(&self, next: Self, mask: &StepMask) -> Result<Self>;
}

fn blend(new: &Tensor, old: &Tensor, mask: &StepMask) -> Result<Tensor> {
    Ok((new.broadcast_mul(&mask.keep)? + old.broadcast_mul(&mask.skip)?)?)
}

impl MaskedState for GRUState {
    fn h(&self) -> &Tensor {
        &self.h
    }

    fn advance(&self, next: Self, mask: &StepMask) -> Result<Self> {
        Ok(GRUState {
            h: blend(&next.h, &self.h, mask)?,
        })
    }
}

impl MaskedState for LSTMState {
    fn h(&self) -> &Tensor {
        &self.h
    }

    fn advance(&self, next: Self, mask: &StepMask) -> Result<Self> {
        Ok(LSTMState {
            h: blend(&next.h, &self.h, mask)?,
            c: blend(&next.c, &self.c, mask)?,
        })
    }
}

/// Run one direction over the steps; returns per-step outputs (zero on padding) and the
/// final hidden state.
fn run_cell<R>(
    rnn: &R,
    batch: usize,
    inputs: &[Tensor],
    masks: &[StepMask],
    reverse: bool,
) -> Result<(Vec<Tensor>, Tensor)>
where
    R: RNN,
    R::State: MaskedState,
{
    let mut state = rnn.zero_state(batch)?;
    let steps: Vec<usize> = if reverse {
        (0..inputs.len()).rev().collect()
    } else {
        (0..inputs.len()).collect()
    };

    let mut outputs = Vec::with_capacity(inputs.len());
    for t in steps {
        let next = rnn.step(&inputs[t], &state)?;
        state = state.advance(next, &masks[t])?;
        // Padded steps produce zeros, as unpacking would.
        outputs.push(state.h().broadcast_mul(&masks[t].keep)?);
    }
    if reverse {
        outputs.reverse();
    }
    Ok((outputs, state.h().clone()))
}

struct RecurrentLayer {
    forward: Cell,
    backward: Option<Cell>,
}

/// Multi-layer, optionally bidirectional GRU/LSTM over length-sorted padded batches.
pub struct RecurrentEncoder {
    rnn_type: RnnType,
    layers: Vec<RecurrentLayer>,
    emb_dropout: Dropout,
    layer_dropout: Dropout,
    emb_size: usize,
    hidden_size: usize,
    bidirectional: bool,
    params: ParamStore,
}

impl RecurrentEncoder {
    pub fn new(config: &EncoderConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let mut params = ParamStore::new();
        let rnn_vb = vb.pp("rnn");
        let directions = if config.bidirectional { 2 } else { 1 };

        let mut layers = Vec::with_capacity(config.num_layers);
        for layer_idx in 0..config.num_layers {
            let in_dim = if layer_idx == 0 {
                config.embedding_size
            } else {
                directions * config.hidden_size
            };
            let build = |backward: bool, params: &mut ParamStore| {
                Cell::build(
                    config.rnn_type,
                    in_dim,
                    config.hidden_size,
                    layer_idx,
                    backward,
                    &rnn_vb,
                    params,
                )
            };
            let forward = build(false, &mut params)?;
            let backward = if config.bidirectional {
                Some(build(true, &mut params)?)
            } else {
                None
            };
            layers.push(RecurrentLayer { forward, backward });
        }

        if config.freeze {
            params.apply(&FreezePolicy::frozen());
        }
        tracing::info!(
            rnn_type = ?config.rnn_type,
            num_layers = config.num_layers,
            bidirectional = config.bidirectional,
            freeze = config.freeze,
            "recurrent encoder"
        );

        // Inter-layer dropout only exists between stacked layers.
        let layer_dropout = if config.num_layers > 1 {
            config.dropout
        } else {
            0.0
        };
        Ok(Self {
            rnn_type: config.rnn_type,
            layers,
            emb_dropout: Dropout::new(config.embedding_dropout),
            layer_dropout: Dropout::new(layer_dropout),
            emb_size: config.embedding_size,
            hidden_size: config.hidden_size,
            bidirectional: config.bidirectional,
            params,
        })
    }

    fn directions(&self) -> usize {
        if self.bidirectional {
            2
        } else {
            1
        }
    }

    fn run_direction(
        cell: &Cell,
        batch: usize,
        inputs: &[Tensor],
        masks: &[StepMask],
        reverse: bool,
    ) -> Result<(Vec<Tensor>, Tensor)> {
        match cell {
            Cell::Gru(gru) => run_cell(gru, batch, inputs, masks, reverse),
            Cell::Lstm(lstm) => run_cell(lstm, batch, inputs, masks, reverse),
        }
    }
}

fn step_masks(
    lengths: &[usize],
    max_len: usize,
    dtype: DType,
    device: &Device,
) -> Result<Vec<StepMask>> {
    let batch = lengths.len();
    (0..max_len)
        .map(|t| {
            let keep: Vec<f32> = lengths
                .iter()
                .map(|&len| if t < len { 1. } else { 0. })
                .collect();
            let keep = Tensor::from_vec(keep, (batch, 1), device)?.to_dtype(dtype)?;
            let skip = keep.affine(-1., 1.)?;
            Ok(StepMask { keep, skip })
        })
        .collect()
}

impl Encoder for RecurrentEncoder {
    fn output_size(&self) -> usize {
        self.directions() * self.hidden_size
    }

    fn forward_t(
        &self,
        embed_src: &Tensor,
        src_length: &Tensor,
        _mask: &Tensor,
        train: bool,
    ) -> Result<EncoderOutput> {
        let lengths = check_recurrent_inputs(embed_src, src_length, self.emb_size)?;
        let (batch, max_len, _) = embed_src.dims3()?;

        let x = self.emb_dropout.forward(embed_src, train)?;
        let masks = step_masks(&lengths, max_len, x.dtype(), x.device())?;
        let mut inputs = (0..max_len)
            .map(|t| x.i((.., t, ..))?.contiguous())
            .collect::<candle_core::Result<Vec<_>>>()?;

        // Final states in (layer, direction) order.
        let mut finals = Vec::with_capacity(self.layers.len() * self.directions());
        for (idx, layer) in self.layers.iter().enumerate() {
            let (mut outputs, fwd_h) =
                Self::run_direction(&layer.forward, batch, &inputs, &masks, false)?;
            finals.push(fwd_h);
            if let Some(backward) = &layer.backward {
                let (bwd_out, bwd_h) =
                    Self::run_direction(backward, batch, &inputs, &masks, true)?;
                outputs = outputs
                    .iter()
                    .zip(&bwd_out)
                    .map(|(f, b)| Tensor::cat(&[f, b], 1))
                    .collect::<candle_core::Result<Vec<_>>>()?;
                finals.push(bwd_h);
            }
            if idx + 1 < self.layers.len() {
                outputs = outputs
                    .iter()
                    .map(|o| self.layer_dropout.forward(o, train))
                    .collect::<candle_core::Result<Vec<_>>>()?;
            }
            inputs = outputs;
        }

        // output: batch x max_len x directions*hidden
        let sequence = Tensor::stack(&inputs, 1)?;

        // hidden: layers x directions x batch x hidden, keep the top layer only
        let hidden = Tensor::stack(&finals, 0)?.reshape((
            self.layers.len(),
            self.directions(),
            batch,
            self.hidden_size,
        ))?;
        let top = hidden.i(self.layers.len() - 1)?;
        let summary = if self.bidirectional {
            Tensor::cat(&[top.i(0)?, top.i(1)?], 1)?
        } else {
            top.i(0)?
        };

        Ok(EncoderOutput {
            sequence,
            summary: Some(summary),
        })
    }

    fn parameters(&self) -> &[Parameter] {
        self.params.parameters()
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.params.trainable_vars()
    }
}

impl fmt::Display for RecurrentEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.rnn_type {
            RnnType::Gru => "GRU",
            RnnType::Lstm => "LSTM",
        };
        write!(
            f,
            "RecurrentEncoder({kind}({}, {}, num_layers={}, bidirectional={}))",
            self.emb_size,
            self.hidden_size,
            self.layers.len(),
            self.bidirectional
        )
    }
}

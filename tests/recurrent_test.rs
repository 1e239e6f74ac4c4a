//! Recurrent encoder integration tests.

mod common;

use approx::assert_abs_diff_eq;
use candle_core::{DType, IndexOp, Tensor};

use sign_encoders::model::RecurrentEncoder;
use sign_encoders::{build_encoder, Encoder, EncoderConfig, EncoderError, LocalProvider, RnnType};

fn recurrent_config(rnn_type: RnnType, bidirectional: bool) -> EncoderConfig {
    EncoderConfig {
        rnn_type,
        hidden_size: 4,
        embedding_size: 8,
        num_layers: 2,
        dropout: 0.0,
        embedding_dropout: 0.0,
        bidirectional,
        ..Default::default()
    }
}

#[test]
fn test_bidirectional_gru_shapes_on_padded_batch() {
    let varmap = common::fresh_varmap();
    let config = EncoderConfig {
        num_layers: 1,
        ..recurrent_config(RnnType::Gru, true)
    };
    let encoder = build_encoder(&config, common::var_builder(&varmap), &LocalProvider)
        .expect("recurrent encoder");

    let x = common::random_embeddings(2, 5, 8);
    let out = encoder
        .forward(&x, &common::lengths(&[5, 3]), &common::mask_from_lengths(&[5, 3], 5))
        .expect("forward");

    assert_eq!(out.sequence.dims(), &[2, 5, 8]);
    let summary = out.summary.expect("recurrent encoders return a summary");
    assert_eq!(summary.dims(), &[2, 8]);
    assert!(!common::has_nan(&out.sequence));
    assert!(!common::has_nan(&summary));
    assert_eq!(encoder.output_size(), 8);
}

#[test]
fn test_padding_values_do_not_leak_into_valid_steps() {
    let varmap = common::fresh_varmap();
    let encoder =
        RecurrentEncoder::new(&recurrent_config(RnnType::Lstm, true), common::var_builder(&varmap))
            .unwrap();
    let lengths = common::lengths(&[5, 3]);
    let mask = common::mask_from_lengths(&[5, 3], 5);

    let x = common::random_embeddings(2, 5, 8);
    // Same valid steps, different garbage in the padding of the second sequence.
    let noise = common::random_embeddings(1, 2, 8).affine(100., 0.).unwrap();
    let row = Tensor::cat(&[&x.i((1..2, 0..3)).unwrap(), &noise], 1).unwrap();
    let x_noisy = Tensor::cat(&[&x.i(0..1).unwrap(), &row], 0).unwrap();

    let a = encoder.forward(&x, &lengths, &mask).unwrap();
    let b = encoder.forward(&x_noisy, &lengths, &mask).unwrap();

    assert_abs_diff_eq!(common::max_abs_diff(&a.sequence, &b.sequence), 0.0, epsilon = 1e-6);
    assert_abs_diff_eq!(
        common::max_abs_diff(a.summary.as_ref().unwrap(), b.summary.as_ref().unwrap()),
        0.0,
        epsilon = 1e-6
    );
    // Padded steps are zero.
    let padded = a.sequence.i((1, 3..5)).unwrap();
    assert_abs_diff_eq!(padded.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
}

#[test]
fn test_batched_result_matches_single_sequence() {
    let varmap = common::fresh_varmap();
    let encoder =
        RecurrentEncoder::new(&recurrent_config(RnnType::Gru, true), common::var_builder(&varmap))
            .unwrap();
    let x = common::random_embeddings(2, 5, 8);
    let batched = encoder
        .forward(&x, &common::lengths(&[5, 3]), &common::mask_from_lengths(&[5, 3], 5))
        .unwrap();

    let short = x.i((1..2, 0..3)).unwrap();
    let alone = encoder
        .forward(&short, &common::lengths(&[3]), &common::mask_from_lengths(&[3], 3))
        .unwrap();

    let batched_valid = batched.sequence.i((1..2, 0..3)).unwrap();
    assert_abs_diff_eq!(common::max_abs_diff(&batched_valid, &alone.sequence), 0.0, epsilon = 1e-5);
    let batched_summary = batched.summary.unwrap().i(1..2).unwrap();
    assert_abs_diff_eq!(
        common::max_abs_diff(&batched_summary, alone.summary.as_ref().unwrap()),
        0.0,
        epsilon = 1e-5
    );
}

#[test]
fn test_unidirectional_lstm_output_size() {
    let varmap = common::fresh_varmap();
    let encoder =
        RecurrentEncoder::new(&recurrent_config(RnnType::Lstm, false), common::var_builder(&varmap))
            .unwrap();
    let out = encoder
        .forward(
            &common::random_embeddings(3, 4, 8),
            &common::lengths(&[4, 4, 2]),
            &common::mask_from_lengths(&[4, 4, 2], 4),
        )
        .unwrap();
    assert_eq!(out.sequence.dims(), &[3, 4, 4]);
    assert_eq!(out.summary.unwrap().dims(), &[3, 4]);
}

#[test]
fn test_wrong_embedding_size_is_rejected() {
    let varmap = common::fresh_varmap();
    let encoder =
        RecurrentEncoder::new(&recurrent_config(RnnType::Gru, true), common::var_builder(&varmap))
            .unwrap();
    let err = encoder
        .forward(
            &common::random_embeddings(2, 5, 6),
            &common::lengths(&[5, 3]),
            &common::mask_from_lengths(&[5, 3], 5),
        )
        .unwrap_err();
    assert!(err.is_config_mismatch());
    assert!(matches!(err, EncoderError::ShapeMismatch { what: "embedding size", .. }));
}

#[test]
fn test_empty_batch_is_an_error() {
    let varmap = common::fresh_varmap();
    let encoder =
        RecurrentEncoder::new(&recurrent_config(RnnType::Lstm, true), common::var_builder(&varmap))
            .unwrap();
    let device = common::device();
    let err = encoder
        .forward(
            &Tensor::zeros((0, 5, 8), DType::F32, &device).unwrap(),
            &Tensor::zeros(0, DType::U32, &device).unwrap(),
            &Tensor::zeros((0, 1, 5), DType::U8, &device).unwrap(),
        )
        .unwrap_err();
    assert!(err.is_config_mismatch());

    let err = encoder
        .forward(
            &Tensor::zeros((1, 0, 8), DType::F32, &device).unwrap(),
            &common::lengths(&[1]),
            &Tensor::zeros((1, 1, 0), DType::U8, &device).unwrap(),
        )
        .unwrap_err();
    assert!(matches!(err, EncoderError::ShapeMismatch { .. }));
}

#[test]
fn test_batch_size_mismatch_is_rejected() {
    let varmap = common::fresh_varmap();
    let encoder =
        RecurrentEncoder::new(&recurrent_config(RnnType::Gru, true), common::var_builder(&varmap))
            .unwrap();
    let err = encoder
        .forward(
            &common::random_embeddings(2, 5, 8),
            &common::lengths(&[5, 3, 2]),
            &common::mask_from_lengths(&[5, 3], 5),
        )
        .unwrap_err();
    assert!(matches!(err, EncoderError::ShapeMismatch { .. }));
}

#[test]
fn test_freeze_leaves_nothing_trainable() {
    let varmap = common::fresh_varmap();
    let config = EncoderConfig {
        freeze: true,
        ..recurrent_config(RnnType::Gru, true)
    };
    let encoder = RecurrentEncoder::new(&config, common::var_builder(&varmap)).unwrap();
    assert!(!encoder.parameters().is_empty());
    assert!(encoder.parameters().iter().all(|p| !p.is_trainable()));
    assert!(encoder.trainable_vars().is_empty());
}

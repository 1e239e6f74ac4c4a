//! Building encoders from JSON configuration files.

mod common;

use sign_encoders::{build_encoder, EncoderConfig, EncoderType, LocalProvider, RnnType};
use tempfile::tempdir;

#[test]
fn test_recurrent_encoder_from_config_file() {
    let dir = tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("encoder.json");
    std::fs::write(
        &path,
        r#"{
            "type": "rnn",
            "rnn_type": "lstm",
            "hidden_size": 6,
            "emb_size": 5,
            "num_layers": 2,
            "dropout": 0.0,
            "emb_dropout": 0.0,
            "bidirectional": true
        }"#,
    )
    .unwrap();

    let config = EncoderConfig::from_json_file(&path).unwrap();
    assert_eq!(config.encoder_type, EncoderType::Recurrent);
    assert_eq!(config.rnn_type, RnnType::Lstm);
    assert_eq!(config.embedding_size, 5);

    let varmap = common::fresh_varmap();
    let encoder = build_encoder(&config, common::var_builder(&varmap), &LocalProvider).unwrap();
    assert_eq!(encoder.output_size(), 12);
    assert_eq!(
        encoder.to_string(),
        "RecurrentEncoder(LSTM(5, 6, num_layers=2, bidirectional=true))"
    );
    // weight_ih, weight_hh, bias_ih, bias_hh per layer and direction
    assert_eq!(encoder.parameters().len(), 16);
    assert_eq!(varmap.all_vars().len(), 16);
}

#[test]
fn test_pretrained_encoder_from_config_file() {
    let checkpoint = common::write_bert_checkpoint();
    let dir = tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("encoder.json");
    let json = serde_json::json!({
        "encoder_type": "bert",
        "hidden_size": common::HIDDEN,
        "num_layers": 1,
        "freeze_pretrained_mode": "freeze_ff",
        "pretrained_name": checkpoint.path().to_string_lossy(),
    });
    std::fs::write(&path, json.to_string()).unwrap();

    let config = EncoderConfig::from_json_file(&path).unwrap();
    let varmap = common::fresh_varmap();
    let encoder = build_encoder(&config, common::var_builder(&varmap), &LocalProvider).unwrap();
    let out = encoder
        .forward(
            &common::random_embeddings(1, 3, common::HIDDEN),
            &common::lengths(&[3]),
            &common::mask_from_lengths(&[3], 3),
        )
        .unwrap();
    assert_eq!(out.sequence.dims(), &[1, 3, common::HIDDEN]);
}

#[test]
fn test_invalid_dropout_is_rejected() {
    let err = EncoderConfig::from_json_str(r#"{"dropout": 1.5}"#).unwrap_err();
    assert!(err.to_string().contains("dropout"));
}

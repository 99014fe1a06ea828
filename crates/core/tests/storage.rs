//! Weight files on disk.

use std::fs;

use minillm::prelude::*;
use minillm::sampling::SamplingStrategy;

const CORPUS: &str = "the cat sat on the mat. the dog sat on the log.\n";

fn tiny() -> ModelConfig {
    ModelConfig {
        d_model: 16,
        n_heads: 2,
        n_layers: 1,
        d_ff: 32,
        seq_len: 16,
        batch_size: 2,
        ..ModelConfig::default()
    }
}

fn greedy(max_tokens: usize) -> GenerateOptions {
    let mut opts = GenerateOptions::from_config(&tiny());
    opts.max_tokens = max_tokens;
    opts.sampling.strategy = SamplingStrategy::Greedy;
    opts
}

#[test]
fn saved_weights_reload_to_the_same_model() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("models").join("m.mlw");

    let mut original = Engine::new();
    original.initialize(tiny(), CORPUS).expect("init");
    for _ in 0..5 {
        original.train_step(1e-2).expect("step");
    }
    let vocab = original.save_weights(&path).expect("save");
    assert_eq!(vocab.kind, "character");
    assert!(path.exists());

    let mut restored = Engine::new();
    restored.load_weights(&path, None).expect("load");
    assert_eq!(restored.param_count(), original.param_count());
    assert_eq!(
        restored.tokenizer().map(|t| t.vocab_size()),
        original.tokenizer().map(|t| t.vocab_size())
    );

    let a = original.loss_on_text("the cat").expect("loss");
    let b = restored.loss_on_text("the cat").expect("loss");
    assert!((a - b).abs() < 1e-5, "{a} vs {b}");

    let ga = original.generate_text("the", &greedy(10)).expect("gen");
    let gb = restored.generate_text("the", &greedy(10)).expect("gen");
    assert_eq!(ga, gb);
}

#[test]
fn garbage_files_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("bad.mlw");
    fs::write(&path, b"definitely not weights").expect("write");

    let mut e = Engine::new();
    let err = e.load_weights(&path, None).expect_err("should fail");
    assert!(matches!(err, EngineError::Storage(StorageError::BadMagic)));
    assert!(!e.is_ready());
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut e = Engine::new();
    let err = e
        .load_weights(&dir.path().join("nope.mlw"), None)
        .expect_err("should fail");
    assert!(matches!(err, EngineError::Storage(StorageError::Io(_))));
}

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VizError {
    #[error("matrix declares {expected} rows but has {got}")]
    RowCount { expected: usize, got: usize },
    #[error("row {row} has {len} values, expected {cols}")]
    Ragged { row: usize, len: usize, cols: usize },
    #[error("bounds are inverted: min {min} > max {max}")]
    InvertedBounds { min: f32, max: f32 },
    #[error("attention weights are {rows}x{cols} for {tokens} tokens")]
    NotSquare {
        rows: usize,
        cols: usize,
        tokens: usize,
    },
}

#[derive(Debug, Error)]
pub enum TokenizerError {
    #[error("cannot build a vocabulary from an empty corpus")]
    EmptyCorpus,
    #[error("symbol {0:?} is not in the vocabulary")]
    UnknownSymbol(char),
    #[error("unsupported tokenizer type {0:?}")]
    UnsupportedType(String),
    #[error("invalid vocabulary: {0}")]
    InvalidVocab(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("not a weight file (bad magic)")]
    BadMagic,
    #[error("unsupported weight file version {0}")]
    UnsupportedVersion(u32),
    #[error("weight file has no {0} chunk")]
    MissingChunk(&'static str),
    #[error("tensor {name}: declared {rows}x{cols}, payload holds {values} values")]
    ShapeMismatch {
        name: String,
        rows: usize,
        cols: usize,
        values: usize,
    },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("model is not initialized")]
    NotReady,
    #[error("corpus too small: {len} characters (need at least {min})")]
    CorpusTooSmall { len: usize, min: usize },
    #[error("invalid config: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),
    #[error("text is empty")]
    EmptyText,
    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<io::Error> for EngineError {
    fn from(e: io::Error) -> Self {
        EngineError::Storage(StorageError::Io(e))
    }
}

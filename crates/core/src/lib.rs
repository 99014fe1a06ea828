//! # minillm
//!
//! A small character-level transformer that trains on CPU, plus the tooling
//! to look inside it: attention maps, weight matrices, embedding projections
//! and a colour-dot renderer for any of them.
//!
//! ## Quick Start
//!
//! ```
//! use minillm::prelude::*;
//!
//! let cfg = ModelConfig {
//!     d_model: 16,
//!     n_heads: 2,
//!     n_layers: 1,
//!     d_ff: 32,
//!     seq_len: 16,
//!     ..ModelConfig::default()
//! };
//! let mut engine = Engine::new();
//! engine.initialize(cfg, "1+1=2\n2+2=4\n").unwrap();
//! let loss = engine.train_step(1e-3).unwrap();
//! assert!(loss.is_finite());
//!
//! let maps = engine.attention("1+1").unwrap();
//! let mut raster = Raster::new(0, 0);
//! render_matrix(&mut raster, &maps[0].weights, &RenderOptions::default());
//! ```
//!
//! ## Feature Flags
//!
//! - `parallel`: row-parallel matmul via rayon
//!
//! ## Modules
//!
//! - [`viz`]: `Matrix` payloads and the dot renderer
//! - [`engine`] / [`introspect`]: the per-model service object
//! - [`trainer`]: epoch loop with stop/pause and progress events
//! - [`storage`]: the `.mlw` weight file

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/array.rs"]
pub mod array;

#[path = "core/layers.rs"]
pub mod layers;

#[path = "core/attention.rs"]
pub mod attention;

#[path = "core/model.rs"]
pub mod model;

#[path = "core/loss.rs"]
pub mod loss;

#[path = "core/optim.rs"]
pub mod optim;

#[path = "core/schedule.rs"]
pub mod schedule;

#[path = "core/tokenizer.rs"]
pub mod tokenizer;

#[path = "core/data.rs"]
pub mod data;

#[path = "core/sampling.rs"]
pub mod sampling;

#[path = "core/config.rs"]
pub mod config;

#[path = "core/storage.rs"]
pub mod storage;

#[path = "core/viz.rs"]
pub mod viz;

#[path = "core/error.rs"]
pub mod error;

#[path = "core/engine.rs"]
pub mod engine;

#[path = "core/introspect.rs"]
pub mod introspect;

#[path = "core/trainer.rs"]
pub mod trainer;

/// Prelude module for convenient imports.
///
/// ```
/// use minillm::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{presets, ModelConfig, Preset};
    pub use crate::engine::{Engine, GenerateOptions};
    pub use crate::error::{EngineError, StorageError, TokenizerError, VizError};
    pub use crate::introspect::{
        EmbeddingPoint, GenerationTrace, ParameterStats, WeightMatrixInfo, WeightSnapshot,
    };
    pub use crate::sampling::{SamplingParams, SamplingStrategy};
    pub use crate::schedule::LrSchedule;
    pub use crate::trainer::{
        run_training, AtomicControl, RunStatus, TrainingControl, TrainingEvent, TrainingOutcome,
    };
    pub use crate::viz::{
        render_matrix, AttentionResult, Canvas, CellSize, DotShape, DrawContext, Matrix, Raster,
        RenderOptions, Rgb,
    };
}

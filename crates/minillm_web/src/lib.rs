//! Browser-side pieces of the minillm client.
//!
//! The stores are plain Rust and build everywhere. The canvas backend needs
//! `--features web` and a wasm32 target.

pub mod stores;

#[cfg(all(feature = "web", target_arch = "wasm32"))]
pub mod canvas;

#[cfg(all(feature = "web", target_arch = "wasm32"))]
pub use canvas::{draw_matrix, WebCanvas};

pub use stores::{
    ChatAction, ChatState, ChatStore, Reducer, Store, StreamedEvent, TrainingAction,
    TrainingState, TrainingStore,
};

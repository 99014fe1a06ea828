//! Shared daemon state and the operations several handlers need.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use minillm::engine::Engine;
use minillm::error::EngineError;
use minillm::tokenizer::VocabJson;
use minillm::trainer::lock_engine;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::error::{DaemonError, Result};
use crate::handlers::SharedState;
use crate::paths::AppPaths;
use crate::registry::{EventBus, Registry, SharedEngine};
use crate::store::{new_id, SavedModelRecord, Store};

/// Corpora shorter than this are refused for initialisation and training.
pub const MIN_CORPUS_CHARS: usize = 10;

pub struct DaemonState {
    pub paths: AppPaths,
    pub store: Store,
    pub registry: Registry,
    pub bus: EventBus,
    pub shutdown: Arc<Notify>,
}

impl DaemonState {
    pub fn new(paths: AppPaths, store: Store, bus: EventBus) -> Self {
        Self {
            paths,
            store,
            registry: Registry::new(),
            bus,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Persist the store, logging rather than failing the request.
    pub fn persist(&self) {
        if let Err(e) = self.store.save() {
            warn!(error = %e, "failed to save store");
        }
    }

    /// Resolve a config id (explicit or the active model) to its engine,
    /// creating the slot on first use. With `require_idle`, a model whose
    /// job is stepping is refused.
    pub fn engine_for(
        &mut self,
        config_id: Option<&str>,
        require_idle: bool,
    ) -> Result<(String, SharedEngine)> {
        let cid = self
            .registry
            .resolve(config_id)
            .ok_or(DaemonError::Engine(EngineError::NotReady))?;
        let engine = self.registry.get_or_create(&cid, &self.store)?;
        if require_idle {
            self.registry.ensure_idle(&cid)?;
        }
        Ok((cid, engine))
    }

    /// Record weights written by [`write_weights`] as a saved model. An
    /// auto-save replaces the previous auto-save.
    pub fn record_model(
        &mut self,
        written: WrittenWeights,
        name: Option<String>,
        description: String,
        auto_save: bool,
        training_duration_seconds: Option<f64>,
    ) -> Result<SavedModelRecord> {
        let WrittenWeights {
            id,
            config_id,
            path,
            vocab,
            total_parameters,
        } = written;
        let config_name = match self.store.config(&config_id) {
            Ok(c) => c.name.clone(),
            Err(e) => {
                remove_weights(&path);
                return Err(e);
            }
        };

        if auto_save {
            if let Some(old) = self.store.take_auto_save(&config_id) {
                remove_weights(&old);
            }
        }
        let history = self.registry.loss_history(&config_id);
        let name = match (name, auto_save) {
            (Some(n), _) if !n.trim().is_empty() => n,
            (_, true) => format!("{config_name} (auto)"),
            _ => format!("model_{}", &id[..8]),
        };
        let rec = SavedModelRecord {
            id,
            name,
            description,
            config_id,
            weights_path: path,
            total_parameters,
            final_loss: history.last().copied(),
            epochs_trained: history.len(),
            training_duration_seconds,
            vocab,
            auto_save,
            created_at: Utc::now(),
        };
        self.store.add_model(rec.clone());
        info!(model = %rec.id, config_id = %rec.config_id, auto_save, "model saved");
        Ok(rec)
    }
}

/// A weight file on disk that the store does not know about yet.
#[derive(Debug)]
pub struct WrittenWeights {
    id: String,
    config_id: String,
    path: PathBuf,
    vocab: VocabJson,
    total_parameters: usize,
}

impl WrittenWeights {
    /// Delete the file instead of recording it.
    pub fn discard(self) {
        remove_weights(&self.path);
    }
}

/// Write the resident engine for `config_id` to a fresh weight file. The
/// daemon lock is only held to find the engine, never during the write.
pub async fn write_weights(state: &SharedState, config_id: &str) -> Result<WrittenWeights> {
    let (engine, path, id) = {
        let s = state.read().await;
        s.store.config(config_id)?;
        let engine = s
            .registry
            .engine(config_id)
            .ok_or_else(|| DaemonError::BadRequest("no model loaded for this config".into()))?;
        let id = new_id();
        (engine, s.paths.model_file(&id), id)
    };
    let write_path = path.clone();
    let (vocab, total_parameters) = blocking(engine, move |e| {
        let vocab = e.save_weights(&write_path)?;
        Ok((vocab, e.param_count()))
    })
    .await?;
    Ok(WrittenWeights {
        id,
        config_id: config_id.to_string(),
        path,
        vocab,
        total_parameters,
    })
}


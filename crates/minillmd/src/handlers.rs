//! Request dispatch. Every failure becomes `Response::Error`; nothing here
//! closes the connection.

use std::sync::Arc;

use minillm::config::ModelConfig;
use minillm::engine::GenerateOptions;
use minillm::error::EngineError;
use minillm::sampling::{SamplingParams, SamplingStrategy};
use minillm::trainer::RunStatus;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{DaemonError, Result};
use crate::files::{extract_text, file_type};
use crate::protocol::{ModelSummary, Request, Response};
use crate::registry::{ActiveModel, SharedEngine, SlotStatus};
use crate::state::{
    blocking, remove_weights, write_weights, DaemonState, MIN_CORPUS_CHARS,
};
use crate::store::{new_id, Role};

pub type SharedState = Arc<RwLock<DaemonState>>;

pub async fn handle(state: &SharedState, req: Request) -> Response {
    match dispatch(state, req).await {
        Ok(resp) => resp,
        Err(e) => {
            debug!(error = %e, "request failed");
            Response::Error {
                message: e.to_string(),
            }
        }
    }
}

fn require(text: &str, what: &str) -> Result<()> {
    if text.is_empty() {
        return Err(DaemonError::BadRequest(format!("{what} is required")));
    }
    Ok(())
}

fn check_corpus(corpus: &str) -> Result<()> {
    let len = corpus.chars().count();
    if len < MIN_CORPUS_CHARS {
        return Err(DaemonError::CorpusTooSmall {
            len,
            min: MIN_CORPUS_CHARS,
        });
    }
    Ok(())
}

async fn dispatch(state: &SharedState, req: Request) -> Result<Response> {
    match req {
        // -------------------------------------------------------------
        // Configs
        Request::ConfigList => {
            let s = state.read().await;
            Ok(Response::Configs {
                configs: s.store.configs(),
            })
        }
        Request::ConfigGet { id } => {
            let s = state.read().await;
            Ok(Response::Config {
                config: s.store.config(&id)?.clone(),
            })
        }
        Request::ConfigCreate {
            name,
            description,
            config,
        } => {
            let mut s = state.write().await;
            let config = s.store.create_config(&name, &description, config)?;
            s.persist();
            Ok(Response::Config { config })
        }
        Request::ConfigUpdate {
            id,
            name,
            description,
            config,
        } => {
            let mut s = state.write().await;
            let config = s.store.update_config(&id, name, description, config)?;
            s.persist();
            Ok(Response::Config { config })
        }
        Request::ConfigDelete { id } => {
            let mut s = state.write().await;
            let files = s.store.delete_config(&id)?;
            s.registry.remove(&id);
            for f in &files {
                remove_weights(f);
            }
            s.persist();
            Ok(Response::success("config deleted"))
        }
        Request::ConfigValidate { id } => {
            let s = state.read().await;
            let errors = s.store.config(&id)?.config.validate();
            Ok(Response::Validation {
                valid: errors.is_empty(),
                errors,
            })
        }
        Request::ConfigDuplicate { id } => {
            let mut s = state.write().await;
            let config = s.store.duplicate_config(&id)?;
            s.persist();
            Ok(Response::Config { config })
        }
        Request::ConfigPresets => {
            let s = state.read().await;
            Ok(Response::Configs {
                configs: s.store.presets(),
            })
        }

        // -------------------------------------------------------------
        // Training data
        Request::DataList => {
            let s = state.read().await;
            Ok(Response::DataList {
                data: s.store.data_list(),
            })
        }
        Request::DataUpload {
            filename,
            content,
            name,
            config_id,
        } => {
            let kind = file_type(&filename)?;
            let text = extract_text(&content, kind);
            let mut s = state.write().await;
            let name = name.unwrap_or_else(|| filename.clone());
            let data = s
                .store
                .add_data(&name, &filename, kind, content.len(), text);
            if let Some(cid) = config_id {
                if let Err(e) = s.store.link(&cid, &data.id) {
                    debug!(error = %e, "upload not linked");
                }
            }
            s.persist();
            Ok(Response::Data {
                data,
                created: true,
            })
        }
        Request::DataSample => {
            let mut s = state.write().await;
            let (data, created) = s.store.sample_data();
            if created {
                s.persist();
            }
            Ok(Response::Data { data, created })
        }
        Request::DataDelete { id } => {
            let mut s = state.write().await;
            s.store.delete_data(&id)?;
            s.persist();
            Ok(Response::success("data deleted"))
        }
        Request::DataToggle { id } => {
            let mut s = state.write().await;
            let data = s.store.toggle_data(&id)?;
            s.persist();
            Ok(Response::Data {
                data,
                created: false,
            })
        }
        Request::DataLink { config_id, data_id } => {
            let mut s = state.write().await;
            let link = s.store.link(&config_id, &data_id)?;
            s.persist();
            Ok(Response::Link {
                linked: true,
                is_active: link.is_active,
            })
        }
        Request::DataUnlink { config_id, data_id } => {
            let mut s = state.write().await;
            s.store.unlink(&config_id, &data_id)?;
            s.persist();
            Ok(Response::Link {
                linked: false,
                is_active: false,
            })
        }
        Request::DataToggleLink { config_id, data_id } => {
            let mut s = state.write().await;
            let link = s.store.toggle_link(&config_id, &data_id)?;
            s.persist();
            Ok(Response::Link {
                linked: true,
                is_active: link.is_active,
            })
        }
        Request::Corpus { config_id } => {
            let s = state.read().await;
            Ok(Response::Corpus(s.store.corpus_info(config_id.as_deref())))
        }

        // -------------------------------------------------------------
        // Training
        Request::ModelInitialize { config_id } => initialize(state, &config_id).await,
        Request::TrainingStart {
            config_id,
            num_epochs,
            continue_training,
        } => start_training(state, &config_id, num_epochs, continue_training).await,
        Request::TrainingStop { config_id } => control(state, config_id, Control::Stop).await,
        Request::TrainingPause { config_id } => control(state, config_id, Control::Pause).await,
        Request::TrainingResume { config_id } => {
            control(state, config_id, Control::Resume).await
        }
        Request::TrainingStatus { config_id } => {
            let (status, loss_history, engine) = {
                let s = state.read().await;
                match s.registry.resolve(config_id.as_deref()) {
                    Some(cid) => {
                        let status = match s.registry.running_job(&cid) {
                            Some(j) if j.is_paused() => "paused",
                            Some(_) => "running",
                            None => "idle",
                        };
                        (status, s.registry.loss_history(&cid), s.registry.engine(&cid))
                    }
                    None => ("idle", Vec::new(), None),
                }
            };
            let (is_ready, total_parameters) = match engine {
                Some(e) => blocking(e, |e| Ok((e.is_ready(), e.param_count()))).await?,
                None => (false, 0),
            };
            Ok(Response::TrainingStatus {
                status: status.to_string(),
                is_ready,
                loss_history,
                model_loaded: is_ready,
                total_parameters,
            })
        }
        Request::TrainingHistory { config_id } => {
            let s = state.read().await;
            Ok(Response::Runs {
                runs: s.store.runs(config_id.as_deref()),
            })
        }
        Request::Subscribe { .. } => Err(DaemonError::BadRequest(
            "Subscribe must be the first request on a connection".into(),
        )),

        // -------------------------------------------------------------
        // Saved models
        Request::ModelSave {
            config_id,
            name,
            description,
        } => {
            let written = write_weights(state, &config_id).await?;
            let mut s = state.write().await;
            let model = s.record_model(written, name, description, false, None)?;
            s.persist();
            Ok(Response::Model { model })
        }
        Request::ModelLoad { model_id } => {
            let (engine, cid, path, config) = {
                let mut guard = state.write().await;
                let s = &mut *guard;
                let saved = s.store.model(&model_id)?.clone();
                if !saved.weights_path.exists() {
                    return Err(DaemonError::not_found(
                        "weights file",
                        &saved.weights_path.display().to_string(),
                    ));
                }
                let config = s.store.config(&saved.config_id)?.config.clone();
                if s.registry.is_busy(&saved.config_id) {
                    return Err(DaemonError::Conflict(
                        "stop training before loading other weights".into(),
                    ));
                }
                let engine = s.registry.get_or_create(&saved.config_id, &s.store)?;
                (engine, saved.config_id, saved.weights_path, config)
            };
            let (total_parameters, vocab_size) = blocking(engine, move |e| {
                e.load_weights(&path, Some(config))?;
                Ok((
                    e.param_count(),
                    e.tokenizer().map_or(0, |t| t.vocab_size()),
                ))
            })
            .await?;
            info!(model = %model_id, config_id = %cid, "model loaded");
            Ok(Response::ModelLoaded {
                config_id: cid,
                total_parameters,
                vocab_size,
            })
        }
        Request::ModelList => {
            let s = state.read().await;
            Ok(Response::Models {
                models: s.store.models(),
            })
        }
        Request::ModelDelete { model_id } => {
            let mut s = state.write().await;
            let path = s.store.delete_model(&model_id)?;
            remove_weights(&path);
            s.persist();
            Ok(Response::success("model deleted"))
        }
        Request::ModelInfo { config_id } => {
            let engine = {
                let mut s = state.write().await;
                match config_id.as_deref() {
                    Some(_) => Some(s.engine_for(config_id.as_deref(), false)?.1),
                    None => s
                        .registry
                        .active_id()
                        .map(str::to_string)
                        .and_then(|cid| s.registry.engine(&cid)),
                }
            };
            let Some(engine) = engine else {
                return Ok(Response::ModelInfo {
                    loaded: false,
                    info: None,
                });
            };
            let info = blocking(engine, |e| {
                Ok(e.config().map(|c| ModelSummary {
                    total_parameters: e.param_count(),
                    vocab_size: c.vocab_size,
                    d_model: c.d_model,
                    n_heads: c.n_heads,
                    n_layers: c.n_layers,
                    d_ff: c.d_ff,
                    seq_len: c.seq_len,
                }))
            })
            .await?;
            Ok(Response::ModelInfo {
                loaded: info.is_some(),
                info,
            })
        }
        Request::ActiveModels => {
            let s = state.read().await;
            let mut models = s.registry.list();
            for saved in s.store.models() {
                if models.iter().any(|m| m.config_id == saved.config_id) {
                    continue;
                }
                models.push(ActiveModel {
                    config_id: saved.config_id.clone(),
                    is_ready: true,
                    status: SlotStatus::Ready,
                    is_active: false,
                    in_memory: false,
                    total_parameters: saved.total_parameters,
                    last_loss: saved.final_loss,
                });
            }
            Ok(Response::ActiveModels { models })
        }
        Request::ModelUnload { config_id } => {
            let mut s = state.write().await;
            if !s.registry.remove(&config_id) {
                return Err(DaemonError::not_found("loaded model", &config_id));
            }
            info!(config_id = %config_id, "model unloaded");
            Ok(Response::success(format!("unloaded {config_id}")))
        }

        // -------------------------------------------------------------
        // Generation and chat
        Request::Generate {
            config_id,
            prompt,
            params,
        } => {
            require(&prompt, "prompt")?;
            let (_, engine) = state.write().await.engine_for(config_id.as_deref(), true)?;
            let opts: GenerateOptions = params.into();
            let p = prompt.clone();
            let text = blocking(engine, move |e| e.generate_text(&p, &opts)).await?;
            let generated_length = text.chars().count().saturating_sub(prompt.chars().count());
            Ok(Response::Generated {
                prompt,
                generated_text: text,
                generated_length,
            })
        }
        Request::ChatSessions { config_id } => {
            let s = state.read().await;
            Ok(Response::Sessions {
                sessions: s.store.sessions(config_id.as_deref()),
            })
        }
        Request::ChatSession { session_id } => {
            let s = state.read().await;
            Ok(Response::Messages {
                messages: s.store.session_messages(&session_id),
            })
        }
        Request::ChatDeleteSession { session_id } => {
            let mut s = state.write().await;
            let n = s.store.delete_session(&session_id);
            s.persist();
            Ok(Response::success(format!("deleted {n} messages")))
        }
        Request::ChatSend {
            session_id,
            config_id,
            content,
            params,
        } => {
            require(&content, "content")?;
            let session_id = session_id.unwrap_or_else(new_id);
            let (engine, record_cid) = {
                let mut s = state.write().await;
                let (_, engine) = s.engine_for(config_id.as_deref(), true)?;
                let record_cid = config_id.filter(|c| s.store.config(c).is_ok());
                s.store
                    .add_message(&session_id, record_cid.as_deref(), Role::User, &content, None);
                s.persist();
                (engine, record_cid)
            };
            let opts: GenerateOptions = params.into();
            let prompt = content.clone();
            let reply = blocking(engine, move |e| e.generate_text(&prompt, &opts)).await?;
            let mut s = state.write().await;
            let message = s.store.add_message(
                &session_id,
                record_cid.as_deref(),
                Role::Assistant,
                &reply,
                Some((params.temperature, params.max_tokens)),
            );
            s.persist();
            Ok(Response::Message { message })
        }

        // -------------------------------------------------------------
        // Evaluation
        Request::EvalAttention { config_id, text } => {
            require(&text, "text")?;
            let (_, engine) = state.write().await.engine_for(config_id.as_deref(), true)?;
            let attention = blocking(engine, move |e| e.attention(&text)).await?;
            Ok(Response::Attention { attention })
        }
        Request::EvalPerplexity { config_id, text } => {
            require(&text, "text")?;
            let (_, engine) = state.write().await.engine_for(config_id.as_deref(), true)?;
            let t = text.clone();
            let (loss, perplexity) = blocking(engine, move |e| {
                let loss = e.loss_on_text(&t)?;
                Ok((loss, loss.exp()))
            })
            .await?;
            Ok(Response::Perplexity {
                text,
                loss,
                perplexity,
            })
        }
        Request::EvalEmbeddings { config_id } => {
            let (_, engine) = state.write().await.engine_for(config_id.as_deref(), false)?;
            let embeddings = blocking(engine, |e| e.embeddings_2d()).await?;
            Ok(Response::Embeddings { embeddings })
        }
        Request::EvalParameters { config_id } => {
            let (_, engine) = state.write().await.engine_for(config_id.as_deref(), false)?;
            let (parameters, total) =
                blocking(engine, |e| Ok((e.parameter_stats()?, e.param_count()))).await?;
            Ok(Response::Parameters { parameters, total })
        }
        Request::EvalWeightMatrices { config_id } => {
            let (_, engine) = state.write().await.engine_for(config_id.as_deref(), false)?;
            let matrices = blocking(engine, |e| e.weight_matrices()).await?;
            Ok(Response::WeightMatrices { matrices })
        }
        Request::EvalGenerationWeights {
            config_id,
            prompt,
            max_tokens,
            temperature,
        } => {
            require(&prompt, "prompt")?;
            let (_, engine) = state.write().await.engine_for(config_id.as_deref(), true)?;
            let opts = GenerateOptions {
                max_tokens,
                sampling: SamplingParams {
                    strategy: SamplingStrategy::Temperature,
                    temperature,
                    ..SamplingParams::default()
                },
                min_new_tokens: 0,
            };
            let trace = blocking(engine, move |e| e.generation_weights(&prompt, &opts)).await?;
            Ok(Response::GenerationWeights(Box::new(trace)))
        }
        Request::EvalTokenize { config_id, text } => {
            require(&text, "text")?;
            let (_, engine) = state.write().await.engine_for(config_id.as_deref(), false)?;
            blocking(engine, move |e| {
                let tok = e
                    .tokenizer()
                    .ok_or(EngineError::NotReady)?;
                let ids = tok.encode(&text)?;
                let chars = ids.iter().map(|&id| tok.decode(&[id])).collect();
                let exported = tok.to_vocab_json();
                let mut vocab: Vec<(String, usize)> = exported.vocab.into_iter().collect();
                vocab.sort_by_key(|(_, id)| *id);
                Ok(Response::Tokens {
                    chars,
                    ids,
                    vocab,
                    vocab_size: tok.vocab_size(),
                    tokenizer_type: exported.kind,
                })
            })
            .await
        }

        Request::Shutdown => {
            let s = state.read().await;
            s.registry.stop_all();
            s.persist();
            s.shutdown.notify_one();
            info!("shutdown requested");
            Ok(Response::success("shutting down"))
        }
    }
}

async fn initialize(state: &SharedState, config_id: &str) -> Result<Response> {
    let (engine, config, corpus) = {
        let mut guard = state.write().await;
        let s = &mut *guard;
        let record = s.store.config(config_id)?.clone();
        let engine = s.registry.get_or_create(config_id, &s.store)?;
        if s.registry.is_busy(config_id) {
            return Err(DaemonError::Conflict(
                "stop training before re-initializing".into(),
            ));
        }
        // held until the weights are in place so no start can interleave
        s.registry.begin_start(config_id)?;
        // vocabulary comes from every linked file, active or not
        (engine, record.config, s.store.corpus(Some(config_id), false))
    };

    let outcome = initialize_engine(engine, config, corpus).await;
    let mut s = state.write().await;
    s.registry.cancel_start(config_id);
    let (status, vocab_size, total_parameters) = outcome?;
    if status == "initialized" {
        s.store.set_vocab_size(config_id, vocab_size)?;
        s.persist();
        info!(config_id, vocab_size, total_parameters, "model initialized");
    }
    Ok(Response::Initialized {
        status: status.to_string(),
        vocab_size,
        total_parameters,
    })
}

async fn initialize_engine(
    engine: SharedEngine,
    config: ModelConfig,
    corpus: String,
) -> Result<(&'static str, usize, usize)> {
    let cfg = config.clone();
    let current = blocking(Arc::clone(&engine), move |e| {
        let unchanged = e.config().is_some_and(|c| c.same_architecture(&cfg));
        Ok((e.is_ready() && unchanged)
            .then(|| (e.tokenizer().map_or(0, |t| t.vocab_size()), e.param_count())))
    })
    .await?;
    if let Some((vocab_size, total_parameters)) = current {
        return Ok(("already_ready", vocab_size, total_parameters));
    }

    check_corpus(&corpus)?;
    let (vocab_size, total_parameters) = blocking(engine, move |e| {
        e.initialize(config, &corpus)?;
        Ok((e.tokenizer().map_or(0, |t| t.vocab_size()), e.param_count()))
    })
    .await?;
    Ok(("initialized", vocab_size, total_parameters))
}

async fn start_training(
    state: &SharedState,
    config_id: &str,
    num_epochs: Option<usize>,
    continue_training: bool,
) -> Result<Response> {
    let (engine, mut config, corpus) = {
        let mut guard = state.write().await;
        let s = &mut *guard;
        let record = s.store.config(config_id)?.clone();
        let engine = s.registry.get_or_create(config_id, &s.store)?;
        let corpus = s.store.corpus(Some(config_id), true);
        check_corpus(&corpus)?;
        s.registry.begin_start(config_id)?;
        let live = s.registry.live_run_ids();
        s.store.fail_orphaned_runs(&live);
        (engine, record.config, corpus)
    };
    if let Some(n) = num_epochs {
        config.max_epochs = n;
    }
    let epochs = config.max_epochs;

    let prepared = blocking(engine, move |e| {
        let same = e.config().is_some_and(|c| c.same_architecture(&config));
        if continue_training && e.is_ready() && same {
            e.update_corpus(&corpus, &config)?;
        } else {
            e.initialize(config, &corpus)?;
        }
        Ok((e.tokenizer().map_or(0, |t| t.vocab_size()), e.param_count()))
    })
    .await;

    let mut s = state.write().await;
    let launched = prepared.and_then(|(vocab_size, total_parameters)| {
        s.store.set_vocab_size(config_id, vocab_size)?;
        let run_id = new_id();
        let bus = s.bus.clone();
        s.registry.start_job(config_id, &run_id, epochs, bus)?;
        s.store.create_run(&run_id, config_id, epochs);
        Ok((run_id, vocab_size, total_parameters))
    });
    let (run_id, vocab_size, total_parameters) = match launched {
        Ok(v) => v,
        Err(e) => {
            s.registry.cancel_start(config_id);
            return Err(e);
        }
    };
    s.persist();
    info!(config_id, run = %run_id, epochs, continue_training, "training job started");
    Ok(Response::TrainingStarted {
        run_id,
        total_epochs: epochs,
        vocab_size,
        total_parameters,
    })
}

#[derive(Debug, Clone, Copy)]
enum Control {
    Stop,
    Pause,
    Resume,
}

async fn control(
    state: &SharedState,
    config_id: Option<String>,
    action: Control,
) -> Result<Response> {
    let mut s = state.write().await;
    let cid = s
        .registry
        .resolve(config_id.as_deref())
        .ok_or(DaemonError::NotTraining)?;
    let job = s.registry.running_job(&cid).ok_or(DaemonError::NotTraining)?;
    let run_id = job.run_id.clone();
    let (status, message) = match action {
        Control::Stop => {
            job.stop();
            (None, "stopped")
        }
        Control::Pause => {
            job.pause();
            (Some(RunStatus::Paused), "paused")
        }
        Control::Resume => {
            job.resume();
            (Some(RunStatus::Running), "running")
        }
    };
    if let Some(status) = status {
        match s.store.run_mut(&run_id) {
            Some(run) => run.status = status,
            None => warn!(run = %run_id, "run record missing"),
        }
        s.persist();
    }
    Ok(Response::success(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::paths::AppPaths;
    use crate::recorder;
    use crate::registry::EventBus;
    use crate::store::Store;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            d_model: 16,
            n_heads: 2,
            n_layers: 1,
            d_ff: 32,
            seq_len: 16,
            batch_size: 4,
            max_epochs: 2,
            learning_rate: 1e-2,
            ..ModelConfig::default()
        }
    }

    fn test_state() -> (tempfile::TempDir, SharedState) {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::at(dir.path()).expect("paths");
        let store = Store::open(&paths.store_file()).expect("store");
        let (bus, events) = EventBus::new(64);
        let state = Arc::new(RwLock::new(DaemonState::new(paths, store, bus)));
        tokio::spawn(recorder::run(Arc::clone(&state), events));
        (dir, state)
    }

    /// A config with the sample text linked to it.
    async fn config_with_data(state: &SharedState) -> String {
        let Response::Config { config } = handle(
            state,
            Request::ConfigCreate {
                name: "tiny".into(),
                description: String::new(),
                config: tiny_config(),
            },
        )
        .await
        else {
            panic!("config not created");
        };
        let Response::Data { data, created } = handle(state, Request::DataSample).await else {
            panic!("no sample data");
        };
        assert!(created);
        let resp = handle(
            state,
            Request::DataLink {
                config_id: config.id.clone(),
                data_id: data.id,
            },
        )
        .await;
        assert!(matches!(resp, Response::Link { linked: true, is_active: true }));
        config.id
    }

    #[tokio::test]
    async fn initialize_then_generate() {
        let (_dir, state) = test_state();
        let cid = config_with_data(&state).await;

        let resp = handle(&state, Request::ModelInitialize { config_id: cid.clone() }).await;
        let Response::Initialized { status, vocab_size, .. } = resp else {
            panic!("unexpected {resp:?}");
        };
        assert_eq!(status, "initialized");
        assert!(vocab_size > 2);

        let resp = handle(&state, Request::ModelInitialize { config_id: cid.clone() }).await;
        assert!(matches!(
            resp,
            Response::Initialized { ref status, .. } if status == "already_ready"
        ));

        let resp = handle(
            &state,
            Request::Generate {
                config_id: None,
                prompt: "The".into(),
                params: crate::protocol::GenParams {
                    max_tokens: 5,
                    ..Default::default()
                },
            },
        )
        .await;
        let Response::Generated { generated_text, .. } = resp else {
            panic!("unexpected {resp:?}");
        };
        assert!(generated_text.starts_with("The"));

        let resp = handle(
            &state,
            Request::EvalTokenize {
                config_id: Some(cid),
                text: "cat".into(),
            },
        )
        .await;
        let Response::Tokens { chars, ids, vocab, tokenizer_type, .. } = resp else {
            panic!("unexpected {resp:?}");
        };
        assert_eq!(chars, vec!["c", "a", "t"]);
        assert_eq!(ids.len(), 3);
        assert!(vocab.windows(2).all(|w| w[0].1 < w[1].1));
        assert_eq!(tokenizer_type, "character");
    }

    #[tokio::test]
    async fn errors_become_error_responses() {
        let (_dir, state) = test_state();
        let resp = handle(
            &state,
            Request::Generate {
                config_id: None,
                prompt: "x".into(),
                params: Default::default(),
            },
        )
        .await;
        assert!(matches!(resp, Response::Error { .. }));

        let resp = handle(&state, Request::TrainingStop { config_id: None }).await;
        assert!(matches!(resp, Response::Error { .. }));

        let resp = handle(
            &state,
            Request::DataUpload {
                filename: "doc.pdf".into(),
                content: "x".into(),
                name: None,
                config_id: None,
            },
        )
        .await;
        assert!(matches!(resp, Response::Error { .. }));
    }

    #[tokio::test]
    async fn training_needs_a_corpus() {
        let (_dir, state) = test_state();
        let Response::Config { config } = handle(
            &state,
            Request::ConfigCreate {
                name: "empty".into(),
                description: String::new(),
                config: tiny_config(),
            },
        )
        .await
        else {
            panic!("config not created");
        };
        let resp = handle(
            &state,
            Request::TrainingStart {
                config_id: config.id,
                num_epochs: None,
                continue_training: false,
            },
        )
        .await;
        let Response::Error { message } = resp else {
            panic!("unexpected {resp:?}");
        };
        assert!(message.contains("corpus too small"));
    }

    #[tokio::test]
    async fn completed_run_is_recorded_and_auto_saved() {
        let (_dir, state) = test_state();
        let cid = config_with_data(&state).await;

        let resp = handle(
            &state,
            Request::TrainingStart {
                config_id: cid.clone(),
                num_epochs: Some(2),
                continue_training: false,
            },
        )
        .await;
        let Response::TrainingStarted { run_id, total_epochs, .. } = resp else {
            panic!("unexpected {resp:?}");
        };
        assert_eq!(total_epochs, 2);

        let mut finished = None;
        for _ in 0..600 {
            let Response::Runs { runs } = handle(
                &state,
                Request::TrainingHistory {
                    config_id: Some(cid.clone()),
                },
            )
            .await
            else {
                panic!("no runs");
            };
            let run = runs.into_iter().find(|r| r.id == run_id).expect("run recorded");
            if run.status.is_terminal() && run.model_id.is_some() {
                finished = Some(run);
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let run = finished.expect("run finished in time");
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.loss_history.len(), 2);
        assert!(run.completed_at.is_some());

        let Response::Models { models } = handle(&state, Request::ModelList).await else {
            panic!("no models");
        };
        assert_eq!(models.len(), 1);
        assert!(models[0].auto_save);
        assert!(models[0].weights_path.exists());
        assert_eq!(models[0].name, "tiny (auto)");
    }

    async fn start(state: &SharedState, cid: &str, epochs: usize) -> Response {
        handle(
            state,
            Request::TrainingStart {
                config_id: cid.to_string(),
                num_epochs: Some(epochs),
                continue_training: false,
            },
        )
        .await
    }

    async fn runs_for(state: &SharedState, cid: &str) -> Vec<crate::store::RunRecord> {
        let Response::Runs { runs } = handle(
            state,
            Request::TrainingHistory {
                config_id: Some(cid.to_string()),
            },
        )
        .await
        else {
            panic!("no runs");
        };
        runs
    }

    async fn wait_for_status(state: &SharedState, cid: &str, run_id: &str, want: RunStatus) {
        for _ in 0..600 {
            let runs = runs_for(state, cid).await;
            if runs.iter().any(|r| r.id == run_id && r.status == want) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("run {run_id} never reached {want:?}");
    }

    fn perplexity(cid: &str) -> Request {
        Request::EvalPerplexity {
            config_id: Some(cid.to_string()),
            text: "The cat".into(),
        }
    }

    #[tokio::test]
    async fn forward_passes_are_refused_until_paused() {
        let (_dir, state) = test_state();
        let cid = config_with_data(&state).await;

        let resp = start(&state, &cid, 100_000).await;
        let Response::TrainingStarted { run_id, .. } = resp else {
            panic!("unexpected {resp:?}");
        };
        wait_for_status(&state, &cid, &run_id, RunStatus::Running).await;

        let Response::Error { message } = handle(&state, perplexity(&cid)).await else {
            panic!("perplexity ran during training");
        };
        assert_eq!(message, DaemonError::TrainingActive.to_string());

        let pause = Request::TrainingPause {
            config_id: Some(cid.clone()),
        };
        assert!(matches!(handle(&state, pause).await, Response::Success { .. }));
        {
            let resp = handle(&state, perplexity(&cid)).await;
            let Response::Perplexity { loss, perplexity, .. } = resp else {
                panic!("unexpected {resp:?}");
            };
            assert!(loss > 0.0);
            assert!((perplexity - loss.exp()).abs() < 1e-3 * perplexity);
        }

        let resume = Request::TrainingResume {
            config_id: Some(cid.clone()),
        };
        assert!(matches!(handle(&state, resume).await, Response::Success { .. }));
        assert!(matches!(
            handle(&state, perplexity(&cid)).await,
            Response::Error { .. }
        ));

        let stop = Request::TrainingStop {
            config_id: Some(cid.clone()),
        };
        assert!(matches!(handle(&state, stop).await, Response::Success { .. }));
        wait_for_status(&state, &cid, &run_id, RunStatus::Stopped).await;
    }

    #[tokio::test]
    async fn pause_and_resume_update_the_run_record() {
        let (_dir, state) = test_state();
        let cid = config_with_data(&state).await;

        let resp = start(&state, &cid, 100_000).await;
        let Response::TrainingStarted { run_id, .. } = resp else {
            panic!("unexpected {resp:?}");
        };
        wait_for_status(&state, &cid, &run_id, RunStatus::Running).await;

        let pause = Request::TrainingPause {
            config_id: Some(cid.clone()),
        };
        handle(&state, pause).await;
        let runs = runs_for(&state, &cid).await;
        assert_eq!(runs[0].status, RunStatus::Paused);
        let resp = handle(
            &state,
            Request::TrainingStatus {
                config_id: Some(cid.clone()),
            },
        )
        .await;
        assert!(matches!(resp, Response::TrainingStatus { ref status, .. } if status == "paused"));

        let resume = Request::TrainingResume {
            config_id: Some(cid.clone()),
        };
        handle(&state, resume).await;
        let runs = runs_for(&state, &cid).await;
        assert_eq!(runs[0].status, RunStatus::Running);

        handle(&state, Request::TrainingStop { config_id: None }).await;
        wait_for_status(&state, &cid, &run_id, RunStatus::Stopped).await;
        let runs = runs_for(&state, &cid).await;
        assert!(runs[0].completed_at.is_some());
        assert!(runs[0].model_id.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn simultaneous_starts_launch_one_job() {
        let (_dir, state) = test_state();
        let cid = config_with_data(&state).await;

        let (a, b) = tokio::join!(start(&state, &cid, 100_000), start(&state, &cid, 100_000));
        let started: Vec<String> = [&a, &b]
            .into_iter()
            .filter_map(|r| match r {
                Response::TrainingStarted { run_id, .. } => Some(run_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(started.len(), 1, "{a:?} / {b:?}");
        assert!(
            [&a, &b]
                .into_iter()
                .any(|r| matches!(r, Response::Error { .. })),
            "{a:?} / {b:?}"
        );

        let runs = runs_for(&state, &cid).await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, started[0]);

        handle(&state, Request::TrainingStop { config_id: None }).await;
        wait_for_status(&state, &cid, &started[0], RunStatus::Stopped).await;
    }
}

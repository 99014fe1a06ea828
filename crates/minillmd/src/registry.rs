//! In-memory engines and their training jobs, keyed by config id.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread::{self, JoinHandle};

use minillm::engine::Engine;
use minillm::trainer::{run_training, AtomicControl, TrainingEvent, TrainingOutcome};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::error::{DaemonError, Result};
use crate::store::Store;

pub const MAX_MODELS: usize = 5;

pub type SharedEngine = Arc<Mutex<Engine>>;

/// A training event tagged with where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedEvent {
    pub config_id: String,
    pub run_id: String,
    #[serde(flatten)]
    pub event: TrainingEvent,
}

/// Fan-out for training events: the recorder gets every event, live
/// subscribers may lag and drop.
#[derive(Debug, Clone)]
pub struct EventBus {
    recorder: mpsc::UnboundedSender<TaggedEvent>,
    live: broadcast::Sender<TaggedEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<TaggedEvent>) {
        let (recorder, rx) = mpsc::unbounded_channel();
        let (live, _) = broadcast::channel(capacity);
        (Self { recorder, live }, rx)
    }

    pub fn publish(&self, ev: TaggedEvent) {
        // No live subscribers is not an error.
        let _ = self.live.send(ev.clone());
        if self.recorder.send(ev).is_err() {
            warn!("event recorder is gone");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaggedEvent> {
        self.live.subscribe()
    }
}

#[derive(Debug)]
pub struct TrainingJob {
    pub run_id: String,
    control: Arc<AtomicControl>,
    handle: Option<JoinHandle<TrainingOutcome>>,
}

impl TrainingJob {
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    pub fn stop(&self) {
        self.control.stop();
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }
}

#[derive(Debug)]
struct Slot {
    engine: SharedEngine,
    job: Option<TrainingJob>,
    /// Set between a training start being accepted and its job spawning.
    starting: bool,
    loss_history: Arc<Mutex<Vec<f32>>>,
    /// Last observed engine facts, for listings taken while it is locked.
    ready: AtomicBool,
    params: AtomicUsize,
}

impl Slot {
    fn new(engine: Engine) -> Self {
        Self {
            ready: AtomicBool::new(engine.is_ready()),
            params: AtomicUsize::new(engine.param_count()),
            engine: Arc::new(Mutex::new(engine)),
            job: None,
            starting: false,
            loss_history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn is_busy(&self) -> bool {
        self.starting || self.job.as_ref().is_some_and(TrainingJob::is_running)
    }

    /// `(is_ready, param_count)` without waiting on the engine lock.
    fn facts(&self) -> (bool, usize) {
        let fresh = match self.engine.try_lock() {
            Ok(e) => Some((e.is_ready(), e.param_count())),
            Err(TryLockError::Poisoned(p)) => {
                let e = p.into_inner();
                Some((e.is_ready(), e.param_count()))
            }
            Err(TryLockError::WouldBlock) => None,
        };
        match fresh {
            Some((ready, params)) => {
                self.ready.store(ready, Ordering::Relaxed);
                self.params.store(params, Ordering::Relaxed);
                (ready, params)
            }
            None => (
                self.ready.load(Ordering::Relaxed),
                self.params.load(Ordering::Relaxed),
            ),
        }
    }
}

/// What a loaded model is doing, for status listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Idle,
    Ready,
    Training,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveModel {
    pub config_id: String,
    pub is_ready: bool,
    pub status: SlotStatus,
    pub is_active: bool,
    pub in_memory: bool,
    pub total_parameters: usize,
    pub last_loss: Option<f32>,
}

#[derive(Debug, Default)]
pub struct Registry {
    slots: HashMap<String, Slot>,
    active: Option<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Explicit id, else the most recently used model.
    pub fn resolve(&self, config_id: Option<&str>) -> Option<String> {
        config_id.map(str::to_string).or_else(|| self.active.clone())
    }

    /// Engine for `config_id`, creating it (and auto-loading the newest
    /// saved weights for that config) when it is not resident yet.
    pub fn get_or_create(&mut self, config_id: &str, store: &Store) -> Result<SharedEngine> {
        if !self.slots.contains_key(config_id) {
            if self.slots.len() >= MAX_MODELS {
                return Err(DaemonError::RegistryFull(MAX_MODELS));
            }
            let record = store.config(config_id)?;
            let mut engine = Engine::new();
            if let Some(saved) = store.latest_model(config_id) {
                match engine.load_weights(&saved.weights_path, Some(record.config.clone())) {
                    Ok(()) => info!(config_id, model = %saved.id, "auto-loaded saved weights"),
                    Err(e) => debug!(config_id, error = %e, "no usable saved weights"),
                }
            }
            self.slots.insert(config_id.to_string(), Slot::new(engine));
        }
        self.active = Some(config_id.to_string());
        self.slots
            .get(config_id)
            .map(|s| Arc::clone(&s.engine))
            .ok_or_else(|| DaemonError::not_found("model", config_id))
    }

    /// Resident engine only; never creates one.
    pub fn engine(&self, config_id: &str) -> Option<SharedEngine> {
        self.slots.get(config_id).map(|s| Arc::clone(&s.engine))
    }

    pub fn job(&self, config_id: &str) -> Option<&TrainingJob> {
        self.slots.get(config_id).and_then(|s| s.job.as_ref())
    }

    pub fn running_job(&self, config_id: &str) -> Option<&TrainingJob> {
        self.job(config_id).filter(|j| j.is_running())
    }

    /// A job is running or a start is being prepared.
    pub fn is_busy(&self, config_id: &str) -> bool {
        self.slots.get(config_id).is_some_and(Slot::is_busy)
    }

    /// Forward passes are refused while a job is stepping or starting.
    pub fn ensure_idle(&self, config_id: &str) -> Result<()> {
        if self.slots.get(config_id).is_some_and(|s| s.starting) {
            return Err(DaemonError::TrainingActive);
        }
        match self.running_job(config_id) {
            Some(j) if !j.is_paused() => Err(DaemonError::TrainingActive),
            _ => Ok(()),
        }
    }

    /// Claim the slot for a training start. Held until [`start_job`] or
    /// [`cancel_start`].
    ///
    /// [`start_job`]: Registry::start_job
    /// [`cancel_start`]: Registry::cancel_start
    pub fn begin_start(&mut self, config_id: &str) -> Result<()> {
        let slot = self
            .slots
            .get_mut(config_id)
            .ok_or_else(|| DaemonError::not_found("model", config_id))?;
        if slot.is_busy() {
            return Err(DaemonError::Conflict(
                "a training job is already running for this model".into(),
            ));
        }
        slot.starting = true;
        Ok(())
    }

    pub fn cancel_start(&mut self, config_id: &str) {
        if let Some(slot) = self.slots.get_mut(config_id) {
            slot.starting = false;
        }
    }

    pub fn loss_history(&self, config_id: &str) -> Vec<f32> {
        self.slots
            .get(config_id)
            .map(|s| s.loss_history.lock().map(|h| h.clone()).unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn live_run_ids(&self) -> HashSet<String> {
        self.slots
            .values()
            .filter_map(|s| s.job.as_ref())
            .filter(|j| j.is_running())
            .map(|j| j.run_id.clone())
            .collect()
    }

    /// Spawn a training thread for `config_id`. Events are tagged and
    /// published on `bus`. Releases a start claimed with `begin_start`.
    pub fn start_job(
        &mut self,
        config_id: &str,
        run_id: &str,
        epochs: usize,
        bus: EventBus,
    ) -> Result<()> {
        let slot = self
            .slots
            .get_mut(config_id)
            .ok_or_else(|| DaemonError::not_found("model", config_id))?;
        if slot.job.as_ref().is_some_and(TrainingJob::is_running) {
            slot.starting = false;
            return Err(DaemonError::Conflict(
                "a training job is already running for this model".into(),
            ));
        }
        slot.starting = false;

        let control = Arc::new(AtomicControl::new());
        let engine = Arc::clone(&slot.engine);
        let history = Arc::clone(&slot.loss_history);
        if let Ok(mut h) = history.lock() {
            h.clear();
        }
        let (cid, rid) = (config_id.to_string(), run_id.to_string());
        let thread_control = Arc::clone(&control);

        let handle = thread::Builder::new()
            .name(format!("train-{config_id}"))
            .spawn(move || {
                run_training(&engine, epochs, thread_control.as_ref(), &mut |event| {
                    if let TrainingEvent::EpochComplete { loss, .. } = &event {
                        if let Ok(mut h) = history.lock() {
                            h.push(*loss);
                        }
                    }
                    bus.publish(TaggedEvent {
                        config_id: cid.clone(),
                        run_id: rid.clone(),
                        event,
                    });
                })
            })?;

        slot.job = Some(TrainingJob {
            run_id: run_id.to_string(),
            control,
            handle: Some(handle),
        });
        Ok(())
    }

    /// Unload a model, stopping its job first.
    pub fn remove(&mut self, config_id: &str) -> bool {
        let Some(slot) = self.slots.remove(config_id) else {
            return false;
        };
        if let Some(job) = &slot.job {
            job.stop();
        }
        if self.active.as_deref() == Some(config_id) {
            self.active = None;
        }
        true
    }

    pub fn stop_all(&self) {
        for slot in self.slots.values() {
            if let Some(job) = &slot.job {
                job.stop();
            }
        }
    }

    pub fn list(&self) -> Vec<ActiveModel> {
        let mut out: Vec<ActiveModel> = self
            .slots
            .iter()
            .map(|(cid, slot)| {
                let (is_ready, total_parameters) = slot.facts();
                let status = match slot.job.as_ref().filter(|j| j.is_running()) {
                    Some(j) if j.is_paused() => SlotStatus::Paused,
                    Some(_) => SlotStatus::Training,
                    None if is_ready => SlotStatus::Ready,
                    None => SlotStatus::Idle,
                };
                ActiveModel {
                    config_id: cid.clone(),
                    is_ready,
                    status,
                    is_active: self.active.as_deref() == Some(cid.as_str()),
                    in_memory: true,
                    total_parameters,
                    last_loss: slot
                        .loss_history
                        .lock()
                        .ok()
                        .and_then(|h| h.last().copied()),
                }
            })
            .collect();
        out.sort_by(|a, b| a.config_id.cmp(&b.config_id));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minillm::config::ModelConfig;

    fn store_with_configs(n: usize) -> (tempfile::TempDir, Store, Vec<String>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut s = Store::open(&dir.path().join("store.json")).expect("open");
        let ids = (0..n)
            .map(|i| {
                s.create_config(&format!("c{i}"), "", ModelConfig::default())
                    .expect("create")
                    .id
            })
            .collect();
        (dir, s, ids)
    }

    #[test]
    fn registry_is_capped() {
        let (_dir, store, ids) = store_with_configs(MAX_MODELS + 1);
        let mut r = Registry::new();
        for id in &ids[..MAX_MODELS] {
            r.get_or_create(id, &store).expect("slot");
        }
        assert!(matches!(
            r.get_or_create(&ids[MAX_MODELS], &store),
            Err(DaemonError::RegistryFull(MAX_MODELS))
        ));
        assert!(r.remove(&ids[0]));
        r.get_or_create(&ids[MAX_MODELS], &store).expect("slot after unload");
    }

    #[test]
    fn last_touched_model_is_active() {
        let (_dir, store, ids) = store_with_configs(2);
        let mut r = Registry::new();
        r.get_or_create(&ids[0], &store).expect("slot");
        r.get_or_create(&ids[1], &store).expect("slot");
        assert_eq!(r.active_id(), Some(ids[1].as_str()));
        assert_eq!(r.resolve(None), Some(ids[1].clone()));
        r.remove(&ids[1]);
        assert_eq!(r.active_id(), None);
    }

    #[test]
    fn a_claimed_start_blocks_a_second_one() {
        let (_dir, store, ids) = store_with_configs(1);
        let mut r = Registry::new();
        r.get_or_create(&ids[0], &store).expect("slot");
        r.begin_start(&ids[0]).expect("first claim");
        assert!(r.is_busy(&ids[0]));
        assert!(matches!(
            r.begin_start(&ids[0]),
            Err(DaemonError::Conflict(_))
        ));
        assert!(matches!(
            r.ensure_idle(&ids[0]),
            Err(DaemonError::TrainingActive)
        ));
        r.cancel_start(&ids[0]);
        assert!(!r.is_busy(&ids[0]));
        r.ensure_idle(&ids[0]).expect("idle again");
        r.begin_start(&ids[0]).expect("claim after release");
    }

    #[test]
    fn listing_does_not_wait_on_a_locked_engine() {
        let (_dir, store, ids) = store_with_configs(1);
        let mut r = Registry::new();
        let engine = r.get_or_create(&ids[0], &store).expect("slot");
        let _held = engine.lock().expect("lock");
        let list = r.list();
        assert_eq!(list.len(), 1);
        assert!(!list[0].is_ready);
        assert_eq!(list[0].status, SlotStatus::Idle);
    }

    #[test]
    fn unknown_config_is_not_found() {
        let (_dir, store, _) = store_with_configs(0);
        let mut r = Registry::new();
        assert!(matches!(
            r.get_or_create("nope", &store),
            Err(DaemonError::NotFound { .. })
        ));
    }

    #[test]
    fn tagged_events_flatten_the_event_type() {
        let ev = TaggedEvent {
            config_id: "c".into(),
            run_id: "r".into(),
            event: TrainingEvent::StatusChange {
                status: minillm::trainer::RunStatus::Running,
                message: None,
            },
        };
        let v = serde_json::to_value(&ev).expect("json");
        assert_eq!(v["type"], "status_change");
        assert_eq!(v["config_id"], "c");
    }
}

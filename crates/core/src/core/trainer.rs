//! Epoch loop over an [`Engine`], with stop/pause control and a stream of
//! progress events.
//!
//! The engine lock is taken once per optimisation step so readers
//! (inspection, a paused job's generate) can interleave with training.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::introspect::WeightSnapshot;
use crate::schedule::Scheduler;

/// Batch progress is reported every this many steps (and on the last one).
pub const BATCH_REPORT_EVERY: usize = 10;
/// Epochs between weight snapshots, besides the first and the last.
pub const SNAPSHOT_EVERY: usize = 5;
const PAUSE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrainingEvent {
    StatusChange {
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    BatchComplete {
        epoch: usize,
        batch: usize,
        total_batches: usize,
        batch_loss: f32,
    },
    EpochComplete {
        epoch: usize,
        total_epochs: usize,
        loss: f32,
        loss_history: Vec<f32>,
        elapsed_seconds: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        weight_snapshot: Option<Vec<WeightSnapshot>>,
    },
}

/// Stop and pause requests, checked between steps.
pub trait TrainingControl: Send + Sync {
    fn should_stop(&self) -> bool;
    /// Block while paused. Must return once a stop is requested.
    fn wait_if_paused(&self);
}

#[derive(Debug, Default)]
pub struct AtomicControl {
    stop: AtomicBool,
    paused: AtomicBool,
}

impl AtomicControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also releases a pause so the loop can observe the stop.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

impl TrainingControl for AtomicControl {
    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn wait_if_paused(&self) {
        while self.paused.load(Ordering::SeqCst) && !self.should_stop() {
            thread::sleep(PAUSE_POLL);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOutcome {
    pub status: RunStatus,
    pub epochs_completed: usize,
    pub loss_history: Vec<f32>,
    pub message: Option<String>,
}

impl TrainingOutcome {
    pub fn final_loss(&self) -> Option<f32> {
        self.loss_history.last().copied()
    }
}

pub fn lock_engine(engine: &Mutex<Engine>) -> MutexGuard<'_, Engine> {
    engine.lock().unwrap_or_else(PoisonError::into_inner)
}

fn wants_snapshot(epoch: usize, epochs: usize) -> bool {
    epoch == 0 || (epoch + 1) % SNAPSHOT_EVERY == 0 || epoch + 1 == epochs
}

fn finish(
    status: RunStatus,
    message: Option<String>,
    history: Vec<f32>,
    sink: &mut dyn FnMut(TrainingEvent),
) -> TrainingOutcome {
    sink(TrainingEvent::StatusChange {
        status,
        message: message.clone(),
    });
    TrainingOutcome {
        status,
        epochs_completed: history.len(),
        loss_history: history,
        message,
    }
}

/// Run `epochs` epochs of `num_batches` steps each. Every terminal path
/// emits exactly one closing `StatusChange`.
pub fn run_training(
    engine: &Mutex<Engine>,
    epochs: usize,
    control: &dyn TrainingControl,
    sink: &mut dyn FnMut(TrainingEvent),
) -> TrainingOutcome {
    let mut history = Vec::with_capacity(epochs);

    let (config, num_batches) = {
        let e = lock_engine(engine);
        match (e.config().cloned(), e.num_batches()) {
            (Some(c), Ok(n)) => (c, n),
            (_, Err(err)) => {
                return finish(RunStatus::Failed, Some(err.to_string()), history, sink);
            }
            (None, Ok(_)) => {
                let message = Some("model is not initialized".to_string());
                return finish(RunStatus::Failed, message, history, sink);
            }
        }
    };

    sink(TrainingEvent::StatusChange {
        status: RunStatus::Running,
        message: None,
    });
    info!(epochs, num_batches, "training started");

    let mut scheduler =
        Scheduler::new(config.lr_schedule, config.learning_rate, epochs * num_batches);
    let started = Instant::now();

    for epoch in 0..epochs {
        let mut total = 0.0f32;
        for batch in 0..num_batches {
            control.wait_if_paused();
            if control.should_stop() {
                info!(epoch = epoch + 1, "training stopped");
                return finish(RunStatus::Stopped, None, history, sink);
            }

            let lr = scheduler.next_lr();
            let loss = match lock_engine(engine).train_step(lr) {
                Ok(l) => l,
                Err(err) => {
                    warn!(error = %err, "training step failed");
                    return finish(RunStatus::Failed, Some(err.to_string()), history, sink);
                }
            };
            if !loss.is_finite() {
                warn!(epoch = epoch + 1, batch = batch + 1, "loss diverged");
                let message = Some(format!("loss diverged ({loss})"));
                return finish(RunStatus::Failed, message, history, sink);
            }
            total += loss;

            if batch % BATCH_REPORT_EVERY == 0 || batch + 1 == num_batches {
                sink(TrainingEvent::BatchComplete {
                    epoch: epoch + 1,
                    batch: batch + 1,
                    total_batches: num_batches,
                    batch_loss: loss,
                });
            }
        }

        let avg = total / num_batches.max(1) as f32;
        history.push(avg);
        let weight_snapshot = if wants_snapshot(epoch, epochs) {
            lock_engine(engine).weight_snapshot().ok()
        } else {
            None
        };
        if config.log_every > 0 && (epoch + 1) % config.log_every == 0 {
            info!(epoch = epoch + 1, loss = avg, "epoch complete");
        } else {
            debug!(epoch = epoch + 1, loss = avg, "epoch complete");
        }
        sink(TrainingEvent::EpochComplete {
            epoch: epoch + 1,
            total_epochs: epochs,
            loss: avg,
            loss_history: history.clone(),
            elapsed_seconds: started.elapsed().as_secs_f64(),
            weight_snapshot,
        });
    }

    info!(elapsed = ?started.elapsed(), "training completed");
    finish(RunStatus::Completed, None, history, sink)
}

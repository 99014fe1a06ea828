//! Folds training events into the persisted run records and auto-saves
//! weights when a run completes.

use chrono::Utc;
use minillm::trainer::{RunStatus, TrainingEvent};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::handlers::SharedState;
use crate::registry::TaggedEvent;
use crate::state::{run_duration, write_weights};

pub async fn run(state: SharedState, mut events: UnboundedReceiver<TaggedEvent>) {
    while let Some(ev) = events.recv().await {
        record(&state, ev).await;
    }
    debug!("event recorder finished");
}

async fn record(state: &SharedState, ev: TaggedEvent) {
    let TaggedEvent {
        config_id,
        run_id,
        event,
    } = ev;
    match event {
        TrainingEvent::BatchComplete { .. } => {}
        TrainingEvent::EpochComplete {
            epoch, loss_history, ..
        } => {
            let mut s = state.write().await;
            if let Some(run) = s.store.run_mut(&run_id) {
                run.current_epoch = epoch;
                run.loss_history = loss_history;
            }
            s.persist();
        }
        TrainingEvent::StatusChange { status, message } => {
            // Weights are written before the store lock is taken.
            let written = if status == RunStatus::Completed {
                match write_weights(state, &config_id).await {
                    Ok(w) => Some(w),
                    Err(e) => {
                        warn!(config_id = %config_id, error = %e, "auto-save failed");
                        None
                    }
                }
            } else {
                None
            };

            let mut s = state.write().await;
            let Some(run) = s.store.run_mut(&run_id) else {
                warn!(run = %run_id, "event for unknown run");
                if let Some(w) = written {
                    w.discard();
                }
                return;
            };
            // a pause can land before the job's opening event is recorded
            if !(status == RunStatus::Running && run.status == RunStatus::Paused) {
                run.status = status;
            }
            match status {
                RunStatus::Running if run.started_at.is_none() => {
                    run.started_at = Some(Utc::now());
                }
                st if st.is_terminal() => {
                    run.completed_at = Some(Utc::now());
                    if let Some(m) = &message {
                        run.error_message = m.clone();
                    }
                }
                _ => {}
            }
            let duration = run_duration(run.started_at, run.completed_at);

            if let Some(written) = written {
                match s.record_model(written, None, String::new(), true, duration) {
                    Ok(model) => {
                        if let Some(run) = s.store.run_mut(&run_id) {
                            run.model_id = Some(model.id);
                        }
                    }
                    Err(e) => warn!(config_id = %config_id, error = %e, "auto-save failed"),
                }
            }
            if status.is_terminal() {
                info!(config_id = %config_id, run = %run_id, ?status, "training finished");
            }
            s.persist();
        }
    }
}

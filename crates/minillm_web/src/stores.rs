//! Client-side state containers.
//!
//! Each store is plain data plus a reducer over a typed action enum. Views
//! hold a [`Store`] and dispatch actions; nothing here is global.

use minillm::introspect::WeightSnapshot;
use minillm::trainer::{RunStatus, TrainingEvent};
use serde::{Deserialize, Serialize};

pub trait Reducer {
    type Action;
    fn reduce(&mut self, action: Self::Action);
}

/// Owns a reducer's state and counts dispatched actions so views can tell
/// cheaply whether anything changed since they last rendered.
#[derive(Debug, Clone, Default)]
pub struct Store<R> {
    state: R,
    version: u64,
}

impl<R: Reducer> Store<R> {
    pub fn new(state: R) -> Self {
        Self { state, version: 0 }
    }

    pub fn dispatch(&mut self, action: R::Action) {
        self.state.reduce(action);
        self.version += 1;
    }

    pub fn state(&self) -> &R {
        &self.state
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

// ---------------------------------------------------------------------------
// Chat

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    #[serde(default)]
    pub first_message: String,
    #[serde(default)]
    pub message_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatAction {
    SessionsLoaded(Vec<SessionInfo>),
    /// Switch to an existing session; its messages arrive separately.
    SelectSession(String),
    NewSession,
    MessagesLoaded {
        session_id: String,
        messages: Vec<ChatMessage>,
    },
    /// The user's message is shown before the reply arrives.
    SendStarted { content: String },
    ReplyReceived(ChatMessage),
    SessionDeleted(String),
    RequestFailed(String),
    DismissError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatState {
    pub sessions: Vec<SessionInfo>,
    pub current_session: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub pending: bool,
    pub error: Option<String>,
}

impl Reducer for ChatState {
    type Action = ChatAction;

    fn reduce(&mut self, action: ChatAction) {
        match action {
            ChatAction::SessionsLoaded(sessions) => self.sessions = sessions,
            ChatAction::SelectSession(id) => {
                if self.current_session.as_deref() != Some(id.as_str()) {
                    self.messages.clear();
                }
                self.current_session = Some(id);
                self.pending = false;
            }
            ChatAction::NewSession => {
                self.current_session = None;
                self.messages.clear();
                self.pending = false;
            }
            ChatAction::MessagesLoaded {
                session_id,
                messages,
            } => {
                // A slow response for a session the user already left.
                if self.current_session.as_deref() == Some(session_id.as_str()) {
                    self.messages = messages;
                }
            }
            ChatAction::SendStarted { content } => {
                self.messages.push(ChatMessage {
                    id: String::new(),
                    session_id: self.current_session.clone().unwrap_or_default(),
                    role: Role::User,
                    content,
                });
                self.pending = true;
                self.error = None;
            }
            ChatAction::ReplyReceived(msg) => {
                if self.current_session.is_none() {
                    for m in &mut self.messages {
                        m.session_id.clone_from(&msg.session_id);
                    }
                    self.current_session = Some(msg.session_id.clone());
                }
                if self.current_session.as_deref() == Some(msg.session_id.as_str()) {
                    self.messages.push(msg);
                }
                self.pending = false;
            }
            ChatAction::SessionDeleted(id) => {
                self.sessions.retain(|s| s.session_id != id);
                if self.current_session.as_deref() == Some(id.as_str()) {
                    self.current_session = None;
                    self.messages.clear();
                }
            }
            ChatAction::RequestFailed(message) => {
                self.pending = false;
                self.error = Some(message);
            }
            ChatAction::DismissError => self.error = None,
        }
    }
}

pub type ChatStore = Store<ChatState>;

// ---------------------------------------------------------------------------
// Training

/// A line of a `Subscribe` stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamedEvent {
    pub config_id: String,
    pub run_id: String,
    #[serde(flatten)]
    pub event: TrainingEvent,
}

impl StreamedEvent {
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line).ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrainingAction {
    /// Follow a config's runs; clears what was shown before.
    Watch { config_id: String },
    Started {
        run_id: String,
        total_epochs: usize,
    },
    Event(StreamedEvent),
    /// Polled status, used on page load before any event arrives.
    StatusLoaded {
        status: RunStatus,
        loss_history: Vec<f32>,
    },
    RequestFailed(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingState {
    pub config_id: Option<String>,
    pub run_id: Option<String>,
    pub status: RunStatus,
    pub message: Option<String>,
    pub epoch: usize,
    pub total_epochs: usize,
    pub batch: usize,
    pub total_batches: usize,
    pub batch_loss: Option<f32>,
    pub loss_history: Vec<f32>,
    pub elapsed_seconds: f64,
    /// Latest weight snapshot; each new one replaces it.
    pub weight_snapshot: Option<Vec<WeightSnapshot>>,
    pub error: Option<String>,
}

impl TrainingState {
    pub fn is_active(&self) -> bool {
        matches!(self.status, RunStatus::Running | RunStatus::Paused)
    }

    /// Epoch progress in `[0, 1]`.
    pub fn progress(&self) -> f32 {
        if self.total_epochs == 0 {
            return 0.0;
        }
        (self.epoch as f32 / self.total_epochs as f32).min(1.0)
    }

    fn accepts(&self, ev: &StreamedEvent) -> bool {
        if self.config_id.as_deref().is_some_and(|c| c != ev.config_id) {
            return false;
        }
        self.run_id.as_deref().map_or(true, |r| r == ev.run_id)
    }
}

impl Reducer for TrainingState {
    type Action = TrainingAction;

    fn reduce(&mut self, action: TrainingAction) {
        match action {
            TrainingAction::Watch { config_id } => {
                *self = TrainingState {
                    config_id: Some(config_id),
                    ..TrainingState::default()
                };
            }
            TrainingAction::Started {
                run_id,
                total_epochs,
            } => {
                let config_id = self.config_id.take();
                *self = TrainingState {
                    config_id,
                    run_id: Some(run_id),
                    status: RunStatus::Pending,
                    total_epochs,
                    ..TrainingState::default()
                };
            }
            TrainingAction::Event(ev) => {
                if !self.accepts(&ev) {
                    return;
                }
                if self.run_id.is_none() {
                    self.run_id = Some(ev.run_id.clone());
                }
                match ev.event {
                    TrainingEvent::StatusChange { status, message } => {
                        self.status = status;
                        self.message = message;
                    }
                    TrainingEvent::BatchComplete {
                        epoch,
                        batch,
                        total_batches,
                        batch_loss,
                    } => {
                        self.batch = batch;
                        self.total_batches = total_batches;
                        self.batch_loss = Some(batch_loss);
                        // the previous epoch is complete once a later one reports
                        self.epoch = self.epoch.max(epoch.saturating_sub(1));
                    }
                    TrainingEvent::EpochComplete {
                        epoch,
                        total_epochs,
                        loss_history,
                        elapsed_seconds,
                        weight_snapshot,
                        ..
                    } => {
                        self.epoch = epoch;
                        self.total_epochs = total_epochs;
                        self.loss_history = loss_history;
                        self.elapsed_seconds = elapsed_seconds;
                        if weight_snapshot.is_some() {
                            self.weight_snapshot = weight_snapshot;
                        }
                    }
                }
            }
            TrainingAction::StatusLoaded {
                status,
                loss_history,
            } => {
                self.status = status;
                self.epoch = loss_history.len();
                self.loss_history = loss_history;
            }
            TrainingAction::RequestFailed(message) => self.error = Some(message),
        }
    }
}

pub type TrainingStore = Store<TrainingState>;

#[cfg(test)]
mod tests {
    use super::*;
    use minillm::viz::Matrix;

    fn msg(session: &str, role: Role, content: &str) -> ChatMessage {
        ChatMessage {
            id: format!("{session}-{content}"),
            session_id: session.into(),
            role,
            content: content.into(),
        }
    }

    fn snapshot(v: f32) -> Vec<WeightSnapshot> {
        vec![WeightSnapshot {
            module: "embedding".into(),
            param: "W".into(),
            matrix: Matrix::new(vec![vec![v, -v]]).expect("matrix"),
        }]
    }

    fn event(run: &str, event: TrainingEvent) -> TrainingAction {
        TrainingAction::Event(StreamedEvent {
            config_id: "cfg".into(),
            run_id: run.into(),
            event,
        })
    }

    fn epoch(n: usize, snap: Option<Vec<WeightSnapshot>>) -> TrainingEvent {
        TrainingEvent::EpochComplete {
            epoch: n,
            total_epochs: 3,
            loss: 1.0 / n as f32,
            loss_history: (1..=n).map(|i| 1.0 / i as f32).collect(),
            elapsed_seconds: n as f64,
            weight_snapshot: snap,
        }
    }

    #[test]
    fn first_reply_adopts_the_new_session() {
        let mut chat = ChatStore::default();
        chat.dispatch(ChatAction::SendStarted {
            content: "hi".into(),
        });
        assert!(chat.state().pending);
        assert_eq!(chat.state().messages.len(), 1);

        chat.dispatch(ChatAction::ReplyReceived(msg("s1", Role::Assistant, "hello")));
        let s = chat.state();
        assert_eq!(s.current_session.as_deref(), Some("s1"));
        assert!(!s.pending);
        assert_eq!(s.messages.len(), 2);
        assert!(s.messages.iter().all(|m| m.session_id == "s1"));
        assert_eq!(chat.version(), 2);
    }

    #[test]
    fn stale_messages_for_another_session_are_ignored() {
        let mut chat = ChatStore::default();
        chat.dispatch(ChatAction::SelectSession("a".into()));
        chat.dispatch(ChatAction::SelectSession("b".into()));
        chat.dispatch(ChatAction::MessagesLoaded {
            session_id: "a".into(),
            messages: vec![msg("a", Role::User, "old")],
        });
        assert!(chat.state().messages.is_empty());

        chat.dispatch(ChatAction::MessagesLoaded {
            session_id: "b".into(),
            messages: vec![msg("b", Role::User, "new")],
        });
        assert_eq!(chat.state().messages[0].content, "new");
    }

    #[test]
    fn deleting_the_open_session_clears_it() {
        let mut chat = ChatStore::default();
        chat.dispatch(ChatAction::SessionsLoaded(vec![SessionInfo {
            session_id: "a".into(),
            first_message: "x".into(),
            message_count: 2,
        }]));
        chat.dispatch(ChatAction::SelectSession("a".into()));
        chat.dispatch(ChatAction::SessionDeleted("a".into()));
        let s = chat.state();
        assert!(s.sessions.is_empty());
        assert!(s.current_session.is_none());
    }

    #[test]
    fn failures_stop_pending_and_can_be_dismissed() {
        let mut chat = ChatStore::default();
        chat.dispatch(ChatAction::SendStarted {
            content: "hi".into(),
        });
        chat.dispatch(ChatAction::RequestFailed("training in progress".into()));
        assert!(!chat.state().pending);
        assert!(chat.state().error.is_some());
        chat.dispatch(ChatAction::DismissError);
        assert!(chat.state().error.is_none());
    }

    #[test]
    fn training_events_fold_into_progress() {
        let mut t = TrainingStore::default();
        t.dispatch(TrainingAction::Watch {
            config_id: "cfg".into(),
        });
        t.dispatch(TrainingAction::Started {
            run_id: "r1".into(),
            total_epochs: 3,
        });
        t.dispatch(event(
            "r1",
            TrainingEvent::StatusChange {
                status: RunStatus::Running,
                message: None,
            },
        ));
        assert!(t.state().is_active());

        t.dispatch(event("r1", epoch(1, Some(snapshot(1.0)))));
        t.dispatch(event(
            "r1",
            TrainingEvent::BatchComplete {
                epoch: 2,
                batch: 1,
                total_batches: 4,
                batch_loss: 0.7,
            },
        ));
        t.dispatch(event("r1", epoch(2, None)));

        let s = t.state();
        assert_eq!(s.epoch, 2);
        assert_eq!(s.loss_history.len(), 2);
        assert_eq!(s.batch_loss, Some(0.7));
        assert!((s.progress() - 2.0 / 3.0).abs() < 1e-6);
        // epochs without a snapshot keep the last one
        assert_eq!(s.weight_snapshot, Some(snapshot(1.0)));
    }

    #[test]
    fn new_snapshot_replaces_the_old_one_wholesale() {
        let mut t = TrainingStore::default();
        t.dispatch(event("r1", epoch(1, Some(snapshot(1.0)))));
        t.dispatch(event("r1", epoch(2, Some(snapshot(2.0)))));
        assert_eq!(t.state().weight_snapshot, Some(snapshot(2.0)));
    }

    #[test]
    fn events_for_other_runs_are_dropped() {
        let mut t = TrainingStore::default();
        t.dispatch(TrainingAction::Watch {
            config_id: "cfg".into(),
        });
        t.dispatch(TrainingAction::Started {
            run_id: "r2".into(),
            total_epochs: 3,
        });
        t.dispatch(event("r1", epoch(1, None)));
        t.dispatch(TrainingAction::Event(StreamedEvent {
            config_id: "other".into(),
            run_id: "r2".into(),
            event: epoch(1, None),
        }));
        assert_eq!(t.state().epoch, 0);
        assert_eq!(t.state().config_id.as_deref(), Some("cfg"));
    }

    #[test]
    fn stream_lines_parse_into_events() {
        let line = r#"{"config_id":"cfg","run_id":"r1","type":"status_change","status":"failed","message":"loss diverged (NaN)"}"#;
        let ev = StreamedEvent::parse(line).expect("parse");
        assert!(matches!(
            ev.event,
            TrainingEvent::StatusChange {
                status: RunStatus::Failed,
                ..
            }
        ));
        assert!(StreamedEvent::parse(r#"{"type":"Subscribed"}"#).is_none());

        let mut t = TrainingStore::default();
        t.dispatch(TrainingAction::Event(ev));
        assert_eq!(t.state().status, RunStatus::Failed);
        assert_eq!(t.state().message.as_deref(), Some("loss diverged (NaN)"));
    }
}

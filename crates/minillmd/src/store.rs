//! Service records persisted as a single JSON document.
//!
//! Every mutating method leaves the in-memory state updated; callers decide
//! when to `save()` (the daemon saves after each mutating request).

use std::collections::HashSet;
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use minillm::config::{presets, ModelConfig};
use minillm::tokenizer::VocabJson;
use minillm::trainer::RunStatus;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{DaemonError, Result};
use crate::files::FileType;

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub config: ModelConfig,
    #[serde(default)]
    pub is_preset: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    pub id: String,
    pub name: String,
    pub original_filename: String,
    pub file_type: FileType,
    pub file_size: usize,
    pub extracted_text: String,
    pub char_count: usize,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub config_id: String,
    pub data_id: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub config_id: String,
    #[serde(default)]
    pub model_id: Option<String>,
    pub status: RunStatus,
    pub current_epoch: usize,
    pub total_epochs: usize,
    #[serde(default)]
    pub loss_history: Vec<f32>,
    #[serde(default)]
    pub error_message: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedModelRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub config_id: String,
    pub weights_path: PathBuf,
    pub total_parameters: usize,
    pub final_loss: Option<f32>,
    pub epochs_trained: usize,
    pub training_duration_seconds: Option<f64>,
    pub vocab: VocabJson,
    #[serde(default)]
    pub auto_save: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessageRecord {
    pub id: String,
    pub session_id: String,
    pub config_id: Option<String>,
    pub role: Role,
    pub content: String,
    pub temperature_used: Option<f32>,
    pub max_tokens_used: Option<usize>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub config_id: Option<String>,
    pub first_message: String,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusInfo {
    pub text: String,
    pub total_chars: usize,
    pub unique_chars: usize,
    pub file_count: usize,
}

/// Characters of the corpus returned in a preview.
pub const CORPUS_PREVIEW_CHARS: usize = 10_000;
const SESSION_PREVIEW_CHARS: usize = 100;
pub const SAMPLE_DATA_NAME: &str = "Sample data";
const SAMPLE_TEXT: &str = "\
The cat eats the fish. The dog eats the meat. \
The cat sleeps on the rug. The dog sleeps in the garden. \
The cat likes milk. The dog likes bones. \
The cat is small. The dog is big. \
The cat plays with the ball. The dog plays in the park. \
The cat purrs softly. The dog wags its tail. \
The cat climbs the tree. The dog runs in the field. \
The cat watches the birds. The dog guards the house.";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    configs: Vec<ConfigRecord>,
    #[serde(default)]
    data: Vec<DataRecord>,
    #[serde(default)]
    links: Vec<LinkRecord>,
    #[serde(default)]
    runs: Vec<RunRecord>,
    #[serde(default)]
    models: Vec<SavedModelRecord>,
    #[serde(default)]
    messages: Vec<ChatMessageRecord>,
}

#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    data: StoreData,
}

impl Store {
    /// Open `path`, starting empty when the file does not exist yet.
    pub fn open(path: &Path) -> Result<Self> {
        let data = if path.exists() {
            let r = BufReader::new(fs::File::open(path)?);
            serde_json::from_reader(r)?
        } else {
            StoreData::default()
        };
        Ok(Self {
            path: path.to_path_buf(),
            data,
        })
    }

    /// Write to a sibling temp file, then rename over the store.
    pub fn save(&self) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut w = BufWriter::new(fs::File::create(&tmp)?);
            serde_json::to_writer_pretty(&mut w, &self.data)?;
            w.flush()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Create each built-in preset (config, corpus and an active link)
    /// unless a config with that name already exists.
    pub fn seed_presets(&mut self) -> usize {
        let mut created = 0;
        for p in presets() {
            if self.data.configs.iter().any(|c| c.name == p.name) {
                continue;
            }
            let now = Utc::now();
            let config_id = new_id();
            self.data.configs.push(ConfigRecord {
                id: config_id.clone(),
                name: p.name.clone(),
                description: p.description.clone(),
                config: p.config.clone(),
                is_preset: true,
                created_at: now,
                updated_at: now,
            });
            let data = self.add_data(
                &p.data_name,
                &format!("{}.txt", p.data_name),
                FileType::Txt,
                p.corpus.len(),
                p.corpus.clone(),
            );
            self.data.links.push(LinkRecord {
                config_id,
                data_id: data.id,
                is_active: true,
            });
            created += 1;
        }
        if created > 0 {
            info!(created, "seeded presets");
        }
        created
    }

    // -----------------------------------------------------------------
    // Configs

    /// Newest first.
    pub fn configs(&self) -> Vec<ConfigRecord> {
        let mut out = self.data.configs.clone();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out
    }

    pub fn presets(&self) -> Vec<ConfigRecord> {
        self.configs().into_iter().filter(|c| c.is_preset).collect()
    }

    pub fn config(&self, id: &str) -> Result<&ConfigRecord> {
        self.data
            .configs
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| DaemonError::not_found("config", id))
    }

    fn config_mut(&mut self, id: &str) -> Result<&mut ConfigRecord> {
        self.data
            .configs
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| DaemonError::not_found("config", id))
    }

    fn check_name_free(&self, name: &str, except: Option<&str>) -> Result<()> {
        let taken = self
            .data
            .configs
            .iter()
            .any(|c| c.name == name && Some(c.id.as_str()) != except);
        if taken {
            return Err(DaemonError::Conflict(format!(
                "a config named {name:?} already exists"
            )));
        }
        Ok(())
    }

    pub fn create_config(
        &mut self,
        name: &str,
        description: &str,
        config: ModelConfig,
    ) -> Result<ConfigRecord> {
        if name.trim().is_empty() {
            return Err(DaemonError::BadRequest("config name is required".into()));
        }
        self.check_name_free(name, None)?;
        let now = Utc::now();
        let rec = ConfigRecord {
            id: new_id(),
            name: name.to_string(),
            description: description.to_string(),
            config,
            is_preset: false,
            created_at: now,
            updated_at: now,
        };
        self.data.configs.push(rec.clone());
        Ok(rec)
    }

    pub fn update_config(
        &mut self,
        id: &str,
        name: Option<String>,
        description: Option<String>,
        config: Option<ModelConfig>,
    ) -> Result<ConfigRecord> {
        if let Some(n) = &name {
            self.check_name_free(n, Some(id))?;
        }
        let rec = self.config_mut(id)?;
        if let Some(n) = name {
            rec.name = n;
        }
        if let Some(d) = description {
            rec.description = d;
        }
        if let Some(c) = config {
            // vocab_size is owned by the tokenizer, not the client
            let vocab = rec.config.vocab_size;
            rec.config = c;
            rec.config.vocab_size = vocab;
        }
        rec.updated_at = Utc::now();
        Ok(rec.clone())
    }

    pub fn set_vocab_size(&mut self, id: &str, vocab_size: usize) -> Result<()> {
        let rec = self.config_mut(id)?;
        rec.config.vocab_size = vocab_size;
        rec.updated_at = Utc::now();
        Ok(())
    }

    /// Removes the config and everything hanging off it. Returns the weight
    /// files that should be deleted.
    pub fn delete_config(&mut self, id: &str) -> Result<Vec<PathBuf>> {
        self.config(id)?;
        self.data.configs.retain(|c| c.id != id);
        self.data.links.retain(|l| l.config_id != id);
        self.data.runs.retain(|r| r.config_id != id);
        self.data
            .messages
            .retain(|m| m.config_id.as_deref() != Some(id));
        let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.data.models)
            .into_iter()
            .partition(|m| m.config_id == id);
        self.data.models = kept;
        Ok(gone.into_iter().map(|m| m.weights_path).collect())
    }

    /// Copy named `"<name> (copy)"`, never a preset.
    pub fn duplicate_config(&mut self, id: &str) -> Result<ConfigRecord> {
        let src = self.config(id)?.clone();
        let mut name = format!("{} (copy)", src.name);
        while self.check_name_free(&name, None).is_err() {
            name.push_str(" (copy)");
        }
        let now = Utc::now();
        let rec = ConfigRecord {
            id: new_id(),
            name,
            is_preset: false,
            created_at: now,
            updated_at: now,
            ..src
        };
        self.data.configs.push(rec.clone());
        Ok(rec)
    }

    // -----------------------------------------------------------------
    // Training data

    pub fn data_list(&self) -> Vec<DataRecord> {
        let mut out = self.data.data.clone();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    pub fn data(&self, id: &str) -> Result<&DataRecord> {
        self.data
            .data
            .iter()
            .find(|d| d.id == id)
            .ok_or_else(|| DaemonError::not_found("training data", id))
    }

    pub fn add_data(
        &mut self,
        name: &str,
        original_filename: &str,
        file_type: FileType,
        file_size: usize,
        text: String,
    ) -> DataRecord {
        let rec = DataRecord {
            id: new_id(),
            name: name.to_string(),
            original_filename: original_filename.to_string(),
            file_type,
            file_size,
            char_count: text.chars().count(),
            extracted_text: text,
            is_active: true,
            created_at: Utc::now(),
        };
        self.data.data.push(rec.clone());
        rec
    }

    /// The built-in sample text, created once.
    pub fn sample_data(&mut self) -> (DataRecord, bool) {
        if let Some(d) = self.data.data.iter().find(|d| d.name == SAMPLE_DATA_NAME) {
            return (d.clone(), false);
        }
        let rec = self.add_data(
            SAMPLE_DATA_NAME,
            "sample.txt",
            FileType::Txt,
            SAMPLE_TEXT.len(),
            SAMPLE_TEXT.to_string(),
        );
        (rec, true)
    }

    pub fn delete_data(&mut self, id: &str) -> Result<()> {
        self.data(id)?;
        self.data.data.retain(|d| d.id != id);
        self.data.links.retain(|l| l.data_id != id);
        Ok(())
    }

    pub fn toggle_data(&mut self, id: &str) -> Result<DataRecord> {
        let rec = self
            .data
            .data
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| DaemonError::not_found("training data", id))?;
        rec.is_active = !rec.is_active;
        Ok(rec.clone())
    }

    // -----------------------------------------------------------------
    // Config <-> data links

    /// Idempotent; an existing link keeps its activation.
    pub fn link(&mut self, config_id: &str, data_id: &str) -> Result<LinkRecord> {
        self.config(config_id)?;
        self.data(data_id)?;
        if let Some(l) = self
            .data
            .links
            .iter()
            .find(|l| l.config_id == config_id && l.data_id == data_id)
        {
            return Ok(l.clone());
        }
        let l = LinkRecord {
            config_id: config_id.to_string(),
            data_id: data_id.to_string(),
            is_active: true,
        };
        self.data.links.push(l.clone());
        Ok(l)
    }

    pub fn unlink(&mut self, config_id: &str, data_id: &str) -> Result<()> {
        self.config(config_id)?;
        self.data(data_id)?;
        self.data
            .links
            .retain(|l| !(l.config_id == config_id && l.data_id == data_id));
        Ok(())
    }

    pub fn toggle_link(&mut self, config_id: &str, data_id: &str) -> Result<LinkRecord> {
        self.config(config_id)?;
        self.data(data_id)?;
        let l = self
            .data
            .links
            .iter_mut()
            .find(|l| l.config_id == config_id && l.data_id == data_id)
            .ok_or_else(|| DaemonError::not_found("link", &format!("{config_id}/{data_id}")))?;
        l.is_active = !l.is_active;
        Ok(l.clone())
    }

    pub fn links_for(&self, config_id: &str) -> Vec<LinkRecord> {
        self.data
            .links
            .iter()
            .filter(|l| l.config_id == config_id)
            .cloned()
            .collect()
    }

    fn corpus_sources(&self, config_id: Option<&str>, active_only: bool) -> Vec<&DataRecord> {
        match config_id {
            Some(cid) => {
                let ids: HashSet<&str> = self
                    .data
                    .links
                    .iter()
                    .filter(|l| l.config_id == cid && (l.is_active || !active_only))
                    .map(|l| l.data_id.as_str())
                    .collect();
                self.data
                    .data
                    .iter()
                    .filter(|d| ids.contains(d.id.as_str()))
                    .collect()
            }
            None => self.data.data.iter().filter(|d| d.is_active).collect(),
        }
    }

    /// Linked texts joined by newlines. Without a config, every globally
    /// active file is used.
    pub fn corpus(&self, config_id: Option<&str>, active_only: bool) -> String {
        self.corpus_sources(config_id, active_only)
            .iter()
            .map(|d| d.extracted_text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn corpus_info(&self, config_id: Option<&str>) -> CorpusInfo {
        let sources = self.corpus_sources(config_id, true);
        let corpus = sources
            .iter()
            .map(|d| d.extracted_text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let unique: HashSet<char> = corpus.chars().collect();
        CorpusInfo {
            text: corpus.chars().take(CORPUS_PREVIEW_CHARS).collect(),
            total_chars: corpus.chars().count(),
            unique_chars: unique.len(),
            file_count: sources.len(),
        }
    }

    // -----------------------------------------------------------------
    // Training runs

    /// Record a pending run under an id the caller already handed to the
    /// training job.
    pub fn create_run(&mut self, run_id: &str, config_id: &str, total_epochs: usize) -> RunRecord {
        let run = RunRecord {
            id: run_id.to_string(),
            config_id: config_id.to_string(),
            model_id: None,
            status: RunStatus::Pending,
            current_epoch: 0,
            total_epochs,
            loss_history: Vec::new(),
            error_message: String::new(),
            started_at: None,
            completed_at: None,
        };
        self.data.runs.push(run.clone());
        run
    }

    pub fn run_mut(&mut self, id: &str) -> Option<&mut RunRecord> {
        self.data.runs.iter_mut().find(|r| r.id == id)
    }

    /// Runs that claim to be live but whose id is not in `live`.
    pub fn fail_orphaned_runs(&mut self, live: &HashSet<String>) -> usize {
        let mut n = 0;
        for r in &mut self.data.runs {
            let claims_live = matches!(r.status, RunStatus::Running | RunStatus::Pending);
            if claims_live && !live.contains(&r.id) {
                r.status = RunStatus::Failed;
                r.error_message = "interrupted (daemon restarted)".into();
                r.completed_at = Some(Utc::now());
                n += 1;
            }
        }
        if n > 0 {
            warn!(count = n, "marked orphaned runs as failed");
        }
        n
    }

    /// Newest first.
    pub fn runs(&self, config_id: Option<&str>) -> Vec<RunRecord> {
        let mut out: Vec<RunRecord> = self
            .data
            .runs
            .iter()
            .filter(|r| config_id.map_or(true, |c| r.config_id == c))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out
    }

    // -----------------------------------------------------------------
    // Saved models

    pub fn models(&self) -> Vec<SavedModelRecord> {
        let mut out = self.data.models.clone();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    pub fn model(&self, id: &str) -> Result<&SavedModelRecord> {
        self.data
            .models
            .iter()
            .find(|m| m.id == id)
            .ok_or_else(|| DaemonError::not_found("model", id))
    }

    pub fn latest_model(&self, config_id: &str) -> Option<&SavedModelRecord> {
        self.data
            .models
            .iter()
            .filter(|m| m.config_id == config_id)
            .max_by_key(|m| m.created_at)
    }

    pub fn add_model(&mut self, rec: SavedModelRecord) {
        self.data.models.push(rec);
    }

    /// Remove a record, returning its weight file path.
    pub fn delete_model(&mut self, id: &str) -> Result<PathBuf> {
        let path = self.model(id)?.weights_path.clone();
        self.data.models.retain(|m| m.id != id);
        for r in &mut self.data.runs {
            if r.model_id.as_deref() == Some(id) {
                r.model_id = None;
            }
        }
        Ok(path)
    }

    /// Drop the previous auto-save for `config_id`, returning its file.
    pub fn take_auto_save(&mut self, config_id: &str) -> Option<PathBuf> {
        let id = self
            .data
            .models
            .iter()
            .find(|m| m.auto_save && m.config_id == config_id)?
            .id
            .clone();
        self.delete_model(&id).ok()
    }

    // -----------------------------------------------------------------
    // Chat

    pub fn add_message(
        &mut self,
        session_id: &str,
        config_id: Option<&str>,
        role: Role,
        content: &str,
        params: Option<(f32, usize)>,
    ) -> ChatMessageRecord {
        let msg = ChatMessageRecord {
            id: new_id(),
            session_id: session_id.to_string(),
            config_id: config_id.map(str::to_string),
            role,
            content: content.to_string(),
            temperature_used: params.map(|p| p.0),
            max_tokens_used: params.map(|p| p.1),
            created_at: Utc::now(),
        };
        self.data.messages.push(msg.clone());
        msg
    }

    /// Oldest first.
    pub fn session_messages(&self, session_id: &str) -> Vec<ChatMessageRecord> {
        let mut out: Vec<ChatMessageRecord> = self
            .data
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub fn sessions(&self, config_id: Option<&str>) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = Vec::new();
        let mut msgs: Vec<&ChatMessageRecord> = self
            .data
            .messages
            .iter()
            .filter(|m| config_id.map_or(true, |c| m.config_id.as_deref() == Some(c)))
            .collect();
        msgs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        for m in msgs {
            match out.iter_mut().find(|s| s.session_id == m.session_id) {
                Some(s) => s.message_count += 1,
                None => out.push(SessionSummary {
                    session_id: m.session_id.clone(),
                    config_id: m.config_id.clone(),
                    first_message: m.content.chars().take(SESSION_PREVIEW_CHARS).collect(),
                    message_count: 1,
                    created_at: m.created_at,
                }),
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    pub fn delete_session(&mut self, session_id: &str) -> usize {
        let before = self.data.messages.len();
        self.data.messages.retain(|m| m.session_id != session_id);
        before - self.data.messages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = Store::open(&dir.path().join("store.json")).expect("open");
        (dir, s)
    }

    #[test]
    fn presets_are_seeded_once_with_active_links() {
        let (_dir, mut s) = store();
        assert_eq!(s.seed_presets(), 2);
        assert_eq!(s.seed_presets(), 0);
        let calc = s
            .presets()
            .into_iter()
            .find(|c| c.name == "Calculator")
            .expect("calculator preset");
        let links = s.links_for(&calc.id);
        assert_eq!(links.len(), 1);
        assert!(links[0].is_active);
        assert!(s.corpus(Some(&calc.id), true).contains("1+2=3"));
    }

    #[test]
    fn duplicate_is_a_renamed_non_preset() {
        let (_dir, mut s) = store();
        s.seed_presets();
        let cat = s
            .presets()
            .into_iter()
            .find(|c| c.name == "The cat")
            .expect("preset");
        let copy = s.duplicate_config(&cat.id).expect("dup");
        assert_eq!(copy.name, "The cat (copy)");
        assert!(!copy.is_preset);
        assert_eq!(copy.config, cat.config);
        let again = s.duplicate_config(&cat.id).expect("dup");
        assert_eq!(again.name, "The cat (copy) (copy)");
    }

    #[test]
    fn names_are_unique() {
        let (_dir, mut s) = store();
        s.create_config("a", "", ModelConfig::default()).expect("create");
        assert!(matches!(
            s.create_config("a", "", ModelConfig::default()),
            Err(DaemonError::Conflict(_))
        ));
    }

    #[test]
    fn inactive_links_are_left_out_of_the_training_corpus() {
        let (_dir, mut s) = store();
        let c = s.create_config("c", "", ModelConfig::default()).expect("create");
        let a = s.add_data("a", "a.txt", FileType::Txt, 5, "alpha".into());
        let b = s.add_data("b", "b.txt", FileType::Txt, 4, "beta".into());
        s.link(&c.id, &a.id).expect("link");
        s.link(&c.id, &b.id).expect("link");
        let l = s.toggle_link(&c.id, &b.id).expect("toggle");
        assert!(!l.is_active);
        assert_eq!(s.corpus(Some(&c.id), true), "alpha");
        assert_eq!(s.corpus(Some(&c.id), false), "alpha\nbeta");

        let info = s.corpus_info(Some(&c.id));
        assert_eq!(info.total_chars, 5);
        assert_eq!(info.file_count, 1);
        assert_eq!(info.unique_chars, 4);
    }

    #[test]
    fn orphaned_runs_fail() {
        let (_dir, mut s) = store();
        let r1 = s.create_run(&new_id(), "c", 10);
        let r2 = s.create_run(&new_id(), "c", 10);
        let live: HashSet<String> = [r2.id.clone()].into_iter().collect();
        assert_eq!(s.fail_orphaned_runs(&live), 1);
        assert_eq!(s.run_mut(&r1.id).map(|r| r.status), Some(RunStatus::Failed));
        assert_eq!(s.run_mut(&r2.id).map(|r| r.status), Some(RunStatus::Pending));
    }

    #[test]
    fn sessions_group_messages() {
        let (_dir, mut s) = store();
        s.add_message("s1", Some("c"), Role::User, "hello", None);
        s.add_message("s1", Some("c"), Role::Assistant, "hi", Some((0.8, 20)));
        s.add_message("s2", Some("d"), Role::User, "other", None);
        let all = s.sessions(None);
        assert_eq!(all.len(), 2);
        let only_c = s.sessions(Some("c"));
        assert_eq!(only_c.len(), 1);
        assert_eq!(only_c[0].message_count, 2);
        assert_eq!(only_c[0].first_message, "hello");
        assert_eq!(s.delete_session("s1"), 2);
        assert!(s.session_messages("s1").is_empty());
    }

    #[test]
    fn survives_a_save_and_reopen() {
        let (dir, mut s) = store();
        s.seed_presets();
        s.save().expect("save");
        let back = Store::open(&dir.path().join("store.json")).expect("reopen");
        assert_eq!(back.configs().len(), 2);
        assert_eq!(back.data_list().len(), 2);
    }
}

//! JSON-lines protocol: one `Request` per line in, one `Response` per line
//! out. `Subscribe` turns the connection into a stream of `TaggedEvent`s.

use minillm::config::ModelConfig;
use minillm::engine::GenerateOptions;
use minillm::introspect::{
    EmbeddingPoint, GenerationTrace, ParameterStats, WeightMatrixInfo,
};
use minillm::sampling::{SamplingParams, SamplingStrategy};
use minillm::viz::AttentionResult;
use serde::{Deserialize, Serialize};

use crate::registry::ActiveModel;
use crate::store::{
    ChatMessageRecord, ConfigRecord, CorpusInfo, DataRecord, RunRecord, SavedModelRecord,
    SessionSummary,
};

fn default_max_tokens() -> usize {
    200
}

fn default_trace_tokens() -> usize {
    50
}

fn default_temperature() -> f32 {
    0.8
}

/// Generation knobs accepted by `Generate` and `ChatSend`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenParams {
    pub max_tokens: usize,
    pub temperature: f32,
    pub sampling_strategy: SamplingStrategy,
    pub top_k: usize,
    pub top_p: f32,
    pub min_new_tokens: usize,
}

impl Default for GenParams {
    fn default() -> Self {
        let s = SamplingParams::default();
        Self {
            max_tokens: default_max_tokens(),
            temperature: s.temperature,
            sampling_strategy: s.strategy,
            top_k: s.top_k,
            top_p: s.top_p,
            min_new_tokens: 0,
        }
    }
}

impl From<GenParams> for GenerateOptions {
    fn from(p: GenParams) -> Self {
        GenerateOptions {
            max_tokens: p.max_tokens,
            sampling: SamplingParams {
                strategy: p.sampling_strategy,
                temperature: p.temperature,
                top_k: p.top_k,
                top_p: p.top_p,
            },
            min_new_tokens: p.min_new_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    // Configs
    ConfigList,
    ConfigGet {
        id: String,
    },
    ConfigCreate {
        name: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        config: ModelConfig,
    },
    ConfigUpdate {
        id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        config: Option<ModelConfig>,
    },
    ConfigDelete {
        id: String,
    },
    ConfigValidate {
        id: String,
    },
    ConfigDuplicate {
        id: String,
    },
    ConfigPresets,

    // Training data
    DataList,
    DataUpload {
        filename: String,
        content: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        config_id: Option<String>,
    },
    DataSample,
    DataDelete {
        id: String,
    },
    DataToggle {
        id: String,
    },
    DataLink {
        config_id: String,
        data_id: String,
    },
    DataUnlink {
        config_id: String,
        data_id: String,
    },
    DataToggleLink {
        config_id: String,
        data_id: String,
    },
    Corpus {
        #[serde(default)]
        config_id: Option<String>,
    },

    // Training
    ModelInitialize {
        config_id: String,
    },
    TrainingStart {
        config_id: String,
        #[serde(default)]
        num_epochs: Option<usize>,
        #[serde(default)]
        continue_training: bool,
    },
    TrainingStop {
        #[serde(default)]
        config_id: Option<String>,
    },
    TrainingPause {
        #[serde(default)]
        config_id: Option<String>,
    },
    TrainingResume {
        #[serde(default)]
        config_id: Option<String>,
    },
    TrainingStatus {
        #[serde(default)]
        config_id: Option<String>,
    },
    TrainingHistory {
        #[serde(default)]
        config_id: Option<String>,
    },
    Subscribe {
        #[serde(default)]
        config_id: Option<String>,
    },

    // Saved models
    ModelSave {
        config_id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        description: String,
    },
    ModelLoad {
        model_id: String,
    },
    ModelList,
    ModelDelete {
        model_id: String,
    },
    ModelInfo {
        #[serde(default)]
        config_id: Option<String>,
    },
    ActiveModels,
    ModelUnload {
        config_id: String,
    },

    // Generation and chat
    Generate {
        #[serde(default)]
        config_id: Option<String>,
        prompt: String,
        #[serde(default)]
        params: GenParams,
    },
    ChatSessions {
        #[serde(default)]
        config_id: Option<String>,
    },
    ChatSession {
        session_id: String,
    },
    ChatDeleteSession {
        session_id: String,
    },
    ChatSend {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        config_id: Option<String>,
        content: String,
        #[serde(default)]
        params: GenParams,
    },

    // Evaluation
    EvalAttention {
        #[serde(default)]
        config_id: Option<String>,
        text: String,
    },
    EvalPerplexity {
        #[serde(default)]
        config_id: Option<String>,
        text: String,
    },
    EvalEmbeddings {
        #[serde(default)]
        config_id: Option<String>,
    },
    EvalParameters {
        #[serde(default)]
        config_id: Option<String>,
    },
    EvalWeightMatrices {
        #[serde(default)]
        config_id: Option<String>,
    },
    EvalGenerationWeights {
        #[serde(default)]
        config_id: Option<String>,
        prompt: String,
        #[serde(default = "default_trace_tokens")]
        max_tokens: usize,
        #[serde(default = "default_temperature")]
        temperature: f32,
    },
    EvalTokenize {
        #[serde(default)]
        config_id: Option<String>,
        text: String,
    },

    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub total_parameters: usize,
    pub vocab_size: usize,
    pub d_model: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    pub d_ff: usize,
    pub seq_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[allow(clippy::large_enum_variant)]
pub enum Response {
    Configs {
        configs: Vec<ConfigRecord>,
    },
    Config {
        config: ConfigRecord,
    },
    Validation {
        valid: bool,
        errors: Vec<String>,
    },
    DataList {
        data: Vec<DataRecord>,
    },
    Data {
        data: DataRecord,
        created: bool,
    },
    Link {
        linked: bool,
        is_active: bool,
    },
    Corpus(CorpusInfo),
    Initialized {
        status: String,
        vocab_size: usize,
        total_parameters: usize,
    },
    TrainingStarted {
        run_id: String,
        total_epochs: usize,
        vocab_size: usize,
        total_parameters: usize,
    },
    TrainingStatus {
        status: String,
        is_ready: bool,
        loss_history: Vec<f32>,
        model_loaded: bool,
        total_parameters: usize,
    },
    Runs {
        runs: Vec<RunRecord>,
    },
    Subscribed {
        config_id: Option<String>,
    },
    Models {
        models: Vec<SavedModelRecord>,
    },
    Model {
        model: SavedModelRecord,
    },
    ModelLoaded {
        config_id: String,
        total_parameters: usize,
        vocab_size: usize,
    },
    ModelInfo {
        loaded: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        info: Option<ModelSummary>,
    },
    ActiveModels {
        models: Vec<ActiveModel>,
    },
    Generated {
        prompt: String,
        generated_text: String,
        generated_length: usize,
    },
    Sessions {
        sessions: Vec<SessionSummary>,
    },
    Messages {
        messages: Vec<ChatMessageRecord>,
    },
    Message {
        message: ChatMessageRecord,
    },
    Attention {
        attention: Vec<AttentionResult>,
    },
    Perplexity {
        text: String,
        loss: f32,
        perplexity: f32,
    },
    Embeddings {
        embeddings: Vec<EmbeddingPoint>,
    },
    Parameters {
        parameters: Vec<ParameterStats>,
        total: usize,
    },
    WeightMatrices {
        matrices: Vec<WeightMatrixInfo>,
    },
    GenerationWeights(Box<GenerationTrace>),
    Tokens {
        chars: Vec<String>,
        ids: Vec<usize>,
        vocab: Vec<(String, usize)>,
        vocab_size: usize,
        tokenizer_type: String,
    },
    Success {
        message: String,
    },
    Error {
        message: String,
    },
}

impl Response {
    pub fn success(message: impl Into<String>) -> Self {
        Self::Success {
            message: message.into(),
        }
    }
}

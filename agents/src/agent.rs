//! Agent contract: a named capability with one async operation.
//!
//! Declarations are immutable data; runtimes are stateless structs holding
//! only shared handles, so one agent instance serves any number of
//! concurrent workflow steps.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use corpora_ai::ChatMessage;
use corpora_models::conversation::TokenUsage;
use corpora_models::search::RetrievedChunk;
use corpora_models::CoreResult;

/// Specialist capabilities known to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    SemanticSearcher,
    HybridSearcher,
    GraphSearcher,
    Merger,
    AnswerSynthesizer,
    QualityAssessor,
    Coordinator,
    Comparator,
    ClaimExtractor,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::SemanticSearcher => "semantic_searcher",
            AgentRole::HybridSearcher => "hybrid_searcher",
            AgentRole::GraphSearcher => "graph_searcher",
            AgentRole::Merger => "merger",
            AgentRole::AnswerSynthesizer => "answer_synthesizer",
            AgentRole::QualityAssessor => "quality_assessor",
            AgentRole::Coordinator => "coordinator",
            AgentRole::Comparator => "comparator",
            AgentRole::ClaimExtractor => "claim_extractor",
        }
    }
}

/// Execution-scoped context handed to every step.
pub struct StepContext {
    pub execution_id: Uuid,
    pub knowledge_base_id: Option<Uuid>,
    pub top_k: usize,
    pub cancel: CancellationToken,
    /// Present only on the terminal synthesizer step of a streaming run;
    /// deltas sent here reach the client as they are produced.
    pub stream: Option<mpsc::Sender<String>>,
}

/// Input assembled from the workflow input and dependency outputs.
#[derive(Debug, Clone, Default)]
pub struct StepInput {
    pub query: String,
    /// Union of dependency passages, source-tagged and deduplicated.
    pub passages: Vec<RetrievedChunk>,
    /// Draft text from an upstream synthesizer, when one exists.
    pub draft: Option<String>,
    /// Conversation context for prompt construction.
    pub messages: Vec<ChatMessage>,
    /// Raw dependency outputs keyed by step name.
    pub upstream: serde_json::Map<String, serde_json::Value>,
}

/// What a step writes (exactly once) into the execution state.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    /// Structured output, bindable by later steps.
    pub value: serde_json::Value,
    /// Passages this step contributed or carried through.
    pub passages: Vec<RetrievedChunk>,
    /// Free text (answer draft, comparison, verdict summary).
    pub text: Option<String>,
    pub confidence: f32,
    pub usage: TokenUsage,
}

/// A named unit with a single async operation and a declared capability.
#[async_trait]
pub trait Agent: Send + Sync {
    fn role(&self) -> AgentRole;

    async fn run(&self, ctx: &StepContext, input: &StepInput) -> CoreResult<StepOutput>;
}

//! Workflow execution: bounded parallel waves over a validated DAG.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use corpora_ai::{ChatMessage, ChatModel};
use corpora_config::CoreConfig;
use corpora_models::conversation::TokenUsage;
use corpora_models::search::RetrievedChunk;
use corpora_models::workflow::{
    ExecutionStatus, OnFailure, StepState, StepStatus, WorkflowExecution,
};
use corpora_models::{CoreError, CoreResult};
use corpora_retrieval::RetrievalEngine;

use crate::agent::{Agent, AgentRole, StepContext, StepInput, StepOutput};
use crate::registry::ExecutionRegistry;
use crate::runtime::{
    comparison_subjects, ClaimExtractorAgent, ComparatorAgent, CoordinatorAgent, MergerAgent,
    QualityAssessorAgent, SearcherAgent, SynthesizerAgent,
};
use crate::workflow::{InputBinding, StepDef, WorkflowDef, WorkflowKind};

pub struct WorkflowInput {
    pub query: String,
    pub knowledge_base_id: Option<Uuid>,
    pub top_k: usize,
    /// Conversation context for prompt construction.
    pub messages: Vec<ChatMessage>,
}

/// What a finished workflow hands back to the conversation layer.
pub struct WorkflowOutcome {
    pub execution: WorkflowExecution,
    pub answer: String,
    pub sources: Vec<RetrievedChunk>,
    pub confidence: f32,
    pub usage: TokenUsage,
    /// True when the synthesizer failed and only sources are returned.
    pub degraded: bool,
    /// Rubric of the last quality-assessor step, when one ran.
    pub assessment: Option<serde_json::Value>,
}

/// Executes workflow DAGs over a fixed agent set.
pub struct WorkflowEngine {
    agents: HashMap<AgentRole, Arc<dyn Agent>>,
    registry: Arc<ExecutionRegistry>,
    parallelism: Arc<Semaphore>,
    workflow_timeout: Duration,
}

impl WorkflowEngine {
    pub fn new(
        config: &CoreConfig,
        retrieval: Arc<RetrievalEngine>,
        llm: Arc<dyn ChatModel>,
        registry: Arc<ExecutionRegistry>,
    ) -> Self {
        let mut agents: HashMap<AgentRole, Arc<dyn Agent>> = HashMap::new();
        agents.insert(
            AgentRole::SemanticSearcher,
            Arc::new(SearcherAgent::semantic(Arc::clone(&retrieval))),
        );
        agents.insert(
            AgentRole::HybridSearcher,
            Arc::new(SearcherAgent::hybrid(Arc::clone(&retrieval))),
        );
        agents.insert(
            AgentRole::GraphSearcher,
            Arc::new(SearcherAgent::graph(Arc::clone(&retrieval))),
        );
        agents.insert(AgentRole::Merger, Arc::new(MergerAgent));
        agents.insert(
            AgentRole::AnswerSynthesizer,
            Arc::new(SynthesizerAgent::new(Arc::clone(&llm))),
        );
        agents.insert(
            AgentRole::QualityAssessor,
            Arc::new(QualityAssessorAgent::new(
                Arc::clone(&llm),
                Arc::clone(&retrieval),
            )),
        );
        agents.insert(
            AgentRole::Coordinator,
            Arc::new(CoordinatorAgent::new(Arc::clone(&llm))),
        );
        agents.insert(
            AgentRole::Comparator,
            Arc::new(ComparatorAgent::new(Arc::clone(&llm))),
        );
        agents.insert(AgentRole::ClaimExtractor, Arc::new(ClaimExtractorAgent));

        Self {
            agents,
            registry,
            parallelism: Arc::new(Semaphore::new(config.concurrency.max_parallel_agents.max(1))),
            workflow_timeout: config.timeouts.per_workflow(),
        }
    }

    pub fn registry(&self) -> Arc<ExecutionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Execute a predefined workflow. `stream` receives answer deltas from
    /// the terminal synthesizer when present.
    pub async fn execute(
        &self,
        kind: WorkflowKind,
        input: WorkflowInput,
        stream: Option<mpsc::Sender<String>>,
        cancel: CancellationToken,
    ) -> CoreResult<WorkflowOutcome> {
        self.execute_definition(&kind.definition(), input, stream, cancel)
            .await
    }

    pub async fn execute_definition(
        &self,
        def: &WorkflowDef,
        input: WorkflowInput,
        stream: Option<mpsc::Sender<String>>,
        cancel: CancellationToken,
    ) -> CoreResult<WorkflowOutcome> {
        if input.query.trim().is_empty() {
            return Err(CoreError::InvalidInput("query is empty".into()));
        }

        let started = Instant::now();
        let deadline = started + self.workflow_timeout;
        let mut execution = WorkflowExecution::new(def.name, &input.query);
        for step in &def.steps {
            execution.steps.insert(step.name.to_string(), StepState::pending());
        }
        self.registry.insert(execution.clone());
        info!(workflow = def.name, execution_id = %execution.id, "workflow started");

        let final_synthesizer = def.final_synthesizer().map(|s| s.name);
        let mut state: HashMap<&str, StepOutput> = HashMap::new();
        let mut terminal: HashSet<&str> = HashSet::new();
        let mut aborted: Option<CoreError> = None;
        let mut degraded = false;

        'waves: loop {
            if cancel.is_cancelled() {
                execution.status = ExecutionStatus::Cancelled;
                break;
            }
            if Instant::now() >= deadline {
                aborted = Some(CoreError::Cancelled("workflow deadline expired".into()));
                break;
            }

            let ready: Vec<&StepDef> = def
                .steps
                .iter()
                .filter(|s| !terminal.contains(s.name))
                .filter(|s| s.depends_on.iter().all(|d| terminal.contains(d)))
                .collect();
            if ready.is_empty() {
                break;
            }

            // One wave: all ready steps, bounded by the parallelism pool.
            let mut wave = Vec::new();
            for &step in &ready {
                let agent = self
                    .agents
                    .get(&step.role)
                    .ok_or_else(|| {
                        CoreError::InvalidInput(format!("no agent for role {}", step.role.as_str()))
                    })?
                    .clone();
                let step_input = build_step_input(def, step, &input, &state);
                let step_stream = if Some(step.name) == final_synthesizer {
                    stream.clone()
                } else {
                    None
                };
                let ctx = StepContext {
                    execution_id: execution.id,
                    knowledge_base_id: input.knowledge_base_id,
                    top_k: input.top_k,
                    cancel: cancel.clone(),
                    stream: step_stream,
                };
                let permits = Arc::clone(&self.parallelism);
                let step_timeout = Duration::from_millis(step.timeout_ms)
                    .min(deadline.saturating_duration_since(Instant::now()));
                let name = step.name;

                wave.push(async move {
                    let _permit = permits.acquire_owned().await;
                    let step_started = Instant::now();
                    let result = timeout(step_timeout, agent.run(&ctx, &step_input))
                        .await
                        .map_err(|_| CoreError::Cancelled(format!("step {} timed out", name)))
                        .and_then(|inner| inner);
                    (name, step_started.elapsed(), result)
                });
            }

            let results = futures::future::join_all(wave).await;

            for (name, elapsed, result) in results {
                let step = def.step(name).expect("step exists");
                terminal.insert(name);
                let entry = execution
                    .steps
                    .get_mut(name)
                    .expect("step state pre-registered");
                entry.elapsed_ms = elapsed.as_millis() as u64;

                match result {
                    Ok(output) => {
                        entry.status = StepStatus::Completed;
                        entry.output = Some(output.value.clone());
                        state.insert(name, output);
                    }
                    Err(err) => {
                        entry.error = Some(err.to_string());
                        match step.on_failure {
                            OnFailure::Abort => {
                                entry.status = StepStatus::Failed;
                                // A dead synthesizer degrades to sources-only
                                // instead of failing the whole request.
                                if Some(name) == final_synthesizer
                                    && matches!(err, CoreError::DependencyFailure { .. })
                                {
                                    degraded = true;
                                    warn!(step = name, "synthesizer failed, degrading to sources only");
                                    continue;
                                }
                                aborted = Some(err);
                                break 'waves;
                            }
                            OnFailure::Skip => {
                                warn!(step = name, "step failed, skipping: {}", err);
                                entry.status = StepStatus::Skipped;
                            }
                            OnFailure::ContinueWithPartial => {
                                warn!(step = name, "step failed, continuing with partial: {}", err);
                                entry.status = StepStatus::Failed;
                            }
                        }
                    }
                }
            }
        }

        // Aggregate.
        let mut usage = TokenUsage::default();
        let mut weighted = 0.0f32;
        let mut weight_sum = 0.0f32;
        for step in &def.steps {
            if let Some(output) = state.get(step.name) {
                usage.add(output.usage);
                weighted += output.confidence * step.weight;
                weight_sum += step.weight;
            }
        }
        let confidence = if weight_sum > 0.0 {
            (weighted / weight_sum).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let answer = final_synthesizer
            .and_then(|name| state.get(name))
            .and_then(|o| o.text.clone())
            .unwrap_or_default();
        let sources = collect_sources(def, &state, final_synthesizer);
        let assessment = def
            .steps
            .iter()
            .rev()
            .find(|s| s.role == AgentRole::QualityAssessor)
            .and_then(|s| state.get(s.name))
            .map(|o| o.value.clone());

        execution.confidence = confidence;
        execution.elapsed_ms = started.elapsed().as_millis() as u64;
        execution.status = match (&aborted, cancel.is_cancelled(), execution.status) {
            (_, _, ExecutionStatus::Cancelled) => ExecutionStatus::Cancelled,
            (_, true, _) => ExecutionStatus::Cancelled,
            (Some(_), _, _) => ExecutionStatus::Failed,
            _ => ExecutionStatus::Completed,
        };
        self.registry.update(execution.clone());

        if let Some(err) = aborted {
            return Err(err);
        }
        if execution.status == ExecutionStatus::Cancelled {
            return Err(CoreError::Cancelled("workflow cancelled".into()));
        }

        debug!(
            workflow = def.name,
            confidence,
            degraded,
            elapsed_ms = execution.elapsed_ms,
            "workflow finished"
        );
        Ok(WorkflowOutcome {
            execution,
            answer,
            sources,
            confidence,
            usage,
            degraded,
            assessment,
        })
    }
}

/// Assemble a step's input from the workflow input and dependency outputs.
fn build_step_input(
    def: &WorkflowDef,
    step: &StepDef,
    input: &WorkflowInput,
    state: &HashMap<&str, StepOutput>,
) -> StepInput {
    let query = match step.binding {
        InputBinding::Query => input.query.clone(),
        InputBinding::Subject(n) => {
            let subjects = comparison_subjects(&input.query);
            subjects.get(n).cloned().unwrap_or_else(|| input.query.clone())
        }
        InputBinding::DependencyText => step
            .depends_on
            .iter()
            .filter_map(|d| state.get(*d))
            .filter_map(|o| o.text.clone())
            .next()
            .unwrap_or_else(|| input.query.clone()),
    };

    let mut seen = HashSet::new();
    let mut passages = Vec::new();
    let mut draft = None;
    let mut upstream = serde_json::Map::new();
    for dep in &step.depends_on {
        let Some(output) = state.get(*dep) else {
            continue; // skipped dependency: tolerate absence
        };
        for chunk in &output.passages {
            if seen.insert(chunk.chunk_id) {
                passages.push(chunk.clone());
            }
        }
        let dep_role = def.step(dep).map(|d| d.role);
        if let Some(text) = &output.text {
            // A synthesizer's text wins over other deps' text.
            if dep_role == Some(AgentRole::AnswerSynthesizer) || draft.is_none() {
                draft = Some(text.clone());
            }
        }
        upstream.insert(dep.to_string(), output.value.clone());
    }
    passages.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    StepInput {
        query,
        passages,
        draft,
        messages: input.messages.clone(),
        upstream,
    }
}

/// Sources for the outcome: the synthesizer's inputs when it ran, otherwise
/// everything the searchers produced.
fn collect_sources(
    def: &WorkflowDef,
    state: &HashMap<&str, StepOutput>,
    final_synthesizer: Option<&str>,
) -> Vec<RetrievedChunk> {
    if let Some(output) = final_synthesizer.and_then(|name| state.get(name)) {
        if !output.passages.is_empty() {
            return output.passages.clone();
        }
    }
    let mut seen = HashSet::new();
    let mut sources = Vec::new();
    for step in &def.steps {
        if let Some(output) = state.get(step.name) {
            for chunk in &output.passages {
                if seen.insert(chunk.chunk_id) {
                    sources.push(chunk.clone());
                }
            }
        }
    }
    sources.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    sources
}

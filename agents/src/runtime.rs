//! Stateless agent runtimes over shared engine and model handles.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;
use tracing::{debug, warn};

use corpora_ai::{
    complete_with_fallback, sparse, ChatModel, CompletionOptions,
};
use corpora_models::conversation::TokenUsage;
use corpora_models::search::{RetrievedChunk, SearchMode, SearchRequest};
use corpora_models::{CoreError, CoreResult};
use corpora_retrieval::RetrievalEngine;

use crate::agent::{Agent, AgentRole, StepContext, StepInput, StepOutput};
use crate::prompts;

/// Split a comparative query into its subjects: "X vs Y", "compare X and Y".
pub fn comparison_subjects(query: &str) -> Vec<String> {
    let lowered = query.to_lowercase();
    for marker in [" versus ", " vs. ", " vs "] {
        if let Some(pos) = lowered.find(marker) {
            let left = query[..pos].trim();
            let right = query[pos + marker.len()..].trim();
            let left = left
                .rsplit(|c: char| c == ',' || c == ':')
                .next()
                .unwrap_or(left)
                .trim();
            let right = right.trim_end_matches(|c: char| c.is_ascii_punctuation());
            return vec![strip_compare_prefix(left), right.to_string()];
        }
    }
    if let Some(pos) = lowered.find(" and ") {
        if lowered.contains("compare") || lowered.contains("difference") {
            let left = strip_compare_prefix(query[..pos].trim());
            let right = query[pos + 5..]
                .trim()
                .trim_end_matches(|c: char| c.is_ascii_punctuation())
                .to_string();
            return vec![left, right];
        }
    }
    vec![query.to_string()]
}

fn strip_compare_prefix(text: &str) -> String {
    let lowered = text.to_lowercase();
    for prefix in ["compare ", "what is the difference between ", "difference between "] {
        if let Some(rest) = lowered.strip_prefix(prefix) {
            let start = text.len() - rest.len();
            return text[start..].trim().to_string();
        }
    }
    text.to_string()
}

fn average_scores(a: f32, b: Option<f32>) -> f32 {
    match b {
        Some(b) => (a + b) / 2.0,
        None => a,
    }
}

/// Token-overlap support score between a claim and a passage.
fn overlap_score(claim: &str, passage: &str) -> f32 {
    let claim_tokens: HashSet<String> = sparse::tokenize(claim).into_iter().collect();
    if claim_tokens.is_empty() {
        return 0.0;
    }
    let passage_tokens: HashSet<String> = sparse::tokenize(passage).into_iter().collect();
    let shared = claim_tokens.intersection(&passage_tokens).count();
    shared as f32 / claim_tokens.len() as f32
}

// ============================================================================
// Searchers
// ============================================================================

/// One runtime serves all three searcher roles, parameterized by mode.
pub struct SearcherAgent {
    engine: Arc<RetrievalEngine>,
    mode: SearchMode,
    role: AgentRole,
}

impl SearcherAgent {
    pub fn semantic(engine: Arc<RetrievalEngine>) -> Self {
        Self {
            engine,
            mode: SearchMode::Semantic,
            role: AgentRole::SemanticSearcher,
        }
    }

    pub fn hybrid(engine: Arc<RetrievalEngine>) -> Self {
        Self {
            engine,
            mode: SearchMode::Hybrid,
            role: AgentRole::HybridSearcher,
        }
    }

    pub fn graph(engine: Arc<RetrievalEngine>) -> Self {
        Self {
            engine,
            mode: SearchMode::Graph,
            role: AgentRole::GraphSearcher,
        }
    }

    async fn search_one(&self, ctx: &StepContext, query: &str) -> CoreResult<Vec<RetrievedChunk>> {
        let Some(kb_id) = ctx.knowledge_base_id else {
            return Ok(Vec::new());
        };
        let response = self
            .engine
            .search(&SearchRequest {
                knowledge_base_id: kb_id,
                query: query.to_string(),
                mode: self.mode,
                top_k: ctx.top_k,
                filter: None,
                enable_rerank: false,
            })
            .await?;
        Ok(response.results)
    }
}

#[async_trait]
impl Agent for SearcherAgent {
    fn role(&self) -> AgentRole {
        self.role
    }

    async fn run(&self, ctx: &StepContext, input: &StepInput) -> CoreResult<StepOutput> {
        if ctx.cancel.is_cancelled() {
            return Err(CoreError::Cancelled("workflow cancelled".into()));
        }

        // A multi-line query comes from a decomposition step: one search per
        // sub-question, results unioned.
        let sub_queries: Vec<&str> = input
            .query
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();

        let mut seen: HashSet<uuid::Uuid> = HashSet::new();
        let mut passages = Vec::new();
        for query in sub_queries {
            if ctx.cancel.is_cancelled() {
                return Err(CoreError::Cancelled("workflow cancelled".into()));
            }
            for chunk in self.search_one(ctx, query).await? {
                if seen.insert(chunk.chunk_id) {
                    passages.push(chunk);
                }
            }
        }

        let confidence = passages
            .iter()
            .map(|p| p.score)
            .fold(0.0f32, f32::max)
            .clamp(0.0, 1.0);
        debug!(role = self.role.as_str(), found = passages.len(), "searcher finished");

        Ok(StepOutput {
            value: json!({ "results": passages.len() }),
            passages,
            text: None,
            confidence,
            usage: TokenUsage::default(),
        })
    }
}

// ============================================================================
// Merger
// ============================================================================

/// Deduplicates and re-ranks the union of upstream searcher outputs.
pub struct MergerAgent;

#[async_trait]
impl Agent for MergerAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Merger
    }

    async fn run(&self, _ctx: &StepContext, input: &StepInput) -> CoreResult<StepOutput> {
        let mut seen: HashSet<uuid::Uuid> = HashSet::new();
        let mut merged: Vec<RetrievedChunk> = Vec::new();
        for chunk in &input.passages {
            if seen.insert(chunk.chunk_id) {
                merged.push(chunk.clone());
            }
        }
        merged.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let confidence = merged.first().map(|c| c.score).unwrap_or(0.0);
        Ok(StepOutput {
            value: json!({ "merged": merged.len() }),
            passages: merged,
            text: None,
            confidence,
            usage: TokenUsage::default(),
        })
    }
}

// ============================================================================
// Synthesizer
// ============================================================================

pub struct SynthesizerAgent {
    llm: Arc<dyn ChatModel>,
}

impl SynthesizerAgent {
    pub fn new(llm: Arc<dyn ChatModel>) -> Self {
        Self { llm }
    }

    async fn synthesize_streaming(
        &self,
        ctx: &StepContext,
        input: &StepInput,
        sink: &tokio::sync::mpsc::Sender<String>,
    ) -> CoreResult<(String, TokenUsage)> {
        let messages = prompts::synthesis_messages(&input.query, &input.passages, &input.messages);
        let mut rx = self
            .llm
            .complete_stream(&messages, &CompletionOptions::default(), ctx.cancel.clone())
            .await?;

        let mut answer = String::new();
        let mut usage = TokenUsage::default();
        while let Some(chunk) = rx.recv().await {
            let chunk = chunk?;
            if !chunk.delta.is_empty() {
                answer.push_str(&chunk.delta);
                if sink.send(chunk.delta).await.is_err() {
                    // Consumer is gone; abort upstream via the token.
                    ctx.cancel.cancel();
                    return Err(CoreError::Cancelled("stream consumer disconnected".into()));
                }
            }
            if let Some(u) = chunk.usage {
                usage = u;
            }
            if chunk.finish_reason.is_some() {
                break;
            }
        }
        if ctx.cancel.is_cancelled() {
            return Err(CoreError::Cancelled("workflow cancelled mid-stream".into()));
        }
        Ok((answer, usage))
    }
}

#[async_trait]
impl Agent for SynthesizerAgent {
    fn role(&self) -> AgentRole {
        AgentRole::AnswerSynthesizer
    }

    async fn run(&self, ctx: &StepContext, input: &StepInput) -> CoreResult<StepOutput> {
        if input.passages.is_empty() && input.draft.is_none() {
            return Err(CoreError::dependency(
                "retrieval",
                "no sources available for synthesis",
            ));
        }

        let (answer, usage) = match &ctx.stream {
            Some(sink) => self.synthesize_streaming(ctx, input, sink).await?,
            None => {
                let primary =
                    prompts::synthesis_messages(&input.query, &input.passages, &input.messages);
                let fallback = prompts::fallback_messages(&input.query, &input.passages);
                let result = complete_with_fallback(
                    self.llm.as_ref(),
                    &primary,
                    &fallback,
                    &CompletionOptions::default(),
                )
                .await?;
                (result.content, result.usage.unwrap_or_default())
            }
        };

        // A grounded answer cites at least one source.
        let cites = answer.contains("[source");
        let confidence = if cites { 0.8 } else { 0.5 };

        Ok(StepOutput {
            value: json!({ "answer": answer, "cites_sources": cites }),
            passages: input.passages.clone(),
            text: Some(answer),
            confidence,
            usage,
        })
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Decomposes a question into sub-questions, one per output line.
pub struct CoordinatorAgent {
    llm: Arc<dyn ChatModel>,
}

impl CoordinatorAgent {
    pub fn new(llm: Arc<dyn ChatModel>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Agent for CoordinatorAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Coordinator
    }

    async fn run(&self, _ctx: &StepContext, input: &StepInput) -> CoreResult<StepOutput> {
        let completion = self
            .llm
            .complete(
                &prompts::decomposition_messages(&input.query),
                &CompletionOptions {
                    temperature: 0.2,
                    max_tokens: 512,
                    tools: None,
                },
            )
            .await;

        let (text, usage) = match completion {
            Ok(result) => {
                let usage = result.usage.unwrap_or_default();
                (result.content, usage)
            }
            Err(e) => {
                // Degrade to the undecomposed query.
                warn!("decomposition failed, using the raw query: {}", e);
                (input.query.clone(), TokenUsage::default())
            }
        };

        let sub_questions: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .take(4)
            .map(String::from)
            .collect();
        let joined = if sub_questions.is_empty() {
            input.query.clone()
        } else {
            sub_questions.join("\n")
        };

        Ok(StepOutput {
            value: json!({ "sub_questions": sub_questions }),
            passages: Vec::new(),
            text: Some(joined),
            confidence: 0.7,
            usage,
        })
    }
}

// ============================================================================
// Comparator
// ============================================================================

/// Contrasts the two subjects' retrieved evidence.
pub struct ComparatorAgent {
    llm: Arc<dyn ChatModel>,
}

impl ComparatorAgent {
    pub fn new(llm: Arc<dyn ChatModel>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Agent for ComparatorAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Comparator
    }

    async fn run(&self, _ctx: &StepContext, input: &StepInput) -> CoreResult<StepOutput> {
        let subjects = comparison_subjects(&input.query);
        let prompt = format!(
            "Contrast the subjects {:?} using only these sources. List \
             similarities, then differences, citing [source N].\n\n{}",
            subjects,
            prompts::source_block(&input.passages)
        );
        let completion = self
            .llm
            .complete(
                &[corpora_ai::ChatMessage::user(prompt)],
                &CompletionOptions::default(),
            )
            .await?;

        Ok(StepOutput {
            value: json!({ "subjects": subjects }),
            passages: input.passages.clone(),
            text: Some(completion.content),
            confidence: 0.7,
            usage: completion.usage.unwrap_or_default(),
        })
    }
}

// ============================================================================
// Claim extractor
// ============================================================================

/// Splits text into individually checkable claims: an upstream draft when
/// one exists, otherwise the retrieved passages themselves.
pub struct ClaimExtractorAgent;

fn split_claims(text: &str) -> Vec<String> {
    text.split(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| s.split_whitespace().count() >= 4)
        .map(|s| {
            // Citation markers are not part of the claim text.
            let mut claim = s.to_string();
            while let Some(start) = claim.find("[source") {
                match claim[start..].find(']') {
                    Some(end) => claim.replace_range(start..start + end + 1, ""),
                    None => break,
                }
            }
            claim.trim().to_string()
        })
        .filter(|s| !s.is_empty())
        .collect()
}

#[async_trait]
impl Agent for ClaimExtractorAgent {
    fn role(&self) -> AgentRole {
        AgentRole::ClaimExtractor
    }

    async fn run(&self, _ctx: &StepContext, input: &StepInput) -> CoreResult<StepOutput> {
        let mut claims = match input.draft.as_deref() {
            Some(draft) => split_claims(draft),
            None => input
                .passages
                .iter()
                .flat_map(|p| split_claims(&p.content))
                .collect(),
        };
        claims.dedup();

        Ok(StepOutput {
            value: json!({ "claims": claims }),
            passages: input.passages.clone(),
            text: None,
            confidence: if claims.is_empty() { 0.2 } else { 0.8 },
            usage: TokenUsage::default(),
        })
    }
}

// ============================================================================
// Quality assessor
// ============================================================================

/// Grades an answer with deterministic checks blended with an LLM rubric.
/// When upstream claims exist, verifies each against the corpus.
pub struct QualityAssessorAgent {
    llm: Arc<dyn ChatModel>,
    engine: Arc<RetrievalEngine>,
}

#[derive(Debug, serde::Deserialize)]
struct RubricScores {
    completeness: f32,
    accuracy: f32,
    clarity: f32,
    consistency: f32,
}

impl QualityAssessorAgent {
    pub fn new(llm: Arc<dyn ChatModel>, engine: Arc<RetrievalEngine>) -> Self {
        Self { llm, engine }
    }

    fn deterministic_scores(answer: &str, passages: &[RetrievedChunk]) -> (f32, f32, f32, f32) {
        let words = answer.split_whitespace().count();
        let completeness = ((words as f32) / 80.0).clamp(0.1, 1.0);
        let clarity = if words > 0 && words < 600 { 0.8 } else { 0.4 };
        let cites = answer.contains("[source");
        let grounded = passages
            .iter()
            .any(|p| overlap_score(answer, &p.content) > 0.2);
        let accuracy = match (cites, grounded) {
            (true, true) => 0.9,
            (true, false) | (false, true) => 0.6,
            (false, false) => 0.3,
        };
        let consistency = if answer.contains("I don't know") && words > 50 {
            0.5
        } else {
            0.8
        };
        (completeness, accuracy, clarity, consistency)
    }

    /// One hybrid search per claim, all claims in flight concurrently; the
    /// engine's own limits bound the fan-out.
    async fn verify_claims(&self, ctx: &StepContext, claims: &[String]) -> Vec<serde_json::Value> {
        let Some(kb_id) = ctx.knowledge_base_id else {
            return Vec::new();
        };

        let searches = claims.iter().map(|claim| {
            let engine = Arc::clone(&self.engine);
            let cancel = ctx.cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return json!({ "claim": claim, "supported": false, "support_score": 0.0 });
                }
                let evidence = engine
                    .search(&SearchRequest {
                        knowledge_base_id: kb_id,
                        query: claim.clone(),
                        mode: SearchMode::Hybrid,
                        top_k: 3,
                        filter: None,
                        enable_rerank: false,
                    })
                    .await;

                match evidence {
                    Ok(response) => {
                        let support = response
                            .results
                            .iter()
                            .map(|r| overlap_score(claim, &r.content))
                            .fold(0.0f32, f32::max);
                        json!({
                            "claim": claim,
                            "supported": support >= 0.5,
                            "support_score": support,
                        })
                    }
                    Err(e) => {
                        warn!("claim verification search failed: {}", e);
                        json!({ "claim": claim, "supported": false, "support_score": 0.0 })
                    }
                }
            }
        });

        join_all(searches).await
    }
}

#[async_trait]
impl Agent for QualityAssessorAgent {
    fn role(&self) -> AgentRole {
        AgentRole::QualityAssessor
    }

    async fn run(&self, ctx: &StepContext, input: &StepInput) -> CoreResult<StepOutput> {
        let answer = input.draft.clone().unwrap_or_default();
        let (mut completeness, mut accuracy, mut clarity, mut consistency) =
            Self::deterministic_scores(&answer, &input.passages);

        // Blend in the LLM rubric when the judge is reachable.
        let mut usage = TokenUsage::default();
        if !answer.is_empty() {
            let judged = self
                .llm
                .complete(
                    &prompts::assessment_messages(&input.query, &answer, &input.passages),
                    &CompletionOptions {
                        temperature: 0.0,
                        max_tokens: 256,
                        tools: None,
                    },
                )
                .await;
            match judged {
                Ok(result) => {
                    usage = result.usage.unwrap_or_default();
                    match serde_json::from_str::<RubricScores>(result.content.trim()) {
                        Ok(rubric) => {
                            completeness = average_scores(completeness, Some(rubric.completeness));
                            accuracy = average_scores(accuracy, Some(rubric.accuracy));
                            clarity = average_scores(clarity, Some(rubric.clarity));
                            consistency = average_scores(consistency, Some(rubric.consistency));
                        }
                        Err(e) => debug!("rubric response was not JSON, keeping heuristics: {}", e),
                    }
                }
                Err(e) => warn!("LLM assessment failed, keeping heuristics: {}", e),
            }
        }

        // Per-claim verdicts in fact-checking flows.
        let claims: Vec<String> = input
            .upstream
            .values()
            .filter_map(|v| v.get("claims"))
            .filter_map(|c| serde_json::from_value::<Vec<String>>(c.clone()).ok())
            .next()
            .unwrap_or_default();
        let verdicts = if claims.is_empty() {
            Vec::new()
        } else {
            self.verify_claims(ctx, &claims).await
        };
        if !verdicts.is_empty() {
            let supported = verdicts
                .iter()
                .filter(|v| v["supported"].as_bool().unwrap_or(false))
                .count();
            accuracy = average_scores(accuracy, Some(supported as f32 / verdicts.len() as f32));
        }

        let overall =
            (completeness * 0.25 + accuracy * 0.4 + clarity * 0.15 + consistency * 0.2).clamp(0.0, 1.0);

        Ok(StepOutput {
            value: json!({
                "completeness": completeness,
                "accuracy": accuracy,
                "clarity": clarity,
                "consistency": consistency,
                "overall": overall,
                "verdicts": verdicts,
            }),
            passages: Vec::new(),
            text: None,
            confidence: overall,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparison_subjects_split_on_vs() {
        assert_eq!(
            comparison_subjects("PostgreSQL vs MySQL"),
            vec!["PostgreSQL".to_string(), "MySQL".to_string()]
        );
        assert_eq!(
            comparison_subjects("Compare Qdrant and Milvus."),
            vec!["Qdrant".to_string(), "Milvus".to_string()]
        );
    }

    #[test]
    fn non_comparative_query_is_one_subject() {
        let subjects = comparison_subjects("What is the capital of France?");
        assert_eq!(subjects.len(), 1);
    }

    #[test]
    fn overlap_score_reflects_shared_tokens() {
        let high = overlap_score(
            "Paris is the capital of France",
            "The capital of France is Paris.",
        );
        let low = overlap_score("Paris is the capital of France", "Rust prevents data races");
        assert!(high > 0.9);
        assert!(low < 0.2);
    }

    #[test]
    fn deterministic_scores_reward_citations() {
        let passages = vec![RetrievedChunk {
            chunk_id: uuid::Uuid::new_v4(),
            document_id: uuid::Uuid::new_v4(),
            knowledge_base_id: uuid::Uuid::nil(),
            chunk_index: 0,
            content: "The capital of France is Paris.".into(),
            score: 0.9,
            chunk_type: corpora_models::chunk::ChunkType::Text,
            matched_modes: vec![SearchMode::Hybrid],
            metadata: serde_json::Value::Null,
        }];
        let (_, cited_accuracy, _, _) = QualityAssessorAgent::deterministic_scores(
            "The capital of France is Paris [source 1].",
            &passages,
        );
        let (_, bare_accuracy, _, _) =
            QualityAssessorAgent::deterministic_scores("It is definitely Lyon.", &passages);
        assert!(cited_accuracy > bare_accuracy);
    }
}

//! Typed workflow definitions: a DAG of steps over agent roles.
//!
//! Steps reference their dependencies by name and are validated at
//! construction, so a renamed or removed step is an immediate error rather
//! than a silent runtime no-op.

use std::collections::{HashMap, HashSet};

use corpora_models::workflow::OnFailure;
use corpora_models::{CoreError, CoreResult};

use crate::agent::AgentRole;

pub type OnFailurePolicy = OnFailure;

/// How a step's query input is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputBinding {
    /// The workflow's original query.
    Query,
    /// The n-th comparison subject extracted from the query (0-based).
    Subject(usize),
    /// The text output of the named dependency becomes the query.
    DependencyText,
}

#[derive(Debug, Clone)]
pub struct StepDef {
    pub name: &'static str,
    pub role: AgentRole,
    pub depends_on: Vec<&'static str>,
    pub binding: InputBinding,
    pub timeout_ms: u64,
    pub on_failure: OnFailurePolicy,
    /// Weight in the aggregated confidence.
    pub weight: f32,
}

impl StepDef {
    fn new(name: &'static str, role: AgentRole) -> Self {
        Self {
            name,
            role,
            depends_on: Vec::new(),
            binding: InputBinding::Query,
            timeout_ms: 30_000,
            on_failure: OnFailure::Abort,
            weight: 1.0,
        }
    }

    fn after(mut self, deps: &[&'static str]) -> Self {
        self.depends_on = deps.to_vec();
        self
    }

    fn binding(mut self, binding: InputBinding) -> Self {
        self.binding = binding;
        self
    }

    fn on_failure(mut self, policy: OnFailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    fn weight(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }
}

/// A validated DAG of steps.
#[derive(Debug, Clone)]
pub struct WorkflowDef {
    pub name: &'static str,
    pub steps: Vec<StepDef>,
}

impl WorkflowDef {
    /// Validate step references and acyclicity.
    pub fn new(name: &'static str, steps: Vec<StepDef>) -> CoreResult<Self> {
        let names: HashSet<&str> = steps.iter().map(|s| s.name).collect();
        if names.len() != steps.len() {
            return Err(CoreError::InvalidInput(format!(
                "workflow {} has duplicate step names",
                name
            )));
        }
        for step in &steps {
            for dep in &step.depends_on {
                if !names.contains(dep) {
                    return Err(CoreError::InvalidInput(format!(
                        "step {} depends on unknown step {}",
                        step.name, dep
                    )));
                }
            }
        }

        // Kahn topological check.
        let mut indegree: HashMap<&str, usize> = steps
            .iter()
            .map(|s| (s.name, s.depends_on.len()))
            .collect();
        let mut queue: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut visited = 0;
        while let Some(current) = queue.pop() {
            visited += 1;
            for step in &steps {
                if step.depends_on.contains(&current) {
                    let d = indegree.get_mut(step.name).expect("known step");
                    *d -= 1;
                    if *d == 0 {
                        queue.push(step.name);
                    }
                }
            }
        }
        if visited != steps.len() {
            return Err(CoreError::InvalidInput(format!(
                "workflow {} contains a cycle",
                name
            )));
        }

        Ok(Self { name, steps })
    }

    pub fn step(&self, name: &str) -> Option<&StepDef> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// The terminal synthesizer step, if the workflow produces an answer.
    pub fn final_synthesizer(&self) -> Option<&StepDef> {
        self.steps
            .iter()
            .rev()
            .find(|s| s.role == AgentRole::AnswerSynthesizer)
    }
}

/// The predefined workflow catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    SimpleQa,
    ComplexResearch,
    ComparativeAnalysis,
    MultiStepReasoning,
    FactChecking,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowKind::SimpleQa => "simple_qa",
            WorkflowKind::ComplexResearch => "complex_research",
            WorkflowKind::ComparativeAnalysis => "comparative_analysis",
            WorkflowKind::MultiStepReasoning => "multi_step_reasoning",
            WorkflowKind::FactChecking => "fact_checking",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "simple_qa" => Some(WorkflowKind::SimpleQa),
            "complex_research" => Some(WorkflowKind::ComplexResearch),
            "comparative_analysis" => Some(WorkflowKind::ComparativeAnalysis),
            "multi_step_reasoning" => Some(WorkflowKind::MultiStepReasoning),
            "fact_checking" => Some(WorkflowKind::FactChecking),
            _ => None,
        }
    }

    pub fn definition(&self) -> WorkflowDef {
        match self {
            WorkflowKind::SimpleQa => simple_qa(),
            WorkflowKind::ComplexResearch => complex_research(),
            WorkflowKind::ComparativeAnalysis => comparative_analysis(),
            WorkflowKind::MultiStepReasoning => multi_step_reasoning(),
            WorkflowKind::FactChecking => fact_checking(),
        }
    }
}

/// One hybrid searcher feeding the synthesizer.
fn simple_qa() -> WorkflowDef {
    WorkflowDef::new(
        "simple_qa",
        vec![
            StepDef::new("search", AgentRole::HybridSearcher).weight(0.4),
            StepDef::new("synthesize", AgentRole::AnswerSynthesizer)
                .after(&["search"])
                .weight(0.6),
        ],
    )
    .expect("static workflow is valid")
}

/// Parallel semantic + graph fan-out, merged, synthesized, assessed.
fn complex_research() -> WorkflowDef {
    WorkflowDef::new(
        "complex_research",
        vec![
            StepDef::new("semantic", AgentRole::SemanticSearcher)
                .on_failure(OnFailure::Skip)
                .weight(0.2),
            StepDef::new("graph", AgentRole::GraphSearcher)
                .on_failure(OnFailure::Skip)
                .weight(0.2),
            StepDef::new("merge", AgentRole::Merger)
                .after(&["semantic", "graph"])
                .on_failure(OnFailure::ContinueWithPartial)
                .weight(0.1),
            StepDef::new("synthesize", AgentRole::AnswerSynthesizer)
                .after(&["merge"])
                .weight(0.3),
            StepDef::new("assess", AgentRole::QualityAssessor)
                .after(&["synthesize"])
                .on_failure(OnFailure::Skip)
                .weight(0.2),
        ],
    )
    .expect("static workflow is valid")
}

/// Two semantic searches, one per extracted subject, then comparison.
fn comparative_analysis() -> WorkflowDef {
    WorkflowDef::new(
        "comparative_analysis",
        vec![
            StepDef::new("subject_a", AgentRole::SemanticSearcher)
                .binding(InputBinding::Subject(0))
                .weight(0.2),
            StepDef::new("subject_b", AgentRole::SemanticSearcher)
                .binding(InputBinding::Subject(1))
                .weight(0.2),
            StepDef::new("compare", AgentRole::Comparator)
                .after(&["subject_a", "subject_b"])
                .weight(0.2),
            StepDef::new("synthesize", AgentRole::AnswerSynthesizer)
                .after(&["compare"])
                .weight(0.4),
        ],
    )
    .expect("static workflow is valid")
}

/// Coordinator decomposes, sub-answers are aggregated, then synthesized.
fn multi_step_reasoning() -> WorkflowDef {
    WorkflowDef::new(
        "multi_step_reasoning",
        vec![
            StepDef::new("decompose", AgentRole::Coordinator).weight(0.2),
            StepDef::new("gather", AgentRole::HybridSearcher)
                .after(&["decompose"])
                .binding(InputBinding::DependencyText)
                .weight(0.3),
            StepDef::new("synthesize", AgentRole::AnswerSynthesizer)
                .after(&["gather"])
                .weight(0.5),
        ],
    )
    .expect("static workflow is valid")
}

/// Retrieve, extract claims from the retrieved evidence, then verify every
/// claim against the corpus in parallel, producing per-claim verdicts.
fn fact_checking() -> WorkflowDef {
    WorkflowDef::new(
        "fact_checking",
        vec![
            StepDef::new("search", AgentRole::SemanticSearcher).weight(0.3),
            StepDef::new("claims", AgentRole::ClaimExtractor)
                .after(&["search"])
                .weight(0.3),
            StepDef::new("verdicts", AgentRole::QualityAssessor)
                .after(&["claims", "search"])
                .weight(0.4),
        ],
    )
    .expect("static workflow is valid")
}

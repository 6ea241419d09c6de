//! Rule-based workflow recommendation.
//!
//! A lightweight classifier over surface features of the query: comparison
//! markers, verification markers, multi-part structure, relationship
//! vocabulary. Used when the caller does not pick a workflow explicitly.

use crate::workflow::WorkflowKind;

const COMPARISON_MARKERS: [&str; 6] = [
    " vs ", " versus ", "compare", "difference between", "better than", "pros and cons",
];

const VERIFICATION_MARKERS: [&str; 5] = [
    "is it true", "verify", "fact check", "fact-check", "confirm that",
];

const RELATIONSHIP_MARKERS: [&str; 7] = [
    "related to", "relationship", "connected", "who owns", "who founded", "depends on",
    "impact of",
];

const MULTI_STEP_MARKERS: [&str; 5] = [
    "step by step", "and then", "first", "walk me through", "explain how",
];

pub fn recommend_workflow(query: &str) -> WorkflowKind {
    let lowered = query.to_lowercase();

    if VERIFICATION_MARKERS.iter().any(|m| lowered.contains(m)) {
        return WorkflowKind::FactChecking;
    }
    if COMPARISON_MARKERS.iter().any(|m| lowered.contains(m)) {
        return WorkflowKind::ComparativeAnalysis;
    }

    let question_marks = lowered.matches('?').count();
    if question_marks > 1 || MULTI_STEP_MARKERS.iter().any(|m| lowered.contains(m)) {
        return WorkflowKind::MultiStepReasoning;
    }

    let long_query = lowered.split_whitespace().count() > 20;
    if long_query || RELATIONSHIP_MARKERS.iter().any(|m| lowered.contains(m)) {
        return WorkflowKind::ComplexResearch;
    }

    WorkflowKind::SimpleQa
}

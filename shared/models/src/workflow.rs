use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What the executor does when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Fail the whole workflow.
    Abort,
    /// Mark the step failed, leave its output absent, keep going.
    Skip,
    /// Keep going; dependents must tolerate the absent output.
    ContinueWithPartial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// State of one workflow step inside an execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    /// Written exactly once, by the executor, when the step completes.
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl StepState {
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            output: None,
            error: None,
            elapsed_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Transient record of one orchestrator run; purged after its TTL once
/// terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow: String,
    pub query: String,
    pub status: ExecutionStatus,
    pub steps: HashMap<String, StepState>,
    /// Aggregated confidence in [0, 1] from weighted step confidences.
    pub confidence: f32,
    pub elapsed_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn new(workflow: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow: workflow.into(),
            query: query.into(),
            status: ExecutionStatus::Running,
            steps: HashMap::new(),
            confidence: 0.0,
            elapsed_ms: 0,
            created_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, ExecutionStatus::Running)
    }
}

//! TTL'd registry of workflow execution records.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use corpora_models::workflow::WorkflowExecution;

pub struct ExecutionRegistry {
    executions: DashMap<Uuid, WorkflowExecution>,
    ttl: Duration,
}

impl ExecutionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            executions: DashMap::new(),
            ttl,
        }
    }

    pub fn insert(&self, execution: WorkflowExecution) {
        self.executions.insert(execution.id, execution);
    }

    pub fn update(&self, execution: WorkflowExecution) {
        self.executions.insert(execution.id, execution);
    }

    pub fn get(&self, id: Uuid) -> Option<WorkflowExecution> {
        self.executions.get(&id).map(|e| e.clone())
    }

    /// Snapshot of all live execution records.
    pub fn list(&self) -> Vec<WorkflowExecution> {
        self.executions.iter().map(|e| e.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    /// Drop terminal executions older than the TTL.
    pub fn purge_expired(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        let before = self.executions.len();
        self.executions
            .retain(|_, execution| !(execution.is_terminal() && execution.created_at < cutoff));
        let removed = before - self.executions.len();
        if removed > 0 {
            debug!(removed, "purged expired workflow executions");
        }
    }

    /// Background purger owned by the process root token.
    pub fn spawn_purger(self: &Arc<Self>, token: CancellationToken) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(60)) => registry.purge_expired(),
                }
            }
        });
    }
}

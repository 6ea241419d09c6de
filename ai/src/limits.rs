//! Shared request-path plumbing for all model clients.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use corpora_config::ModelConfig;
use corpora_models::{CoreError, CoreResult};

/// Concurrency limit, bounded in-flight queue and retry budget shared by
/// every model client.
#[derive(Clone)]
pub struct ClientLimits {
    semaphore: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    queue_depth: usize,
    pub request_timeout: Duration,
    pub retries: u32,
}

impl ClientLimits {
    pub fn new(max_concurrency: usize, queue_depth: usize, request_timeout: Duration, retries: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            waiting: Arc::new(AtomicUsize::new(0)),
            queue_depth,
            request_timeout,
            retries,
        }
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(
            config.client_concurrency,
            config.client_queue_depth,
            Duration::from_millis(config.client_timeout_ms),
            config.client_retries,
        )
    }

    /// Admit one request. Saturated queue surfaces as a transient error with
    /// a retry hint instead of unbounded waiting.
    pub async fn acquire(&self) -> CoreResult<OwnedSemaphorePermit> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(permit);
        }
        if self.waiting.fetch_add(1, Ordering::SeqCst) >= self.queue_depth {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(CoreError::transient_after(
                "client queue saturated",
                Duration::from_millis(250),
            ));
        }
        let permit = self.semaphore.clone().acquire_owned().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        permit.map_err(|_| CoreError::Cancelled("client shut down".into()))
    }

    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

/// Exponential backoff with jitter: 200ms, 400ms, 800ms, ... capped at 5s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = 200u64.saturating_mul(1 << attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0..100);
    Duration::from_millis(base.min(5_000) + jitter)
}

/// Run `operation` with retries on transient errors. Retry exhaustion
/// surfaces the last transient error unchanged so the caller can still see
/// the kind.
pub async fn with_retries<T, F, Fut>(retries: u32, operation_name: &str, operation: F) -> CoreResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = CoreResult<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < retries => {
                let delay = backoff_delay(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, retrying: {}",
                    err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

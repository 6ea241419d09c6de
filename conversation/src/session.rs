//! In-memory session registry with idle eviction.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use corpora_models::conversation::Message;

/// Per-conversation session state: the model-context ring plus a mutation
/// lock serializing concurrent sends on the same conversation.
pub struct Session {
    pub conversation_id: Uuid,
    pub owner: String,
    pub knowledge_base_id: Option<Uuid>,
    context: VecDeque<Message>,
    last_activity: Instant,
}

impl Session {
    pub fn context(&self) -> impl Iterator<Item = &Message> {
        self.context.iter()
    }
}

pub struct SessionManager {
    sessions: DashMap<Uuid, Arc<Mutex<Session>>>,
    idle_ttl: Duration,
    context_window: usize,
}

impl SessionManager {
    pub fn new(idle_ttl: Duration, context_window: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_ttl,
            context_window: context_window.max(1),
        }
    }

    /// Fetch or create the session for a conversation.
    pub fn session(
        &self,
        conversation_id: Uuid,
        owner: &str,
        knowledge_base_id: Option<Uuid>,
    ) -> Arc<Mutex<Session>> {
        self.sessions
            .entry(conversation_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(Session {
                    conversation_id,
                    owner: owner.to_string(),
                    knowledge_base_id,
                    context: VecDeque::new(),
                    last_activity: Instant::now(),
                }))
            })
            .clone()
    }

    /// Push a message into the context ring, evicting the oldest beyond the
    /// window, and refresh the activity clock.
    pub async fn remember(&self, session: &Arc<Mutex<Session>>, message: Message) {
        let mut guard = session.lock().await;
        guard.context.push_back(message);
        while guard.context.len() > self.context_window {
            guard.context.pop_front();
        }
        guard.last_activity = Instant::now();
    }

    /// Seed a fresh session's ring from persisted history, oldest first.
    pub async fn seed(&self, session: &Arc<Mutex<Session>>, messages: Vec<Message>) {
        let mut guard = session.lock().await;
        if !guard.context.is_empty() {
            return;
        }
        for message in messages.into_iter().rev().take(self.context_window).rev() {
            guard.context.push_back(message);
        }
        guard.last_activity = Instant::now();
    }

    pub fn context_window(&self) -> usize {
        self.context_window
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Evict sessions idle beyond the TTL.
    pub async fn evict_idle(&self) {
        let mut stale = Vec::new();
        for entry in self.sessions.iter() {
            let session = entry.value().lock().await;
            if session.last_activity.elapsed() > self.idle_ttl {
                stale.push(*entry.key());
            }
        }
        for id in stale {
            debug!(conversation_id = %id, "evicting idle session");
            self.sessions.remove(&id);
        }
    }

    /// Background GC owned by the process root token.
    pub fn spawn_gc(self: &Arc<Self>, token: CancellationToken) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(60)) => manager.evict_idle().await,
                }
            }
        });
    }
}

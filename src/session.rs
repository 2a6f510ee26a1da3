//! Conversation session storage
//!
//! At most one live [`Session`] exists per subject (user id). Stores are
//! pluggable through [`SessionStore`]; [`InMemorySessionStore`] is the default.

use crate::conversation::Stages;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One subject's position in a conversation
#[derive(Clone)]
pub struct Session {
    /// Generation id; a fresh `start` for the same subject gets a new one
    pub id: Uuid,
    /// Owner of the session, the sender's user id
    pub subject: i64,
    /// Chat the conversation runs in
    pub scope: i64,
    /// Index of the next stage to run
    pub cursor: usize,
    pub stages: Stages,
    pub last_activity: Instant,
}

impl Session {
    pub fn new(subject: i64, scope: i64, stages: Stages) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject,
            scope,
            cursor: 0,
            stages,
            last_activity: Instant::now(),
        }
    }

    /// Cursor ran past the last stage
    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.stages.len()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("subject", &self.subject)
            .field("scope", &self.scope)
            .field("cursor", &self.cursor)
            .field("stages", &self.stages.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session store unavailable: {0}")]
    Unavailable(String),

    #[error("Session store operation failed: {0}")]
    Backend(String),
}

/// Storage for conversation sessions keyed by subject.
///
/// Implementations must serialize mutations: a reader never observes a
/// partially written session.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or overwrite the session for `subject`
    async fn store(&self, subject: i64, session: Session) -> Result<(), StoreError>;

    /// Look up a session. `Ok(None)` is the common case, not an error.
    async fn get(&self, subject: i64) -> Result<Option<Session>, StoreError>;

    /// Remove a session; removing an absent subject is a no-op
    async fn remove(&self, subject: i64) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: SessionStore + ?Sized> SessionStore for Arc<T> {
    async fn store(&self, subject: i64, session: Session) -> Result<(), StoreError> {
        (**self).store(subject, session).await
    }

    async fn get(&self, subject: i64) -> Result<Option<Session>, StoreError> {
        (**self).get(subject).await
    }

    async fn remove(&self, subject: i64) -> Result<(), StoreError> {
        (**self).remove(subject).await
    }
}

/// Process-local store behind a single reader/writer lock
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<i64, Session>>,
    /// Sessions idle longer than this are treated as gone
    idle_timeout: Option<Duration>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expire sessions that saw no activity for `timeout`
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    fn is_expired(&self, session: &Session) -> bool {
        self.idle_timeout
            .is_some_and(|timeout| session.last_activity.elapsed() >= timeout)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Drop every expired session, returning how many were removed
    pub async fn evict_idle(&self) -> usize {
        if self.idle_timeout.is_none() {
            return 0;
        }
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|subject, session| {
            let keep = !self.is_expired(session);
            if !keep {
                tracing::info!(subject, scope = session.scope, "Evicting idle conversation");
            }
            keep
        });
        before - sessions.len()
    }

    /// Run [`evict_idle`](Self::evict_idle) every `interval` until `cancel`
    /// fires or the store is dropped.
    pub fn spawn_eviction(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        // Weak reference so the task does not keep the store alive
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                let Some(store) = store.upgrade() else {
                    tracing::debug!("Session store dropped, eviction task exiting");
                    break;
                };
                let evicted = store.evict_idle().await;
                if evicted > 0 {
                    tracing::debug!(evicted, "Evicted idle sessions");
                }
            }
        })
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn store(&self, subject: i64, session: Session) -> Result<(), StoreError> {
        self.sessions.write().await.insert(subject, session);
        Ok(())
    }

    async fn get(&self, subject: i64) -> Result<Option<Session>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(&subject)
            .filter(|session| !self.is_expired(session))
            .cloned())
    }

    async fn remove(&self, subject: i64) -> Result<(), StoreError> {
        self.sessions.write().await.remove(&subject);
        Ok(())
    }
}

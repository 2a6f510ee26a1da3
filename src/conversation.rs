//! Per-user conversation state machine
//!
//! A conversation is an ordered list of stage handlers. Each subject (user)
//! owns at most one session, whose cursor points at the stage that handles
//! that user's next update:
//!
//! ```text
//! absent --start--> stage 0 --success--> stage 1 --success--> ... --success--> absent
//!                   stage i --repeat---> stage i
//!                   stage i --end------> absent
//!                   stage i --failure--> stage i   (error returned to caller)
//! ```
//!
//! Routing is left to the application: it decides when to call
//! [`ConversationEngine::start`] and checks [`ConversationEngine::has_active`]
//! before [`ConversationEngine::advance`].

use crate::session::{InMemorySessionStore, Session, SessionStore, StoreError};
use crate::types::Update;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

#[cfg(test)]
mod proptests;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What a stage handler asks the engine to do next
pub enum StageOutcome {
    /// Move on to the next stage; completes the conversation after the last one
    Success,
    /// Run the same stage again on the subject's next update
    Repeat,
    /// Tear the conversation down now
    End,
    /// Leave the session untouched and report the error to the caller
    Failure(BoxError),
}

impl StageOutcome {
    pub fn failure(error: impl Into<BoxError>) -> Self {
        Self::Failure(error.into())
    }
}

impl fmt::Debug for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::Repeat => write!(f, "Repeat"),
            Self::End => write!(f, "End"),
            Self::Failure(e) => write!(f, "Failure({e})"),
        }
    }
}

/// `Ok(())` is success, any error is a failure
impl<E: Into<BoxError>> From<Result<(), E>> for StageOutcome {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(e) => Self::Failure(e.into()),
        }
    }
}

/// One step of a conversation
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn handle(&self, update: Update) -> StageOutcome;
}

#[async_trait]
impl<F, Fut> StageHandler for F
where
    F: Fn(Update) -> Fut + Send + Sync,
    Fut: Future<Output = StageOutcome> + Send,
{
    async fn handle(&self, update: Update) -> StageOutcome {
        (self)(update).await
    }
}

/// Immutable, shared, non-empty list of stage handlers
#[derive(Clone)]
pub struct Stages(Arc<[Arc<dyn StageHandler>]>);

impl Stages {
    pub fn new(handlers: Vec<Arc<dyn StageHandler>>) -> Result<Self, ConversationError> {
        if handlers.is_empty() {
            return Err(ConversationError::EmptyStages);
        }
        Ok(Self(handlers.into()))
    }

    pub fn builder() -> StagesBuilder {
        StagesBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false for a constructed list; kept for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<dyn StageHandler>> {
        self.0.get(index)
    }
}

impl fmt::Debug for Stages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stages({})", self.len())
    }
}

#[derive(Default)]
pub struct StagesBuilder {
    handlers: Vec<Arc<dyn StageHandler>>,
}

impl StagesBuilder {
    #[must_use]
    pub fn stage<H: StageHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<Stages, ConversationError> {
        Stages::new(self.handlers)
    }
}

/// What a `start` or `advance` call did to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Stage succeeded; `next_stage` runs on the subject's next update
    Advanced { next_stage: usize },
    /// Stage asked to run again
    Repeated { stage: usize },
    /// Stage ended the conversation early
    Ended { stage: usize },
    /// Last stage succeeded; the session is gone
    Completed,
}

impl Progress {
    /// Whether the session is still live after this step
    pub fn is_active(self) -> bool {
        matches!(self, Self::Advanced { .. } | Self::Repeated { .. })
    }
}

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("Conversation needs at least one stage")]
    EmptyStages,

    #[error("Update {update_id} has no sender or chat to key a conversation on")]
    MissingSubject { update_id: i64 },

    #[error("No active conversation for user {subject}")]
    NoActiveSession { subject: i64 },

    #[error("Conversation for user {subject} already ran all {stages} stages")]
    ConversationEnded { subject: i64, stages: usize },

    #[error("Stage {stage} failed for user {subject}: {source}")]
    Stage {
        subject: i64,
        stage: usize,
        source: BoxError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-subject async locks. An entry lives while someone holds or waits on
/// its lock.
#[derive(Default)]
struct SubjectLocks {
    locks: Mutex<HashMap<i64, Weak<tokio::sync::Mutex<()>>>>,
}

impl SubjectLocks {
    async fn acquire(self: &Arc<Self>, subject: i64) -> SubjectGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            let existing = locks.get(&subject).and_then(Weak::upgrade);
            match existing {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(tokio::sync::Mutex::new(()));
                    locks.insert(subject, Arc::downgrade(&lock));
                    lock
                }
            }
        };
        SubjectGuard {
            subject,
            guard: Some(lock.lock_owned().await),
            locks: Arc::clone(self),
        }
    }

    fn prune(&self, subject: i64) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(&subject).is_some_and(|lock| lock.strong_count() == 0) {
            locks.remove(&subject);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct SubjectGuard {
    subject: i64,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<SubjectLocks>,
}

impl Drop for SubjectGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.prune(self.subject);
    }
}

/// Runs stage handlers against sessions held in a [`SessionStore`].
///
/// `start`, `advance` and `end` for one subject are serialized: the session
/// load, the stage run and the write-back happen under a per-subject lock
/// shared by all clones of the engine. Stage handlers must not call back into
/// the engine for their own subject; they return [`StageOutcome::End`]
/// instead.
pub struct ConversationEngine<S: SessionStore = InMemorySessionStore> {
    store: Arc<S>,
    locks: Arc<SubjectLocks>,
}

impl<S: SessionStore> Clone for ConversationEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            locks: Arc::clone(&self.locks),
        }
    }
}

impl ConversationEngine<InMemorySessionStore> {
    /// Engine over a fresh process-local store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemorySessionStore::new()))
    }
}

impl<S: SessionStore> ConversationEngine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            locks: Arc::default(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Subject (user id) and scope (chat id) an update belongs to
    fn keys(update: &Update) -> Result<(i64, i64), ConversationError> {
        match (update.user_id(), update.chat_id()) {
            (Some(subject), Some(scope)) => Ok((subject, scope)),
            _ => Err(ConversationError::MissingSubject {
                update_id: update.id,
            }),
        }
    }

    /// Begin a conversation for the update's sender and run stage 0 on the
    /// same update. Replaces any session the sender already had.
    pub async fn start(
        &self,
        stages: &Stages,
        update: &Update,
    ) -> Result<Progress, ConversationError> {
        let (subject, scope) = Self::keys(update)?;
        let _guard = self.locks.acquire(subject).await;
        let session = Session::new(subject, scope, stages.clone());
        self.store.store(subject, session.clone()).await?;
        tracing::info!(subject, scope, stages = stages.len(), "Conversation started");
        self.run_stage(session, update).await
    }

    /// True iff `subject` has a session bound to chat `scope`.
    ///
    /// Store failures are logged and reported as no session.
    pub async fn has_active(&self, scope: i64, subject: i64) -> bool {
        match self.try_has_active(scope, subject).await {
            Ok(active) => active,
            Err(e) => {
                tracing::warn!(subject, scope, error = %e, "Session lookup failed");
                false
            }
        }
    }

    pub async fn try_has_active(&self, scope: i64, subject: i64) -> Result<bool, StoreError> {
        Ok(self
            .store
            .get(subject)
            .await?
            .is_some_and(|session| session.scope == scope))
    }

    /// [`has_active`](Self::has_active) keyed by the update's chat and sender
    pub async fn has_active_for(&self, update: &Update) -> bool {
        match Self::keys(update) {
            Ok((subject, scope)) => self.has_active(scope, subject).await,
            Err(_) => false,
        }
    }

    /// Run the sender's current stage on `update`
    pub async fn advance(&self, update: &Update) -> Result<Progress, ConversationError> {
        let (subject, scope) = Self::keys(update)?;
        let _guard = self.locks.acquire(subject).await;
        let session = match self.store.get(subject).await? {
            Some(session) if session.scope == scope => session,
            Some(session) => {
                tracing::debug!(
                    subject,
                    scope,
                    session_scope = session.scope,
                    "Ignoring update from another chat"
                );
                return Err(ConversationError::NoActiveSession { subject });
            }
            None => return Err(ConversationError::NoActiveSession { subject }),
        };
        self.run_stage(session, update).await
    }

    /// Drop the subject's session, if any
    pub async fn end(&self, subject: i64) -> Result<(), ConversationError> {
        let _guard = self.locks.acquire(subject).await;
        self.store.remove(subject).await?;
        tracing::info!(subject, "Conversation ended by caller");
        Ok(())
    }

    async fn run_stage(
        &self,
        mut session: Session,
        update: &Update,
    ) -> Result<Progress, ConversationError> {
        let subject = session.subject;
        let stage = session.cursor;

        let Some(handler) = session.stages.get(stage).cloned() else {
            self.remove_if_current(&session).await?;
            return Err(ConversationError::ConversationEnded {
                subject,
                stages: session.stages.len(),
            });
        };

        match handler.handle(update.clone()).await {
            StageOutcome::Success => {
                session.cursor += 1;
                if session.is_exhausted() {
                    self.remove_if_current(&session).await?;
                    tracing::info!(subject, stages = session.stages.len(), "Conversation completed");
                    Ok(Progress::Completed)
                } else {
                    session.touch();
                    let next_stage = session.cursor;
                    self.store_if_current(session).await?;
                    tracing::debug!(subject, next_stage, "Conversation advanced");
                    Ok(Progress::Advanced { next_stage })
                }
            }
            StageOutcome::Repeat => {
                session.touch();
                self.store_if_current(session).await?;
                tracing::debug!(subject, stage, "Repeating conversation stage");
                Ok(Progress::Repeated { stage })
            }
            StageOutcome::End => {
                self.remove_if_current(&session).await?;
                tracing::info!(subject, stage, "Conversation ended by stage");
                Ok(Progress::Ended { stage })
            }
            StageOutcome::Failure(source) => Err(ConversationError::Stage {
                subject,
                stage,
                source,
            }),
        }
    }

    /// Write back unless a newer session replaced this one while the stage ran
    async fn store_if_current(&self, session: Session) -> Result<(), StoreError> {
        match self.store.get(session.subject).await? {
            Some(current) if current.id == session.id => {
                self.store.store(session.subject, session).await
            }
            _ => {
                tracing::debug!(
                    subject = session.subject,
                    "Session replaced or removed during stage, dropping stale progress"
                );
                Ok(())
            }
        }
    }

    async fn remove_if_current(&self, session: &Session) -> Result<(), StoreError> {
        match self.store.get(session.subject).await? {
            Some(current) if current.id == session.id => self.store.remove(session.subject).await,
            _ => Ok(()),
        }
    }
}

//! Long-poll update loop
//!
//! One background task repeatedly calls `getUpdates` with the current offset,
//! drops anything already acknowledged, and pushes new updates into a bounded
//! channel. The read side is an [`UpdateStream`]; cancellation goes through
//! the [`PollerHandle`].

use crate::conversation::{ConversationEngine, ConversationError};
use crate::session::SessionStore;
use crate::transport::{Transport, UpdateParams};
use crate::types::Update;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod proptests;

/// Pause between successful cycles
pub const CYCLE_SLEEP: Duration = Duration::from_secs(1);

/// Pause after a failed fetch
pub const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Acknowledgement watermark: the smallest update id not yet seen.
///
/// Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    next_offset: i64,
}

impl Watermark {
    pub fn new(offset: i64) -> Self {
        Self {
            next_offset: offset,
        }
    }

    pub fn next_offset(self) -> i64 {
        self.next_offset
    }

    /// Acknowledge `id`. Returns false for ids below the watermark, which
    /// must not be delivered again, and for `i64::MAX`, which has no
    /// successor offset.
    pub fn admit(&mut self, id: i64) -> bool {
        if id < self.next_offset {
            return false;
        }
        let Some(next) = id.checked_add(1) else {
            tracing::warn!(update_id = id, "Update id has no successor offset, skipping");
            return false;
        };
        self.next_offset = next;
        true
    }
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Starting offset, result cap (also the delivery buffer size), long-poll
    /// timeout and allowed update kinds
    pub params: UpdateParams,
    pub cycle_sleep: Duration,
    pub error_backoff: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            params: UpdateParams::default(),
            cycle_sleep: CYCLE_SLEEP,
            error_backoff: ERROR_BACKOFF,
        }
    }
}

impl PollerConfig {
    fn buffer_capacity(&self) -> usize {
        usize::try_from(self.params.limit).unwrap_or(1).max(1)
    }
}

/// Where the poller sends an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Push onto the update stream
    Deliver,
    /// Handled elsewhere; acknowledge without delivering
    Consumed,
}

/// Decides, per update, whether the update stream sees it
#[async_trait]
pub trait UpdateRouter: Send + Sync {
    async fn route(&self, update: &Update) -> Route;
}

/// Default router: everything goes to the update stream
pub struct DeliverAll;

#[async_trait]
impl UpdateRouter for DeliverAll {
    async fn route(&self, _update: &Update) -> Route {
        Route::Deliver
    }
}

/// Sends updates belonging to an active conversation straight to the
/// conversation engine, each on its own task. Everything else is delivered.
///
/// The engine serializes advances per user, but two updates of the same user
/// from one batch may be applied in either order; applications needing
/// arrival order should route from the stream instead.
pub struct ConversationRouter<S: SessionStore + 'static> {
    engine: ConversationEngine<S>,
}

impl<S: SessionStore + 'static> ConversationRouter<S> {
    pub fn new(engine: ConversationEngine<S>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl<S: SessionStore + 'static> UpdateRouter for ConversationRouter<S> {
    async fn route(&self, update: &Update) -> Route {
        if !self.engine.has_active_for(update).await {
            return Route::Deliver;
        }

        let engine = self.engine.clone();
        let update = update.clone();
        tokio::spawn(async move {
            match engine.advance(&update).await {
                Ok(progress) => {
                    tracing::debug!(update_id = update.id, ?progress, "Conversation update handled");
                }
                // Session vanished between the check and the call
                Err(ConversationError::NoActiveSession { subject }) => {
                    tracing::debug!(update_id = update.id, subject, "Conversation gone before advance");
                }
                Err(e) => {
                    tracing::error!(update_id = update.id, error = %e, "Conversation stage failed");
                }
            }
        });
        Route::Consumed
    }
}

/// Read side of the delivery buffer.
///
/// Yields updates in non-decreasing id order and ends once the poller stops.
pub struct UpdateStream {
    inner: ReceiverStream<Update>,
}

impl UpdateStream {
    pub fn from_receiver(rx: mpsc::Receiver<Update>) -> Self {
        Self {
            inner: ReceiverStream::new(rx),
        }
    }

    /// Next update, or `None` once the poller stopped and the buffer drained
    pub async fn recv(&mut self) -> Option<Update> {
        futures::StreamExt::next(&mut self.inner).await
    }
}

impl Stream for UpdateStream {
    type Item = Update;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Update>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Control handle for a running poller
pub struct PollerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    next_offset: Arc<AtomicI64>,
}

impl PollerHandle {
    /// Ask the loop to stop. It checks at cycle boundaries and while waiting;
    /// an in-flight fetch finishes first.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current watermark as last published by the loop
    pub fn next_offset(&self) -> i64 {
        self.next_offset.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel and wait for the loop to exit
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Poller task panicked");
        }
    }
}

/// Drives the fetch-deliver loop against a [`Transport`]
pub struct Poller<T: Transport + 'static> {
    transport: Arc<T>,
    config: PollerConfig,
    router: Arc<dyn UpdateRouter>,
}

impl<T: Transport + 'static> Poller<T> {
    pub fn new(transport: Arc<T>, config: PollerConfig) -> Self {
        Self {
            transport,
            config,
            router: Arc::new(DeliverAll),
        }
    }

    #[must_use]
    pub fn with_router(mut self, router: Arc<dyn UpdateRouter>) -> Self {
        self.router = router;
        self
    }

    /// Spawn the loop on the current tokio runtime
    pub fn start(self) -> (UpdateStream, PollerHandle) {
        self.start_with_token(CancellationToken::new())
    }

    /// Like [`start`](Self::start), stopping when `cancel` (or any parent
    /// token) is cancelled
    pub fn start_with_token(self, cancel: CancellationToken) -> (UpdateStream, PollerHandle) {
        let (tx, rx) = mpsc::channel(self.config.buffer_capacity());
        let next_offset = Arc::new(AtomicI64::new(self.config.params.offset));

        let task = tokio::spawn(self.run(tx, cancel.clone(), Arc::clone(&next_offset)));

        (
            UpdateStream::from_receiver(rx),
            PollerHandle {
                cancel,
                task,
                next_offset,
            },
        )
    }

    async fn run(self, tx: mpsc::Sender<Update>, cancel: CancellationToken, published: Arc<AtomicI64>) {
        let mut params = self.config.params.clone();
        let mut watermark = Watermark::new(params.offset);
        tracing::info!(
            offset = params.offset,
            limit = params.limit,
            timeout_secs = params.timeout,
            "Started polling updates"
        );

        'poll: loop {
            if cancel.is_cancelled() {
                break;
            }

            params.offset = watermark.next_offset();
            let mut updates = match self.transport.fetch_updates(&params).await {
                Ok(updates) => updates,
                Err(e) => {
                    let backoff = e
                        .retry_after
                        .map_or(self.config.error_backoff, |wait| {
                            wait.max(self.config.error_backoff)
                        });
                    tracing::warn!(
                        offset = params.offset,
                        error = %e,
                        retryable = e.is_retryable(),
                        backoff_ms = %backoff.as_millis(),
                        "Fetching updates failed"
                    );
                    if sleep_or_cancel(backoff, &cancel).await {
                        break;
                    }
                    continue;
                }
            };

            updates.sort_by_key(|u| u.id);
            for update in updates {
                if !watermark.admit(update.id) {
                    tracing::debug!(
                        update_id = update.id,
                        next_offset = watermark.next_offset(),
                        "Skipping already acknowledged update"
                    );
                    continue;
                }
                published.store(watermark.next_offset(), Ordering::Release);

                if update.kind().is_none() {
                    tracing::debug!(update_id = update.id, "Skipping update without a known payload");
                    continue;
                }

                if self.router.route(&update).await == Route::Consumed {
                    continue;
                }

                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break 'poll,
                    sent = tx.send(update) => {
                        if sent.is_err() {
                            tracing::info!("Update stream dropped, stopping poller");
                            break 'poll;
                        }
                    }
                }
            }

            if sleep_or_cancel(self.config.cycle_sleep, &cancel).await {
                break;
            }
        }

        tracing::info!(next_offset = watermark.next_offset(), "Stopped polling updates");
    }
}

/// Sleep for `duration`; true if cancelled first
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(duration) => false,
    }
}

//! Concurrent update handling
//!
//! Drains an [`UpdateStream`] and runs one handler task per update, capped by
//! a semaphore. When every permit is taken the dispatcher stops reading, so
//! the poller's buffer fills and the poller waits in turn.

use crate::conversation::BoxError;
use crate::poller::UpdateStream;
use crate::types::Update;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

pub const DEFAULT_MAX_CONCURRENCY: usize = 16;

#[derive(Debug, Clone)]
pub struct Dispatcher {
    limit: Arc<Semaphore>,
    max_concurrency: usize,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENCY)
    }
}

impl Dispatcher {
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            limit: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Run `handler` for every update until the stream ends, then wait for
    /// in-flight handlers. Handler errors and panics are logged and do not
    /// stop the loop.
    pub async fn run<H, Fut>(&self, mut updates: UpdateStream, handler: H)
    where
        H: Fn(Update) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let mut tasks = JoinSet::new();

        while let Some(update) = updates.recv().await {
            let Ok(permit) = Arc::clone(&self.limit).acquire_owned().await else {
                tracing::error!("Dispatcher semaphore closed");
                break;
            };

            let handler = Arc::clone(&handler);
            tasks.spawn(async move {
                let update_id = update.id;
                if let Err(e) = handler(update).await {
                    tracing::error!(update_id, error = %e, "Update handler failed");
                }
                drop(permit);
            });

            while let Some(joined) = tasks.try_join_next() {
                log_join_result(joined);
            }
        }

        tracing::debug!(in_flight = tasks.len(), "Update stream ended, waiting for handlers");
        while let Some(joined) = tasks.join_next().await {
            log_join_result(joined);
        }
    }
}

fn log_join_result(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!(error = %e, "Update handler panicked");
        } else {
            tracing::warn!(error = %e, "Update handler cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::updates_with_ids;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn stream_of(ids: &[i64]) -> UpdateStream {
        let updates = updates_with_ids(ids);
        let (tx, rx) = mpsc::channel(updates.len().max(1));
        for update in updates {
            tx.try_send(update).unwrap();
        }
        UpdateStream::from_receiver(rx)
    }

    #[tokio::test]
    async fn test_runs_every_update_and_waits_for_completion() {
        let handled = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&handled);

        Dispatcher::new(4)
            .run(stream_of(&[1, 2, 3, 4, 5]), move |update: Update| {
                let seen = Arc::clone(&seen);
                async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    seen.lock().unwrap().push(update.id);
                    Ok::<(), BoxError>(())
                }
            })
            .await;

        let mut ids = handled.lock().unwrap().clone();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));

        Dispatcher::new(2)
            .run(stream_of(&[1, 2, 3, 4, 5, 6, 7, 8]), move |_update: Update| {
                let (active, peak) = (Arc::clone(&a), Arc::clone(&p));
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), BoxError>(())
                }
            })
            .await;

        assert_eq!(active.load(Ordering::SeqCst), 0);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_failures_and_panics_do_not_stop_dispatch() {
        let completed = Arc::new(AtomicUsize::new(0));
        let done = Arc::clone(&completed);

        Dispatcher::new(1)
            .run(stream_of(&[1, 2, 3]), move |update: Update| {
                let done = Arc::clone(&done);
                async move {
                    match update.id {
                        1 => Err::<(), BoxError>("handler failed".into()),
                        2 => panic!("handler panicked"),
                        _ => {
                            done.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }
                }
            })
            .await;

        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_concurrency_is_raised_to_one() {
        assert_eq!(Dispatcher::new(0).max_concurrency(), 1);
        assert_eq!(Dispatcher::default().max_concurrency(), DEFAULT_MAX_CONCURRENCY);
    }
}

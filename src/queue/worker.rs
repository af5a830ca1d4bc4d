//! Background queue worker: polls the queue, runs the engine for each claimed
//! item and records the result back on the item.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{QueueItem, QueueStore};
use crate::engine::{EngineError, TranslationEngine};
use crate::metrics::metric_names;
use crate::progress::RunStatus;
use crate::storage::StoreResult;

pub struct QueueWorker {
    queue: Arc<QueueStore>,
    engine: Arc<TranslationEngine>,
    poll_interval: Duration,
    batch_size: usize,
}

impl QueueWorker {
    pub fn new(
        queue: Arc<QueueStore>,
        engine: Arc<TranslationEngine>,
        poll_interval: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            queue,
            engine,
            poll_interval,
            batch_size: batch_size.max(1),
        }
    }

    /// Claim up to `batch_size` due items and process them one after another.
    /// Returns how many items were handled.
    pub async fn run_once(&self) -> StoreResult<usize> {
        let mut handled = 0;
        while handled < self.batch_size {
            let Some(item) = self.queue.claim_next()? else {
                break;
            };
            self.process(item).await?;
            handled += 1;
        }
        Ok(handled)
    }

    async fn process(&self, item: QueueItem) -> StoreResult<()> {
        let span = self.engine.metrics().span(metric_names::QUEUE_ITEM);
        let languages: Vec<String> = item.target_languages.iter().cloned().collect();
        info!(
            item_id = item.id,
            post_id = item.post_id,
            attempt = item.attempts + 1,
            "processing queue item"
        );

        match self.engine.translate_post(item.post_id, &languages).await {
            Ok(outcome) if outcome.status == RunStatus::Completed => {
                self.queue.complete(item.id)?;
                self.engine.metrics().increment(metric_names::QUEUE_COMPLETED, 1);
                info!(
                    item_id = item.id,
                    progress_id = %outcome.progress_id,
                    "queue item completed"
                );
            }
            Ok(outcome) => {
                let failed: Vec<String> = outcome
                    .languages
                    .iter()
                    .filter(|l| !l.errors.is_empty())
                    .map(|l| format!("{}: {}", l.language, l.errors.join("; ")))
                    .collect();
                let message = if failed.is_empty() {
                    format!("run ended {:?}", outcome.status).to_lowercase()
                } else {
                    failed.join(" | ")
                };
                self.queue.fail(item.id, &message, true)?;
                self.engine.metrics().increment(metric_names::QUEUE_FAILED, 1);
            }
            Err(e) => {
                // A missing post or an empty language set will not fix itself.
                let retryable = matches!(e, EngineError::Store(_));
                error!(item_id = item.id, error = %e, retryable, "queue item run failed");
                self.queue.fail(item.id, &e.to_string(), retryable)?;
                self.engine.metrics().increment(metric_names::QUEUE_FAILED, 1);
            }
        }
        span.finish();
        Ok(())
    }

    /// Spawn the polling loop. Runs until `shutdown` fires; an item already
    /// being processed finishes first.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            match self.queue.recover_stale() {
                Ok(_) => {}
                Err(e) => warn!(error = %e, "stale queue recovery failed"),
            }
            info!(
                poll_ms = self.poll_interval.as_millis() as u64,
                batch_size = self.batch_size,
                "queue worker started"
            );
            loop {
                if let Err(e) = self.run_once().await {
                    error!(error = %e, "queue worker pass failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
            info!("queue worker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{harness, seed};
    use crate::queue::{EnqueueRequest, QueueStatus};
    use crate::storage::Database;
    use crate::translate::mock::MockTranslator;
    use crate::translate::TranslateError;

    fn enqueue(queue: &QueueStore, post_id: i64, priority: u8) -> QueueItem {
        queue
            .enqueue(&EnqueueRequest {
                post_id,
                target_languages: ["fr".to_string()].into_iter().collect(),
                priority,
                scheduled_time: None,
                max_attempts: 2,
            })
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_once_completes_successful_items() {
        let h = harness(MockTranslator::new());
        let source = seed(&h.posts);
        let queue = Arc::new(QueueStore::open(&Database::memory(), 60).unwrap());
        let item = enqueue(&queue, source, 5);

        let worker = QueueWorker::new(queue.clone(), h.engine.clone(), Duration::from_secs(5), 2);
        assert_eq!(worker.run_once().await.unwrap(), 1);
        assert_eq!(queue.get(item.id).unwrap().unwrap().status, QueueStatus::Completed);
        assert!(h.engine.relationships().get(source, "fr").unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_run_is_rescheduled() {
        let h = harness(MockTranslator::new().fail_always("Second", || TranslateError::Timeout));
        let source = seed(&h.posts);
        let queue = Arc::new(QueueStore::open(&Database::memory(), 60).unwrap());
        let item = enqueue(&queue, source, 5);

        let worker = QueueWorker::new(queue.clone(), h.engine.clone(), Duration::from_secs(5), 2);
        worker.run_once().await.unwrap();
        let after = queue.get(item.id).unwrap().unwrap();
        assert_eq!(after.status, QueueStatus::Pending);
        assert_eq!(after.attempts, 1);
        assert!(after.error_message.unwrap().starts_with("fr: block:1"));
        // not due yet
        assert_eq!(worker.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_post_fails_permanently() {
        let h = harness(MockTranslator::new());
        let queue = Arc::new(QueueStore::open(&Database::memory(), 60).unwrap());
        let item = enqueue(&queue, 999, 5);

        let worker = QueueWorker::new(queue.clone(), h.engine.clone(), Duration::from_secs(5), 1);
        worker.run_once().await.unwrap();
        let after = queue.get(item.id).unwrap().unwrap();
        assert_eq!(after.status, QueueStatus::Failed);
        assert_eq!(after.error_message.as_deref(), Some("post 999 not found"));
    }

    #[tokio::test]
    async fn test_paused_queue_is_left_alone() {
        let h = harness(MockTranslator::new());
        let source = seed(&h.posts);
        let queue = Arc::new(QueueStore::open(&Database::memory(), 60).unwrap());
        enqueue(&queue, source, 5);
        queue.pause().unwrap();

        let worker = QueueWorker::new(queue.clone(), h.engine.clone(), Duration::from_secs(5), 2);
        assert_eq!(worker.run_once().await.unwrap(), 0);
        assert_eq!(h.translator.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_worker_stops_on_shutdown() {
        let h = harness(MockTranslator::new());
        let source = seed(&h.posts);
        let queue = Arc::new(QueueStore::open(&Database::memory(), 60).unwrap());
        let item = enqueue(&queue, source, 5);

        let shutdown = CancellationToken::new();
        let worker = Arc::new(QueueWorker::new(
            queue.clone(),
            h.engine.clone(),
            Duration::from_millis(50),
            1,
        ));
        let handle = worker.spawn(shutdown.clone());

        while queue.get(item.id).unwrap().unwrap().status != QueueStatus::Completed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();
    }
}

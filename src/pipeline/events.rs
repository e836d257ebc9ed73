// ABOUTME: Change event delivery for one pipeline, confirmed or through a background worker
// ABOUTME: Fire-and-forget events are handed to a single worker so the topic sees load order

use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::record::Record;
use crate::sink::{EventPublisher, PublishMode};
use crate::utils::with_timeout;

enum PublishJob {
    Event(Record),
    /// Answered once every event queued before it has been attempted
    Flush(oneshot::Sender<()>),
}

/// Publishes loaded records to the pipeline's topic.
///
/// In `FireAndForget` mode the load stage only enqueues; one worker task per
/// pipeline drains the queue in order. `Confirmed` publishes inline.
pub(super) struct EventQueue {
    pipeline: String,
    topic: String,
    mode: PublishMode,
    timeout: Duration,
    publisher: Arc<dyn EventPublisher>,
    worker: OnceLock<mpsc::UnboundedSender<PublishJob>>,
}

impl EventQueue {
    pub(super) fn new(
        pipeline: &str,
        topic: &str,
        mode: PublishMode,
        timeout: Duration,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            topic: topic.to_string(),
            mode,
            timeout,
            publisher,
            worker: OnceLock::new(),
        }
    }

    /// Publish one loaded record. Failures are logged and never surface to the caller.
    pub(super) async fn publish(&self, record: &Record) {
        match self.mode {
            PublishMode::Confirmed => {
                deliver(&self.topic, self.timeout, self.publisher.as_ref(), record).await
            }
            PublishMode::FireAndForget => {
                if self.sender().send(PublishJob::Event(record.clone())).is_err() {
                    tracing::warn!(
                        "Event worker of {} is gone, dropping event for {}",
                        self.pipeline,
                        record.entity_id
                    );
                }
            }
        }
    }

    /// Wait until every event enqueued so far has been attempted.
    pub(super) async fn flush(&self) {
        let Some(worker) = self.worker.get() else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if worker.send(PublishJob::Flush(done_tx)).is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    fn sender(&self) -> &mpsc::UnboundedSender<PublishJob> {
        self.worker.get_or_init(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_worker(
                self.pipeline.clone(),
                self.topic.clone(),
                self.timeout,
                self.publisher.clone(),
                rx,
            ));
            tx
        })
    }
}

async fn run_worker(
    pipeline: String,
    topic: String,
    timeout: Duration,
    publisher: Arc<dyn EventPublisher>,
    mut jobs: mpsc::UnboundedReceiver<PublishJob>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            PublishJob::Event(record) => {
                deliver(&topic, timeout, publisher.as_ref(), &record).await
            }
            PublishJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("Event worker of {} stopped", pipeline);
}

async fn deliver(topic: &str, timeout: Duration, publisher: &dyn EventPublisher, record: &Record) {
    match with_timeout("publish", timeout, publisher.publish(topic, record)).await {
        Ok(()) => tracing::debug!("Delivered {} to {}", record.entity_id, topic),
        Err(e) => tracing::warn!(
            "Failed to publish {} to {}: {:?}",
            record.entity_id,
            topic,
            e
        ),
    }
}

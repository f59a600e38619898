//! Fire-and-forget client-side usage batching.
//!
//! Callers that cannot afford one aggregator write per request queue events
//! in a [`UsageBatcher`] instead. The queue flushes when it reaches the
//! batch-size threshold or on a timer, collapsing the drained events into
//! one aggregated event per deployment (summed tokens, averaged latency,
//! OR'd error flag) before handing them to the [`UsageSink`].
//!
//! A failed send re-queues the batch at the head rather than dropping it,
//! the queue is capped to bound memory, and errors are logged, never
//! thrown, so request-serving latency is unaffected.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use fleet_core::{DeploymentId, FleetResult};

use crate::usage::{UsageAggregator, UsageEvent};

/// Destination for flushed usage batches.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Deliver one aggregated event per deployment.
    async fn send(&self, batch: Vec<UsageEvent>) -> FleetResult<()>;
}

/// The in-process wiring: flushed batches fold straight into the
/// aggregator.
#[async_trait]
impl UsageSink for UsageAggregator {
    async fn send(&self, batch: Vec<UsageEvent>) -> FleetResult<()> {
        for event in batch {
            self.record(event).await;
        }
        Ok(())
    }
}

/// Batcher configuration.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Queue length that triggers an immediate flush.
    pub max_batch: usize,
    /// Timer interval between background flushes.
    pub flush_interval: Duration,
    /// Hard cap on queued events; the oldest are dropped past it.
    pub max_queue: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch: 20,
            flush_interval: Duration::from_secs(10),
            max_queue: 1000,
        }
    }
}

impl BatcherConfig {
    /// Set the flush threshold.
    #[must_use]
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    /// Set the timer interval.
    #[must_use]
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the queue cap.
    #[must_use]
    pub fn with_max_queue(mut self, max_queue: usize) -> Self {
        self.max_queue = max_queue.max(1);
        self
    }
}

/// Queues usage events and flushes them in aggregated batches.
pub struct UsageBatcher {
    config: BatcherConfig,
    sink: Arc<dyn UsageSink>,
    queue: Mutex<VecDeque<UsageEvent>>,
}

impl std::fmt::Debug for UsageBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageBatcher")
            .field("config", &self.config)
            .field("pending", &self.pending())
            .finish()
    }
}

impl UsageBatcher {
    /// Create a new batcher over the given sink.
    pub fn new(sink: Arc<dyn UsageSink>, config: BatcherConfig) -> Self {
        Self {
            config,
            sink,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Number of events currently queued.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Queue one event, flushing if the threshold is reached.
    pub async fn record(&self, event: UsageEvent) {
        let should_flush = {
            let mut queue = self.queue.lock();
            while queue.len() >= self.config.max_queue {
                queue.pop_front();
            }
            queue.push_back(event);
            queue.len() >= self.config.max_batch
        };
        if should_flush {
            self.flush().await;
        }
    }

    /// Drain the queue and send one aggregated event per deployment. On
    /// failure the drained events go back to the head of the queue.
    pub async fn flush(&self) {
        let drained: Vec<UsageEvent> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        if drained.is_empty() {
            return;
        }

        let batch = aggregate(&drained);
        match self.sink.send(batch).await {
            Ok(()) => {
                debug!(events = drained.len(), "Usage batch flushed");
            }
            Err(e) => {
                error!(error = %e, events = drained.len(), "Usage batch send failed, re-queueing");
                let mut queue = self.queue.lock();
                for event in drained.into_iter().rev() {
                    queue.push_front(event);
                }
                while queue.len() > self.config.max_queue {
                    queue.pop_front();
                }
            }
        }
    }

    /// Spawn the background timer flush. The task runs until the batcher
    /// is dropped everywhere else and its queue stays empty forever; abort
    /// the handle to stop it sooner.
    pub fn spawn_interval_flush(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let batcher = Arc::clone(self);
        let mut interval = tokio::time::interval(batcher.config.flush_interval);
        tokio::spawn(async move {
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                batcher.flush().await;
            }
        })
    }
}

/// Collapse raw events into one aggregate per deployment: summed tokens,
/// batch-averaged latency, OR'd error flag.
fn aggregate(events: &[UsageEvent]) -> Vec<UsageEvent> {
    struct Acc {
        input: u64,
        output: u64,
        latency_sum: f64,
        count: u64,
        any_error: bool,
    }

    let mut buckets: HashMap<DeploymentId, Acc> = HashMap::new();
    for event in events {
        let acc = buckets.entry(event.deployment_id.clone()).or_insert(Acc {
            input: 0,
            output: 0,
            latency_sum: 0.0,
            count: 0,
            any_error: false,
        });
        acc.input += event.input_tokens;
        acc.output += event.output_tokens;
        acc.latency_sum += event.latency_ms;
        acc.count += 1;
        acc.any_error |= event.is_error;
    }

    let mut batch: Vec<UsageEvent> = buckets
        .into_iter()
        .map(|(deployment_id, acc)| UsageEvent {
            deployment_id,
            input_tokens: acc.input,
            output_tokens: acc.output,
            latency_ms: acc.latency_sum / acc.count as f64,
            is_error: acc.any_error,
        })
        .collect();
    batch.sort_by(|a, b| a.deployment_id.as_str().cmp(b.deployment_id.as_str()));
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::FleetError;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct CollectingSink {
        batches: Mutex<Vec<Vec<UsageEvent>>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl UsageSink for CollectingSink {
        async fn send(&self, batch: Vec<UsageEvent>) -> FleetResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(FleetError::internal("sink down"));
            }
            self.batches.lock().push(batch);
            Ok(())
        }
    }

    fn event(deployment: &str, input: u64, output: u64, latency: f64, is_error: bool) -> UsageEvent {
        UsageEvent {
            deployment_id: DeploymentId::new(deployment),
            input_tokens: input,
            output_tokens: output,
            latency_ms: latency,
            is_error,
        }
    }

    #[test]
    fn aggregate_collapses_per_deployment() {
        let events = vec![
            event("d1", 100, 50, 200.0, false),
            event("d1", 80, 40, 300.0, true),
            event("d2", 10, 5, 150.0, false),
        ];

        let batch = aggregate(&events);
        assert_eq!(batch.len(), 2);

        let d1 = &batch[0];
        assert_eq!(d1.input_tokens, 180);
        assert_eq!(d1.output_tokens, 90);
        assert!((d1.latency_ms - 250.0).abs() < f64::EPSILON);
        assert!(d1.is_error);

        let d2 = &batch[1];
        assert_eq!(d2.input_tokens, 10);
        assert!(!d2.is_error);
    }

    #[tokio::test]
    async fn flush_triggers_at_batch_threshold() {
        let sink = Arc::new(CollectingSink::default());
        let batcher = UsageBatcher::new(
            sink.clone(),
            BatcherConfig::default().with_max_batch(3),
        );

        batcher.record(event("d1", 1, 1, 10.0, false)).await;
        batcher.record(event("d1", 1, 1, 20.0, false)).await;
        assert!(sink.batches.lock().is_empty());

        batcher.record(event("d1", 1, 1, 30.0, false)).await;
        let batches = sink.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].input_tokens, 3);
        assert!((batches[0][0].latency_ms - 20.0).abs() < f64::EPSILON);
        drop(batches);
        assert_eq!(batcher.pending(), 0);
    }

    #[tokio::test]
    async fn failed_flush_requeues_events() {
        let sink = Arc::new(CollectingSink::default());
        sink.fail.store(true, Ordering::SeqCst);
        let batcher = UsageBatcher::new(sink.clone(), BatcherConfig::default().with_max_batch(2));

        batcher.record(event("d1", 1, 1, 10.0, false)).await;
        batcher.record(event("d1", 1, 1, 20.0, false)).await;

        // Send failed; both events are back in the queue.
        assert_eq!(batcher.pending(), 2);
        assert!(sink.batches.lock().is_empty());

        sink.fail.store(false, Ordering::SeqCst);
        batcher.flush().await;
        assert_eq!(batcher.pending(), 0);
        assert_eq!(sink.batches.lock().len(), 1);
    }

    #[tokio::test]
    async fn queue_cap_drops_oldest() {
        let sink = Arc::new(CollectingSink::default());
        sink.fail.store(true, Ordering::SeqCst);
        let batcher = UsageBatcher::new(
            sink,
            BatcherConfig::default().with_max_batch(100).with_max_queue(3),
        );

        for i in 0..5 {
            batcher.record(event("d1", i, 0, 10.0, false)).await;
        }
        assert_eq!(batcher.pending(), 3);

        let queue = batcher.queue.lock();
        // The two oldest events were evicted.
        assert_eq!(queue.front().unwrap().input_tokens, 2);
        assert_eq!(queue.back().unwrap().input_tokens, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_flush_drains_the_queue() {
        let sink = Arc::new(CollectingSink::default());
        let batcher = Arc::new(UsageBatcher::new(
            sink.clone(),
            BatcherConfig::default()
                .with_max_batch(100)
                .with_flush_interval(Duration::from_secs(5)),
        ));

        batcher.record(event("d1", 1, 1, 10.0, false)).await;
        let handle = batcher.spawn_interval_flush();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(batcher.pending(), 0);
        assert_eq!(sink.batches.lock().len(), 1);

        handle.abort();
    }
}

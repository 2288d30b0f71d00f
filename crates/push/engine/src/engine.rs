//! Dispatch engine: bounded queue, worker pool and batch result collection.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use push_core::{Batch, Config, Counts, EnqueuePolicy, FailureReason, LogEntry, Summary};
use push_provider::Registry;
use push_stats::{StatStore, StatsSnapshot};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::worker::{Job, JobReport, Shared, worker_loop};
use crate::{Admission, AdmissionError, Dispatch, ExponentialBackoff, RetryPolicy};

/// Engine sizing and behaviour.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workers: usize,
    /// Queue capacity, in notifications.
    pub queue_capacity: usize,
    pub max_notification: usize,
    /// Wait for every delivery before returning a summary.
    pub sync: bool,
    pub enqueue_policy: EnqueuePolicy,
    pub attempt_timeout: Duration,
    /// Tokens of one notification delivered at the same time by a worker.
    pub token_concurrency: usize,
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.core.worker_num,
            queue_capacity: config.core.queue_num,
            max_notification: config.core.max_notification,
            sync: config.core.sync,
            enqueue_policy: config.core.enqueue_policy,
            attempt_timeout: config.core.attempt_timeout(),
            token_concurrency: config.core.token_concurrency,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Queue occupancy at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct QueueStatus {
    pub capacity: usize,
    pub usage: usize,
    pub workers: usize,
}

/// How shutdown went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers finished the queue within the grace period.
    pub drained: bool,
    /// Queued notifications finished without delivery.
    pub dropped: usize,
}

/// The notification dispatch engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    shared: Arc<Shared>,
    admission: Admission,
    config: EngineConfig,
    /// Taken at shutdown so the queue closes once in-flight submits finish.
    sender: RwLock<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    submitted_batches: AtomicUsize,
}

impl Engine {
    /// Start the worker pool. Must be called inside a tokio runtime.
    pub fn start(
        config: EngineConfig,
        registry: Registry,
        stats: Arc<dyn StatStore>,
        policy: Arc<dyn RetryPolicy>,
    ) -> Self {
        let workers = config.workers.max(1);
        let capacity = config.queue_capacity.max(1);
        let token_concurrency = config.token_concurrency.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let queue = Arc::new(tokio::sync::Mutex::new(rx));

        let shared = Arc::new(Shared {
            registry,
            policy,
            stats,
            attempt_timeout: config.attempt_timeout,
            token_concurrency,
            shutdown: CancellationToken::new(),
            dropped: AtomicUsize::new(0),
        });

        let handles = (0..workers)
            .map(|id| tokio::spawn(worker_loop(id, queue.clone(), shared.clone())))
            .collect();

        tracing::info!(
            workers,
            queue_capacity = capacity,
            token_concurrency,
            sync = config.sync,
            enqueue_policy = ?config.enqueue_policy,
            platforms = ?shared.registry.platforms(),
            "dispatch engine started"
        );

        Self {
            inner: Arc::new(EngineInner {
                shared,
                admission: Admission::new(config.max_notification),
                config: EngineConfig {
                    workers,
                    queue_capacity: capacity,
                    token_concurrency,
                    ..config
                },
                sender: RwLock::new(Some(tx)),
                workers: Mutex::new(handles),
                submitted_batches: AtomicUsize::new(0),
            }),
        }
    }

    /// Start an engine from gateway configuration.
    pub fn from_config(config: &Config, registry: Registry, stats: Arc<dyn StatStore>) -> Self {
        Self::start(
            EngineConfig::from_config(config),
            registry,
            stats,
            Arc::new(ExponentialBackoff::from_config(&config.retry)),
        )
    }

    /// Admit and queue a batch.
    ///
    /// In synchronous mode this resolves once every token has a terminal
    /// outcome, with logs in submission order. Otherwise it resolves as soon as
    /// the batch is queued, with zero counts and no logs.
    pub async fn submit(&self, batch: Batch) -> Result<Summary, AdmissionError> {
        let inner = &self.inner;
        inner.admission.check(&batch)?;

        let sender = inner
            .sender
            .read()
            .clone()
            .ok_or(AdmissionError::ShuttingDown)?;

        let batch_id = batch.id;
        let job_count = batch.len();
        let token_count = batch.token_count();

        if inner.config.enqueue_policy == EnqueuePolicy::FailFast
            && job_count > inner.config.queue_capacity
        {
            return Err(AdmissionError::QueueFull);
        }

        let cancel = inner.shared.shutdown.child_token();
        // A synchronous caller that goes away cancels the rest of its batch.
        let _guard = inner.config.sync.then(|| cancel.clone().drop_guard());

        let (reply_tx, reply_rx) = if inner.config.sync {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let jobs = batch
            .notifications
            .into_iter()
            .enumerate()
            .map(|(index, notification)| Job {
                index,
                batch_id,
                notification,
                reply: reply_tx.clone(),
                cancel: cancel.clone(),
            });

        match inner.config.enqueue_policy {
            EnqueuePolicy::FailFast => {
                let permits = sender.try_reserve_many(job_count).map_err(|e| match e {
                    TrySendError::Full(()) => AdmissionError::QueueFull,
                    TrySendError::Closed(()) => AdmissionError::ShuttingDown,
                })?;
                for (permit, job) in permits.zip(jobs) {
                    permit.send(job);
                }
                drop(sender);
                inner.shared.record_submitted(token_count).await;
            }
            EnqueuePolicy::Block => {
                let jobs: Vec<Job> = jobs.collect();
                let shared = inner.shared.clone();
                // Owned by the runtime, not the caller: every job is either
                // queued or finished here even if the caller goes away.
                let enqueue = tokio::spawn(async move {
                    shared.record_submitted(token_count).await;
                    let mut jobs = jobs.into_iter();
                    while let Some(job) = jobs.next() {
                        if let Err(mpsc::error::SendError(job)) = sender.send(job).await {
                            shared.drop_job(job, FailureReason::Shutdown).await;
                            for job in jobs.by_ref() {
                                shared.drop_job(job, FailureReason::Shutdown).await;
                            }
                        }
                    }
                });
                if let Err(e) = enqueue.await {
                    tracing::error!(internal_error = true, error = %e, "enqueue task failed");
                }
            }
        }
        drop(reply_tx);
        inner.submitted_batches.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            batch = %batch_id,
            notifications = job_count,
            tokens = token_count,
            "batch queued"
        );

        let Some(mut reply_rx) = reply_rx else {
            return Ok(Summary {
                counts: Counts::default(),
                logs: Vec::new(),
                queued: token_count,
            });
        };

        // The channel closes once every job has reported and dropped its sender.
        let mut reports: Vec<JobReport> = Vec::with_capacity(job_count);
        while let Some(report) = reply_rx.recv().await {
            reports.push(report);
        }
        reports.sort_by_key(|report| report.index);

        let logs: Vec<LogEntry> = reports
            .into_iter()
            .flat_map(|report| report.entries)
            .collect();
        let counts = Counts::tally(&logs);

        tracing::info!(
            batch = %batch_id,
            success = counts.success,
            failure = counts.failure,
            "batch complete"
        );

        Ok(Summary {
            counts,
            logs,
            queued: token_count,
        })
    }

    pub fn queue_status(&self) -> QueueStatus {
        let capacity = self.inner.config.queue_capacity;
        let usage = self
            .inner
            .sender
            .read()
            .as_ref()
            .map_or(0, |sender| capacity.saturating_sub(sender.capacity()));

        QueueStatus {
            capacity,
            usage,
            workers: self.inner.config.workers,
        }
    }

    pub fn stats(&self) -> color_eyre::eyre::Result<StatsSnapshot> {
        self.inner.shared.stats.snapshot()
    }

    /// Number of batches accepted since start.
    pub fn submitted_batches(&self) -> usize {
        self.inner.submitted_batches.load(Ordering::Relaxed)
    }

    /// Stop accepting batches and wind the worker pool down.
    ///
    /// Workers get `grace` to drain the queue. After that, in-flight deliveries
    /// are cancelled and whatever is still queued is dropped and reported.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let inner = &self.inner;
        let queued = self.queue_status().usage;
        drop(inner.sender.write().take());
        let handles = std::mem::take(&mut *inner.workers.lock());

        tracing::info!(
            grace_secs = grace.as_secs_f64(),
            queued,
            "dispatch engine shutting down"
        );

        let join = futures::future::join_all(handles);
        tokio::pin!(join);

        let drained = match tokio::time::timeout(grace, &mut join).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!("grace period elapsed, cancelling in-flight deliveries");
                inner.shared.shutdown.cancel();
                join.await;
                false
            }
        };

        let report = ShutdownReport {
            drained,
            dropped: inner.shared.dropped.load(Ordering::Relaxed),
        };
        tracing::info!(
            drained = report.drained,
            dropped = report.dropped,
            "dispatch engine stopped"
        );
        report
    }
}

impl Dispatch for Engine {
    async fn queue_notification(&self, batch: Batch) -> Result<Summary, AdmissionError> {
        self.submit(batch).await
    }

    fn queue_status(&self) -> QueueStatus {
        Engine::queue_status(self)
    }

    fn stats(&self) -> color_eyre::eyre::Result<StatsSnapshot> {
        Engine::stats(self)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use push_core::{DeliveryOutcome, LogStatus, Notification, Payload, Platform};
    use push_provider::Pusher;
    use push_stats::MemoryStats;
    use tokio::sync::Semaphore;

    use super::*;

    struct Always {
        platform: Platform,
        outcome: DeliveryOutcome,
        calls: AtomicU32,
    }

    impl Always {
        fn new(platform: Platform, outcome: DeliveryOutcome) -> Arc<Self> {
            Arc::new(Self {
                platform,
                outcome,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Pusher for Always {
        fn platform(&self) -> Platform {
            self.platform
        }

        async fn send(&self, _token: &str, _payload: &Payload) -> DeliveryOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    /// Fails with a retryable error `failures` times, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Pusher for Flaky {
        fn platform(&self) -> Platform {
            Platform::Android
        }

        async fn send(&self, _token: &str, _payload: &Payload) -> DeliveryOutcome {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                DeliveryOutcome::retryable(FailureReason::Unavailable("503".into()))
            } else {
                DeliveryOutcome::Success
            }
        }
    }

    struct Panicking;

    #[async_trait]
    impl Pusher for Panicking {
        fn platform(&self) -> Platform {
            Platform::Ios
        }

        async fn send(&self, token: &str, _payload: &Payload) -> DeliveryOutcome {
            if token == "boom" {
                panic!("adapter exploded");
            }
            DeliveryOutcome::Success
        }
    }

    /// Sleeps for the number of milliseconds in the token.
    struct Sleepy;

    #[async_trait]
    impl Pusher for Sleepy {
        fn platform(&self) -> Platform {
            Platform::Ios
        }

        async fn send(&self, token: &str, _payload: &Payload) -> DeliveryOutcome {
            let millis = token.parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            DeliveryOutcome::Success
        }
    }

    /// Blocks every send until a permit is available.
    struct Gated {
        gate: Semaphore,
        calls: AtomicU32,
    }

    impl Gated {
        fn closed() -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Pusher for Gated {
        fn platform(&self) -> Platform {
            Platform::Ios
        }

        async fn send(&self, _token: &str, _payload: &Payload) -> DeliveryOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _permit = self.gate.acquire().await;
            DeliveryOutcome::Success
        }
    }

    fn config(workers: usize, queue_capacity: usize) -> EngineConfig {
        EngineConfig {
            workers,
            queue_capacity,
            max_notification: 100,
            sync: true,
            enqueue_policy: EnqueuePolicy::Block,
            attempt_timeout: Duration::from_secs(5),
            token_concurrency: 1,
        }
    }

    fn policy(max_retry: u32) -> Arc<ExponentialBackoff> {
        Arc::new(ExponentialBackoff {
            max_retry,
            initial: Duration::from_millis(1),
            max: Duration::from_millis(5),
            multiplier: 2,
        })
    }

    fn start(config: EngineConfig, registry: Registry, max_retry: u32) -> (Engine, Arc<MemoryStats>) {
        let stats = Arc::new(MemoryStats::new());
        let store: Arc<dyn StatStore> = stats.clone();
        let engine = Engine::start(config, registry, store, policy(max_retry));
        (engine, stats)
    }

    fn ios(tokens: &[&str]) -> Notification {
        Notification::new(
            Platform::Ios,
            tokens.iter().map(|t| t.to_string()).collect(),
            "hello",
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn via_dispatch<D: Dispatch>(dispatch: &D, batch: Batch) -> Result<Summary, AdmissionError> {
        dispatch.queue_notification(batch).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mixed_batch_summary_and_stats() {
        let apns = Always::new(Platform::Ios, DeliveryOutcome::Success);
        let registry = Registry::new().with(apns.clone());
        let (engine, _stats) = start(config(2, 16), registry, 0);

        let batch = Batch::new(vec![
            ios(&["a", "b"]),
            Notification::new(Platform::Other(9), vec!["c".into()], "hello"),
        ]);
        let summary = via_dispatch(&engine, batch).await.unwrap();

        assert_eq!(summary.counts, Counts { success: 2, failure: 1 });
        assert_eq!(summary.queued, 3);
        let tokens: Vec<&str> = summary.logs.iter().map(|l| l.token.as_str()).collect();
        assert_eq!(tokens, vec!["a", "b", "c"]);

        let unknown = &summary.logs[2];
        assert_eq!(unknown.status, LogStatus::Failure);
        assert_eq!(unknown.notification_index, 1);
        assert_eq!(unknown.attempts, 0);
        assert_eq!(
            unknown.error.as_deref(),
            Some("no provider registered for platform(9)")
        );
        assert_eq!(apns.calls.load(Ordering::SeqCst), 2);

        let snapshot = engine.stats().unwrap();
        assert_eq!(snapshot.submitted, 3);
        assert_eq!(snapshot.succeeded, 2);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.platform(Platform::Ios).success, 2);
        assert_eq!(snapshot.platform(Platform::Other(9)).failure, 1);
        assert_eq!(engine.submitted_batches(), 1);
    }

    #[tokio::test]
    async fn test_over_limit_batch_has_no_side_effects() {
        let apns = Always::new(Platform::Ios, DeliveryOutcome::Success);
        let (engine, stats) = start(config(1, 16), Registry::new().with(apns.clone()), 0);

        let batch = Batch::new((0..101).map(|i| ios(&[&i.to_string()])).collect());
        let err = engine.submit(batch).await.unwrap_err();
        assert_eq!(err.to_string(), "Number of notifications(101) over limit(100)");

        let err = engine.submit(Batch::new(Vec::new())).await.unwrap_err();
        assert_eq!(err, AdmissionError::Empty);

        assert_eq!(stats.snapshot().unwrap(), StatsSnapshot::default());
        assert_eq!(apns.calls.load(Ordering::SeqCst), 0);
        assert_eq!(engine.submitted_batches(), 0);
    }

    #[tokio::test]
    async fn test_retryable_failure_exhausts_retries() {
        let apns = Always::new(
            Platform::Ios,
            DeliveryOutcome::retryable(FailureReason::Unavailable("down".into())),
        );
        let (engine, stats) = start(config(1, 16), Registry::new().with(apns.clone()), 3);

        let summary = engine.submit(Batch::new(vec![ios(&["a"])])).await.unwrap();
        assert_eq!(summary.counts, Counts { success: 0, failure: 1 });
        assert_eq!(summary.logs[0].attempts, 4);
        assert_eq!(
            summary.logs[0].error.as_deref(),
            Some("gave up after 4 attempts: provider unavailable: down")
        );
        assert_eq!(apns.calls.load(Ordering::SeqCst), 4);
        assert_eq!(stats.snapshot().unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let apns = Always::new(
            Platform::Ios,
            DeliveryOutcome::permanent(FailureReason::InvalidToken("BadDeviceToken".into())),
        );
        let (engine, _) = start(config(1, 16), Registry::new().with(apns.clone()), 5);

        let summary = engine.submit(Batch::new(vec![ios(&["a"])])).await.unwrap();
        assert_eq!(summary.logs[0].attempts, 1);
        assert_eq!(apns.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_notification_retry_override_lowers_ceiling() {
        let apns = Always::new(Platform::Ios, DeliveryOutcome::retryable(FailureReason::RateLimited));
        let (engine, _) = start(config(1, 16), Registry::new().with(apns.clone()), 5);

        let mut notification = ios(&["a"]);
        notification.retry = Some(1);
        let summary = engine.submit(Batch::new(vec![notification])).await.unwrap();
        assert_eq!(summary.logs[0].attempts, 2);
        assert_eq!(apns.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let fcm = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let (engine, stats) = start(config(1, 16), Registry::new().with(fcm.clone()), 3);

        let batch = Batch::new(vec![Notification::new(
            Platform::Android,
            vec!["a".into()],
            "hello",
        )]);
        let summary = engine.submit(batch).await.unwrap();
        assert_eq!(summary.counts, Counts { success: 1, failure: 0 });
        assert_eq!(summary.logs[0].attempts, 3);
        assert_eq!(fcm.calls.load(Ordering::SeqCst), 3);
        assert_eq!(stats.snapshot().unwrap().platform(Platform::Android).success, 1);
    }

    #[tokio::test]
    async fn test_panicking_pusher_does_not_kill_worker() {
        let (engine, stats) = start(config(1, 16), Registry::new().with(Arc::new(Panicking)), 3);

        let summary = engine.submit(Batch::new(vec![ios(&["boom", "ok"])])).await.unwrap();
        assert_eq!(summary.counts, Counts { success: 1, failure: 1 });
        assert_eq!(
            summary.logs[0].error.as_deref(),
            Some("internal error: adapter exploded")
        );
        assert_eq!(summary.logs[0].attempts, 1);

        // The single worker is still serving.
        let summary = engine.submit(Batch::new(vec![ios(&["ok"])])).await.unwrap();
        assert_eq!(summary.counts, Counts { success: 1, failure: 0 });
        assert_eq!(stats.snapshot().unwrap().succeeded, 2);
    }

    #[tokio::test]
    async fn test_slow_attempt_times_out() {
        let config = EngineConfig {
            attempt_timeout: Duration::from_millis(20),
            ..config(1, 16)
        };
        let (engine, _) = start(config, Registry::new().with(Arc::new(Sleepy)), 1);

        let summary = engine.submit(Batch::new(vec![ios(&["5000"])])).await.unwrap();
        assert_eq!(summary.counts.failure, 1);
        assert_eq!(
            summary.logs[0].error.as_deref(),
            Some("gave up after 2 attempts: request timed out")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_batches_are_counted_exactly() {
        let apns = Always::new(Platform::Ios, DeliveryOutcome::Success);
        let (engine, stats) = start(config(4, 8), Registry::new().with(apns.clone()), 0);

        let submits = (0..50).map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let batch = Batch::new(vec![
                    ios(&[&format!("{i}-a"), &format!("{i}-b"), &format!("{i}-c")]),
                    ios(&[&format!("{i}-d"), &format!("{i}-e"), &format!("{i}-f")]),
                ]);
                engine.submit(batch).await
            })
        });

        for result in futures::future::join_all(submits).await {
            let summary = result.unwrap().unwrap();
            assert_eq!(summary.counts, Counts { success: 6, failure: 0 });
        }

        let snapshot = stats.snapshot().unwrap();
        assert_eq!(snapshot.submitted, 300);
        assert_eq!(snapshot.succeeded, 300);
        assert_eq!(snapshot.failed, 0);
        assert_eq!(apns.calls.load(Ordering::SeqCst), 300);
        assert_eq!(engine.submitted_batches(), 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_logs_follow_submission_order() {
        let (engine, _) = start(config(4, 16), Registry::new().with(Arc::new(Sleepy)), 0);

        let batch = Batch::new(vec![ios(&["60"]), ios(&["0"]), ios(&["30", "1"])]);
        let summary = engine.submit(batch).await.unwrap();

        let order: Vec<(usize, &str)> = summary
            .logs
            .iter()
            .map(|l| (l.notification_index, l.token.as_str()))
            .collect();
        assert_eq!(order, vec![(0, "60"), (1, "0"), (2, "30"), (2, "1")]);
    }

    #[tokio::test]
    async fn test_async_mode_returns_once_queued() {
        let gated = Gated::closed();
        let config = EngineConfig {
            sync: false,
            ..config(1, 16)
        };
        let (engine, stats) = start(config, Registry::new().with(gated.clone()), 0);

        let summary = engine.submit(Batch::new(vec![ios(&["a", "b"])])).await.unwrap();
        assert_eq!(summary.counts, Counts::default());
        assert!(summary.logs.is_empty());
        assert_eq!(summary.queued, 2);
        assert_eq!(stats.snapshot().unwrap().submitted, 2);

        gated.gate.add_permits(2);
        let report = engine.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report, ShutdownReport { drained: true, dropped: 0 });
        assert_eq!(stats.snapshot().unwrap().succeeded, 2);
    }

    #[tokio::test]
    async fn test_fail_fast_rejects_when_queue_is_full() {
        let gated = Gated::closed();
        let config = EngineConfig {
            sync: false,
            enqueue_policy: EnqueuePolicy::FailFast,
            ..config(1, 2)
        };
        let (engine, stats) = start(config, Registry::new().with(gated.clone()), 0);

        engine.submit(Batch::new(vec![ios(&["a"])])).await.unwrap();
        wait_until(|| gated.calls() == 1).await;

        engine
            .submit(Batch::new(vec![ios(&["b"]), ios(&["c"])]))
            .await
            .unwrap();
        assert_eq!(
            engine.queue_status(),
            QueueStatus {
                capacity: 2,
                usage: 2,
                workers: 1
            }
        );

        let err = engine.submit(Batch::new(vec![ios(&["d"])])).await.unwrap_err();
        assert_eq!(err, AdmissionError::QueueFull);
        let err = engine
            .submit(Batch::new(vec![ios(&["e"]), ios(&["f"]), ios(&["g"])]))
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::QueueFull);
        assert_eq!(stats.snapshot().unwrap().submitted, 3);

        gated.gate.add_permits(3);
        let report = engine.shutdown(Duration::from_secs(5)).await;
        assert!(report.drained);
        assert_eq!(stats.snapshot().unwrap().succeeded, 3);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_drains_queue() {
        let config = EngineConfig {
            sync: false,
            ..config(1, 16)
        };
        let (engine, stats) = start(config, Registry::new().with(Arc::new(Sleepy)), 0);

        let batch = Batch::new((0..5).map(|_| ios(&["10"])).collect());
        engine.submit(batch).await.unwrap();

        let report = engine.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report, ShutdownReport { drained: true, dropped: 0 });
        assert_eq!(stats.snapshot().unwrap().succeeded, 5);

        let err = engine.submit(Batch::new(vec![ios(&["a"])])).await.unwrap_err();
        assert_eq!(err, AdmissionError::ShuttingDown);
    }

    #[tokio::test]
    async fn test_forced_shutdown_reports_every_token() {
        let gated = Gated::closed();
        let config = EngineConfig {
            attempt_timeout: Duration::from_secs(60),
            ..config(1, 16)
        };
        let (engine, stats) = start(config, Registry::new().with(gated.clone()), 0);

        let caller = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let batch = Batch::new(vec![ios(&["a"]), ios(&["b"]), ios(&["c"])]);
                engine.submit(batch).await
            })
        };
        wait_until(|| gated.calls() == 1).await;

        let report = engine.shutdown(Duration::from_millis(50)).await;
        assert_eq!(report, ShutdownReport { drained: false, dropped: 2 });

        let summary = caller.await.unwrap().unwrap();
        assert_eq!(summary.counts, Counts { success: 0, failure: 3 });
        assert_eq!(summary.logs[0].error.as_deref(), Some("delivery cancelled"));
        assert_eq!(summary.logs[1].error.as_deref(), Some("dropped at shutdown"));
        assert_eq!(summary.logs[2].attempts, 0);

        let snapshot = stats.snapshot().unwrap();
        assert_eq!(snapshot.submitted, 3);
        assert_eq!(snapshot.failed, 3);
        assert_eq!(gated.calls(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_caller_cancels_remaining_work() {
        let gated = Gated::closed();
        let (engine, stats) = start(config(1, 16), Registry::new().with(gated.clone()), 0);

        let caller = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .submit(Batch::new(vec![ios(&["a"]), ios(&["b"])]))
                    .await
            })
        };
        wait_until(|| gated.calls() == 1).await;
        caller.abort();

        wait_until(|| stats.snapshot().unwrap().failed == 2).await;
        assert_eq!(gated.calls(), 1);
        assert_eq!(stats.snapshot().unwrap().succeeded, 0);
    }

    #[tokio::test]
    async fn test_caller_dropped_while_queue_is_full() {
        let gated = Gated::closed();
        let (engine, stats) = start(config(1, 1), Registry::new().with(gated.clone()), 0);

        let caller = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let batch = Batch::new(vec![ios(&["a"]), ios(&["b"]), ios(&["c"]), ios(&["d"])]);
                engine.submit(batch).await
            })
        };
        wait_until(|| gated.calls() == 1).await;
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());
        gated.gate.add_permits(4);

        wait_until(|| {
            let snapshot = stats.snapshot().unwrap();
            snapshot.succeeded + snapshot.failed == 4
        })
        .await;
        let snapshot = stats.snapshot().unwrap();
        assert_eq!(snapshot.submitted, 4);
        assert_eq!(snapshot.succeeded, 0);
        assert_eq!(snapshot.failed, 4);
        assert_eq!(gated.calls(), 1);

        let report = engine.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report, ShutdownReport { drained: true, dropped: 0 });
    }

    /// Counts submissions but panics when a failure is recorded.
    #[derive(Default)]
    struct BrokenStore {
        inner: MemoryStats,
    }

    impl StatStore for BrokenStore {
        fn increment_submitted(&self, n: u64) -> color_eyre::eyre::Result<()> {
            self.inner.increment_submitted(n)
        }

        fn increment_succeeded(&self, platform: Platform, n: u64) -> color_eyre::eyre::Result<()> {
            self.inner.increment_succeeded(platform, n)
        }

        fn increment_failed(&self, _platform: Platform, _n: u64) -> color_eyre::eyre::Result<()> {
            panic!("store exploded");
        }

        fn snapshot(&self) -> color_eyre::eyre::Result<StatsSnapshot> {
            self.inner.snapshot()
        }

        fn reset(&self) -> color_eyre::eyre::Result<()> {
            self.inner.reset()
        }
    }

    #[tokio::test]
    async fn test_panicking_store_does_not_lose_results() {
        let apns = Always::new(Platform::Ios, DeliveryOutcome::Success);
        let store = Arc::new(BrokenStore::default());
        let engine = Engine::start(
            config(1, 16),
            Registry::new().with(apns),
            store.clone(),
            policy(0),
        );

        let batch = Batch::new(vec![Notification::new(
            Platform::Other(9),
            vec!["t".into()],
            "hello",
        )]);
        let summary = engine.submit(batch).await.unwrap();
        assert_eq!(summary.logs.len(), 1);
        assert_eq!(summary.counts, Counts { success: 0, failure: 1 });

        // The single worker is still serving.
        let summary = engine.submit(Batch::new(vec![ios(&["a"])])).await.unwrap();
        assert_eq!(summary.counts, Counts { success: 1, failure: 0 });
        assert_eq!(store.snapshot().unwrap().succeeded, 1);
    }

    /// Panics whenever a retry is scheduled.
    struct BrokenBackoff;

    impl RetryPolicy for BrokenBackoff {
        fn max_retry(&self) -> u32 {
            3
        }

        fn backoff(&self, _retry_count: u32) -> Duration {
            panic!("backoff exploded");
        }
    }

    #[tokio::test]
    async fn test_worker_survives_panic_outside_adapter() {
        let apns = Always::new(Platform::Ios, DeliveryOutcome::retryable(FailureReason::RateLimited));
        let fcm = Always::new(Platform::Android, DeliveryOutcome::Success);
        let (stats, store) = {
            let stats = Arc::new(MemoryStats::new());
            let store: Arc<dyn StatStore> = stats.clone();
            (stats, store)
        };
        let engine = Engine::start(
            config(1, 16),
            Registry::new().with(apns).with(fcm),
            store,
            Arc::new(BrokenBackoff),
        );

        let summary = engine.submit(Batch::new(vec![ios(&["a", "b"])])).await.unwrap();
        assert_eq!(summary.counts, Counts { success: 0, failure: 2 });
        assert_eq!(
            summary.logs[0].error.as_deref(),
            Some("internal error: backoff exploded")
        );

        let batch = Batch::new(vec![Notification::new(
            Platform::Android,
            vec!["c".into()],
            "hello",
        )]);
        let summary = engine.submit(batch).await.unwrap();
        assert_eq!(summary.counts, Counts { success: 1, failure: 0 });

        let snapshot = stats.snapshot().unwrap();
        assert_eq!(snapshot.submitted, 3);
        assert_eq!(snapshot.succeeded + snapshot.failed, 3);
    }

    /// Tracks how many sends overlap.
    #[derive(Default)]
    struct Counting {
        in_flight: AtomicU32,
        peak: AtomicU32,
    }

    #[async_trait]
    impl Pusher for Counting {
        fn platform(&self) -> Platform {
            Platform::Ios
        }

        async fn send(&self, _token: &str, _payload: &Payload) -> DeliveryOutcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            DeliveryOutcome::Success
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_provider_calls_bounded_by_worker_count() {
        let counting = Arc::new(Counting::default());
        let (engine, _) = start(config(2, 16), Registry::new().with(counting.clone()), 0);

        let batch = Batch::new(vec![
            ios(&["a", "b", "c", "d"]),
            ios(&["e", "f", "g", "h"]),
            ios(&["i", "j", "k", "l"]),
        ]);
        let summary = engine.submit(batch).await.unwrap();
        assert_eq!(summary.counts, Counts { success: 12, failure: 0 });
        assert!(counting.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_token_concurrency_caps_one_notification() {
        let counting = Arc::new(Counting::default());
        let config = EngineConfig {
            token_concurrency: 3,
            ..config(1, 16)
        };
        let (engine, _) = start(config, Registry::new().with(counting.clone()), 0);

        let tokens: Vec<String> = (0..9).map(|i| i.to_string()).collect();
        let batch = Batch::new(vec![Notification::new(Platform::Ios, tokens, "hello")]);
        let summary = engine.submit(batch).await.unwrap();

        assert_eq!(summary.counts, Counts { success: 9, failure: 0 });
        let order: Vec<String> = summary.logs.iter().map(|l| l.token.clone()).collect();
        assert_eq!(order, (0..9).map(|i| i.to_string()).collect::<Vec<_>>());
        let peak = counting.peak.load(Ordering::SeqCst);
        assert!((1..=3).contains(&peak), "peak {}", peak);
    }
}

//! Dispatch workers.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{FutureExt as _, StreamExt as _};
use push_core::{DeliveryOutcome, FailureReason, LogEntry, Notification, Payload, Platform};
use push_provider::{Pusher, Registry};
use push_stats::StatStore;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

use crate::{Capped, RetryAction, RetryPolicy};

/// One notification queued for delivery.
pub(crate) struct Job {
    pub index: usize,
    pub batch_id: uuid::Uuid,
    pub notification: Notification,
    /// Where results go when the caller waits for them.
    pub reply: Option<mpsc::UnboundedSender<JobReport>>,
    /// Cancelled when the batch's caller goes away or on forced shutdown.
    pub cancel: CancellationToken,
}

/// Terminal log entries for one job, in token order.
pub(crate) struct JobReport {
    pub index: usize,
    pub entries: Vec<LogEntry>,
}

pub(crate) type JobQueue = Arc<Mutex<mpsc::Receiver<Job>>>;

/// State shared by every worker.
pub(crate) struct Shared {
    pub registry: Registry,
    pub policy: Arc<dyn RetryPolicy>,
    pub stats: Arc<dyn StatStore>,
    pub attempt_timeout: Duration,
    /// Tokens of one job delivered at the same time.
    pub token_concurrency: usize,
    /// Fired when shutdown stops waiting for the queue to drain.
    pub shutdown: CancellationToken,
    pub dropped: AtomicUsize,
}

pub(crate) async fn worker_loop(id: usize, queue: JobQueue, shared: Arc<Shared>) {
    tracing::debug!(worker = id, "worker started");

    loop {
        let job = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            job = next_job(&queue) => match job {
                Some(job) => job,
                None => break,
            },
        };

        if let Err(panic) = AssertUnwindSafe(shared.process(&job)).catch_unwind().await {
            let message = panic_message(panic);
            tracing::error!(
                internal_error = true,
                worker = id,
                batch = %job.batch_id,
                index = job.index,
                panic = %message,
                "worker panicked while processing a job"
            );
            shared.fail_job(job, FailureReason::InternalError(message)).await;
        }
    }

    if shared.shutdown.is_cancelled() {
        let mut rx = queue.lock().await;
        // Later sends fail and are reported by the submitter instead.
        rx.close();
        while let Ok(job) = rx.try_recv() {
            shared.drop_job(job, FailureReason::Shutdown).await;
        }
    }

    tracing::debug!(worker = id, "worker stopped");
}

async fn next_job(queue: &JobQueue) -> Option<Job> {
    queue.lock().await.recv().await
}

impl Shared {
    /// Deliver every token of a job and fold the terminal outcomes into stats.
    pub async fn process(&self, job: &Job) {
        let platform = job.notification.platform;
        let pusher = self.registry.get(platform);
        let policy = Capped::new(self.policy.as_ref(), job.notification.retry);
        let payload = Arc::new(job.notification.payload.clone());

        let deliveries: Vec<_> = job
            .notification
            .tokens
            .iter()
            .map(|token| {
                self.deliver(
                    pusher.clone(),
                    platform,
                    token,
                    payload.clone(),
                    &policy,
                    &job.cancel,
                )
            })
            .collect();
        let results: Vec<(DeliveryOutcome, u32)> = futures::stream::iter(deliveries)
            .buffered(self.token_concurrency)
            .collect()
            .await;

        let entries: Vec<LogEntry> = job
            .notification
            .tokens
            .iter()
            .zip(results)
            .map(|(token, (outcome, attempts))| {
                LogEntry::new(job.index, platform, token, &outcome, attempts)
            })
            .collect();

        self.record(job.batch_id, platform, &entries).await;

        if let Some(reply) = &job.reply {
            // The caller may have gone away; results are already in stats.
            let _ = reply.send(JobReport {
                index: job.index,
                entries,
            });
        }
    }

    /// Run attempts for one token until the retry policy stops.
    async fn deliver(
        &self,
        pusher: Option<Arc<dyn Pusher>>,
        platform: Platform,
        token: &str,
        payload: Arc<Payload>,
        policy: &dyn RetryPolicy,
        cancel: &CancellationToken,
    ) -> (DeliveryOutcome, u32) {
        let Some(pusher) = pusher else {
            return (
                DeliveryOutcome::permanent(FailureReason::UnknownPlatform(platform)),
                0,
            );
        };

        let mut retry_count = 0;
        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return (DeliveryOutcome::permanent(FailureReason::Cancelled), retry_count);
                }
                outcome = self.attempt(pusher.clone(), token, payload.clone()) => outcome,
            };
            let attempts = retry_count + 1;

            let reason = outcome.reason().map(ToString::to_string);
            match policy.next_action(outcome, retry_count) {
                RetryAction::Stop(terminal) => return (terminal, attempts),
                RetryAction::RetryAfter(delay) => {
                    tracing::debug!(
                        %platform,
                        token,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        reason = reason.as_deref().unwrap_or_default(),
                        "retrying after transient failure"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return (DeliveryOutcome::permanent(FailureReason::Cancelled), attempts);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    retry_count += 1;
                }
            }
        }
    }

    /// One provider call, bounded by the attempt timeout.
    ///
    /// The call runs on its own task so a panicking adapter is contained; the
    /// task is aborted if the attempt is abandoned.
    async fn attempt(
        &self,
        pusher: Arc<dyn Pusher>,
        token: &str,
        payload: Arc<Payload>,
    ) -> DeliveryOutcome {
        let token = token.to_string();
        let handle =
            AbortOnDropHandle::new(tokio::spawn(
                async move { pusher.send(&token, &payload).await },
            ));

        match tokio::time::timeout(self.attempt_timeout, handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                tracing::error!(internal_error = true, panic = %message, "pusher panicked");
                DeliveryOutcome::permanent(FailureReason::InternalError(message))
            }
            Ok(Err(e)) => {
                tracing::error!(internal_error = true, error = %e, "pusher task failed");
                DeliveryOutcome::permanent(FailureReason::InternalError(e.to_string()))
            }
            Err(_) => DeliveryOutcome::retryable(FailureReason::Timeout),
        }
    }

    /// Finish a queued job without contacting any provider.
    pub async fn drop_job(&self, job: Job, reason: FailureReason) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            batch = %job.batch_id,
            index = job.index,
            platform = %job.notification.platform,
            tokens = job.notification.tokens.len(),
            %reason,
            "dropping queued notification"
        );
        self.fail_job(job, reason).await;
    }

    /// Fail every token of a job with the same reason and report it.
    pub async fn fail_job(&self, job: Job, reason: FailureReason) {
        let outcome = DeliveryOutcome::permanent(reason);
        let platform = job.notification.platform;
        let entries: Vec<LogEntry> = job
            .notification
            .tokens
            .iter()
            .map(|token| LogEntry::new(job.index, platform, token, &outcome, 0))
            .collect();

        self.record(job.batch_id, platform, &entries).await;

        if let Some(reply) = job.reply {
            let _ = reply.send(JobReport {
                index: job.index,
                entries,
            });
        }
    }

    pub async fn record_submitted(&self, token_count: usize) {
        let n = token_count as u64;
        self.update_stats(move |stats| stats.increment_submitted(n))
            .await;
    }

    async fn record(&self, batch_id: uuid::Uuid, platform: Platform, entries: &[LogEntry]) {
        let mut succeeded = 0;
        for entry in entries {
            if entry.is_success() {
                succeeded += 1;
                tracing::info!(
                    batch = %batch_id,
                    %platform,
                    token = %entry.token,
                    attempts = entry.attempts,
                    "push delivered"
                );
            } else {
                tracing::warn!(
                    batch = %batch_id,
                    %platform,
                    token = %entry.token,
                    attempts = entry.attempts,
                    error = entry.error.as_deref().unwrap_or_default(),
                    "push failed"
                );
            }
        }
        let failed = entries.len() as u64 - succeeded;

        self.update_stats(move |stats| {
            if succeeded > 0 {
                stats.increment_succeeded(platform, succeeded)?;
            }
            if failed > 0 {
                stats.increment_failed(platform, failed)?;
            }
            Ok(())
        })
        .await;
    }

    /// Run a store update off the async workers. Store errors and panics are
    /// logged, never propagated.
    async fn update_stats<F>(&self, update: F)
    where
        F: FnOnce(&dyn StatStore) -> color_eyre::eyre::Result<()> + Send + 'static,
    {
        let stats = self.stats.clone();
        match tokio::task::spawn_blocking(move || update(stats.as_ref())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "failed to update stats"),
            Err(e) => tracing::error!(internal_error = true, error = %e, "stats store panicked"),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "pusher panicked".to_string()
    }
}

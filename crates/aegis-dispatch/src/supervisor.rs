//! Background delivery to adapters that were offline at dispatch time
//!
//! Each scheduled job gets its own task. The task polls the registry every
//! `interval` until the adapter shows up online, makes exactly one delivery
//! attempt and ends, whatever the outcome. A task drops its own entry when it
//! ends, so the supervisor only tracks live jobs. Jobs never block the
//! reconcile that scheduled them. Deleting an intent cancels its jobs, and
//! shutdown cancels every poller and waits for them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use aegis_common::registry::{AdapterEntry, RegistryStore};

use crate::delivery::{Courier, DispatchJob};

/// Default registry poll interval
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// A live deferred job
struct PendingJob {
    id: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the deferred-delivery tasks
pub struct RetrySupervisor {
    registry: Arc<dyn RegistryStore>,
    courier: Courier,
    interval: Duration,
    cancel: CancellationToken,
    tasks: Arc<DashMap<String, PendingJob>>,
    next_id: AtomicU64,
}

impl RetrySupervisor {
    pub(crate) fn new(
        registry: Arc<dyn RegistryStore>,
        courier: Courier,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            courier,
            interval,
            cancel: CancellationToken::new(),
            tasks: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Start waiting for `job.adapter` to come online.
    ///
    /// Returns false if the same job is already waiting or the supervisor
    /// was shut down.
    pub fn schedule(&self, job: DispatchJob) -> bool {
        if self.cancel.is_cancelled() {
            warn!(job = %job.key(), "supervisor stopped, not scheduling retry");
            return false;
        }

        let key = job.key();
        match self.tasks.entry(key.clone()) {
            Entry::Occupied(existing) if !existing.get().handle.is_finished() => {
                debug!(job = %key, "retry already pending");
                false
            }
            Entry::Occupied(mut finished) => {
                finished.insert(self.spawn(key, job));
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(self.spawn(key, job));
                true
            }
        }
    }

    fn spawn(&self, key: String, job: DispatchJob) -> PendingJob {
        info!(policy = %job.policy, namespace = %job.namespace, adapter = %job.adapter, "adapter offline, deferring dispatch");
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.cancel.child_token();
        let poller = await_online(
            self.registry.clone(),
            self.courier.clone(),
            job,
            self.interval,
            cancel.clone(),
        );
        let tasks = self.tasks.clone();
        let handle = tokio::spawn(async move {
            poller.await;
            // a newer job under the same key keeps its entry
            tasks.remove_if(&key, |_, pending| pending.id == id);
        });
        PendingJob { id, cancel, handle }
    }

    /// Number of jobs still waiting or delivering
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Cancel every job of one intent, e.g. because it was deleted.
    /// Returns how many jobs were cancelled.
    pub fn cancel_intent(&self, namespace: &str, policy: &str) -> usize {
        let prefix = format!("{namespace}/{policy}@");
        let keys: Vec<String> = self
            .tasks
            .iter()
            .filter(|t| t.key().starts_with(&prefix))
            .map(|t| t.key().clone())
            .collect();

        let mut cancelled = 0;
        for key in keys {
            if let Some((_, pending)) = self.tasks.remove(&key) {
                pending.cancel.cancel();
                debug!(job = %key, "retry cancelled for deleted intent");
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!(policy = %policy, namespace = %namespace, cancelled, "dropped deferred dispatches");
        }
        cancelled
    }

    /// Stop every poller; deliveries already in flight run to completion
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for all tasks to end. Returns false if `timeout` elapsed first.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let keys: Vec<String> = self.tasks.iter().map(|t| t.key().clone()).collect();
        let handles: Vec<(String, JoinHandle<()>)> = keys
            .into_iter()
            .filter_map(|key| self.tasks.remove(&key))
            .map(|(key, pending)| (key, pending.handle))
            .collect();

        let joined = tokio::time::timeout(timeout, async {
            for (key, handle) in handles {
                if let Err(e) = handle.await {
                    warn!(job = %key, error = %e, "retry task failed");
                }
            }
        })
        .await;
        joined.is_ok()
    }

    /// Cancel, then wait up to `timeout`
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.cancel();
        let drained = self.wait(timeout).await;
        if drained {
            info!("retry supervisor stopped");
        } else {
            warn!(timeout = ?timeout, "retry tasks still running at shutdown");
        }
        drained
    }
}

async fn await_online(
    registry: Arc<dyn RegistryStore>,
    courier: Courier,
    job: DispatchJob,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(job = %job.key(), "retry cancelled");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let entry = match registry.load().await {
            Ok(snapshot) => snapshot.get(&job.adapter).cloned(),
            Err(e) => {
                debug!(job = %job.key(), error = %e, "registry read failed, polling again");
                continue;
            }
        };
        let Some(entry) = entry.filter(AdapterEntry::is_online) else {
            trace!(job = %job.key(), "adapter still offline");
            continue;
        };
        if cancel.is_cancelled() {
            debug!(job = %job.key(), "retry cancelled");
            return;
        }

        match courier.deliver(&job, &entry).await {
            Ok(applied) => info!(job = %job.key(), applied = %applied, "deferred dispatch delivered"),
            Err(e) => warn!(job = %job.key(), error = %e, "deferred dispatch failed, not retrying"),
        }
        return;
    }
}

//! Work queue that drives a reconciler.
//!
//! At most one pass runs per key. A trigger for a key with a pass in flight
//! marks it dirty and the key runs again once the pass finishes. Failed
//! passes are retried with exponential backoff; requeues and retries wait on
//! a per-key timer that a newer pass supersedes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Semaphore, broadcast, watch};
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::error::Result;
use crate::reconciler::{Reconciler, Requeue};
use crate::resource::ResourceKey;

type PassOutcome = (ResourceKey, std::result::Result<Result<Requeue>, JoinError>);

/// Runs a reconciler for every key it is told about.
pub struct Controller {
    reconciler: Arc<dyn Reconciler>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(reconciler: Arc<dyn Reconciler>, config: ControllerConfig) -> Self {
        Self { reconciler, config }
    }

    /// Reconcile `initial`, then every key received on `triggers`, until
    /// `shutdown` turns true. Passes in flight are allowed to finish.
    pub async fn run(
        self,
        initial: Vec<ResourceKey>,
        mut triggers: broadcast::Receiver<ResourceKey>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let kind = self.reconciler.kind();
        info!("Starting {} controller ({} resources)", kind, initial.len());

        let mut queue = WorkQueue::new(self.reconciler, self.config);
        for key in initial {
            queue.enqueue(key);
        }

        let mut triggers_open = true;
        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                trigger = triggers.recv(), if triggers_open => match trigger {
                    Ok(key) => queue.enqueue(key),
                    Err(RecvError::Lagged(missed)) => {
                        warn!("{} controller missed {} change notifications, requeueing all", kind, missed);
                        queue.enqueue_known();
                    }
                    Err(RecvError::Closed) => {
                        debug!("{} trigger channel closed", kind);
                        triggers_open = false;
                    }
                },
                Some(done) = queue.passes.join_next(), if !queue.passes.is_empty() => match done {
                    Ok((key, outcome)) => queue.finish(key, outcome),
                    Err(e) => error!("{} pass wrapper failed: {}", kind, e),
                },
                Some(fired) = queue.timers.join_next(), if !queue.timers.is_empty() => {
                    // Aborted timers come back as errors
                    if let Ok((key, seq)) = fired {
                        queue.fire(key, seq);
                    }
                }
            }
        }

        info!("Stopping {} controller", kind);
        queue.timers.abort_all();
        while let Some(done) = queue.passes.join_next().await {
            if let Ok((key, outcome)) = done {
                queue.in_flight.remove(&key);
                if let Ok(Err(e)) = outcome {
                    warn!("{} {} failed during shutdown: {}", kind, key, e);
                }
            }
        }
    }
}

struct WorkQueue {
    reconciler: Arc<dyn Reconciler>,
    config: ControllerConfig,
    semaphore: Arc<Semaphore>,
    passes: JoinSet<PassOutcome>,
    timers: JoinSet<(ResourceKey, u64)>,
    scheduled: HashMap<ResourceKey, (u64, AbortHandle)>,
    next_timer: u64,
    in_flight: HashSet<ResourceKey>,
    dirty: HashSet<ResourceKey>,
    failures: HashMap<ResourceKey, u32>,
    known: HashSet<ResourceKey>,
}

impl WorkQueue {
    fn new(reconciler: Arc<dyn Reconciler>, config: ControllerConfig) -> Self {
        let permits = config.max_concurrent_reconciles.max(1);
        Self {
            reconciler,
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
            passes: JoinSet::new(),
            timers: JoinSet::new(),
            scheduled: HashMap::new(),
            next_timer: 0,
            in_flight: HashSet::new(),
            dirty: HashSet::new(),
            failures: HashMap::new(),
            known: HashSet::new(),
        }
    }

    fn enqueue(&mut self, key: ResourceKey) {
        self.known.insert(key.clone());
        if self.in_flight.contains(&key) {
            self.dirty.insert(key);
            return;
        }

        if let Some((_, timer)) = self.scheduled.remove(&key) {
            timer.abort();
        }
        self.in_flight.insert(key.clone());

        let reconciler = self.reconciler.clone();
        let semaphore = self.semaphore.clone();
        self.passes.spawn(async move {
            // Inner task so a panicking pass still reports its key
            let pass_key = key.clone();
            let outcome = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                reconciler.reconcile(&pass_key).await
            })
            .await;
            (key, outcome)
        });
    }

    fn enqueue_known(&mut self) {
        let keys: Vec<_> = self.known.iter().cloned().collect();
        for key in keys {
            self.enqueue(key);
        }
    }

    fn finish(&mut self, key: ResourceKey, outcome: std::result::Result<Result<Requeue>, JoinError>) {
        self.in_flight.remove(&key);
        let kind = self.reconciler.kind();

        let retry = match outcome {
            Ok(Ok(requeue)) => {
                self.failures.remove(&key);
                match requeue {
                    Requeue::Done => None,
                    Requeue::Gone => {
                        debug!("Forgetting {} {}", kind, key);
                        self.known.remove(&key);
                        None
                    }
                    Requeue::After(delay) => Some(delay),
                }
            }
            Ok(Err(e)) => {
                let delay = self.record_failure(&key);
                warn!("{} {} failed, retrying in {:?}: {}", kind, key, delay, e);
                Some(delay)
            }
            Err(e) => {
                let delay = self.record_failure(&key);
                error!("{} {} pass panicked, retrying in {:?}: {}", kind, key, delay, e);
                Some(delay)
            }
        };

        if self.dirty.remove(&key) {
            self.enqueue(key);
        } else if let Some(delay) = retry {
            self.schedule(key, delay);
        }
    }

    fn record_failure(&mut self, key: &ResourceKey) -> Duration {
        let failures = self.failures.entry(key.clone()).or_insert(0);
        *failures = failures.saturating_add(1);
        self.config.error_backoff(*failures)
    }

    fn schedule(&mut self, key: ResourceKey, delay: Duration) {
        if let Some((_, timer)) = self.scheduled.remove(&key) {
            timer.abort();
        }
        self.next_timer += 1;
        let seq = self.next_timer;
        let timer_key = key.clone();
        let timer = self.timers.spawn(async move {
            tokio::time::sleep(delay).await;
            (timer_key, seq)
        });
        self.scheduled.insert(key, (seq, timer));
    }

    fn fire(&mut self, key: ResourceKey, seq: u64) {
        match self.scheduled.get(&key) {
            Some((current, _)) if *current == seq => {
                self.scheduled.remove(&key);
                self.enqueue(key);
            }
            _ => debug!("Dropping superseded timer for {}", key),
        }
    }
}

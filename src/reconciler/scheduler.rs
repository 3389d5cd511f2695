// Reconcile Scheduler - drives passes for active sessions
//
// - Session start: immediate pass, then one pass per interval
// - Heartbeat: a repeated start keeps the session alive
// - Session end or expiry: the loop stops; a pass already running finishes
// - Ad-hoc trigger: one pass, gated on the challenge list
// - Optional sweep: every sender with pending candidates, per interval

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{should_reconcile, FineReconciler, PassOutcome, SkipReason};
use crate::fines::models::ChallengeSummary;

const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(900);
const DEFAULT_MAX_SESSIONS: usize = 10_000;

/// Result of a session start or heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchOutcome {
    Started,
    Refreshed,
    AtCapacity,
}

struct UserWatch {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
    last_seen: Arc<Mutex<Instant>>,
    generation: u64,
}

type Watches = Arc<Mutex<HashMap<Uuid, UserWatch>>>;

/// Periodic reconciliation per active user session
pub struct ReconcileScheduler {
    reconciler: Arc<FineReconciler>,
    interval: Duration,
    session_ttl: Duration,
    max_sessions: usize,
    watches: Watches,
    generations: AtomicU64,
}

impl ReconcileScheduler {
    pub fn new(reconciler: Arc<FineReconciler>, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
            session_ttl: DEFAULT_SESSION_TTL,
            max_sessions: DEFAULT_MAX_SESSIONS,
            watches: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
        }
    }

    /// Sessions expire after `session_ttl` without a heartbeat; at most
    /// `max_sessions` loops run at once.
    pub fn with_session_limits(mut self, session_ttl: Duration, max_sessions: usize) -> Self {
        self.session_ttl = session_ttl;
        self.max_sessions = max_sessions;
        self
    }

    pub fn reconciler(&self) -> Arc<FineReconciler> {
        self.reconciler.clone()
    }

    /// Start the periodic loop for `user_id`, or refresh its heartbeat if it
    /// is already running.
    pub fn watch_user(&self, user_id: Uuid) -> WatchOutcome {
        let mut watches = self.watches.lock();
        watches.retain(|_, w| !w.handle.is_finished());

        if let Some(existing) = watches.get(&user_id) {
            *existing.last_seen.lock() = Instant::now();
            debug!("Session for {} refreshed", user_id);
            return WatchOutcome::Refreshed;
        }

        if watches.len() >= self.max_sessions {
            warn!(
                "Session limit reached ({}), not watching {}",
                self.max_sessions, user_id
            );
            return WatchOutcome::AtCapacity;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let last_seen = Arc::new(Mutex::new(Instant::now()));
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let reconciler = self.reconciler.clone();
        let registry = self.watches.clone();
        let seen = last_seen.clone();
        let (period, ttl) = (self.interval, self.session_ttl);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }

                if seen.lock().elapsed() > ttl {
                    info!("⌛ Session for {} expired after {:?} without a heartbeat", user_id, ttl);
                    let mut watches = registry.lock();
                    if watches.get(&user_id).map(|w| w.generation) == Some(generation) {
                        watches.remove(&user_id);
                    }
                    break;
                }

                if let PassOutcome::Aborted { error } = reconciler.run_pass(user_id).await {
                    error!("❌ Reconciliation pass for {} aborted: {}", user_id, error);
                }
            }

            debug!("Reconciliation loop for {} stopped", user_id);
        });

        watches.insert(
            user_id,
            UserWatch {
                shutdown,
                handle,
                last_seen,
                generation,
            },
        );
        info!("▶️ Reconciliation started for {} (every {:?})", user_id, period);
        WatchOutcome::Started
    }

    /// Refresh the heartbeat of a running session. Returns false if the
    /// user is not watched.
    pub fn touch(&self, user_id: Uuid) -> bool {
        match self.watches.lock().get(&user_id) {
            Some(watch) => {
                *watch.last_seen.lock() = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Stop the loop for `user_id`. Returns false if it was not watched.
    pub fn unwatch_user(&self, user_id: Uuid) -> bool {
        match self.watches.lock().remove(&user_id) {
            Some(watch) => {
                let _ = watch.shutdown.send(true);
                info!("⏹️ Reconciliation stopped for {}", user_id);
                true
            }
            None => false,
        }
    }

    /// One pass outside the periodic schedule
    pub async fn trigger(&self, user_id: Uuid, challenges: &[ChallengeSummary]) -> PassOutcome {
        self.touch(user_id);
        if !should_reconcile(user_id, challenges) {
            debug!("Trigger for {} has no finished challenge it created", user_id);
            return PassOutcome::Skipped {
                reason: SkipReason::NotRelevant,
            };
        }
        self.reconciler.run_pass(user_id).await
    }

    /// Reconcile every sender with pending candidates, once per interval
    pub fn start_sweep(&self) -> JoinHandle<()> {
        let reconciler = self.reconciler.clone();
        let period = self.interval;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let senders = match reconciler.store().senders_with_pending_candidates().await {
                    Ok(senders) => senders,
                    Err(e) => {
                        error!("❌ Sweep could not list pending senders: {}", e);
                        continue;
                    }
                };

                if senders.is_empty() {
                    continue;
                }

                info!("🧹 Sweeping {} senders with pending challenge fines", senders.len());
                for sender in senders {
                    reconciler.run_pass(sender).await;
                }
            }
        })
    }

    pub fn watched_count(&self) -> usize {
        self.watches
            .lock()
            .values()
            .filter(|w| !w.handle.is_finished())
            .count()
    }

    pub fn shutdown_all(&self) {
        let watches: Vec<_> = self.watches.lock().drain().collect();
        for (_, watch) in &watches {
            let _ = watch.shutdown.send(true);
        }
        if !watches.is_empty() {
            info!("Stopped {} reconciliation sessions", watches.len());
        }
    }
}

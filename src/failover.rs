//! Single-active-connection manager with ordered, health-checked failover
//! (`spec.md` §4.7).
//!
//! The round-robin-from-current shape is grounded on the teacher's
//! `connection.rs::MultiClientState` (`next`/`skip_unreachable`/`index`):
//! that type tracks an unbounded `current` counter and reduces it modulo the
//! candidate count only when indexing, so "have we tried everyone since we
//! started" is a plain subtraction. `FailoverManager` only ever has one
//! active client rather than per-request retry state, so it keeps the same
//! current-index idea but drops the unbounded counter — `spec.md` says
//! nothing requires surviving concurrent in-flight retries the way the
//! teacher's multi-request retry loop does.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::cache::Cache;
use crate::client::Client;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::logger::Logger;

/// Health path for the background ticker (`spec.md` §9 open question,
/// decided in `DESIGN.md`).
const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

type FailoverCallback = Arc<dyn Fn(String, String) + Send + Sync>;

struct Candidate {
    profile: String,
    config: Arc<dyn Config>,
}

struct ActiveState {
    client: Arc<Client>,
    profile: String,
    /// Index into `candidates` of the currently active connection.
    index: usize,
}

/// Holds an ordered candidate list and at most one active `Client`.
/// `Initialize` tries candidates in order; `Failover` round-robins from
/// `active_index + 1` back around to `active_index`, succeeding on the first
/// reachable candidate.
pub struct FailoverManager {
    candidates: Vec<Candidate>,
    cache: Arc<dyn Cache>,
    logger: Arc<dyn Logger>,
    active: RwLock<Option<ActiveState>>,
    on_failover: RwLock<Option<FailoverCallback>>,
    health_interval: Mutex<Duration>,
    health_timeout: Mutex<Duration>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl FailoverManager {
    pub fn new(cache: Arc<dyn Cache>, logger: Arc<dyn Logger>) -> Self {
        FailoverManager {
            candidates: Vec::new(),
            cache,
            logger,
            active: RwLock::new(None),
            on_failover: RwLock::new(None),
            health_interval: Mutex::new(DEFAULT_HEALTH_CHECK_INTERVAL),
            health_timeout: Mutex::new(DEFAULT_HEALTH_CHECK_TIMEOUT),
            health_task: Mutex::new(None),
        }
    }

    pub fn with_candidates(mut self, candidates: Vec<(String, Arc<dyn Config>)>) -> Self {
        self.candidates = candidates
            .into_iter()
            .map(|(profile, config)| Candidate { profile, config })
            .collect();
        self
    }

    /// Registers the callback fired on every successful failover. Fired
    /// asynchronously, outside any lock held by `failover_locked`
    /// (`spec.md` §4.7/§5).
    pub async fn set_on_failover<F>(&self, callback: F)
    where
        F: Fn(String, String) + Send + Sync + 'static,
    {
        *self.on_failover.write().await = Some(Arc::new(callback));
    }

    /// Must be called before `start_health_check` to take effect.
    pub async fn set_health_check_interval(&self, interval: Duration) {
        *self.health_interval.lock().await = interval;
    }

    /// Must be called before `start_health_check` to take effect.
    pub async fn set_health_check_timeout(&self, timeout: Duration) {
        *self.health_timeout.lock().await = timeout;
    }

    /// Tries candidates in order; the first success becomes active.
    /// Remaining candidates are left untried until a later `Failover`.
    pub async fn initialize(&self) -> Result<()> {
        if self.candidates.is_empty() {
            return Err(Error::config("no candidates provided"));
        }

        for (index, candidate) in self.candidates.iter().enumerate() {
            match Client::new(candidate.config.clone(), self.cache.clone(), self.logger.clone()).await {
                Ok(client) => {
                    *self.active.write().await = Some(ActiveState {
                        client: Arc::new(client),
                        profile: candidate.profile.clone(),
                        index,
                    });
                    log::info!("failover manager active on {}", candidate.profile);
                    self.logger.info(&format!("failover manager active on {}", candidate.profile));
                    return Ok(());
                }
                Err(err) => {
                    log::debug!("candidate {} failed during initialize: {err}", candidate.profile);
                    self.logger
                        .debug(&format!("candidate {} failed during initialize: {err}", candidate.profile));
                }
            }
        }

        Err(Error::config("no candidate connected"))
    }

    /// The currently active client, for transparent use as a single
    /// connection.
    pub async fn get_active_client(&self) -> Option<Arc<Client>> {
        self.active.read().await.as_ref().map(|s| s.client.clone())
    }

    pub async fn get_active_profile_name(&self) -> Option<String> {
        self.active.read().await.as_ref().map(|s| s.profile.clone())
    }

    /// Attempts each subsequent candidate in round-robin from
    /// `active_index + 1`; succeeds on the first reachable one. Fails only
    /// when all candidates fail (`spec.md` §8 "failover fails only when all
    /// n fail").
    pub async fn failover(&self) -> Result<()> {
        let (old_profile, start) = {
            let guard = self.active.read().await;
            match guard.as_ref() {
                Some(state) => (state.profile.clone(), state.index),
                None => return Err(Error::config("no active connection to fail over from")),
            }
        };

        let n = self.candidates.len();
        for step in 1..=n {
            let index = (start + step) % n;
            let candidate = &self.candidates[index];
            match Client::new(candidate.config.clone(), self.cache.clone(), self.logger.clone()).await {
                Ok(client) => {
                    *self.active.write().await = Some(ActiveState {
                        client: Arc::new(client),
                        profile: candidate.profile.clone(),
                        index,
                    });
                    log::info!("failed over from {old_profile} to {}", candidate.profile);
                    self.logger
                        .info(&format!("failed over from {old_profile} to {}", candidate.profile));

                    if let Some(callback) = self.on_failover.read().await.clone() {
                        let new_profile = candidate.profile.clone();
                        let old_profile = old_profile.clone();
                        tokio::spawn(async move { callback(old_profile, new_profile) });
                    }
                    return Ok(());
                }
                Err(err) => {
                    log::debug!("failover candidate {} unreachable: {err}", candidate.profile);
                    self.logger
                        .debug(&format!("failover candidate {} unreachable: {err}", candidate.profile));
                }
            }
        }

        Err(Error::config("failover exhausted all candidates"))
    }

    /// Idempotent: calling twice while already running is a no-op.
    pub async fn start_health_check(self: &Arc<Self>) {
        let mut task = self.health_task.lock().await;
        if task.is_some() {
            return;
        }

        let interval = *self.health_interval.lock().await;
        let manager = self.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                manager.run_health_check().await;
            }
        }));
    }

    async fn run_health_check(&self) {
        let Some(client) = self.get_active_client().await else {
            return;
        };
        let timeout = *self.health_timeout.lock().await;
        match tokio::time::timeout(timeout, client.check_version()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                log::error!("health check failed: {err}");
                self.logger.error(&format!("health check failed: {err}"));
                let _ = self.failover().await;
            }
            Err(_) => {
                log::error!("health check timed out");
                self.logger.error("health check timed out");
                let _ = self.failover().await;
            }
        }
    }

    /// Idempotent: calling twice while already stopped is a no-op.
    pub async fn stop_health_check(&self) {
        if let Some(task) = self.health_task.lock().await.take() {
            task.abort();
        }
    }

    /// Stops the health-check loop and drops all state.
    pub async fn close(&self) {
        self.stop_health_check().await;
        *self.active.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn logger() -> Arc<dyn Logger> {
        crate::logger::default_logger()
    }

    fn cache() -> Arc<dyn Cache> {
        Arc::new(crate::cache::NoOpCache)
    }

    #[test]
    fn candidate_order_wraps_from_active_index() {
        // Mirrors the teacher's `MultiClientState::index`: `(k+1)..=(k+n)`
        // modulo `n` visits every candidate exactly once before returning to
        // `k` (`spec.md` §8).
        let n = 4usize;
        let start = 2usize;
        let order: Vec<usize> = (1..=n).map(|step| (start + step) % n).collect();
        assert_eq!(order, vec![3, 0, 1, 2]);
    }

    #[tokio::test]
    async fn initialize_rejects_empty_candidate_list() {
        let manager = FailoverManager::new(cache(), logger());
        let err = manager.initialize().await.unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("no candidates")));
    }

    #[tokio::test]
    async fn start_health_check_is_idempotent() {
        let manager = Arc::new(FailoverManager::new(cache(), logger()).with_candidates(Vec::new()));
        manager.set_health_check_interval(Duration::from_millis(10)).await;
        manager.start_health_check().await;
        manager.start_health_check().await;
        assert!(manager.health_task.lock().await.is_some());
        manager.stop_health_check().await;
        assert!(manager.health_task.lock().await.is_none());
    }

    #[tokio::test]
    async fn failover_callback_fires_asynchronously() {
        // A bare counter stands in for asserting the callback runs outside
        // the manager's lock: if it ran while the write lock from
        // `failover()` were still held, a subsequent `get_active_client`
        // call inside the callback would deadlock. We can't easily
        // construct real `Client`s without a mock server here (covered in
        // `client.rs`), so this test only exercises the no-candidates path
        // to confirm the callback is never invoked when failover itself
        // never succeeds.
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = Arc::new(FailoverManager::new(cache(), logger()).with_candidates(Vec::new()));
        let calls_clone = calls.clone();
        manager.set_on_failover(move |_old, _new| { calls_clone.fetch_add(1, Ordering::SeqCst); }).await;
        let err = manager.failover().await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

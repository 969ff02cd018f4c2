//! Background UPID status watcher with subscriber fan-out (`spec.md` §4.8).
//!
//! Adapted from the teacher's `remote_tasks` "track a freshly submitted
//! task, poll until it ends" idea (`track_running_pve_task`), but in-memory
//! rather than journaled to disk: the spec's poller is a pub/sub primitive
//! for a UI to react to task lifecycle, not the durable task-history cache
//! `remote_tasks::task_cache` implements (that's the out-of-scope on-disk
//! cache backend per `spec.md` §1/§9).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::client::Client;
use crate::logger::Logger;
use crate::model::{Task, TaskStatus, VmId};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

type SubscriberFn = Arc<dyn Fn(&Task) + Send + Sync>;
/// Mirrors the `BoxFuture` alias `group.rs` uses for its own boxed-closure
/// callbacks.
type UnsubscribeFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct TrackedTask {
    info: Task,
    monitor: JoinHandle<()>,
}

/// Monitors asynchronous Proxmox tasks (UPIDs) and fans out lifecycle
/// events (`running` then `stopped`) to subscribers.
pub struct TaskPoller {
    tasks: Arc<RwLock<HashMap<String, TrackedTask>>>,
    callbacks: Arc<RwLock<HashMap<u64, SubscriberFn>>>,
    next_callback_id: AtomicU64,
    logger: Arc<dyn Logger>,
}

impl TaskPoller {
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        TaskPoller {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            callbacks: Arc::new(RwLock::new(HashMap::new())),
            next_callback_id: AtomicU64::new(0),
            logger,
        }
    }

    /// Registers a subscriber; returns an unregister closure. Notifications
    /// are dispatched by copying the callback list under a lock and
    /// invoking each in its own task, so a slow subscriber cannot block the
    /// poller or its siblings (`spec.md` §4.8).
    pub async fn subscribe<F>(&self, callback: F) -> impl FnOnce() -> UnsubscribeFuture
    where
        F: Fn(&Task) + Send + Sync + 'static,
    {
        let id = self.next_callback_id.fetch_add(1, Ordering::SeqCst);
        self.callbacks.write().await.insert(id, Arc::new(callback));
        let callbacks = self.callbacks.clone();
        move || Box::pin(async move { callbacks.write().await.remove(&id); }) as UnsubscribeFuture
    }

    /// Idempotent: if `upid` is already tracked, this is a no-op
    /// (`spec.md` §8 "AddTask(upid) then AddTask(upid) ≡ AddTask(upid)
    /// once").
    pub async fn add_task(&self, client: Arc<Client>, upid: String, node: String, vmid: Option<VmId>) {
        {
            let tasks = self.tasks.read().await;
            if tasks.contains_key(&upid) {
                return;
            }
        }
        // Re-check under the write half in case two callers raced the read
        // above; insert wins the race, the loser returns without spawning a
        // second monitor.
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&upid) {
            return;
        }

        let info = Task {
            upid: upid.clone(),
            node: node.clone(),
            vmid,
            status: TaskStatus::Running,
            exit_status: None,
            start_time: Instant::now(),
            source_profile: String::new(),
        };
        self.notify(&info).await;

        let monitor = self.spawn_monitor(client, upid.clone(), node, info.clone());
        tasks.insert(upid, TrackedTask { info, monitor });
    }

    fn spawn_monitor(&self, client: Arc<Client>, upid: String, node: String, initial: Task) -> JoinHandle<()> {
        let tasks = self.tasks.clone();
        let callbacks = self.callbacks.clone();
        let logger = self.logger.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                match client.get_task_status(&node, &upid).await {
                    Ok(response) if response.status == "stopped" => {
                        let mut finished = initial.clone();
                        finished.status = TaskStatus::Stopped;
                        finished.exit_status = response.exitstatus;

                        notify_all(&callbacks, &finished).await;
                        tasks.write().await.remove(&upid);
                        return;
                    }
                    Ok(_) => {
                        // still running; next tick retries.
                    }
                    Err(err) => {
                        // A single failed poll is logged and skipped; the
                        // next tick retries (`spec.md` §7 item 8).
                        log::debug!("task poll for {upid} failed: {err}");
                        logger.debug(&format!("task poll for {upid} failed: {err}"));
                    }
                }
            }
        })
    }

    async fn notify(&self, task: &Task) {
        notify_all(&self.callbacks, task).await;
    }

    /// Returns a snapshot of every currently-tracked (i.e. still running)
    /// task.
    pub async fn active_tasks(&self) -> Vec<Task> {
        self.tasks.read().await.values().map(|t| t.info.clone()).collect()
    }

    /// Cancels every monitor; subsequent ticks are never observed. Safe to
    /// call from `Drop`-adjacent shutdown paths.
    pub async fn stop(&self) {
        let mut tasks = self.tasks.write().await;
        for (_, tracked) in tasks.drain() {
            tracked.monitor.abort();
        }
    }
}

async fn notify_all(callbacks: &Arc<RwLock<HashMap<u64, SubscriberFn>>>, task: &Task) {
    let subscribers: Vec<SubscriberFn> = callbacks.read().await.values().cloned().collect();
    for subscriber in subscribers {
        let task = task.clone();
        tokio::spawn(async move { subscriber(&task) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn subscribe_then_unsubscribe_removes_callback() {
        let poller = TaskPoller::new(crate::logger::default_logger());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let unsubscribe = poller.subscribe(move |_task| { count_clone.fetch_add(1, Ordering::SeqCst); }).await;
        assert_eq!(poller.callbacks.read().await.len(), 1);
        unsubscribe().await;
        assert_eq!(poller.callbacks.read().await.len(), 0);
    }

    #[tokio::test]
    async fn stop_clears_all_tracked_tasks() {
        let poller = TaskPoller::new(crate::logger::default_logger());
        poller.stop().await;
        assert!(poller.active_tasks().await.is_empty());
    }
}

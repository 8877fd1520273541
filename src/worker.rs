//! The worker façade: advertises capabilities, runs the grab/sleep/assign
//! cycle against a pool of servers, and executes assigned jobs on a bounded
//! concurrency pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::encoding::{DataEncoder, NoopEncoder};
use crate::error::{GearmanError, Result};
use crate::handler::worker::{JobCallback, WorkerHandler};
use crate::job::Job;
use crate::manager::ConnectionManager;
use crate::net::notification::TERMINATE;
use crate::pool::{CallbackResult, WorkerPool};

/// How long in-flight jobs get to flush their results before shutdown closes
/// the sockets out from under them.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

pub struct Worker {
    manager: ConnectionManager<WorkerHandler>,
    callbacks: Arc<Mutex<HashMap<String, JobCallback>>>,
    pool: Arc<Mutex<WorkerPool>>,
    encoder: Arc<dyn DataEncoder>,
    abilities: Vec<Arc<str>>,
    client_id: Option<Arc<str>>,
}

impl Worker {
    pub fn new(concurrency: usize) -> Self {
        Self::with_encoder(concurrency, Arc::new(NoopEncoder))
    }

    pub fn with_encoder(concurrency: usize, encoder: Arc<dyn DataEncoder>) -> Self {
        Self {
            manager: ConnectionManager::new(Arc::clone(&encoder)),
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            pool: Arc::new(Mutex::new(WorkerPool::new(concurrency.max(1)))),
            encoder,
            abilities: Vec::new(),
            client_id: None,
        }
    }

    pub fn add_server(&mut self, host: impl Into<String>, port: u16) -> usize {
        let notifier = self.manager.notifier();
        let handler = WorkerHandler::new(
            Arc::clone(&self.callbacks),
            Arc::clone(&self.pool),
            notifier,
            Arc::clone(&self.encoder),
        );
        self.manager.add_connection(host, port, handler)
    }

    /// Registers a task's callback and broadcasts the updated ability list to
    /// every configured connection.
    pub fn register_task<F>(&mut self, task: impl Into<Arc<str>>, callback: F)
    where
        F: Fn(&Job) -> CallbackResult + Send + Sync + 'static,
    {
        let task: Arc<str> = task.into();
        self.callbacks.lock().insert(task.to_string(), Arc::new(callback));
        if !self.abilities.contains(&task) {
            self.abilities.push(task);
        }
        self.broadcast_abilities();
    }

    pub fn unregister_task(&mut self, task: &str) {
        self.callbacks.lock().remove(task);
        self.abilities.retain(|t| t.as_ref() != task);
        self.broadcast_abilities();
    }

    pub fn set_client_id(&mut self, id: impl Into<Arc<str>>) {
        self.client_id = Some(id.into());
        for idx in 0..self.manager.len() {
            if self.manager.connection(idx).is_connected() {
                let id = self.client_id.clone();
                let (conn, handler) = self.manager.split_mut(idx);
                handler.set_client_id(id, conn);
            } else {
                self.manager.handler_mut(idx).sync_client_id(self.client_id.clone());
            }
        }
    }

    fn broadcast_abilities(&mut self) {
        let abilities = self.abilities.clone();
        for idx in 0..self.manager.len() {
            if self.manager.connection(idx).is_connected() {
                let (conn, handler) = self.manager.split_mut(idx);
                handler.set_abilities(abilities.clone(), conn);
            } else {
                self.manager.handler_mut(idx).sync_abilities(abilities.clone());
            }
        }
    }

    /// Requests an immediate stop: wakes the poll loop with a terminate byte,
    /// so a currently-blocked `poll_once` call returns right away instead of
    /// waiting out its timeout slice. Only callable with direct `&mut self`
    /// access to this worker (not concurrently with an in-flight `work()`
    /// call on the same value) — for stopping a `work()` call running on
    /// another task, cancel the `CancellationToken` passed to it instead,
    /// which reaches the same wake path.
    pub fn terminate(&mut self) {
        self.manager.terminate();
    }

    /// Runs the work loop until `cancel` is cancelled or [`Worker::terminate`]
    /// is called, then flushes any in-flight results before returning.
    ///
    /// Cancelling `cancel` from another task wakes the poll loop immediately
    /// via the same terminate byte `terminate()` sends, rather than merely
    /// being rechecked at the end of the current `poll_timeout` slice — with
    /// no timeout (`poll_timeout = None`) a slice runs for up to an hour, so
    /// this loop would otherwise barely respond to cancellation at all.
    pub async fn work(&mut self, cancel: &CancellationToken, poll_timeout: Option<Duration>) -> Result<()> {
        let notifier = self.manager.notifier();
        let watcher_cancel = cancel.clone();
        let watcher = tokio::spawn(async move {
            watcher_cancel.cancelled().await;
            notifier.wake(TERMINATE);
        });

        while !cancel.is_cancelled() {
            self.establish_connections().await?;
            self.manager.poll(|_| true, |_| !cancel.is_cancelled(), poll_timeout).await;
        }

        watcher.abort();

        if self.pool.lock().outstanding() > 0 {
            for idx in 0..self.manager.len() {
                self.manager.connection_mut(idx).write_only = true;
            }

            let pool = Arc::clone(&self.pool);
            self.manager
                .poll(|_| true, |_| pool.lock().outstanding() > 0, Some(DRAIN_TIMEOUT))
                .await;
        }

        self.drain_pool().await;
        Ok(())
    }

    async fn establish_connections(&mut self) -> Result<()> {
        if self.manager.is_empty() {
            return Err(GearmanError::ServerUnavailable("no servers configured".into()));
        }

        let mut order: Vec<usize> = (0..self.manager.len()).collect();
        order.shuffle(&mut rand::thread_rng());

        let mut any_connected = false;
        for idx in order {
            match self.manager.establish_connection(idx).await {
                Ok(()) => any_connected = true,
                Err(err) => warn!(%err, idx, "failed to connect to configured server"),
            }
        }

        if !any_connected {
            return Err(GearmanError::ServerUnavailable("no configured server accepted a connection".into()));
        }

        Ok(())
    }

    /// Waits for every pooled callback to finish, without holding the pool's
    /// lock across an await (it's a synchronous lock shared with the
    /// per-connection handlers).
    async fn drain_pool(&mut self) {
        self.pool.lock().mark_terminated();

        loop {
            let remaining = {
                let mut guard = self.pool.lock();
                guard.drain_ready();
                guard.outstanding()
            };

            if remaining == 0 {
                break;
            }

            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_task_adds_and_unregister_removes_ability() {
        let mut worker = Worker::new(2);
        worker.register_task("reverse", |job: &Job| Ok(job.data.clone()));
        assert!(worker.abilities.iter().any(|t| t.as_ref() == "reverse"));

        worker.unregister_task("reverse");
        assert!(!worker.abilities.iter().any(|t| t.as_ref() == "reverse"));
    }

    #[tokio::test]
    async fn work_without_servers_fails_fast() {
        let mut worker = Worker::new(1);
        let cancel = CancellationToken::new();
        let err = worker.work(&cancel, Some(Duration::from_millis(10))).await.unwrap_err();
        assert!(matches!(err, GearmanError::ServerUnavailable(_)));
    }
}

//! The client façade: submits jobs against a pool of servers, tracking each
//! through `UNKNOWN -> PENDING -> CREATED -> {COMPLETE|FAILED}` and retrying
//! on connection failure up to a per-request budget.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::time::Instant;
use tracing::{instrument, warn};

use crate::encoding::{DataEncoder, NoopEncoder};
use crate::error::{GearmanError, Result};
use crate::handler::client::{ClientHandler, SharedRequest};
use crate::job::{random_unique, Job, JobRequest, RequestState};
use crate::manager::{ConnectionManager, FacadeCtx};
use crate::wire::protocol::Priority;

/// A slice bound on each inner poll call, so the outer submit/wait loops stay
/// responsive to newly-`UNKNOWN` requests without spinning.
const POLL_SLICE: Duration = Duration::from_millis(250);

/// Per-call options shared by every job in one `submit_multiple_jobs` batch.
#[derive(Clone, Debug)]
pub struct SubmitOptions {
    pub priority: Priority,
    pub background: bool,
    /// Wait for completion (or timeout) before returning. If `false`, the
    /// call returns as soon as every request has been submitted.
    pub block: bool,
    pub max_connect_attempts: u32,
    pub timeout: Option<Duration>,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            priority: Priority::None,
            background: false,
            block: true,
            max_connect_attempts: 3,
            timeout: None,
        }
    }
}

/// One job to submit: a task name, opaque payload, and optional caller-chosen
/// `unique` key (a random one is generated if absent).
pub struct JobSpec {
    pub task: String,
    pub unique: Option<String>,
    pub data: Bytes,
}

impl JobSpec {
    pub fn new(task: impl Into<String>, data: Bytes) -> Self {
        Self { task: task.into(), unique: None, data }
    }

    pub fn with_unique(mut self, unique: impl Into<String>) -> Self {
        self.unique = Some(unique.into());
        self
    }
}

pub struct Client {
    manager: ConnectionManager<ClientHandler>,
}

impl Client {
    pub fn new() -> Self {
        Self::with_encoder(Arc::new(NoopEncoder))
    }

    pub fn with_encoder(encoder: Arc<dyn DataEncoder>) -> Self {
        Self { manager: ConnectionManager::new(encoder) }
    }

    /// Registers a server; connections are made lazily on first submission.
    pub fn add_server(&mut self, host: impl Into<String>, port: u16) -> usize {
        self.manager.add_connection(host, port, ClientHandler::new())
    }

    #[instrument(skip(self, data))]
    pub async fn submit_job(
        &mut self,
        task: impl Into<String>,
        data: Bytes,
        opts: SubmitOptions,
    ) -> Result<SharedRequest> {
        let spec = JobSpec::new(task.into(), data);
        let mut reqs = self.submit_multiple_jobs(vec![spec], opts).await?;
        Ok(reqs.remove(0))
    }

    #[instrument(skip(self, jobs))]
    pub async fn submit_multiple_jobs(
        &mut self,
        jobs: Vec<JobSpec>,
        opts: SubmitOptions,
    ) -> Result<Vec<SharedRequest>> {
        let requests: Vec<SharedRequest> = jobs
            .into_iter()
            .map(|spec| {
                let unique = spec.unique.unwrap_or_else(random_unique);
                let job = Job::new(spec.task, unique, spec.data);
                Arc::new(Mutex::new(JobRequest::new(
                    job,
                    opts.priority,
                    opts.background,
                    opts.max_connect_attempts,
                )))
            })
            .collect();

        let deadline = opts.timeout.map(|t| Instant::now() + t);

        self.blocking_submit(&requests, deadline).await?;

        if opts.block {
            self.wait_until_complete(&requests, deadline).await;
        }

        Ok(requests)
    }

    /// Blocks until every request has a status update newer than when this
    /// call started, or the timeout expires.
    #[instrument(skip(self, requests))]
    pub async fn get_job_statuses(&mut self, requests: &[SharedRequest], timeout: Option<Duration>) -> Result<()> {
        self.wait_for_statuses(requests, timeout).await
    }

    pub async fn get_job_status(&mut self, request: &SharedRequest, timeout: Option<Duration>) -> Result<()> {
        self.get_job_statuses(std::slice::from_ref(request), timeout).await
    }

    /// Closes every connection this client has opened.
    pub async fn shutdown(&mut self) {
        for idx in 0..self.manager.len() {
            self.manager.connection_mut(idx).close().await;
        }
    }

    /// Sends `SUBMIT_JOB` for every request still `UNKNOWN` (choosing a
    /// server via [`Client::create_handler`]), then drives I/O until nothing
    /// is left `PENDING` — re-entering the submission step if a connection
    /// drop puts a request back in `UNKNOWN`.
    async fn blocking_submit(&mut self, requests: &[SharedRequest], deadline: Option<Instant>) -> Result<()> {
        let mut server_order: HashMap<usize, VecDeque<usize>> = HashMap::new();

        loop {
            let unsubmitted: Vec<SharedRequest> = requests
                .iter()
                .filter(|r| r.lock().state == RequestState::Unknown)
                .cloned()
                .collect();

            for req in &unsubmitted {
                self.create_handler(req, &mut server_order).await?;
            }

            if !requests.iter().any(|r| r.lock().state == RequestState::Pending) {
                break;
            }

            let Some(remaining) = remaining_time(deadline) else { break };

            self.manager
                .poll(
                    |_| true,
                    |_| {
                        let any_pending = requests.iter().any(|r| r.lock().state == RequestState::Pending);
                        let any_unknown = requests.iter().any(|r| r.lock().state == RequestState::Unknown);
                        any_pending && !any_unknown
                    },
                    Some(remaining.min(POLL_SLICE)),
                )
                .await;
        }

        for req in requests {
            let mut guard = req.lock();
            if guard.state == RequestState::Pending {
                guard.timed_out = true;
            }
        }

        Ok(())
    }

    /// Polls until every request is either `UNKNOWN` (its connection was
    /// lost; not retried here) or complete. Never re-submits a `CREATED`
    /// request — the server may already be running it.
    async fn wait_until_complete(&mut self, requests: &[SharedRequest], deadline: Option<Instant>) {
        let settled = |requests: &[SharedRequest]| {
            requests
                .iter()
                .all(|r| { let g = r.lock(); g.state == RequestState::Unknown || g.is_complete() })
        };

        while !settled(requests) {
            let Some(remaining) = remaining_time(deadline) else { break };

            self.manager.poll(|_| true, |_| !settled(requests), Some(remaining)).await;
        }

        for req in requests {
            let mut guard = req.lock();
            if guard.state != RequestState::Unknown && !guard.is_complete() {
                guard.timed_out = true;
            }
        }
    }

    async fn wait_for_statuses(&mut self, requests: &[SharedRequest], timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let baseline: Vec<Option<Instant>> = requests.iter().map(|r| r.lock().status.time_received).collect();

        for req in requests {
            let idx = req
                .lock()
                .server_index
                .ok_or_else(|| GearmanError::InvalidClientState("request has no bound server yet".into()))?;
            self.manager.establish_connection(idx).await?;
            let (conn, handler) = self.manager.split_mut(idx);
            handler.send_get_status_of_job(req, conn)?;
        }

        let advanced = |requests: &[SharedRequest], baseline: &[Option<Instant>]| {
            requests
                .iter()
                .zip(baseline)
                .all(|(r, base)| { let g = r.lock(); g.status.time_received != *base || g.state == RequestState::Unknown })
        };

        while !advanced(requests, &baseline) {
            let Some(remaining) = remaining_time(deadline) else { break };
            self.manager.poll(|_| true, |_| !advanced(requests, &baseline), Some(remaining)).await;
        }

        for (req, base) in requests.iter().zip(&baseline) {
            let mut guard = req.lock();
            if guard.status.time_received == *base {
                guard.timed_out = true;
            }
        }

        Ok(())
    }

    /// Picks a server for `req` from a per-request shuffled deque, retrying
    /// connection failures against the next server in the rotation, and
    /// sends `SUBMIT_JOB` once one connects.
    async fn create_handler(
        &mut self,
        req: &SharedRequest,
        server_order: &mut HashMap<usize, VecDeque<usize>>,
    ) -> Result<()> {
        let key = Arc::as_ptr(req) as usize;
        let deque = server_order.entry(key).or_insert_with(|| {
            let mut idxs: Vec<usize> = (0..self.manager.len()).collect();
            idxs.shuffle(&mut rand::thread_rng());
            idxs.into()
        });

        let max_attempts = req.lock().max_connect_attempts;

        loop {
            if req.lock().connect_attempts >= max_attempts {
                return Err(GearmanError::ExceededConnectionAttempts(format!(
                    "exceeded {max_attempts} connection attempts"
                )));
            }

            let Some(&idx) = deque.front() else {
                return Err(GearmanError::ServerUnavailable("no configured server accepted a connection".into()));
            };

            req.lock().connect_attempts += 1;

            match self.manager.establish_connection(idx).await {
                Ok(()) => {
                    let mut ctx = FacadeCtx::new(self.manager.encoder());
                    let (conn, handler) = self.manager.split_mut(idx);
                    handler.send_job_request(req, conn, &mut ctx)?;
                    req.lock().server_index = Some(idx);
                    return Ok(());
                },
                Err(err) => {
                    warn!(%err, idx, "failed to connect, trying next server");
                    deque.pop_front();
                    deque.push_back(idx);
                },
            }
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

fn remaining_time(deadline: Option<Instant>) -> Option<Duration> {
    match deadline {
        Some(d) => d.checked_duration_since(Instant::now()).filter(|r| !r.is_zero()),
        None => Some(Duration::from_secs(3600)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_options_default_is_blocking_foreground() {
        let opts = SubmitOptions::default();
        assert_eq!(opts.priority, Priority::None);
        assert!(!opts.background);
        assert!(opts.block);
        assert_eq!(opts.max_connect_attempts, 3);
    }

    #[test]
    fn job_spec_with_unique_overrides_random_generation() {
        let spec = JobSpec::new("reverse", Bytes::from_static(b"abc")).with_unique("fixed-key");
        assert_eq!(spec.unique.as_deref(), Some("fixed-key"));
    }
}

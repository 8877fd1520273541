//! The worker's bounded concurrency pool for user callback execution.
//!
//! Callbacks never touch connection or handler state directly; they receive
//! a [`ResultSink`] that lets them enqueue a job's outcome onto the owning
//! connection's outbound queue and wake the main poll loop, without any of
//! the pool's worker tasks needing `&mut` access to the connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{instrument, warn};

use crate::encoding::DataEncoder;
use crate::net::notification::{Notifier, PREPARE, WAKE};
use crate::net::OutboundQueue;
use crate::wire::events::GearmanEvent;
use crate::wire::protocol::{Frame, PacketType};

/// A callback-safe handle for reporting a job's outcome back to its
/// connection. Cloneable and `Send + Sync` so pooled tasks can hold one.
#[derive(Clone)]
pub struct ResultSink {
    outbound: OutboundQueue,
    notifier: Notifier,
    encoder: Arc<dyn DataEncoder>,
    handle: Arc<str>,
}

impl ResultSink {
    pub fn new(outbound: OutboundQueue, notifier: Notifier, encoder: Arc<dyn DataEncoder>, handle: Arc<str>) -> Self {
        Self { outbound, notifier, encoder, handle }
    }

    fn enqueue(&self, ptype: PacketType, extra: Vec<Bytes>, wake: u8) {
        let mut args = vec![self.handle.as_bytes().to_vec().into()];
        args.extend(extra);
        self.outbound.lock().push_back(GearmanEvent::Binary(Frame::new(ptype, args)));
        self.notifier.wake(wake);
    }

    /// Terminal updates wake with `PREPARE`, not `WAKE`: a terminal update is
    /// the only thing that frees this job's reserved pool slot, so it must
    /// also re-trigger `WorkerHandler::prepare` for any connection stalled
    /// with `_waiting=true` on that slot — a bare `WAKE` only unblocks the
    /// poll loop without re-running `prepare`, leaving such a connection
    /// stuck until some other event happens to wake it.
    pub fn send_job_complete(&self, data: &[u8]) {
        let encoded = self.encoder.encode(data).unwrap_or_default();
        self.enqueue(PacketType::WorkComplete, vec![encoded], PREPARE);
    }

    pub fn send_job_failure(&self) {
        self.enqueue(PacketType::WorkFail, vec![], PREPARE);
    }

    pub fn send_job_exception(&self, data: &[u8]) {
        let encoded = self.encoder.encode(data).unwrap_or_default();
        self.enqueue(PacketType::WorkException, vec![encoded], PREPARE);
    }

    pub fn send_job_data(&self, data: &[u8]) {
        let encoded = self.encoder.encode(data).unwrap_or_default();
        self.enqueue(PacketType::WorkData, vec![encoded], WAKE);
    }

    pub fn send_job_warning(&self, data: &[u8]) {
        let encoded = self.encoder.encode(data).unwrap_or_default();
        self.enqueue(PacketType::WorkWarning, vec![encoded], WAKE);
    }

    pub fn send_job_status(&self, numerator: u64, denominator: u64) {
        self.enqueue(
            PacketType::WorkStatus,
            vec![numerator.to_string().into_bytes().into(), denominator.to_string().into_bytes().into()],
            WAKE,
        );
    }
}

/// The outcome of a worker callback: `Ok` sends `WORK_COMPLETE`, `Err` sends
/// `WORK_FAIL`.
pub type CallbackResult = std::result::Result<Bytes, ()>;

/// A bounded pool of cooperative tasks executing worker job callbacks.
///
/// `reserve`/`release` implement the counting-semaphore reservation
/// discipline from the spec; `spawn` moves a reservation from "reserved" to
/// "running" and joins it via an internal [`JoinSet`].
pub struct WorkerPool {
    concurrency: usize,
    semaphore: Arc<Semaphore>,
    /// Permits acquired by `reserve()` but not yet handed to `spawn()`; a
    /// permit moves out of here into the spawned task, which drops it (and
    /// so returns the slot to the semaphore) on completion.
    pending: VecDeque<tokio::sync::OwnedSemaphorePermit>,
    running: Arc<AtomicUsize>,
    tasks: JoinSet<()>,
    terminated: bool,
}

impl WorkerPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            pending: VecDeque::new(),
            running: Arc::new(AtomicUsize::new(0)),
            tasks: JoinSet::new(),
            terminated: false,
        }
    }

    /// Attempts to reserve a slot. Non-blocking: returns `false` immediately
    /// if the pool is saturated. The acquired permit is held until `spawn`
    /// or `release` consumes it.
    pub fn reserve(&mut self) -> bool {
        if self.terminated {
            return false;
        }
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => {
                self.pending.push_back(permit);
                true
            },
            Err(_) => false,
        }
    }

    /// Gives back a reservation that ended up not being used (e.g. `NO_JOB`
    /// arrived for a grab that never turned into a running job).
    pub fn release(&mut self) {
        self.pending.pop_front();
    }

    pub fn busy(&self) -> bool {
        self.running.load(Ordering::Acquire) > 0
    }

    /// Runs `callback` to completion on this pool, sending the resulting
    /// `WORK_COMPLETE`/`WORK_FAIL` through `sink`. Consumes one permit
    /// reserved by a prior [`WorkerPool::reserve`] call.
    #[instrument(skip_all)]
    pub fn spawn<F>(&mut self, sink: ResultSink, callback: F)
    where
        F: FnOnce() -> CallbackResult + Send + 'static,
    {
        let permit = self.pending.pop_front().expect("spawn called without a matching reserve");
        let running = Arc::clone(&self.running);

        self.tasks.spawn(async move {
            running.fetch_add(1, Ordering::AcqRel);

            let result = tokio::task::spawn_blocking(callback).await;

            match result {
                Ok(Ok(data)) => sink.send_job_complete(&data),
                Ok(Err(())) => sink.send_job_failure(),
                Err(join_err) => {
                    warn!(%join_err, "worker callback panicked");
                    sink.send_job_failure();
                },
            }

            running.fetch_sub(1, Ordering::AcqRel);
            drop(permit);
        });
    }

    /// Stops accepting new work and waits for every outstanding task.
    pub async fn terminate(&mut self) {
        self.terminated = true;
        while self.tasks.join_next().await.is_some() {}
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Non-blocking variant of the reservation discipline above, for callers
    /// that only hold this pool behind a synchronous lock (shared with the
    /// per-connection handlers) and so cannot await while holding it.
    pub fn mark_terminated(&mut self) {
        self.terminated = true;
    }

    /// Reaps every task that has already finished, without blocking on the
    /// ones still running.
    pub fn drain_ready(&mut self) {
        while self.tasks.try_join_next().is_some() {}
    }

    pub fn outstanding(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;
    use crate::encoding::NoopEncoder;
    use crate::net::notification::channel;

    fn sink() -> (ResultSink, OutboundQueue) {
        let outbound: OutboundQueue = Arc::new(Mutex::new(VecDeque::new()));
        let (notifier, _listener) = channel();
        let sink = ResultSink::new(outbound.clone(), notifier, Arc::new(NoopEncoder), Arc::from("H:1"));
        (sink, outbound)
    }

    #[test]
    fn reserve_respects_concurrency_limit() {
        let mut pool = WorkerPool::new(1);
        assert!(pool.reserve());
        assert!(!pool.reserve());
    }

    #[tokio::test]
    async fn spawn_sends_complete_on_ok() {
        let mut pool = WorkerPool::new(2);
        assert!(pool.reserve());
        let (sink, outbound) = sink();

        pool.spawn(sink, || Ok(Bytes::from_static(b"done")));
        pool.terminate().await;

        let frame = outbound.lock().pop_front().expect("a result was enqueued");
        let GearmanEvent::Binary(frame) = frame else { panic!("expected binary") };
        assert_eq!(frame.ptype, PacketType::WorkComplete);
    }

    #[tokio::test]
    async fn spawn_sends_failure_on_err() {
        let mut pool = WorkerPool::new(2);
        assert!(pool.reserve());
        let (sink, outbound) = sink();

        pool.spawn(sink, || Err(()));
        pool.terminate().await;

        let frame = outbound.lock().pop_front().expect("a result was enqueued");
        let GearmanEvent::Binary(frame) = frame else { panic!("expected binary") };
        assert_eq!(frame.ptype, PacketType::WorkFail);
    }
}

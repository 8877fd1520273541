//! Job and job-request value types shared by the client and worker façades.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;

use crate::wire::protocol::Priority;

/// A unit of work: a named task plus an opaque payload.
///
/// Created by the client on submission (where `handle` starts unset) or by
/// the worker on `JOB_ASSIGN(_UNIQ)` (where it arrives already set). `handle`
/// is assigned exactly once, by the server.
#[derive(Clone, Debug)]
pub struct Job {
    pub task: Arc<str>,
    pub unique: Arc<str>,
    pub data: Bytes,
    pub handle: Option<Arc<str>>,
}

impl Job {
    pub fn new(task: impl Into<Arc<str>>, unique: impl Into<Arc<str>>, data: Bytes) -> Self {
        Self {
            task: task.into(),
            unique: unique.into(),
            data,
            handle: None,
        }
    }
}

/// A client request's position in the `UNKNOWN → PENDING → CREATED →
/// {COMPLETE|FAILED}` state machine.
///
/// For background requests `CREATED` is terminal and is treated as complete
/// by [`JobRequest::is_complete`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestState {
    /// Not bound to a connection, or its connection was lost.
    Unknown,
    /// `SUBMIT_JOB` sent, awaiting `JOB_CREATED`.
    Pending,
    /// Server handle received; open to further updates.
    Created,
    Complete,
    Failed,
}

/// A progress snapshot as reported by `WORK_STATUS`/`STATUS_RES`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JobStatus {
    pub known: bool,
    pub running: bool,
    pub numerator: u64,
    pub denominator: u64,
    pub time_received: Option<Instant>,
}

/// A client-side request tracking one submitted [`Job`] through its lifetime.
#[derive(Clone, Debug)]
pub struct JobRequest {
    pub job: Job,
    pub priority: Priority,
    pub background: bool,
    pub max_connect_attempts: u32,
    pub connect_attempts: u32,
    pub state: RequestState,
    pub result: Option<Bytes>,
    pub exception: Option<Bytes>,
    pub data_updates: VecDeque<Bytes>,
    pub warning_updates: VecDeque<Bytes>,
    pub status: JobStatus,
    pub timed_out: bool,
    /// Index (into the client's connection manager) of the server this
    /// request was last submitted to. Set by the client façade once
    /// `send_job_request` succeeds; later status queries are sent on this
    /// same connection, since a job handle is only meaningful to the server
    /// that issued it.
    pub server_index: Option<usize>,
}

impl JobRequest {
    pub fn new(job: Job, priority: Priority, background: bool, max_connect_attempts: u32) -> Self {
        Self {
            job,
            priority,
            background,
            max_connect_attempts,
            connect_attempts: 0,
            state: RequestState::Unknown,
            result: None,
            exception: None,
            data_updates: VecDeque::new(),
            warning_updates: VecDeque::new(),
            status: JobStatus::default(),
            timed_out: false,
            server_index: None,
        }
    }

    /// True once this request has reached a state the caller no longer needs
    /// to poll for. Background requests are complete the moment a handle is
    /// assigned; a background request that somehow enters `FAILED` is, per
    /// the wire contract, not expected and is deliberately NOT treated as
    /// complete here.
    pub fn is_complete(&self) -> bool {
        match self.state {
            RequestState::Complete => true,
            RequestState::Created if self.background => true,
            _ => false,
        }
    }
}

/// Generates a 16-byte random key, hex-encoded, for requests submitted
/// without an explicit `unique` value.
pub fn random_unique() -> String {
    use rand::RngCore;

    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);

    let mut out = String::with_capacity(32);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_created_is_complete_but_not_failed() {
        let job = Job::new("reverse", "u1", Bytes::from_static(b"abc"));
        let mut req = JobRequest::new(job, Priority::None, true, 3);
        req.state = RequestState::Created;
        assert!(req.is_complete());

        req.state = RequestState::Failed;
        assert!(!req.is_complete());
    }

    #[test]
    fn foreground_is_complete_only_at_complete() {
        let job = Job::new("reverse", "u1", Bytes::from_static(b"abc"));
        let mut req = JobRequest::new(job, Priority::None, false, 3);
        req.state = RequestState::Created;
        assert!(!req.is_complete());
        req.state = RequestState::Complete;
        assert!(req.is_complete());
    }

    #[test]
    fn random_unique_is_32_hex_chars() {
        let u = random_unique();
        assert_eq!(u.len(), 32);
        assert!(u.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

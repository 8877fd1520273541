//! A client-side implementation of the Gearman job-queue protocol.
//!
//! Three façades sit on top of a shared connection/protocol engine:
//! [`client::Client`] submits jobs and tracks them to completion,
//! [`worker::Worker`] advertises capabilities and executes assigned jobs, and
//! [`admin::Admin`] issues the server's line-oriented control commands.

pub mod admin;
pub mod client;
pub mod encoding;
pub mod error;
pub mod handler;
pub mod job;
pub mod manager;
pub mod net;
pub mod pool;
pub mod wire;
pub mod worker;

pub use admin::Admin;
pub use client::{Client, JobSpec, SubmitOptions};
pub use encoding::{DataEncoder, NoopEncoder};
pub use error::{GearmanError, Result};
pub use job::{Job, JobRequest, JobStatus, RequestState};
pub use wire::protocol::{Priority, DEFAULT_PORT};
pub use worker::Worker;

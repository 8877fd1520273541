use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{trace, warn};

use super::{CommandHandler, HandlerContext};
use crate::error::{GearmanError, Result};
use crate::job::{JobRequest, RequestState};
use crate::net::Connection;
use crate::wire::events::GearmanEvent;
use crate::wire::protocol::{Frame, PacketType};

pub type SharedRequest = Arc<Mutex<JobRequest>>;

/// Per-connection client state: the FIFO of requests awaiting `JOB_CREATED`,
/// and the map from server-assigned handle to request once one is bound.
#[derive(Default)]
pub struct ClientHandler {
    request_queue: VecDeque<SharedRequest>,
    handle_map: HashMap<String, SharedRequest>,
}

impl ClientHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends `SUBMIT_JOB`/`SUBMIT_JOB_BG` (in the priority-appropriate
    /// variant) for a request currently in `UNKNOWN`, and moves it to
    /// `PENDING`.
    pub fn send_job_request(
        &mut self,
        req: &SharedRequest,
        conn: &mut Connection,
        ctx: &mut dyn HandlerContext,
    ) -> Result<()> {
        let mut guard = req.lock();
        if guard.state != RequestState::Unknown {
            return Err(GearmanError::InvalidClientState(
                "send_job_request requires state = UNKNOWN".into(),
            ));
        }

        let ptype = guard.priority.submit_packet_type(guard.background);
        let data = ctx.encoder().encode(&guard.job.data)?;

        conn.send_command(GearmanEvent::Binary(Frame::new(
            ptype,
            vec![
                guard.job.task.as_bytes().to_vec().into(),
                guard.job.unique.as_bytes().to_vec().into(),
                data,
            ],
        )));

        guard.state = RequestState::Pending;
        drop(guard);

        self.request_queue.push_back(Arc::clone(req));
        Ok(())
    }

    /// Sends `GET_STATUS` for a request that already has a server handle.
    pub fn send_get_status_of_job(&mut self, req: &SharedRequest, conn: &mut Connection) -> Result<()> {
        let handle = {
            let guard = req.lock();
            guard
                .job
                .handle
                .clone()
                .ok_or_else(|| GearmanError::InvalidClientState("request has no handle yet".into()))?
        };

        conn.send_command(GearmanEvent::Binary(Frame::new(
            PacketType::GetStatus,
            vec![handle.as_bytes().to_vec().into()],
        )));

        self.handle_map.insert(handle.to_string(), Arc::clone(req));
        Ok(())
    }

    fn unbind(&mut self, handle: &str) {
        self.handle_map.remove(handle);
    }
}

fn parse_u64(bytes: &[u8]) -> Result<u64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| GearmanError::protocol("expected an integer field"))
}

fn parse_bool(bytes: &[u8]) -> bool {
    bytes == b"1"
}

impl CommandHandler for ClientHandler {
    fn on_connected(&mut self, _conn: &mut Connection) {}

    fn dispatch(
        &mut self,
        event: GearmanEvent,
        _conn: &mut Connection,
        ctx: &mut dyn HandlerContext,
    ) -> Result<bool> {
        let GearmanEvent::Binary(frame) = event else {
            return Err(GearmanError::protocol("client handler received a text event"));
        };

        match frame.ptype {
            PacketType::JobCreated => {
                let handle = String::from_utf8_lossy(frame.field(0)).into_owned();

                let req = self
                    .request_queue
                    .pop_front()
                    .ok_or_else(|| GearmanError::InvalidClientState("JOB_CREATED with no pending request".into()))?;

                {
                    let mut guard = req.lock();
                    if guard.state != RequestState::Pending {
                        return Err(GearmanError::InvalidClientState(
                            "JOB_CREATED matched a request not in PENDING".into(),
                        ));
                    }
                    guard.job.handle = Some(handle.clone().into());
                    guard.state = RequestState::Created;
                }

                self.handle_map.insert(handle, req);
            },
            PacketType::WorkData => {
                let handle = String::from_utf8_lossy(frame.field(0)).into_owned();
                if let Some(req) = self.handle_map.get(&handle) {
                    let decoded = ctx.encoder().decode(frame.field(1))?;
                    let mut guard = req.lock();
                    guard.data_updates.push_back(decoded);
                }
            },
            PacketType::WorkWarning => {
                let handle = String::from_utf8_lossy(frame.field(0)).into_owned();
                if let Some(req) = self.handle_map.get(&handle) {
                    let decoded = ctx.encoder().decode(frame.field(1))?;
                    let mut guard = req.lock();
                    guard.warning_updates.push_back(decoded);
                }
            },
            PacketType::WorkStatus => {
                let handle = String::from_utf8_lossy(frame.field(0)).into_owned();
                let numerator = parse_u64(frame.field(1))?;
                let denominator = parse_u64(frame.field(2))?;
                if let Some(req) = self.handle_map.get(&handle) {
                    let mut guard = req.lock();
                    guard.status.known = true;
                    guard.status.running = true;
                    guard.status.numerator = numerator;
                    guard.status.denominator = denominator;
                    guard.status.time_received = Some(Instant::now());
                }
            },
            PacketType::WorkComplete => {
                let handle = String::from_utf8_lossy(frame.field(0)).into_owned();
                let decoded = ctx.encoder().decode(frame.field(1))?;
                if let Some(req) = self.handle_map.get(&handle) {
                    let mut guard = req.lock();
                    guard.result = Some(decoded);
                    guard.state = RequestState::Complete;
                }
                self.unbind(&handle);
            },
            PacketType::WorkFail => {
                let handle = String::from_utf8_lossy(frame.field(0)).into_owned();
                if let Some(req) = self.handle_map.get(&handle) {
                    let mut guard = req.lock();
                    guard.state = RequestState::Failed;
                }
                self.unbind(&handle);
            },
            PacketType::WorkException => {
                let handle = String::from_utf8_lossy(frame.field(0)).into_owned();
                let decoded = ctx.encoder().decode(frame.field(1))?;
                if let Some(req) = self.handle_map.get(&handle) {
                    let mut guard = req.lock();
                    guard.exception = Some(decoded);
                }
            },
            PacketType::StatusRes => {
                let handle = String::from_utf8_lossy(frame.field(0)).into_owned();
                let known = parse_bool(frame.field(1));
                let running = parse_bool(frame.field(2));
                let numerator = parse_u64(frame.field(3))?;
                let denominator = parse_u64(frame.field(4))?;

                if let Some(req) = self.handle_map.get(&handle) {
                    let mut guard = req.lock();
                    guard.status.known = known;
                    guard.status.running = running;
                    guard.status.numerator = numerator;
                    guard.status.denominator = denominator;
                    guard.status.time_received = Some(Instant::now());
                }

                if !known {
                    self.unbind(&handle);
                }
            },
            PacketType::Error => {
                trace!("server ERROR frame on client connection");
                return Ok(ctx.on_server_error(frame.field(0), frame.field(1)));
            },
            other => {
                warn!(command = other.name(), "unexpected command on client connection");
                return Err(GearmanError::UnknownCommand(other.name().to_string()));
            },
        }

        Ok(true)
    }

    /// Every pending or in-flight request goes back to `UNKNOWN` so the
    /// client façade can retry it against another server.
    fn on_io_error(&mut self) {
        for req in self.request_queue.drain(..) {
            req.lock().state = RequestState::Unknown;
        }
        for (_, req) in self.handle_map.drain() {
            req.lock().state = RequestState::Unknown;
        }
    }
}

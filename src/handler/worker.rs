use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::warn;

use super::{CommandHandler, HandlerContext};
use crate::encoding::DataEncoder;
use crate::error::{GearmanError, Result};
use crate::job::Job;
use crate::net::notification::Notifier;
use crate::net::Connection;
use crate::pool::{CallbackResult, ResultSink, WorkerPool};
use crate::wire::events::GearmanEvent;
use crate::wire::protocol::{Frame, PacketType};

/// A registered task callback: given the assigned job, returns the bytes to
/// send as `WORK_COMPLETE`, or `Err(())` to send `WORK_FAIL`.
pub type JobCallback = Arc<dyn Fn(&Job) -> CallbackResult + Send + Sync>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum WorkerState {
    Sleep,
    AwaitingJob,
}

/// Per-connection worker state. Multiple connections (one per configured
/// server) share the same abilities, client id, callback table, and pool —
/// those live on the façade and are handed in by `Arc`/shared-lock handles.
pub struct WorkerHandler {
    state: WorkerState,
    grabbing: bool,
    waiting: bool,
    abilities: Vec<Arc<str>>,
    client_id: Option<Arc<str>>,
    callbacks: Arc<Mutex<HashMap<String, JobCallback>>>,
    pool: Arc<Mutex<WorkerPool>>,
    notifier: Notifier,
    encoder: Arc<dyn DataEncoder>,
}

impl WorkerHandler {
    pub fn new(
        callbacks: Arc<Mutex<HashMap<String, JobCallback>>>,
        pool: Arc<Mutex<WorkerPool>>,
        notifier: Notifier,
        encoder: Arc<dyn DataEncoder>,
    ) -> Self {
        Self {
            state: WorkerState::Sleep,
            grabbing: false,
            waiting: false,
            abilities: Vec::new(),
            client_id: None,
            callbacks,
            pool,
            notifier,
            encoder,
        }
    }

    /// Sends `RESET_ABILITIES` then `CAN_DO` per ability, in order.
    pub fn set_abilities(&mut self, abilities: Vec<Arc<str>>, conn: &mut Connection) {
        conn.send_command(GearmanEvent::Binary(Frame::new(PacketType::ResetAbilities, vec![])));
        for task in &abilities {
            conn.send_command(GearmanEvent::Binary(Frame::new(
                PacketType::CanDo,
                vec![task.as_bytes().to_vec().into()],
            )));
        }
        self.abilities = abilities;
    }

    pub fn set_client_id(&mut self, id: Option<Arc<str>>, conn: &mut Connection) {
        if let Some(id) = &id {
            conn.send_command(GearmanEvent::Binary(Frame::new(
                PacketType::SetClientId,
                vec![id.as_bytes().to_vec().into()],
            )));
        }
        self.client_id = id;
    }

    /// Updates the stored ability/client-id state without sending anything —
    /// for a connection that isn't connected yet, whose `on_connected` will
    /// send the current values itself once it comes up.
    pub fn sync_abilities(&mut self, abilities: Vec<Arc<str>>) {
        self.abilities = abilities;
    }

    pub fn sync_client_id(&mut self, id: Option<Arc<str>>) {
        self.client_id = id;
    }

    fn sleep(&mut self, conn: &mut Connection) {
        conn.send_command(GearmanEvent::Binary(Frame::new(PacketType::PreSleep, vec![])));
        self.state = WorkerState::Sleep;
    }
}

fn field_str(bytes: &Bytes) -> Arc<str> {
    Arc::from(String::from_utf8_lossy(bytes).into_owned())
}

impl CommandHandler for WorkerHandler {
    fn on_connected(&mut self, conn: &mut Connection) {
        let id = self.client_id.clone();
        self.set_client_id(id, conn);
        let abilities = self.abilities.clone();
        self.set_abilities(abilities, conn);
        self.sleep(conn);
    }

    fn dispatch(
        &mut self,
        event: GearmanEvent,
        conn: &mut Connection,
        _ctx: &mut dyn HandlerContext,
    ) -> Result<bool> {
        let GearmanEvent::Binary(frame) = event else {
            return Err(GearmanError::protocol("worker handler received a text event"));
        };

        match frame.ptype {
            PacketType::Noop if self.state == WorkerState::Sleep => {
                if self.pool.lock().reserve() {
                    self.grabbing = true;
                    conn.send_command(GearmanEvent::Binary(Frame::new(PacketType::GrabJobUniq, vec![])));
                    self.state = WorkerState::AwaitingJob;
                } else {
                    self.waiting = true;
                }
            },
            PacketType::NoJob if self.state == WorkerState::AwaitingJob => {
                self.pool.lock().release();
                self.grabbing = false;
                self.sleep(conn);
            },
            PacketType::JobAssign | PacketType::JobAssignUniq if self.state == WorkerState::AwaitingJob => {
                let handle = field_str(frame.field(0));
                let task = field_str(frame.field(1));

                let (unique, data) = if frame.ptype == PacketType::JobAssignUniq {
                    (field_str(frame.field(2)), self.encoder.decode(frame.field(3))?)
                } else {
                    (Arc::from(""), self.encoder.decode(frame.field(2))?)
                };

                if !self.abilities.contains(&task) {
                    return Err(GearmanError::protocol(format!("JOB_ASSIGN for unregistered task {task}")));
                }

                let callback = self.callbacks.lock().get(task.as_ref()).cloned();
                self.grabbing = false;

                match callback {
                    Some(callback) => {
                        let job = Job {
                            task: Arc::clone(&task),
                            unique,
                            data,
                            handle: Some(Arc::clone(&handle)),
                        };

                        let sink = ResultSink::new(
                            conn.outbound_handle(),
                            self.notifier.clone(),
                            Arc::clone(&self.encoder),
                            handle,
                        );

                        self.pool.lock().spawn(sink, move || callback(&job));
                    },
                    None => {
                        warn!(%task, "no callback registered for assigned task");
                    },
                }

                self.sleep(conn);
            },
            PacketType::Error => {
                if self.grabbing {
                    self.pool.lock().release();
                    self.grabbing = false;
                }
                self.sleep(conn);
            },
            other => {
                warn!(command = other.name(), "unexpected command on worker connection");
            },
        }

        Ok(true)
    }

    fn on_io_error(&mut self) {
        if self.grabbing {
            self.pool.lock().release();
        }
        self.grabbing = false;
        self.waiting = false;
        self.state = WorkerState::Sleep;
    }

    /// If stalled on pool saturation, re-enter the sleep/NOOP cycle.
    fn prepare(&mut self, conn: &mut Connection) {
        if self.waiting {
            self.waiting = false;
            self.sleep(conn);
        }
    }
}

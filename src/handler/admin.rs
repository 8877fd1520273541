use std::collections::VecDeque;

use bytes::Bytes;

use super::{CommandHandler, HandlerContext};
use crate::error::{GearmanError, Result};
use crate::net::Connection;
use crate::wire::events::GearmanEvent;
use crate::wire::protocol::{AdminCommandTag, Frame, PacketType};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatusRow {
    pub task: String,
    pub queued: u64,
    pub running: u64,
    pub workers: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkerRow {
    pub fd: String,
    pub ip: String,
    pub client_id: String,
    pub tasks: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AdminResponse {
    Status(Vec<StatusRow>),
    Workers(Vec<WorkerRow>),
    Version(String),
    Maxqueue,
    Shutdown,
    Echo(Bytes),
}

/// A command this handler sent, pending a matching response — either a
/// single-line admin text command, or the binary echo round-trip.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SentCommand {
    Text(AdminCommandTag),
    Echo,
}

/// Tracks outstanding admin commands and their parsed responses. A text
/// command's response may span multiple lines (`status`, `workers`),
/// terminated by a lone `.`; this handler accumulates those lines across
/// successive `dispatch` calls.
#[derive(Default)]
pub struct AdminHandler {
    sent: VecDeque<SentCommand>,
    responses: VecDeque<(SentCommand, AdminResponse)>,
    status_buf: Vec<StatusRow>,
    workers_buf: Vec<WorkerRow>,
}

impl AdminHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_echo(&mut self, data: &[u8], conn: &mut Connection) {
        conn.send_command(GearmanEvent::Binary(Frame::new(PacketType::EchoReq, vec![data.to_vec().into()])));
        self.sent.push_back(SentCommand::Echo);
    }

    pub fn send_text(&mut self, tag: AdminCommandTag, line: String, conn: &mut Connection) {
        conn.send_command(GearmanEvent::Text(line));
        self.sent.push_back(SentCommand::Text(tag));

        // `shutdown` has no response body at all, so there is nothing for
        // `dispatch` to complete it on — record it as answered immediately.
        if tag == AdminCommandTag::Shutdown {
            self.sent.pop_back();
            self.responses
                .push_back((SentCommand::Text(tag), AdminResponse::Shutdown));
        }
    }

    pub fn response_ready(&self) -> bool {
        !self.responses.is_empty()
    }

    pub fn pop_response(&mut self) -> Result<(SentCommand, AdminResponse)> {
        self.responses
            .pop_front()
            .ok_or_else(|| GearmanError::InvalidAdminClientState("no response is ready".into()))
    }

    fn complete(&mut self, response: AdminResponse) -> Result<()> {
        let tag = self
            .sent
            .pop_front()
            .ok_or_else(|| GearmanError::InvalidAdminClientState("response with no matching sent command".into()))?;
        self.responses.push_back((tag, response));
        Ok(())
    }

    fn parse_status_row(line: &str) -> Result<StatusRow> {
        let mut parts = line.split('\t');
        let mut next = |what: &str| -> Result<&str> {
            parts
                .next()
                .ok_or_else(|| GearmanError::protocol(format!("status row missing {what}")))
        };
        let task = next("task")?.to_string();
        let queued = next("queued")?
            .parse()
            .map_err(|_| GearmanError::protocol("status row: bad queued count"))?;
        let running = next("running")?
            .parse()
            .map_err(|_| GearmanError::protocol("status row: bad running count"))?;
        let workers = next("workers")?
            .parse()
            .map_err(|_| GearmanError::protocol("status row: bad workers count"))?;
        Ok(StatusRow { task, queued, running, workers })
    }

    fn parse_worker_row(line: &str) -> Result<WorkerRow> {
        let (head, tasks) = line
            .split_once(" : ")
            .ok_or_else(|| GearmanError::protocol("workers row missing ' : ' separator"))?;

        let mut head_parts = head.split(' ');
        let fd = head_parts
            .next()
            .ok_or_else(|| GearmanError::protocol("workers row missing fd"))?
            .to_string();
        let ip = head_parts
            .next()
            .ok_or_else(|| GearmanError::protocol("workers row missing ip"))?
            .to_string();
        let client_id = head_parts
            .next()
            .ok_or_else(|| GearmanError::protocol("workers row missing client id"))?
            .to_string();

        let tasks = tasks.split(' ').filter(|s| !s.is_empty()).map(str::to_string).collect();

        Ok(WorkerRow { fd, ip, client_id, tasks })
    }
}

impl CommandHandler for AdminHandler {
    fn on_connected(&mut self, _conn: &mut Connection) {}

    fn dispatch(
        &mut self,
        event: GearmanEvent,
        _conn: &mut Connection,
        _ctx: &mut dyn HandlerContext,
    ) -> Result<bool> {
        match event {
            GearmanEvent::Binary(frame) if frame.ptype == PacketType::EchoRes => {
                self.complete(AdminResponse::Echo(frame.field(0).clone()))?;
                Ok(true)
            },
            GearmanEvent::Binary(frame) if frame.ptype == PacketType::Error => Ok(true),
            GearmanEvent::Binary(frame) => {
                Err(GearmanError::UnknownCommand(frame.ptype.name().to_string()))
            },
            GearmanEvent::Text(line) => {
                let tag = match self.sent.front() {
                    Some(SentCommand::Text(tag)) => *tag,
                    _ => return Err(GearmanError::InvalidAdminClientState("unexpected text response".into())),
                };

                match tag {
                    AdminCommandTag::Status => {
                        if line == "." {
                            let rows = std::mem::take(&mut self.status_buf);
                            self.complete(AdminResponse::Status(rows))?;
                        } else {
                            self.status_buf.push(Self::parse_status_row(&line)?);
                        }
                    },
                    AdminCommandTag::Workers => {
                        if line == "." {
                            let rows = std::mem::take(&mut self.workers_buf);
                            self.complete(AdminResponse::Workers(rows))?;
                        } else {
                            self.workers_buf.push(Self::parse_worker_row(&line)?);
                        }
                    },
                    AdminCommandTag::Version => {
                        self.complete(AdminResponse::Version(line))?;
                    },
                    AdminCommandTag::Maxqueue => {
                        if line != "OK" {
                            return Err(GearmanError::protocol(format!("maxqueue: unexpected response {line:?}")));
                        }
                        self.complete(AdminResponse::Maxqueue)?;
                    },
                    AdminCommandTag::Shutdown => {
                        // No response body is expected; `send_text` already
                        // completed this synchronously.
                    },
                }

                Ok(true)
            },
        }
    }

    fn on_io_error(&mut self) {
        self.sent.clear();
        self.responses.clear();
        self.status_buf.clear();
        self.workers_buf.clear();
    }
}

//! The connection manager: owns every connection for one role instance, runs
//! the poll loop, and routes readiness/errors to each connection's handler.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::encoding::DataEncoder;
use crate::error::Result;
use crate::handler::{CommandHandler, HandlerContext};
use crate::net::notification::{self, Listener, Notifier, PREPARE, TERMINATE};
use crate::net::Connection;

struct ManagerCtx<'a> {
    encoder: &'a dyn DataEncoder,
}

impl HandlerContext for ManagerCtx<'_> {
    fn encoder(&self) -> &dyn DataEncoder {
        self.encoder
    }

    fn on_server_error(&mut self, code: &[u8], text: &[u8]) -> bool {
        warn!(
            code = %String::from_utf8_lossy(code),
            text = %String::from_utf8_lossy(text),
            "server sent an ERROR frame"
        );
        false
    }
}

/// An owned [`HandlerContext`] for façade code that calls a handler's send
/// methods directly, outside `fetch_commands`/`poll` (e.g. submitting a job
/// before the poll loop has started).
pub(crate) struct FacadeCtx {
    encoder: Arc<dyn DataEncoder>,
}

impl FacadeCtx {
    pub(crate) fn new(encoder: Arc<dyn DataEncoder>) -> Self {
        Self { encoder }
    }
}

impl HandlerContext for FacadeCtx {
    fn encoder(&self) -> &dyn DataEncoder {
        self.encoder.as_ref()
    }

    fn on_server_error(&mut self, code: &[u8], text: &[u8]) -> bool {
        warn!(
            code = %String::from_utf8_lossy(code),
            text = %String::from_utf8_lossy(text),
            "server sent an ERROR frame"
        );
        false
    }
}

/// Owns a role's connections and drives the poll loop described in the
/// protocol design: register readiness, poll once, dispatch reads/writes,
/// route errors, repeat until the caller's predicates say to stop.
pub struct ConnectionManager<H> {
    connections: Vec<(Connection, H)>,
    encoder: Arc<dyn DataEncoder>,
    notifier: Notifier,
    wake_listener: Listener,
    terminated: bool,
}

impl<H: CommandHandler> ConnectionManager<H> {
    pub fn new(encoder: Arc<dyn DataEncoder>) -> Self {
        let (notifier, wake_listener) = notification::channel();
        Self {
            connections: Vec::new(),
            encoder,
            notifier,
            wake_listener,
            terminated: false,
        }
    }

    pub fn encoder(&self) -> Arc<dyn DataEncoder> {
        Arc::clone(&self.encoder)
    }

    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    pub fn add_connection(&mut self, host: impl Into<String>, port: u16, handler: H) -> usize {
        self.connections.push((Connection::new(host, port), handler));
        self.connections.len() - 1
    }

    pub fn connection(&self, idx: usize) -> &Connection {
        &self.connections[idx].0
    }

    pub fn connection_mut(&mut self, idx: usize) -> &mut Connection {
        &mut self.connections[idx].0
    }

    pub fn handler(&self, idx: usize) -> &H {
        &self.connections[idx].1
    }

    pub fn handler_mut(&mut self, idx: usize) -> &mut H {
        &mut self.connections[idx].1
    }

    /// Splits out a simultaneous `&mut Connection` and `&mut H` for `idx`, for
    /// façade code that calls a handler's send methods directly.
    pub fn split_mut(&mut self, idx: usize) -> (&mut Connection, &mut H) {
        let (conn, handler) = &mut self.connections[idx];
        (conn, handler)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Idempotent connect: a no-op if already connected.
    #[instrument(skip(self))]
    pub async fn establish_connection(&mut self, idx: usize) -> Result<()> {
        let (conn, handler) = &mut self.connections[idx];
        if conn.is_connected() {
            return Ok(());
        }
        conn.connect().await?;
        handler.on_connected(conn);
        Ok(())
    }

    async fn handle_read(&mut self, idx: usize) -> Result<()> {
        let encoder = Arc::clone(&self.encoder);
        let (conn, handler) = &mut self.connections[idx];
        conn.read_data_from_socket().await?;
        conn.read_commands_from_buffer()?;
        let mut ctx = ManagerCtx { encoder: encoder.as_ref() };
        handler.fetch_commands(conn, &mut ctx)?;
        Ok(())
    }

    async fn handle_write(&mut self, idx: usize) -> Result<()> {
        let (conn, _handler) = &mut self.connections[idx];
        conn.send_commands_to_buffer()?;
        conn.send_data_to_socket().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn handle_error(&mut self, idx: usize) {
        let (conn, handler) = &mut self.connections[idx];
        handler.on_io_error();
        conn.close().await;
    }

    /// The central loop. `before_poll`/`after_poll` decide whether the loop
    /// should keep running (return `false` to stop); `timeout` bounds total
    /// wall-clock time, `None` means run until a stopping condition fires.
    /// Both closures are handed `&Self` so callers can read back handler or
    /// connection state (e.g. "has a response arrived yet") without needing
    /// their own separate borrow of the manager.
    #[instrument(skip_all)]
    pub async fn poll(
        &mut self,
        mut before_poll: impl FnMut(&Self) -> bool,
        mut after_poll: impl FnMut(&Self) -> bool,
        timeout: Option<Duration>,
    ) -> bool {
        let start = Instant::now();
        let mut workable = before_poll(&*self);

        loop {
            let pollable = self.connections.iter().any(|(c, _)| c.is_connected());
            if !workable || !pollable {
                break;
            }

            let remaining = match timeout {
                Some(t) => match t.checked_sub(start.elapsed()) {
                    Some(r) if !r.is_zero() => r,
                    _ => break,
                },
                None => Duration::from_secs(3600),
            };

            if self.poll_once(remaining).await {
                break; // termination requested
            }

            workable = after_poll(&*self);
        }

        workable
    }

    /// One iteration: wait for any readable/writable connection or a wake
    /// byte, dispatch whatever became ready, and close anything broken.
    /// Returns `true` if termination was requested.
    async fn poll_once(&mut self, timeout: Duration) -> bool {
        let readable: Vec<usize> =
            (0..self.connections.len()).filter(|&i| self.connections[i].0.readable()).collect();
        let writable: Vec<usize> =
            (0..self.connections.len()).filter(|&i| self.connections[i].0.writable()).collect();

        enum Ready {
            Read(usize),
            Write(usize),
            Woke(Option<u8>),
            TimedOut,
        }

        let ready = {
            let read_fut = wait_any(&self.connections, &readable, Connection::wait_readable);
            let write_fut = wait_any(&self.connections, &writable, Connection::wait_writable);

            tokio::select! {
                idx = read_fut, if !readable.is_empty() => Ready::Read(idx),
                idx = write_fut, if !writable.is_empty() => Ready::Write(idx),
                byte = self.wake_listener.recv() => Ready::Woke(byte),
                _ = tokio::time::sleep(timeout) => Ready::TimedOut,
            }
        };

        let mut broken = Vec::new();

        match ready {
            Ready::Read(idx) => {
                if let Err(err) = self.handle_read(idx).await {
                    warn!(%err, idx, "read failed");
                    broken.push(idx);
                }
            },
            Ready::Write(idx) => {
                if let Err(err) = self.handle_write(idx).await {
                    warn!(%err, idx, "write failed");
                    broken.push(idx);
                }
            },
            Ready::Woke(Some(notification::WAKE)) => {},
            Ready::Woke(Some(PREPARE)) => {
                for (conn, handler) in &mut self.connections {
                    handler.prepare(conn);
                }
            },
            Ready::Woke(Some(TERMINATE)) => {
                self.terminated = true;
                return true;
            },
            Ready::Woke(Some(byte)) => debug!(byte = byte as u32, "unknown wake byte"),
            Ready::Woke(None) | Ready::TimedOut => {},
        }

        for idx in broken {
            self.handle_error(idx).await;
        }

        self.terminated
    }

    pub fn terminate(&mut self) {
        self.notifier.wake(TERMINATE);
    }
}

/// Races the given connections' readiness futures (as selected by `wait`),
/// returning the index of whichever becomes ready first. Never resolves if
/// `candidates` is empty — callers must guard with a `select!` `if` clause.
async fn wait_any<H, F, Fut>(connections: &[(Connection, H)], candidates: &[usize], wait: F) -> usize
where
    F: Fn(&Connection) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    if candidates.is_empty() {
        std::future::pending::<()>().await;
        unreachable!()
    }

    let futs = candidates.iter().map(|&i| {
        let wait = &wait;
        let conn = &connections[i].0;
        async move {
            let _ = wait(conn).await;
            i
        }
    });

    let pinned: Vec<_> = futs.map(Box::pin).collect();
    let (idx, _, _) = futures::future::select_all(pinned).await;
    idx
}

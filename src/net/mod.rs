//! A reconnectable, buffered duplex wrapper over one Gearman server socket.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::codec::{Decoder as _, Encoder as _};
use tracing::{debug, instrument, warn};

use crate::error::{GearmanError, Result};
use crate::wire::decoder::Decoder;
use crate::wire::encoder::Encoder;
use crate::wire::events::GearmanEvent;

pub mod notification;

/// Reconnects are gated for this long after any failed attempt.
const COOLDOWN: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 4096;

/// The outbound command queue, shared so worker-pool callbacks can enqueue a
/// job's result directly instead of routing back through the main loop.
/// This is the one piece of connection state the mutation discipline in §5
/// allows outside callers to touch, and only through this lock.
pub type OutboundQueue = Arc<Mutex<VecDeque<GearmanEvent>>>;

/// A single outbound connection to a Gearman server.
pub struct Connection {
    pub host: String,
    pub port: u16,
    stream: Option<TcpStream>,
    connected: bool,
    /// Suppresses reads during drain-on-shutdown, so in-flight writes can
    /// flush without the handler reacting to further inbound commands.
    pub write_only: bool,
    inbound_buf: BytesMut,
    outbound_buf: BytesMut,
    inbound_queue: VecDeque<GearmanEvent>,
    outbound_queue: OutboundQueue,
    allowed_connect_time: Option<Instant>,
    decoder: Decoder,
    encoder: Encoder,
}

impl Connection {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            stream: None,
            connected: false,
            write_only: false,
            inbound_buf: BytesMut::new(),
            outbound_buf: BytesMut::new(),
            inbound_queue: VecDeque::new(),
            outbound_queue: Arc::new(Mutex::new(VecDeque::new())),
            allowed_connect_time: None,
            decoder: Decoder,
            encoder: Encoder,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// A cloneable handle to this connection's outbound queue, for handing
    /// to worker-pool callbacks that need to enqueue a job's result directly.
    pub fn outbound_handle(&self) -> OutboundQueue {
        Arc::clone(&self.outbound_queue)
    }

    /// `connected && !write_only` — whether the manager should poll this
    /// connection for read readiness.
    pub fn readable(&self) -> bool {
        self.connected && !self.write_only
    }

    /// `connected && (outbound queue or buffer non-empty)` — whether the
    /// manager should poll this connection for write readiness. Once both
    /// drain, this turns false, so the loop stops polling for write (no
    /// busy-wait on an always-writable socket).
    pub fn writable(&self) -> bool {
        self.connected && (!self.outbound_queue.lock().is_empty() || !self.outbound_buf.is_empty())
    }

    #[instrument(skip(self), fields(host = %self.host, port = self.port))]
    pub async fn connect(&mut self) -> Result<()> {
        if let Some(allowed_at) = self.allowed_connect_time {
            if Instant::now() < allowed_at {
                return Err(GearmanError::connection(format!(
                    "{}:{} is in cooldown after a recent failure",
                    self.host, self.port
                )));
            }
        }

        let result = TcpStream::connect((self.host.as_str(), self.port)).await;

        match result {
            Ok(stream) => {
                if let Err(err) = stream.set_nodelay(true) {
                    warn!(%err, "failed to set TCP_NODELAY");
                }
                debug!("connected");
                self.stream = Some(stream);
                self.connected = true;
                self.allowed_connect_time = None;
                Ok(())
            },
            Err(err) => {
                self.allowed_connect_time = Some(Instant::now() + COOLDOWN);
                Err(GearmanError::from(err))
            },
        }
    }

    pub async fn wait_readable(&self) -> Result<()> {
        let stream = self.stream.as_ref().expect("connect() called");
        stream.readable().await.map_err(GearmanError::from)
    }

    pub async fn wait_writable(&self) -> Result<()> {
        let stream = self.stream.as_ref().expect("connect() called");
        stream.writable().await.map_err(GearmanError::from)
    }

    /// Reads up to [`READ_CHUNK`] bytes into the inbound buffer. An empty
    /// read means the peer disconnected.
    pub async fn read_data_from_socket(&mut self) -> Result<usize> {
        let stream = self.stream.as_mut().expect("connect() called");

        let mut chunk = [0u8; READ_CHUNK];
        let n = match stream.try_read(&mut chunk) {
            Ok(0) => {
                self.connected = false;
                return Err(GearmanError::connection("remote disconnected"));
            },
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(0),
            Err(e) => {
                self.connected = false;
                return Err(GearmanError::from(e));
            },
        };

        self.inbound_buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Parses as many complete frames as are present, pushing them to the
    /// inbound queue. Returns the number parsed.
    pub fn read_commands_from_buffer(&mut self) -> Result<usize> {
        let mut count = 0;
        while let Some(evt) = self.decoder.decode(&mut self.inbound_buf)? {
            self.inbound_queue.push_back(evt);
            count += 1;
        }
        Ok(count)
    }

    pub fn read_command(&mut self) -> Option<GearmanEvent> {
        self.inbound_queue.pop_front()
    }

    pub fn send_command(&mut self, event: GearmanEvent) {
        self.outbound_queue.lock().push_back(event);
    }

    /// Serializes every queued outbound command into the outbound byte
    /// buffer.
    pub fn send_commands_to_buffer(&mut self) -> Result<()> {
        loop {
            let event = self.outbound_queue.lock().pop_front();
            let Some(event) = event else { break };
            self.encoder.encode(event, &mut self.outbound_buf)?;
        }
        Ok(())
    }

    /// Writes as much of the outbound buffer as the socket will accept right
    /// now. Returns the number of bytes still left to write.
    pub async fn send_data_to_socket(&mut self) -> Result<usize> {
        let stream = self.stream.as_mut().expect("connect() called");

        while !self.outbound_buf.is_empty() {
            match stream.try_write(&self.outbound_buf) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = self.outbound_buf.split_to(n);
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.connected = false;
                    return Err(GearmanError::from(e));
                },
            }
        }

        Ok(self.outbound_buf.len())
    }

    /// Closes the socket (idempotent) and resets all buffers/queues.
    #[instrument(skip(self), fields(host = %self.host, port = self.port))]
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("closed");
        }
        self.connected = false;
        self.write_only = false;
        self.inbound_buf.clear();
        self.outbound_buf.clear();
        self.inbound_queue.clear();
        self.outbound_queue.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writable_reflects_pending_output() {
        let mut conn = Connection::new("localhost", 4730);
        conn.connected = true;
        assert!(!conn.writable());

        conn.outbound_buf.extend_from_slice(b"x");
        assert!(conn.writable());
    }

    #[test]
    fn disconnected_connection_is_neither_readable_nor_writable() {
        let conn = Connection::new("localhost", 4730);
        assert!(!conn.readable());
        assert!(!conn.writable());
    }

    #[test]
    fn write_only_suppresses_readable() {
        let mut conn = Connection::new("localhost", 4730);
        conn.connected = true;
        conn.write_only = true;
        assert!(!conn.readable());
    }
}

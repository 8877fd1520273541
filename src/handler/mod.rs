//! Per-connection command-handler state machines.
//!
//! Each connection owns exactly one handler for its lifetime. `fetch_commands`
//! drains the connection's inbound queue and dispatches each command to a
//! per-role table (a `match` on [`PacketType`]/admin tag, replacing the
//! source's dynamic `recv_<command_name>` lookup with something the compiler
//! checks for us).

use crate::encoding::DataEncoder;
use crate::error::Result;
use crate::net::Connection;
use crate::wire::events::GearmanEvent;

pub mod admin;
pub mod client;
pub mod worker;

/// The capabilities a handler may call back into its manager for, without
/// holding a reference to the manager itself.
pub trait HandlerContext {
    fn encoder(&self) -> &dyn DataEncoder;

    /// Invoked when the server sends an `ERROR` frame. Returns whether
    /// `fetch_commands` should keep processing further queued commands on
    /// this connection (default handling: log and stop).
    fn on_server_error(&mut self, code: &[u8], text: &[u8]) -> bool;
}

pub trait CommandHandler {
    /// Invoked once, right after the connection's `connect()` succeeds, so
    /// the handler can send its startup commands (worker abilities,
    /// `SET_CLIENT_ID`, etc).
    fn on_connected(&mut self, conn: &mut Connection);

    /// Dispatches a single decoded event. Returns `Ok(true)` to keep
    /// draining the inbound queue, `Ok(false)` to stop early (used by the
    /// admin handler to yield between multi-frame responses).
    fn dispatch(
        &mut self,
        event: GearmanEvent,
        conn: &mut Connection,
        ctx: &mut dyn HandlerContext,
    ) -> Result<bool>;

    /// Drains and dispatches every currently-queued inbound command.
    fn fetch_commands(&mut self, conn: &mut Connection, ctx: &mut dyn HandlerContext) -> Result<bool> {
        while let Some(event) = conn.read_command() {
            if !self.dispatch(event, conn, ctx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Invoked just before the owning connection is closed, so per-connection
    /// request/job state can be invalidated (e.g. the client handler resets
    /// every pending request to `UNKNOWN`).
    fn on_io_error(&mut self);

    /// Invoked by the manager when it reads the `'s'` (re-prepare) wake byte.
    /// Only the worker handler does anything here (it may have stalled on
    /// pool saturation and needs nudging back into its sleep/NOOP cycle).
    fn prepare(&mut self, _conn: &mut Connection) {}
}

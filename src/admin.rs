//! The admin façade: issues the line-oriented control commands (`status`,
//! `workers`, `version`, `maxqueue`, `shutdown`) plus the binary `ECHO_REQ`
//! round-trip, against one configured server at a time.

use std::time::Duration;

use tokio::time::Instant;

use crate::encoding::NoopEncoder;
use crate::error::{GearmanError, Result};
use crate::handler::admin::{AdminHandler, AdminResponse, SentCommand};
use crate::manager::ConnectionManager;
use crate::wire::protocol::AdminCommandTag;

const PING_PAYLOAD: &[u8] = b"ping? pong!";

pub struct Admin {
    manager: ConnectionManager<AdminHandler>,
}

impl Admin {
    pub fn new() -> Self {
        Self { manager: ConnectionManager::new(std::sync::Arc::new(NoopEncoder)) }
    }

    pub fn add_server(&mut self, host: impl Into<String>, port: u16) -> usize {
        self.manager.add_connection(host, port, AdminHandler::new())
    }

    /// Round-trips `ECHO_REQ`/`ECHO_RES` and returns the measured latency.
    pub async fn ping_server(&mut self, server: usize, timeout: Option<Duration>) -> Result<Duration> {
        self.manager.establish_connection(server).await?;

        let start = Instant::now();
        {
            let (conn, handler) = self.manager.split_mut(server);
            handler.send_echo(PING_PAYLOAD, conn);
        }

        match self.wait_for_response(server, timeout).await? {
            AdminResponse::Echo(data) if data.as_ref() == PING_PAYLOAD => Ok(start.elapsed()),
            AdminResponse::Echo(_) => {
                Err(GearmanError::InvalidAdminClientState("echo payload did not match".into()))
            },
            _ => Err(GearmanError::InvalidAdminClientState("unexpected response to ECHO_REQ".into())),
        }
    }

    pub async fn get_status(
        &mut self,
        server: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<crate::handler::admin::StatusRow>> {
        self.send_and_wait(server, AdminCommandTag::Status, "status".to_string(), timeout)
            .await
            .and_then(|resp| match resp {
                AdminResponse::Status(rows) => Ok(rows),
                _ => Err(GearmanError::InvalidAdminClientState("unexpected response to status".into())),
            })
    }

    pub async fn get_workers(
        &mut self,
        server: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<crate::handler::admin::WorkerRow>> {
        self.send_and_wait(server, AdminCommandTag::Workers, "workers".to_string(), timeout)
            .await
            .and_then(|resp| match resp {
                AdminResponse::Workers(rows) => Ok(rows),
                _ => Err(GearmanError::InvalidAdminClientState("unexpected response to workers".into())),
            })
    }

    pub async fn get_version(&mut self, server: usize, timeout: Option<Duration>) -> Result<String> {
        self.send_and_wait(server, AdminCommandTag::Version, "version".to_string(), timeout)
            .await
            .and_then(|resp| match resp {
                AdminResponse::Version(v) => Ok(v),
                _ => Err(GearmanError::InvalidAdminClientState("unexpected response to version".into())),
            })
    }

    pub async fn send_maxqueue(
        &mut self,
        server: usize,
        task: &str,
        max_size: u64,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let line = format!("maxqueue {task} {max_size}");
        self.send_and_wait(server, AdminCommandTag::Maxqueue, line, timeout)
            .await
            .and_then(|resp| match resp {
                AdminResponse::Maxqueue => Ok(()),
                _ => Err(GearmanError::InvalidAdminClientState("unexpected response to maxqueue".into())),
            })
    }

    pub async fn send_shutdown(&mut self, server: usize, graceful: bool, timeout: Option<Duration>) -> Result<()> {
        let line = if graceful { "shutdown graceful".to_string() } else { "shutdown".to_string() };
        self.send_and_wait(server, AdminCommandTag::Shutdown, line, timeout)
            .await
            .and_then(|resp| match resp {
                AdminResponse::Shutdown => Ok(()),
                _ => Err(GearmanError::InvalidAdminClientState("unexpected response to shutdown".into())),
            })
    }

    async fn send_and_wait(
        &mut self,
        server: usize,
        tag: AdminCommandTag,
        line: String,
        timeout: Option<Duration>,
    ) -> Result<AdminResponse> {
        self.manager.establish_connection(server).await?;
        {
            let (conn, handler) = self.manager.split_mut(server);
            handler.send_text(tag, line, conn);
        }
        self.wait_for_response(server, timeout).await
    }

    async fn wait_for_response(&mut self, server: usize, timeout: Option<Duration>) -> Result<AdminResponse> {
        let ready = |mgr: &ConnectionManager<AdminHandler>| mgr.handler(server).response_ready();

        if !ready(&self.manager) {
            self.manager.poll(|_| true, |mgr| !ready(mgr), timeout).await;
        }

        if !ready(&self.manager) {
            return Err(GearmanError::InvalidAdminClientState("timed out waiting for a response".into()));
        }

        let (_sent, response): (SentCommand, AdminResponse) = self.manager.handler_mut(server).pop_response()?;
        Ok(response)
    }
}

impl Default for Admin {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_payload_is_fixed() {
        assert_eq!(PING_PAYLOAD, b"ping? pong!");
    }

    #[tokio::test]
    async fn get_status_without_connecting_surfaces_connection_error() {
        let mut admin = Admin::new();
        let idx = admin.add_server("127.0.0.1", 1);
        let err = admin.get_status(idx, Some(Duration::from_millis(50))).await.unwrap_err();
        assert!(err.is_connection_error());
    }
}

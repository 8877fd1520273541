//! The self-pipe equivalent: a wake channel the worker's pooled callbacks use
//! to nudge the main poll loop from outside it.
//!
//! A real self-pipe is a 1-byte, non-blocking pipe: writers ignore `EAGAIN`
//! because a single pending byte already carries the wake. A bounded,
//! capacity-one `mpsc` channel with `try_send` gives the same coalescing
//! behaviour without touching raw file descriptors.

use tokio::sync::mpsc;

/// Wake byte meanings, per the notification protocol.
pub const WAKE: u8 = b'w';
pub const PREPARE: u8 = b's';
pub const TERMINATE: u8 = b'z';

/// The receiving half, held by the connection manager.
pub struct Listener {
    rx: mpsc::Receiver<u8>,
}

/// The sending half, cloned out to worker-pool callbacks.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<u8>,
}

/// Builds a linked notifier/listener pair with the self-pipe's 1-byte
/// buffering semantics.
pub fn channel() -> (Notifier, Listener) {
    let (tx, rx) = mpsc::channel(1);
    (Notifier { tx }, Listener { rx })
}

impl Notifier {
    /// Sends a wake byte. A full channel means a wake is already pending, so
    /// the send is simply dropped rather than treated as an error — this is
    /// the channel equivalent of ignoring `EAGAIN` on a pipe write.
    pub fn wake(&self, byte: u8) {
        let _ = self.tx.try_send(byte);
    }
}

impl Listener {
    pub async fn recv(&mut self) -> Option<u8> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<u8> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn a_pending_wake_coalesces_further_wakes() {
        let (notifier, mut listener) = channel();
        notifier.wake(WAKE);
        notifier.wake(WAKE); // dropped: one is already pending
        notifier.wake(WAKE);

        assert_eq!(listener.recv().await, Some(WAKE));
        assert!(listener.try_recv().is_none());
    }

    #[tokio::test]
    async fn terminate_byte_is_delivered() {
        let (notifier, mut listener) = channel();
        notifier.wake(TERMINATE);
        assert_eq!(listener.recv().await, Some(TERMINATE));
    }
}

//! Self-pipe that interrupts the readiness wait.
//!
//! [`ShutdownHandle`]s write one byte into the pipe, and so does
//! `signal-hook` when a shutdown signal arrives. The event loop polls the
//! read end alongside its sockets and stops when it becomes readable.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::low_level::pipe;
use signal_hook::SigId;

/// Signals that ask the agent to shut down cleanly.
pub const SHUTDOWN_SIGNALS: [libc::c_int; 3] = [SIGTERM, SIGINT, SIGHUP];

/// Requests a graceful stop of the event loop from any thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<UnixStream>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if let Err(e) = (&*self.tx).write(&[1]) {
            // WouldBlock means a wakeup is already pending.
            if e.kind() != io::ErrorKind::WouldBlock {
                tracing::warn!(error = %e, "Failed to wake event loop");
            }
        }
    }
}

#[derive(Debug)]
pub struct Waker {
    rx: UnixStream,
    tx: Arc<UnixStream>,
    registered: Vec<SigId>,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let (rx, tx) = UnixStream::pair()?;
        rx.set_nonblocking(true)?;
        tx.set_nonblocking(true)?;
        Ok(Self {
            rx,
            tx: Arc::new(tx),
            registered: Vec::new(),
        })
    }

    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.tx),
        }
    }

    /// Consume pending wakeups. Returns whether there were any.
    pub fn drain(&self) -> bool {
        let mut woken = false;
        let mut buf = [0u8; 64];
        loop {
            match (&self.rx).read(&mut buf) {
                Ok(0) => return woken,
                Ok(_) => woken = true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return woken,
            }
        }
    }

    /// Route [`SHUTDOWN_SIGNALS`] into this waker. Idempotent.
    pub fn install_signal_handlers(&mut self) -> io::Result<()> {
        if !self.registered.is_empty() {
            return Ok(());
        }
        for signal in SHUTDOWN_SIGNALS {
            let id = pipe::register(signal, self.tx.try_clone()?)?;
            self.registered.push(id);
        }
        tracing::debug!(signals = ?SHUTDOWN_SIGNALS, "Installed shutdown signal handlers");
        Ok(())
    }
}

impl AsFd for Waker {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.rx.as_fd()
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        for id in self.registered.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

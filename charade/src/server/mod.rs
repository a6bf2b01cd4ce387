//! Single-threaded connection multiplexer.
//!
//! Flow per wakeup:
//! 1. Build the interest set: listener + waker (readable) and every
//!    connection (readable while awaiting input, writable while flushing)
//! 2. Block in `poll(2)` with no timeout
//! 3. Service each ready descriptor exactly once, in registry order
//!
//! Bridge calls run inline and block the loop for at most the bridge timeout.

pub mod connection;
pub mod registry;
pub mod waker;

use std::io;
use std::os::fd::{AsFd, RawFd};
use std::os::unix::net::UnixListener;
use std::time::Instant;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use crate::bridge::codec::{DEFAULT_MAX_FRAME, FrameCodec};
use crate::bridge::{Bridge, BridgeReply, BridgeRequest};

pub use connection::{CloseReason, Connection, ConnectionState, Step};
pub use registry::ConnectionRegistry;
pub use waker::{ShutdownHandle, Waker};

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub max_frame: usize,
    /// Give the bridge one more attempt before answering with a failure.
    pub retry_bridge: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_frame: DEFAULT_MAX_FRAME,
            retry_bridge: true,
        }
    }
}

/// Descriptors reported ready by one `poll` call.
#[derive(Debug, Default)]
struct Ready {
    accept: bool,
    stop: bool,
    connections: Vec<(RawFd, PollFlags)>,
}

pub struct EventLoop<'a, B> {
    listener: &'a UnixListener,
    bridge: B,
    registry: ConnectionRegistry,
    waker: Waker,
    codec: FrameCodec,
    retry_bridge: bool,
}

impl<'a, B: Bridge> EventLoop<'a, B> {
    pub fn new(listener: &'a UnixListener, bridge: B, config: LoopConfig) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            bridge,
            registry: ConnectionRegistry::new(),
            waker: Waker::new()?,
            codec: FrameCodec::new(config.max_frame),
            retry_bridge: config.retry_bridge,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.waker.handle()
    }

    /// Stop gracefully on SIGTERM, SIGINT and SIGHUP.
    pub fn install_signal_handlers(&mut self) -> io::Result<()> {
        self.waker.install_signal_handlers()
    }

    /// Serve until a shutdown is requested. Only a failing `poll` is an error.
    pub fn run(&mut self) -> io::Result<()> {
        tracing::info!(backend = self.bridge.name(), "Serving agent requests");

        loop {
            let ready = match self.wait() {
                Ok(ready) => ready,
                Err(Errno::EINTR) => {
                    tracing::trace!("poll interrupted");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if ready.stop {
                self.waker.drain();
                tracing::info!(
                    open_connections = self.registry.len(),
                    "Shutdown requested"
                );
                self.registry.clear();
                return Ok(());
            }

            if ready.accept {
                self.accept_one();
            }

            for (fd, revents) in ready.connections {
                self.service(fd, revents);
            }
        }
    }

    fn wait(&self) -> nix::Result<Ready> {
        let mut keys = Vec::with_capacity(self.registry.len());
        let mut fds = Vec::with_capacity(self.registry.len() + 2);
        fds.push(PollFd::new(self.listener.as_fd(), PollFlags::POLLIN));
        fds.push(PollFd::new(self.waker.as_fd(), PollFlags::POLLIN));
        for (fd, connection) in self.registry.iter() {
            if let Some(events) = connection.interest() {
                fds.push(PollFd::new(connection.as_fd(), events));
                keys.push(*fd);
            }
        }

        let count = poll(&mut fds, PollTimeout::NONE)?;
        tracing::trace!(ready = count, polled = fds.len(), "poll returned");

        let revents = |pfd: &PollFd<'_>| pfd.revents().unwrap_or(PollFlags::empty());
        Ok(Ready {
            accept: !revents(&fds[0]).is_empty(),
            stop: !revents(&fds[1]).is_empty(),
            connections: keys
                .into_iter()
                .zip(fds[2..].iter().map(revents))
                .filter(|(_, events)| !events.is_empty())
                .collect(),
        })
    }

    fn accept_one(&mut self) {
        match self.listener.accept() {
            Ok((stream, _)) => match Connection::new(stream, self.codec) {
                Ok(connection) => {
                    let fd = self.registry.insert(connection);
                    tracing::debug!(fd, open_connections = self.registry.len(), "Accepted client");
                }
                Err(e) => tracing::warn!(error = %e, "Failed to configure client socket"),
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => tracing::warn!(error = %e, "accept failed"),
        }
    }

    fn service(&mut self, fd: RawFd, revents: PollFlags) {
        let Some(connection) = self.registry.get_mut(fd) else {
            return;
        };

        let mut step = if revents.contains(PollFlags::POLLNVAL) {
            Step::Close(CloseReason::Io(io::Error::from_raw_os_error(libc::EBADF)))
        } else {
            match connection.state() {
                ConnectionState::Writing => connection.on_writable(),
                ConnectionState::AwaitingLength | ConnectionState::AwaitingBody => {
                    connection.on_readable()
                }
                ConnectionState::AwaitingBridgeReply | ConnectionState::Closing => Step::Wait,
            }
        };

        let reason = loop {
            match step {
                Step::Wait => return,
                Step::Dispatch(request) => {
                    let reply = call_bridge(&mut self.bridge, self.retry_bridge, &request);
                    step = connection.begin_reply(reply);
                }
                Step::Close(reason) => break reason,
            }
        };

        match &reason {
            CloseReason::PeerClosed => tracing::debug!(fd, "Client disconnected"),
            other => tracing::warn!(fd, reason = %other, "Closing client connection"),
        }
        self.registry.remove(fd);
    }
}

/// Forward one request, retrying at most once. Never fails: a bridge that
/// gives up yields the agent failure reply.
fn call_bridge<B: Bridge>(bridge: &mut B, retry: bool, request: &BridgeRequest) -> BridgeReply {
    let attempts = if retry { 2 } else { 1 };

    for attempt in 1..=attempts {
        let started = Instant::now();
        match bridge.transact(request) {
            Ok(reply) => {
                tracing::debug!(
                    request = %request.id,
                    kind = request.kind(),
                    request_len = request.payload.len(),
                    reply_len = reply.payload.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Bridge call succeeded"
                );
                return reply;
            }
            Err(e) if attempt < attempts && e.is_transient() => {
                tracing::warn!(request = %request.id, error = %e, "Bridge call failed, retrying");
            }
            Err(e) => {
                tracing::warn!(
                    request = %request.id,
                    kind = request.kind(),
                    error = %e,
                    attempt,
                    "Bridge call failed, answering with failure"
                );
                break;
            }
        }
    }

    BridgeReply::failure(request.id)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::bridge::BridgeError;
    use crate::bridge::protocol::SSH_AGENT_FAILURE;

    struct Scripted {
        outcomes: VecDeque<Result<&'static [u8], BridgeError>>,
        calls: usize,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<&'static [u8], BridgeError>>) -> Self {
            Self {
                outcomes: outcomes.into(),
                calls: 0,
            }
        }
    }

    impl Bridge for Scripted {
        fn transact(&mut self, request: &BridgeRequest) -> Result<BridgeReply, BridgeError> {
            self.calls += 1;
            match self.outcomes.pop_front() {
                Some(Ok(payload)) => Ok(BridgeReply::new(request.id, Bytes::from_static(payload))),
                Some(Err(e)) => Err(e),
                None => Err(BridgeError::Unavailable("script exhausted".into())),
            }
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn request() -> BridgeRequest {
        BridgeRequest::new(Bytes::from_static(&[11]))
    }

    #[test]
    fn success_passes_reply_through() {
        let mut bridge = Scripted::new(vec![Ok(b"ok")]);
        let req = request();
        let reply = call_bridge(&mut bridge, true, &req);
        assert_eq!(reply.id, req.id);
        assert_eq!(&reply.payload[..], b"ok");
        assert_eq!(bridge.calls, 1);
    }

    #[test]
    fn one_retry_then_success() {
        let mut bridge = Scripted::new(vec![
            Err(BridgeError::Timeout(Duration::from_millis(1))),
            Ok(b"late"),
        ]);
        let reply = call_bridge(&mut bridge, true, &request());
        assert_eq!(&reply.payload[..], b"late");
        assert_eq!(bridge.calls, 2);
    }

    #[test]
    fn gives_up_after_second_failure() {
        let mut bridge = Scripted::new(vec![
            Err(BridgeError::Unavailable("down".into())),
            Err(BridgeError::Unavailable("still down".into())),
            Ok(b"never"),
        ]);
        let reply = call_bridge(&mut bridge, true, &request());
        assert_eq!(&reply.payload[..], &[SSH_AGENT_FAILURE]);
        assert_eq!(bridge.calls, 2);
    }

    #[test]
    fn no_retry_when_disabled_or_permanent() {
        let mut bridge = Scripted::new(vec![Err(BridgeError::Timeout(Duration::from_millis(1)))]);
        call_bridge(&mut bridge, false, &request());
        assert_eq!(bridge.calls, 1);

        let mut bridge = Scripted::new(vec![Err(BridgeError::TooLarge { len: 9, max: 8 })]);
        let reply = call_bridge(&mut bridge, true, &request());
        assert_eq!(&reply.payload[..], &[SSH_AGENT_FAILURE]);
        assert_eq!(bridge.calls, 1);
    }
}

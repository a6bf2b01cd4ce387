//! One accepted client and its request/response state machine.
//!
//! ```text
//! AwaitingLength/AwaitingBody --frame complete--> AwaitingBridgeReply
//! AwaitingBridgeReply --reply queued--> Writing
//! Writing --flushed--> AwaitingLength (or Closing after peer EOF)
//! ```
//!
//! At most one request is in flight. Bytes that arrive while a request is
//! being served stay in the read buffer until the reply has been flushed.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;

use bytes::{Buf, BytesMut};
use nix::poll::PollFlags;
use tokio_util::codec::Decoder;

use crate::bridge::codec::{self, FrameCodec, FrameError, LENGTH_PREFIX};
use crate::bridge::protocol::{BridgeReply, BridgeRequest, FAILURE_PAYLOAD, RequestId};

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingLength,
    AwaitingBody,
    AwaitingBridgeReply,
    Writing,
    Closing,
}

/// Why a connection is being dropped from the registry.
#[derive(Debug, thiserror::Error)]
pub enum CloseReason {
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("peer closed mid-frame with {0} bytes buffered")]
    Truncated(usize),

    #[error("malformed frame: {0}")]
    Malformed(FrameError),

    #[error("reply for {got} does not match in-flight request {expected:?}")]
    Uncorrelated {
        got: RequestId,
        expected: Option<RequestId>,
    },

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// What the event loop must do next for this connection.
#[derive(Debug)]
pub enum Step {
    /// Wait for the next readiness event.
    Wait,
    /// A complete request is ready for the bridge.
    Dispatch(BridgeRequest),
    /// Remove the connection and release its socket.
    Close(CloseReason),
}

#[derive(Debug)]
pub struct Connection {
    stream: UnixStream,
    state: ConnectionState,
    codec: FrameCodec,
    read_buf: BytesMut,
    write_buf: BytesMut,
    in_flight: Option<RequestId>,
    peer_closed: bool,
}

impl Connection {
    pub fn new(stream: UnixStream, codec: FrameCodec) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            state: ConnectionState::AwaitingLength,
            codec,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            in_flight: None,
            peer_closed: false,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn in_flight(&self) -> Option<RequestId> {
        self.in_flight
    }

    /// Readiness this connection is waiting for, if any.
    pub fn interest(&self) -> Option<PollFlags> {
        match self.state {
            ConnectionState::AwaitingLength | ConnectionState::AwaitingBody => {
                Some(PollFlags::POLLIN)
            }
            ConnectionState::Writing => Some(PollFlags::POLLOUT),
            ConnectionState::AwaitingBridgeReply | ConnectionState::Closing => None,
        }
    }

    /// Drain the socket into the read buffer and look for a request.
    pub fn on_readable(&mut self) -> Step {
        // Leave excess bytes in the kernel rather than buffering without bound.
        let limit = self.codec.max_frame() + LENGTH_PREFIX;
        let mut chunk = [0u8; READ_CHUNK];

        while self.read_buf.len() < limit {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.peer_closed = true;
                    break;
                }
                Ok(n) => {
                    tracing::trace!(fd = self.fd(), bytes = n, "Read from client");
                    self.read_buf.extend_from_slice(&chunk[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.close(CloseReason::Io(e)),
            }
        }

        self.next_request()
    }

    /// Run the codec over whatever is buffered.
    fn next_request(&mut self) -> Step {
        match self.codec.decode(&mut self.read_buf) {
            Ok(Some(payload)) => {
                let request = BridgeRequest::new(payload);
                self.in_flight = Some(request.id);
                self.state = ConnectionState::AwaitingBridgeReply;
                Step::Dispatch(request)
            }
            Ok(None) if self.peer_closed => {
                if self.read_buf.is_empty() {
                    self.close(CloseReason::PeerClosed)
                } else {
                    self.close(CloseReason::Truncated(self.read_buf.len()))
                }
            }
            Ok(None) => {
                self.state = if self.read_buf.len() < LENGTH_PREFIX {
                    ConnectionState::AwaitingLength
                } else {
                    ConnectionState::AwaitingBody
                };
                Step::Wait
            }
            Err(e) => self.close(CloseReason::Malformed(e)),
        }
    }

    /// Queue the bridge's answer for writing.
    pub fn begin_reply(&mut self, reply: BridgeReply) -> Step {
        if self.in_flight != Some(reply.id) {
            return self.close(CloseReason::Uncorrelated {
                got: reply.id,
                expected: self.in_flight,
            });
        }

        let framed = match codec::encode(&reply.payload, self.codec.max_frame()) {
            Ok(framed) => framed,
            Err(e) => {
                tracing::warn!(fd = self.fd(), error = %e, "Reply does not fit a frame, sending failure");
                // A one-byte payload always fits.
                codec::encode(FAILURE_PAYLOAD, usize::MAX).unwrap_or_default()
            }
        };
        self.write_buf.extend_from_slice(&framed);
        self.state = ConnectionState::Writing;
        Step::Wait
    }

    /// Flush as much of the pending reply as the socket takes.
    pub fn on_writable(&mut self) -> Step {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => {
                    return self.close(CloseReason::Io(io::ErrorKind::WriteZero.into()));
                }
                Ok(n) => {
                    tracing::trace!(fd = self.fd(), bytes = n, "Wrote to client");
                    self.write_buf.advance(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Step::Wait,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.close(CloseReason::Io(e)),
            }
        }

        self.in_flight = None;
        if self.peer_closed && self.read_buf.is_empty() {
            return self.close(CloseReason::PeerClosed);
        }
        // A pipelined request may already be buffered.
        self.next_request()
    }

    fn close(&mut self, reason: CloseReason) -> Step {
        self.state = ConnectionState::Closing;
        self.in_flight = None;
        Step::Close(reason)
    }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn pair(max_frame: usize) -> (Connection, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        (Connection::new(ours, FrameCodec::new(max_frame)).unwrap(), theirs)
    }

    fn expect_dispatch(step: Step) -> BridgeRequest {
        match step {
            Step::Dispatch(request) => request,
            other => panic!("expected dispatch, got {other:?}"),
        }
    }

    #[test]
    fn partial_frame_walks_through_awaiting_states() {
        let (mut conn, mut client) = pair(1024);
        assert_eq!(conn.interest(), Some(PollFlags::POLLIN));

        client.write_all(&[0, 0]).unwrap();
        assert!(matches!(conn.on_readable(), Step::Wait));
        assert_eq!(conn.state(), ConnectionState::AwaitingLength);

        client.write_all(&[0, 3, b'a']).unwrap();
        assert!(matches!(conn.on_readable(), Step::Wait));
        assert_eq!(conn.state(), ConnectionState::AwaitingBody);

        client.write_all(b"bc").unwrap();
        let request = expect_dispatch(conn.on_readable());
        assert_eq!(&request.payload[..], b"abc");
        assert_eq!(conn.state(), ConnectionState::AwaitingBridgeReply);
        assert_eq!(conn.in_flight(), Some(request.id));
        assert_eq!(conn.interest(), None);
    }

    #[test]
    fn reply_is_framed_and_connection_rearms() {
        let (mut conn, mut client) = pair(1024);
        client.write_all(&[0, 0, 0, 1, 11]).unwrap();
        let request = expect_dispatch(conn.on_readable());

        assert!(matches!(
            conn.begin_reply(BridgeReply::new(request.id, Bytes::from_static(b"answer"))),
            Step::Wait
        ));
        assert_eq!(conn.interest(), Some(PollFlags::POLLOUT));

        assert!(matches!(conn.on_writable(), Step::Wait));
        assert_eq!(conn.state(), ConnectionState::AwaitingLength);
        assert_eq!(conn.in_flight(), None);

        let mut got = [0u8; 10];
        client.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"\x00\x00\x00\x06answer");
    }

    #[test]
    fn pipelined_request_dispatches_after_flush() {
        let (mut conn, mut client) = pair(1024);
        client.write_all(&[0, 0, 0, 1, 11, 0, 0, 0, 1, 13]).unwrap();

        let first = expect_dispatch(conn.on_readable());
        assert_eq!(&first.payload[..], &[11]);

        conn.begin_reply(BridgeReply::new(first.id, Bytes::from_static(&[12])));
        let second = expect_dispatch(conn.on_writable());
        assert_eq!(&second.payload[..], &[13]);
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn oversized_length_closes() {
        let (mut conn, mut client) = pair(16);
        client.write_all(&[0, 0, 0, 17]).unwrap();
        assert!(matches!(
            conn.on_readable(),
            Step::Close(CloseReason::Malformed(FrameError::TooLarge { len: 17, max: 16 }))
        ));
        assert_eq!(conn.state(), ConnectionState::Closing);
    }

    #[test]
    fn eof_mid_frame_is_truncated() {
        let (mut conn, mut client) = pair(1024);
        client.write_all(&[0, 0, 0, 9, 1, 2]).unwrap();
        drop(client);
        assert!(matches!(conn.on_readable(), Step::Close(CloseReason::Truncated(6))));
    }

    #[test]
    fn eof_on_idle_connection_is_clean() {
        let (mut conn, client) = pair(1024);
        drop(client);
        assert!(matches!(conn.on_readable(), Step::Close(CloseReason::PeerClosed)));
    }

    #[test]
    fn request_then_eof_is_still_answered() {
        let (mut conn, mut client) = pair(1024);
        client.write_all(&[0, 0, 0, 1, 11]).unwrap();
        client.shutdown(std::net::Shutdown::Write).unwrap();

        let request = expect_dispatch(conn.on_readable());
        conn.begin_reply(BridgeReply::new(request.id, Bytes::from_static(&[5])));
        assert!(matches!(conn.on_writable(), Step::Close(CloseReason::PeerClosed)));
        drop(conn);

        let mut got = Vec::new();
        client.read_to_end(&mut got).unwrap();
        assert_eq!(got, vec![0, 0, 0, 1, 5]);
    }

    #[test]
    fn stale_reply_closes() {
        let (mut conn, mut client) = pair(1024);
        client.write_all(&[0, 0, 0, 1, 11]).unwrap();
        let _request = expect_dispatch(conn.on_readable());

        let step = conn.begin_reply(BridgeReply::new(RequestId::new(), Bytes::new()));
        assert!(matches!(step, Step::Close(CloseReason::Uncorrelated { .. })));
    }

    #[test]
    fn oversized_reply_becomes_failure() {
        let (mut conn, mut client) = pair(8);
        client.write_all(&[0, 0, 0, 1, 11]).unwrap();
        let request = expect_dispatch(conn.on_readable());

        conn.begin_reply(BridgeReply::new(request.id, Bytes::from(vec![0u8; 9])));
        conn.on_writable();

        let mut got = [0u8; 5];
        client.read_exact(&mut got).unwrap();
        assert_eq!(got, [0, 0, 0, 1, 5]);
    }
}

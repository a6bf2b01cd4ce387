//! Relay to another agent listening on a Unix socket.
//!
//! Useful wherever Pageant does not exist, and for chaining charade in
//! front of a stock `ssh-agent`. The connection is opened lazily, reused
//! across calls and dropped after any failure so the next call reconnects.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use super::codec::{self, FrameCodec, FrameError};
use super::{Bridge, BridgeError, BridgeReply, BridgeRequest};

pub struct UpstreamBridge {
    path: PathBuf,
    timeout: Duration,
    codec: FrameCodec,
    stream: Option<UnixStream>,
}

impl UpstreamBridge {
    pub fn new(path: PathBuf, timeout: Duration, max_frame: usize) -> Self {
        Self {
            path,
            timeout,
            codec: FrameCodec::new(max_frame),
            stream: None,
        }
    }

    fn connection(&mut self) -> Result<&mut UnixStream, BridgeError> {
        if self.stream.is_none() {
            let stream = UnixStream::connect(&self.path).map_err(|e| {
                BridgeError::Unavailable(format!("connect {}: {e}", self.path.display()))
            })?;
            tracing::debug!(path = %self.path.display(), "Connected to upstream agent");
            self.stream = Some(stream);
        }
        self.stream
            .as_mut()
            .ok_or_else(|| BridgeError::Unavailable("upstream connection lost".to_string()))
    }

    fn exchange(&mut self, request: &BridgeRequest) -> Result<bytes::Bytes, BridgeError> {
        let framed = codec::encode(&request.payload, self.codec.max_frame()).map_err(|e| match e {
            FrameError::TooLarge { len, max } => BridgeError::TooLarge { len, max },
            FrameError::Io(e) => BridgeError::Io(e),
        })?;

        let deadline = Instant::now() + self.timeout;
        let timeout = self.timeout;
        let mut codec = self.codec;
        let stream = self.connection()?;

        stream.set_write_timeout(Some(timeout))?;
        stream
            .write_all(&framed)
            .map_err(|e| timed_out_or(e, timeout))?;

        let mut buf = BytesMut::with_capacity(1024);
        let mut chunk = [0u8; 4096];
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(payload)) => return Ok(payload),
                Ok(None) => {}
                Err(e) => return Err(BridgeError::Protocol(e.to_string())),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BridgeError::Timeout(timeout));
            }
            stream.set_read_timeout(Some(remaining))?;

            match stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(BridgeError::Unavailable(
                        "upstream agent closed the connection".to_string(),
                    ));
                }
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(timed_out_or(e, timeout)),
            }
        }
    }
}

fn timed_out_or(e: io::Error, timeout: Duration) -> BridgeError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => BridgeError::Timeout(timeout),
        _ => BridgeError::Io(e),
    }
}

impl Bridge for UpstreamBridge {
    fn transact(&mut self, request: &BridgeRequest) -> Result<BridgeReply, BridgeError> {
        match self.exchange(request) {
            Ok(payload) => Ok(BridgeReply::new(request.id, payload)),
            Err(e) => {
                // Whatever is left on the stream belongs to the failed exchange.
                self.stream = None;
                Err(e)
            }
        }
    }

    fn name(&self) -> &'static str {
        "upstream"
    }
}

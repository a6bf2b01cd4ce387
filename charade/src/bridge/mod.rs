//! Bridge to the foreign agent that actually holds the keys.
//!
//! # Architecture
//!
//! - **codec**: length-prefixed framing shared by clients and the bridge
//! - **protocol**: request/reply types and the agent failure message
//! - **pageant**: Pageant over shared memory + `WM_COPYDATA` (Windows-family targets)
//! - **upstream**: another agent listening on a Unix socket
//!
//! A bridge call blocks its caller for at most the configured timeout.
//! Retrying is the caller's decision, never the bridge's.

pub mod codec;
#[cfg(any(windows, target_os = "cygwin"))]
pub mod pageant;
pub mod protocol;
#[cfg(unix)]
pub mod upstream;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

pub use protocol::{BridgeReply, BridgeRequest, RequestId};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("foreign agent did not answer within {0:?}")]
    Timeout(Duration),

    #[error("foreign agent unavailable: {0}")]
    Unavailable(String),

    #[error("message of {len} bytes exceeds bridge limit of {max}")]
    TooLarge { len: usize, max: usize },

    #[error("malformed reply from foreign agent: {0}")]
    Protocol(String),

    #[error("bridge I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl BridgeError {
    /// Whether a second attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::TooLarge { .. })
    }
}

/// One request/response exchange with the foreign agent.
pub trait Bridge {
    fn transact(&mut self, request: &BridgeRequest) -> Result<BridgeReply, BridgeError>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

impl<B: Bridge + ?Sized> Bridge for Box<B> {
    fn transact(&mut self, request: &BridgeRequest) -> Result<BridgeReply, BridgeError> {
        (**self).transact(request)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Which backend to talk to and how patiently.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub timeout: Duration,
    pub max_frame: usize,
    /// Relay to an agent socket instead of Pageant.
    pub upstream: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_frame: codec::DEFAULT_MAX_FRAME,
            upstream: None,
        }
    }
}

/// Build the backend for this platform and configuration.
///
/// Construction never contacts the foreign agent; an absent agent shows up
/// as `Unavailable` on the first call.
pub fn connect_bridge(config: &BridgeConfig) -> Result<Box<dyn Bridge>, BridgeError> {
    #[cfg(unix)]
    if let Some(path) = &config.upstream {
        tracing::debug!(backend = "upstream", path = %path.display(), "Selected bridge backend");
        return Ok(Box::new(upstream::UpstreamBridge::new(
            path.clone(),
            config.timeout,
            config.max_frame,
        )));
    }

    #[cfg(any(windows, target_os = "cygwin"))]
    {
        tracing::debug!(backend = "pageant", "Selected bridge backend");
        Ok(Box::new(pageant::PageantBridge::new(config.timeout)))
    }

    #[cfg(not(any(windows, target_os = "cygwin")))]
    {
        Err(BridgeError::Unavailable(
            "Pageant is not available on this platform; pass --upstream <socket>".to_string(),
        ))
    }
}

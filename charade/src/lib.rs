//! charade: an ssh-agent lookalike.
//!
//! Clients connect to a Unix socket exactly as they would to ssh-agent. Each
//! request is relayed to a foreign agent (Pageant, or another agent socket)
//! and the reply is written back on the same connection.
//!
//! # Architecture
//!
//! - **endpoint**: private directory + listening socket, removed on exit
//! - **daemon**: fork/setsid, shell assignments, kill and exec
//! - **server**: poll-driven event loop over all client connections
//! - **bridge**: framing codec and the foreign agent backends
//! - **config** / **logging** / **stdio**: process plumbing for the binary

#![cfg(unix)]

pub mod bridge;
pub mod config;
pub mod daemon;
pub mod endpoint;
pub mod logging;
pub mod server;
pub mod stdio;

pub use bridge::{Bridge, BridgeConfig, BridgeError, BridgeReply, BridgeRequest, connect_bridge};
pub use config::{Args, Config, Mode};
pub use endpoint::{EndpointError, ListenEndpoint, Teardown};
pub use server::{EventLoop, LoopConfig, ShutdownHandle};

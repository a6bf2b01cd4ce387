//! Listening socket lifecycle.
//!
//! Socket path format: `{temp_dir}/ssh-XXXXXXXXXX/agent.{pid}`, the same
//! shape ssh-agent uses, so tooling that greps for it keeps working.
//!
//! Everything created here is removed again by [`ListenEndpoint`] on every
//! exit path, exactly once, unless ownership was handed to a forked child.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::socket::{
    AddressFamily, Backlog, SockFlag, SockType, UnixAddr, bind, listen, socket,
};
use nix::sys::stat::{Mode, umask};
use nix::unistd::Pid;

pub const LISTEN_BACKLOG: i32 = 5;

/// Applied around bind so the socket file is created owner read/write only.
const SOCKET_UMASK: u32 = 0o177;

const DIR_PREFIX: &str = "ssh-";
const DIR_RAND_BYTES: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("cannot create private socket directory in {}: {source}", base.display())]
    CreateDir { base: PathBuf, source: io::Error },

    #[error("socket path {} is too long for a Unix socket address", path.display())]
    PathTooLong { path: PathBuf },

    #[error("socket: {0}")]
    Socket(Errno),

    #[error("bind {}: {source}", path.display())]
    Bind { path: PathBuf, source: Errno },

    #[error("listen {}: {source}", path.display())]
    Listen { path: PathBuf, source: Errno },

    #[error("configure listener: {0}")]
    Configure(#[from] io::Error),
}

/// Outcome of one teardown step.
#[derive(Debug)]
pub enum Removal {
    Removed,
    /// Nothing to remove: never created, handed off, or already torn down.
    Skipped,
    Failed(io::Error),
}

impl Removal {
    fn attempt(path: Option<&Path>, remove: impl FnOnce(&Path) -> io::Result<()>) -> Self {
        match path {
            None => Self::Skipped,
            Some(path) => match remove(path) {
                Ok(()) => Self::Removed,
                Err(e) => Self::Failed(e),
            },
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Per-step report of a teardown. Failures are reported, never raised.
#[derive(Debug)]
pub struct Teardown {
    pub socket: Removal,
    pub dir: Removal,
}

impl Teardown {
    fn skipped() -> Self {
        Self {
            socket: Removal::Skipped,
            dir: Removal::Skipped,
        }
    }

    pub fn is_clean(&self) -> bool {
        !self.socket.is_failed() && !self.dir.is_failed()
    }

    pub fn log(&self, socket_path: &Path, dir: Option<&Path>) {
        match &self.socket {
            Removal::Removed => tracing::debug!(path = %socket_path.display(), "Removed socket"),
            Removal::Failed(e) => {
                tracing::warn!(path = %socket_path.display(), error = %e, "Error removing socket")
            }
            Removal::Skipped => {}
        }
        if let Some(dir) = dir {
            match &self.dir {
                Removal::Removed => tracing::debug!(dir = %dir.display(), "Removed socket directory"),
                Removal::Failed(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "Error removing socket directory")
                }
                Removal::Skipped => {}
            }
        }
    }
}

/// Owns whatever has been created so far. Dropping it removes those paths,
/// which also covers a setup that fails halfway through.
#[derive(Debug)]
struct Cleanup {
    socket: Option<PathBuf>,
    dir: Option<PathBuf>,
    armed: bool,
    done: bool,
}

impl Cleanup {
    fn new(dir: Option<PathBuf>) -> Self {
        Self {
            socket: None,
            dir,
            armed: true,
            done: false,
        }
    }

    fn run(&mut self) -> Teardown {
        if !self.armed || self.done {
            return Teardown::skipped();
        }
        self.done = true;

        // Each step runs regardless of the other's outcome.
        Teardown {
            socket: Removal::attempt(self.socket.as_deref(), |p| std::fs::remove_file(p)),
            dir: Removal::attempt(self.dir.as_deref(), |p| std::fs::remove_dir(p)),
        }
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        if self.armed && !self.done {
            let report = self.run();
            let socket = self.socket.clone().unwrap_or_default();
            report.log(&socket, self.dir.as_deref());
        }
    }
}

/// Restores the previous creation mask on drop, whatever happened in between.
struct UmaskGuard(Mode);

impl UmaskGuard {
    fn set(mask: u32) -> Self {
        Self(umask(Mode::from_bits_truncate(mask as _)))
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        let _ = umask(self.0);
    }
}

/// The bound, listening agent socket plus the paths it lives at.
#[derive(Debug)]
pub struct ListenEndpoint {
    listener: UnixListener,
    socket_path: PathBuf,
    cleanup: Cleanup,
}

impl ListenEndpoint {
    /// Create a private directory under `base` and listen on `agent.{pid}` inside it.
    pub fn create(base: &Path, pid: Pid) -> Result<Self, EndpointError> {
        // tempfile creates the directory owner-only (0700).
        let dir = tempfile::Builder::new()
            .prefix(DIR_PREFIX)
            .rand_bytes(DIR_RAND_BYTES)
            .tempdir_in(base)
            .map_err(|source| EndpointError::CreateDir {
                base: base.to_path_buf(),
                source,
            })?
            .keep();
        tracing::debug!(dir = %dir.display(), "Created private socket directory");

        // From here on an early return removes the directory again.
        let cleanup = Cleanup::new(Some(dir.clone()));
        let socket_path = dir.join(format!("agent.{pid}"));
        Self::listen_at(socket_path, cleanup)
    }

    /// Listen on exactly `path`. No directory is created or removed.
    pub fn bind_at(path: PathBuf) -> Result<Self, EndpointError> {
        Self::listen_at(path, Cleanup::new(None))
    }

    fn listen_at(socket_path: PathBuf, mut cleanup: Cleanup) -> Result<Self, EndpointError> {
        let addr = UnixAddr::new(&socket_path).map_err(|_| EndpointError::PathTooLong {
            path: socket_path.clone(),
        })?;

        let fd: OwnedFd = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::empty(),
            None,
        )
        .map_err(EndpointError::Socket)?;

        {
            let _mask = UmaskGuard::set(SOCKET_UMASK);
            bind(fd.as_raw_fd(), &addr).map_err(|source| EndpointError::Bind {
                path: socket_path.clone(),
                source,
            })?;
        }
        cleanup.socket = Some(socket_path.clone());

        let backlog = Backlog::new(LISTEN_BACKLOG).map_err(EndpointError::Socket)?;
        listen(&fd, backlog).map_err(|source| EndpointError::Listen {
            path: socket_path.clone(),
            source,
        })?;

        let listener = UnixListener::from(fd);
        listener.set_nonblocking(true)?;

        tracing::info!(path = %socket_path.display(), "Agent socket listening");

        Ok(Self {
            listener,
            socket_path,
            cleanup,
        })
    }

    pub fn listener(&self) -> &UnixListener {
        &self.listener
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn dir(&self) -> Option<&Path> {
        self.cleanup.dir.as_deref()
    }

    /// Another process now owns the socket and directory; never remove them from here.
    pub fn hand_off(&mut self) {
        tracing::trace!(path = %self.socket_path.display(), "Handing endpoint cleanup to child");
        self.cleanup.armed = false;
    }

    /// Unlink the socket, then remove the directory. Runs at most once;
    /// later calls (and the eventual drop) report `Skipped`.
    pub fn teardown(&mut self) -> Teardown {
        let report = self.cleanup.run();
        report.log(&self.socket_path, self.cleanup.dir.as_deref());
        report
    }
}

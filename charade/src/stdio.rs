//! Standard descriptor hygiene.
//!
//! Two jobs:
//! 1. At startup make sure fds 0, 1 and 2 are open, so the agent socket (or
//!    any later file) can never land on a standard descriptor and receive
//!    stray `println!` output
//! 2. In the detached child, point 0, 1 and 2 at `/dev/null` so the agent stops
//!    writing to the terminal it was started from
//!
//! ## Safety contracts
//!
//! The `unsafe` blocks rely on:
//! 1. Running while the process is single-threaded (before the event loop)
//! 2. Ownership of 0/1/2 being taken via `from_raw_fd` and released with
//!    `mem::forget`, so they are never closed here

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::unistd::dup2;

const DEV_NULL: &str = "/dev/null";
const STDERR_FD: RawFd = 2;

fn open_dev_null() -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(DEV_NULL)
}

/// Reopen any closed standard descriptor on `/dev/null`.
///
/// `open` returns the lowest free descriptor, so as long as the result is
/// 0, 1 or 2 one of them was closed and the descriptor is kept.
pub fn ensure_std_fds_open() -> io::Result<()> {
    loop {
        let null = open_dev_null()?;
        if null.as_raw_fd() > STDERR_FD {
            return Ok(());
        }
        // std opens with O_CLOEXEC; a standard descriptor must survive exec.
        fcntl(&null, FcntlArg::F_SETFD(FdFlag::empty()))?;
        let fd = null.into_raw_fd();
        tracing::trace!(fd, "Reopened closed standard descriptor on /dev/null");
    }
}

/// Replace stdin, stdout and stderr with `/dev/null`.
pub fn redirect_std_fds_to_devnull() -> io::Result<()> {
    let null = open_dev_null()?;

    for target in 0..=STDERR_FD {
        // Safety: 0..=2 are open (see ensure_std_fds_open); the OwnedFd is
        // forgotten below so it never closes them.
        let mut std_fd = unsafe { OwnedFd::from_raw_fd(target) };
        let result = dup2(&null, &mut std_fd);
        std::mem::forget(std_fd);
        result.map_err(|e| io::Error::other(format!("dup2({DEV_NULL}, {target}) failed: {e}")))?;
    }

    tracing::trace!("Standard descriptors redirected to /dev/null");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_open(fd: RawFd) -> bool {
        // Safety: F_GETFD only inspects the descriptor table.
        unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
    }

    #[test]
    fn std_fds_stay_open() {
        ensure_std_fds_open().unwrap();
        ensure_std_fds_open().unwrap();
        for fd in 0..=STDERR_FD {
            assert!(is_open(fd), "fd {fd} should be open");
        }
    }

    #[test]
    fn dev_null_is_readable_and_writable() {
        use std::io::{Read, Write};

        let mut null = open_dev_null().unwrap();
        null.write_all(b"discarded").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(null.read(&mut buf).unwrap(), 0);
    }
}

//! Detaching from the invoking shell and talking back to it.
//!
//! The parent's stdout is the only channel to the shell that started us:
//! it carries `SSH_AUTH_SOCK` / `SSH_AGENT_PID` assignments in Bourne or
//! C-shell syntax, the same text ssh-agent prints, so `eval $(charade)`
//! works unchanged.

use std::ffi::OsString;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::{ForkResult, Pid, fork, setsid};

pub const AUTH_SOCK_VAR: &str = "SSH_AUTH_SOCK";
pub const AGENT_PID_VAR: &str = "SSH_AGENT_PID";

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("fork failed: {0}")]
    Fork(#[source] Errno),

    #[error("SSH_AGENT_PID not set, cannot kill agent")]
    NoAgentPid,

    #[error("SSH_AGENT_PID={0:?} is not a valid process id")]
    BadAgentPid(String),

    #[error("failed to kill agent pid {pid}: {source}")]
    Kill { pid: Pid, source: Errno },

    #[error("failed to execute {program}: {source}")]
    Exec { program: String, source: io::Error },
}

/// Which side of the fork we are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    /// Print or exec, then exit. The child owns the socket now.
    Parent { child: Pid },
    /// Serve connections.
    Child,
}

/// Fork; the child starts a new session.
///
/// Must be called while the process is single-threaded.
pub fn detach() -> Result<Detached, DaemonError> {
    // Safety: no other threads exist yet, so the child inherits a consistent heap.
    match unsafe { fork() }.map_err(DaemonError::Fork)? {
        ForkResult::Parent { child } => {
            tracing::debug!(%child, "Forked agent process");
            Ok(Detached::Parent { child })
        }
        ForkResult::Child => {
            if let Err(e) = setsid() {
                tracing::warn!(error = %e, "setsid failed, agent stays in the caller's session");
            }
            Ok(Detached::Child)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    Bourne,
    CShell,
}

impl Shell {
    /// C-shell syntax when the login shell looks like csh/tcsh.
    pub fn detect(shell: Option<&str>) -> Self {
        match shell {
            Some(path) if path.ends_with("csh") => Self::CShell,
            _ => Self::Bourne,
        }
    }
}

/// The text a shell evaluates to find the agent.
pub fn env_assignments(shell: Shell, socket: &Path, agent: Pid) -> String {
    let socket = socket.display();
    match shell {
        Shell::Bourne => format!(
            "{AUTH_SOCK_VAR}={socket}; export {AUTH_SOCK_VAR};\n\
             {AGENT_PID_VAR}={agent}; export {AGENT_PID_VAR};\n\
             echo Agent pid {agent};\n"
        ),
        Shell::CShell => format!(
            "setenv {AUTH_SOCK_VAR} {socket};\n\
             setenv {AGENT_PID_VAR} {agent};\n\
             echo Agent pid {agent};\n"
        ),
    }
}

/// The text a shell evaluates after the agent has been killed.
pub fn kill_assignments(shell: Shell, agent: Pid) -> String {
    let unset = match shell {
        Shell::Bourne => "unset",
        Shell::CShell => "unsetenv",
    };
    format!("{unset} {AUTH_SOCK_VAR};\n{unset} {AGENT_PID_VAR};\necho Agent pid {agent} killed;\n")
}

pub fn parse_agent_pid(value: Option<&str>) -> Result<Pid, DaemonError> {
    let value = value.ok_or(DaemonError::NoAgentPid)?;
    match value.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(Pid::from_raw(pid)),
        _ => Err(DaemonError::BadAgentPid(value.to_string())),
    }
}

/// Ask a running agent to shut down.
pub fn kill_agent(agent: Pid) -> Result<(), DaemonError> {
    kill(agent, Signal::SIGTERM).map_err(|source| DaemonError::Kill { pid: agent, source })?;
    tracing::debug!(%agent, "Sent SIGTERM to agent");
    Ok(())
}

/// Replace this process with `command`, with the agent variables exported.
///
/// Only returns on failure.
pub fn exec_with_agent(command: &[OsString], socket: &Path, agent: Pid) -> DaemonError {
    let Some((program, args)) = command.split_first() else {
        return DaemonError::Exec {
            program: String::new(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "empty command"),
        };
    };

    tracing::debug!(program = %program.to_string_lossy(), "Executing command under agent");
    let source = Command::new(program)
        .args(args)
        .env(AUTH_SOCK_VAR, socket)
        .env(AGENT_PID_VAR, agent.to_string())
        .exec();

    DaemonError::Exec {
        program: program.to_string_lossy().into_owned(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;

    use super::*;

    #[test]
    fn shell_detection() {
        assert_eq!(Shell::detect(Some("/bin/tcsh")), Shell::CShell);
        assert_eq!(Shell::detect(Some("/usr/bin/csh")), Shell::CShell);
        assert_eq!(Shell::detect(Some("/bin/bash")), Shell::Bourne);
        assert_eq!(Shell::detect(Some("/usr/bin/fish")), Shell::Bourne);
        assert_eq!(Shell::detect(None), Shell::Bourne);
    }

    #[test]
    fn bourne_assignments() {
        let text = env_assignments(
            Shell::Bourne,
            Path::new("/tmp/ssh-abcdefghij/agent.41"),
            Pid::from_raw(42),
        );
        insta::assert_snapshot!(text, @r"
        SSH_AUTH_SOCK=/tmp/ssh-abcdefghij/agent.41; export SSH_AUTH_SOCK;
        SSH_AGENT_PID=42; export SSH_AGENT_PID;
        echo Agent pid 42;
        ");
    }

    #[test]
    fn csh_assignments() {
        let text = env_assignments(
            Shell::CShell,
            Path::new("/tmp/ssh-abcdefghij/agent.41"),
            Pid::from_raw(42),
        );
        insta::assert_snapshot!(text, @r"
        setenv SSH_AUTH_SOCK /tmp/ssh-abcdefghij/agent.41;
        setenv SSH_AGENT_PID 42;
        echo Agent pid 42;
        ");
    }

    #[test]
    fn kill_text_per_shell() {
        insta::assert_snapshot!(kill_assignments(Shell::Bourne, Pid::from_raw(7)), @r"
        unset SSH_AUTH_SOCK;
        unset SSH_AGENT_PID;
        echo Agent pid 7 killed;
        ");
        insta::assert_snapshot!(kill_assignments(Shell::CShell, Pid::from_raw(7)), @r"
        unsetenv SSH_AUTH_SOCK;
        unsetenv SSH_AGENT_PID;
        echo Agent pid 7 killed;
        ");
    }

    #[test]
    fn agent_pid_parsing() {
        assert_eq!(parse_agent_pid(Some("1234")).unwrap(), Pid::from_raw(1234));
        assert!(matches!(parse_agent_pid(None), Err(DaemonError::NoAgentPid)));
        assert!(matches!(
            parse_agent_pid(Some("nope")),
            Err(DaemonError::BadAgentPid(v)) if v == "nope"
        ));
        assert!(matches!(parse_agent_pid(Some("0")), Err(DaemonError::BadAgentPid(_))));
        assert!(matches!(parse_agent_pid(Some("-5")), Err(DaemonError::BadAgentPid(_))));
    }

    #[test]
    fn kill_terminates_process() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        kill_agent(Pid::from_raw(child.id() as i32)).unwrap();
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGTERM));
    }

    #[test]
    fn exec_failure_is_reported() {
        let err = exec_with_agent(
            &[OsString::from("/nonexistent/charade-test-program")],
            Path::new("/tmp/agent.sock"),
            Pid::from_raw(1),
        );
        match err {
            DaemonError::Exec { program, source } => {
                assert_eq!(program, "/nonexistent/charade-test-program");
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn exec_rejects_empty_command() {
        let err = exec_with_agent(&[], Path::new("/tmp/agent.sock"), Pid::from_raw(1));
        assert!(matches!(err, DaemonError::Exec { .. }));
    }
}

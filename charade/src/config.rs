//! Command line and environment configuration.
//!
//! Flags follow ssh-agent where they overlap. Usage errors (conflicting
//! flags, out-of-range values) are reported by clap and exit with code 2.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::bridge::BridgeConfig;
use crate::bridge::codec::{DEFAULT_MAX_FRAME, LENGTH_PREFIX};
use crate::daemon::Shell;

/// Smallest useful frame limit: one message-type byte plus a length field.
pub const MIN_MAX_FRAME: usize = LENGTH_PREFIX + 1;

pub const DEFAULT_BRIDGE_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Parser)]
#[command(name = "charade")]
#[command(about = "ssh-agent lookalike that relays requests to Pageant")]
#[command(version)]
pub struct Args {
    /// Bind the agent socket at this exact path
    #[arg(short = 'a', value_name = "BIND_ADDRESS")]
    pub bind_address: Option<PathBuf>,

    /// Print C-shell commands
    #[arg(short = 'c', conflicts_with = "bourne")]
    pub csh: bool,

    /// Print Bourne shell commands
    #[arg(short = 's')]
    pub bourne: bool,

    /// Debug mode: stay in the foreground and log at debug level
    #[arg(short = 'd', conflicts_with = "foreground")]
    pub debug: bool,

    /// Stay in the foreground
    #[arg(short = 'D')]
    pub foreground: bool,

    /// Kill the agent named by SSH_AGENT_PID
    #[arg(short = 'k', conflicts_with_all = ["bind_address", "debug", "foreground", "command"])]
    pub kill: bool,

    /// Upper bound on one call to the foreign agent, in milliseconds
    #[arg(
        long = "bridge-timeout",
        value_name = "MILLIS",
        env = "CHARADE_BRIDGE_TIMEOUT_MS",
        default_value_t = DEFAULT_BRIDGE_TIMEOUT_MS,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub bridge_timeout_ms: u64,

    /// Largest accepted message payload, in bytes
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_MAX_FRAME, value_parser = parse_max_frame)]
    pub max_frame: usize,

    /// Answer with a failure after the first bridge error instead of retrying once
    #[arg(long)]
    pub no_retry: bool,

    /// Relay to the agent listening on this socket instead of Pageant
    #[arg(long, value_name = "PATH", env = "CHARADE_UPSTREAM")]
    pub upstream: Option<PathBuf>,

    /// Run this command with the agent variables set instead of printing them
    #[arg(
        value_name = "COMMAND",
        trailing_var_arg = true,
        allow_hyphen_values = true,
        conflicts_with_all = ["debug", "foreground"]
    )]
    pub command: Vec<OsString>,
}

fn parse_max_frame(value: &str) -> Result<usize, String> {
    let max: usize = value.parse().map_err(|e| format!("{e}"))?;
    if max < MIN_MAX_FRAME {
        return Err(format!("must be at least {MIN_MAX_FRAME}"));
    }
    Ok(max)
}

/// What the process does after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Fork, print assignments from the parent, serve from the child.
    Daemon,
    /// Fork, exec the command from the parent, serve from the child.
    Command(Vec<OsString>),
    /// Serve in the foreground.
    Foreground,
    /// Serve in the foreground with debug logging.
    Debug,
    /// Signal a running agent and exit.
    Kill,
}

impl Mode {
    pub fn forks(&self) -> bool {
        matches!(self, Self::Daemon | Self::Command(_))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub shell: Shell,
    pub bind_address: Option<PathBuf>,
    pub bridge: BridgeConfig,
    pub retry_bridge: bool,
}

impl Config {
    /// `login_shell` is `$SHELL`, consulted only when neither -c nor -s is given.
    pub fn from_args(args: Args, login_shell: Option<&str>) -> Self {
        let mode = if args.kill {
            Mode::Kill
        } else if args.debug {
            Mode::Debug
        } else if args.foreground {
            Mode::Foreground
        } else if !args.command.is_empty() {
            Mode::Command(args.command)
        } else {
            Mode::Daemon
        };

        let shell = if args.csh {
            Shell::CShell
        } else if args.bourne {
            Shell::Bourne
        } else {
            Shell::detect(login_shell)
        };

        Self {
            mode,
            shell,
            bind_address: args.bind_address,
            bridge: BridgeConfig {
                timeout: Duration::from_millis(args.bridge_timeout_ms),
                max_frame: args.max_frame,
                upstream: args.upstream,
            },
            retry_bridge: !args.no_retry,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use clap::error::ErrorKind;

    use super::*;

    fn parse(argv: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("charade").chain(argv.iter().copied()))
    }

    fn config(argv: &[&str]) -> Config {
        Config::from_args(parse(argv).unwrap(), Some("/bin/sh"))
    }

    #[test]
    fn command_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn defaults() {
        let config = config(&[]);
        assert_eq!(config.mode, Mode::Daemon);
        assert_eq!(config.shell, Shell::Bourne);
        assert!(config.bind_address.is_none());
        assert_eq!(config.bridge.max_frame, DEFAULT_MAX_FRAME);
        assert!(config.retry_bridge);
    }

    #[test]
    fn mode_selection() {
        assert_eq!(config(&["-d"]).mode, Mode::Debug);
        assert_eq!(config(&["-D"]).mode, Mode::Foreground);
        assert_eq!(config(&["-k"]).mode, Mode::Kill);
        assert_eq!(
            config(&["bash", "-l"]).mode,
            Mode::Command(vec![OsString::from("bash"), OsString::from("-l")])
        );
        assert!(config(&[]).mode.forks());
        assert!(!config(&["-D"]).mode.forks());
    }

    #[test]
    fn shell_flags_override_detection() {
        let args = parse(&["-s"]).unwrap();
        assert_eq!(Config::from_args(args, Some("/bin/tcsh")).shell, Shell::Bourne);

        let args = parse(&["-c"]).unwrap();
        assert_eq!(Config::from_args(args, Some("/bin/bash")).shell, Shell::CShell);

        let args = parse(&[]).unwrap();
        assert_eq!(Config::from_args(args, Some("/bin/tcsh")).shell, Shell::CShell);
    }

    #[test]
    fn bridge_options() {
        let config = config(&[
            "--bridge-timeout",
            "250",
            "--max-frame",
            "8192",
            "--no-retry",
            "--upstream",
            "/run/agent.sock",
            "-a",
            "/tmp/charade.sock",
        ]);
        assert_eq!(config.bridge.timeout, Duration::from_millis(250));
        assert_eq!(config.bridge.max_frame, 8192);
        assert_eq!(config.bridge.upstream, Some(PathBuf::from("/run/agent.sock")));
        assert_eq!(config.bind_address, Some(PathBuf::from("/tmp/charade.sock")));
        assert!(!config.retry_bridge);
    }

    #[test]
    fn conflicting_flags_are_usage_errors() {
        for argv in [
            &["-c", "-s"][..],
            &["-k", "true"][..],
            &["-d", "-D"][..],
            &["-d", "true"][..],
        ] {
            let err = parse(argv).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ArgumentConflict, "{argv:?}");
            assert_eq!(err.exit_code(), 2);
        }
    }

    #[test]
    fn out_of_range_values_are_usage_errors() {
        for argv in [&["--bridge-timeout", "0"][..], &["--max-frame", "4"][..]] {
            let err = parse(argv).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ValueValidation, "{argv:?}");
            assert_eq!(err.exit_code(), 2);
        }
    }
}

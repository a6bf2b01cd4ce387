//! charade binary.
//!
//! Exit codes: 0 on clean shutdown or parent handoff, 1 on any fatal error,
//! 2 on usage errors (from clap).

#[cfg(unix)]
mod app {
    use std::io::{self, Write};
    use std::process::ExitCode;

    use anyhow::Context;
    use clap::Parser;
    use nix::unistd::{Pid, getpid};

    use charade::bridge::Bridge;
    use charade::daemon::{self, AGENT_PID_VAR, Detached, Shell};
    use charade::{Args, Config, EventLoop, ListenEndpoint, LoopConfig, Mode, logging, stdio};

    pub fn main() -> ExitCode {
        if let Err(e) = stdio::ensure_std_fds_open() {
            eprintln!("charade: cannot open standard descriptors: {e}");
            return ExitCode::FAILURE;
        }

        let shell = std::env::var("SHELL").ok();
        let config = Config::from_args(Args::parse(), shell.as_deref());
        logging::init_tracing(config.mode == Mode::Debug);

        match run(&config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(error = format!("{e:#}"), "Fatal error");
                eprintln!("charade: {e:#}");
                ExitCode::FAILURE
            }
        }
    }

    fn run(config: &Config) -> anyhow::Result<()> {
        if config.mode == Mode::Kill {
            return kill(config.shell);
        }

        let mut endpoint = match &config.bind_address {
            Some(path) => ListenEndpoint::bind_at(path.clone()),
            None => ListenEndpoint::create(&std::env::temp_dir(), getpid()),
        }
        .context("failed to set up agent socket")?;

        let bridge = charade::connect_bridge(&config.bridge).context("no foreign agent backend")?;

        if config.mode.forks()
            && let Detached::Parent { child } = daemon::detach()?
        {
            endpoint.hand_off();
            return parent(config, endpoint, child);
        }

        let loop_config = LoopConfig {
            max_frame: config.bridge.max_frame,
            retry_bridge: config.retry_bridge,
        };
        let served = serve(&endpoint, bridge, loop_config, config);

        let report = endpoint.teardown();
        if !report.is_clean() {
            tracing::warn!("Agent socket cleanup was incomplete");
        }
        served
    }

    /// Shutdown signals are routed to the loop before anything else can
    /// block, so a signal at any point from here on still tears down.
    fn serve(
        endpoint: &ListenEndpoint,
        bridge: Box<dyn Bridge>,
        loop_config: LoopConfig,
        config: &Config,
    ) -> anyhow::Result<()> {
        let mut event_loop = EventLoop::new(endpoint.listener(), bridge, loop_config)
            .context("failed to create event loop")?;
        event_loop
            .install_signal_handlers()
            .context("failed to install signal handlers")?;

        if config.mode.forks() {
            stdio::redirect_std_fds_to_devnull().context("failed to detach standard descriptors")?;
        } else {
            print_assignments(config.shell, endpoint, getpid())?;
        }

        event_loop.run().context("event loop failed")
    }

    /// The forked parent: hand the agent's location to the caller, then leave.
    fn parent(config: &Config, endpoint: ListenEndpoint, child: Pid) -> anyhow::Result<()> {
        match &config.mode {
            Mode::Command(command) => {
                let socket = endpoint.socket_path().to_path_buf();
                // Closes our copy of the listener; the child keeps serving.
                drop(endpoint);
                Err(daemon::exec_with_agent(command, &socket, child).into())
            }
            _ => print_assignments(config.shell, &endpoint, child),
        }
    }

    fn print_assignments(shell: Shell, endpoint: &ListenEndpoint, agent: Pid) -> anyhow::Result<()> {
        let mut stdout = io::stdout().lock();
        stdout.write_all(daemon::env_assignments(shell, endpoint.socket_path(), agent).as_bytes())?;
        stdout.flush()?;
        Ok(())
    }

    fn kill(shell: Shell) -> anyhow::Result<()> {
        let value = std::env::var(AGENT_PID_VAR).ok();
        let agent = daemon::parse_agent_pid(value.as_deref())?;
        daemon::kill_agent(agent)?;

        let mut stdout = io::stdout().lock();
        stdout.write_all(daemon::kill_assignments(shell, agent).as_bytes())?;
        stdout.flush()?;
        Ok(())
    }
}

#[cfg(unix)]
fn main() -> std::process::ExitCode {
    app::main()
}

#[cfg(not(unix))]
fn main() -> std::process::ExitCode {
    eprintln!("charade: Unix domain sockets are required");
    std::process::ExitCode::FAILURE
}

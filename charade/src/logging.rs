//! Tracing setup.
//!
//! `RUST_LOG` wins when set. Otherwise `CHARADE_LOG` picks the level for
//! this crate, defaulting to `debug` under `-d` and `info` otherwise.
//! `LOG_FORMAT=json` switches to JSON lines. Output always goes to stderr,
//! since stdout carries the shell assignments.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

fn level(charade_log: Option<&str>, debug: bool) -> &'static str {
    match charade_log {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("info") => "info",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ if debug => "debug",
        _ => "info",
    }
}

fn filter(debug: bool) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    let level = level(std::env::var("CHARADE_LOG").ok().as_deref(), debug);
    EnvFilter::new(format!("charade={level}"))
}

/// Install the global subscriber. Safe to call more than once.
pub fn init_tracing(debug: bool) {
    let filter = filter(debug);
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_level_beats_debug_flag() {
        assert_eq!(level(Some("warn"), true), "warn");
        assert_eq!(level(Some("warning"), false), "warn");
        assert_eq!(level(Some("trace"), false), "trace");
    }

    #[test]
    fn fallback_depends_on_debug_flag() {
        assert_eq!(level(None, false), "info");
        assert_eq!(level(None, true), "debug");
        assert_eq!(level(Some("loud"), false), "info");
    }

    #[test]
    fn init_is_idempotent() {
        init_tracing(false);
        init_tracing(true);
        tracing::debug!("still fine");
    }
}

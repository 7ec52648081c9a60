//! Logging setup shared by the master and worker processes.
//!
//! Events go to stderr so child stdout stays free for the supervisor.
//! The format follows the stream: JSON lines when piped, colored text on
//! a terminal, with `--log.json` forcing the former.

use anyhow::Context;
use tracing_subscriber::prelude::*;

#[derive(Debug, clap::Args)]
pub struct LogArgs {
    /// Tracing filter directives, e.g. "info" or "info,rpc=debug".
    #[arg(
        long = "log.level",
        default_value = "info",
        env = "LOG_LEVEL",
        global = true
    )]
    pub level: String,

    /// Emit one JSON document per line even on a terminal.
    #[arg(long = "log.json", env = "LOG_JSON", global = true)]
    pub json: bool,
}

/// Install the process-wide subscriber. Spans are logged once, on close,
/// so an instrumented request costs a single line carrying its timing
/// and recorded fields.
pub fn init_logging(args: &LogArgs) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(&args.level)
        .with_context(|| format!("parsing log filter '{}'", args.level))?;

    let events = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE);

    if args.json || !atty::is(atty::Stream::Stderr) {
        tracing_subscriber::registry()
            .with(filter)
            .with(events.json().flatten_event(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(events.with_ansi(true))
            .init();
    }
    Ok(())
}

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;

/// The game-server cluster binary. With no `gsid` in the environment it
/// runs the master, which forks one worker per locally-hosted peer;
/// workers are those forked children.
#[derive(Debug, Parser)]
#[command(name = "burrowd", version)]
struct Cli {
    /// Base config file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Local config file, merged over the base.
    #[arg(long, value_name = "PATH")]
    config_local: Option<PathBuf>,

    /// Config overrides, e.g. --set net.rpc.basePort=18000
    #[arg(long = "set", value_name = "PATH=VALUE")]
    set: Vec<String>,

    #[command(flatten)]
    log: server::logging::LogArgs,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    server::logging::init_logging(&cli.log)?;

    // An uncaught panic anywhere in the process is fatal: log it and
    // exit, letting the master respawn this worker.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        tracing::error!(panic = %info, "uncaught panic, exiting");
        std::process::exit(70);
    }));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    let result = runtime.block_on(run(cli));

    // Shut the runtime down without waiting for lingering blocking tasks.
    runtime.shutdown_background();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = config::Config::load(
        cli.config.as_deref(),
        cli.config_local.as_deref(),
        &cli.set,
    )?;

    match std::env::var(config::GSID_VAR) {
        Ok(gsid) => server::worker::run(cfg, gsid).await,
        Err(_) => server::master::run(cfg).await,
    }
}

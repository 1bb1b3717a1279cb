//! kestrel-run: the NVR pipeline supervisor.

use std::path::PathBuf;

use clap::Parser;
use eyre::WrapErr;
use tracing::info;

mod labels;
mod logging;
mod pipeline;
mod stats;
mod supervisor;

#[derive(Debug, Parser)]
#[command(name = "kestrel-run", about = "multi-camera NVR pipeline supervisor")]
struct Args {
    /// Configuration file; the CONFIG_FILE environment variable overrides
    /// the built-in default path.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Validate the configuration and exit.
    #[arg(long)]
    check_config: bool,
    /// Also write logs to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> eyre::Result<()> {
    let args = Args::parse();
    logging::init(args.log_file.as_deref())
        .map_err(|e| eyre::eyre!("cannot initialize logging: {e}"))?;

    let config_path = args.config.unwrap_or_else(kestrel_config::config_path);
    let cfg = kestrel_config::parse_config_file(&config_path)
        .wrap_err_with(|| format!("invalid configuration {config_path:?}"))?;

    if args.check_config {
        info!("configuration {config_path:?} is valid");
        return Ok(());
    }

    info!(
        "starting kestrel with {} cameras, {} detectors",
        cfg.cameras.len(),
        cfg.detectors.len()
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("building runtime")?;
    runtime.block_on(supervisor::run(cfg, async {
        let _ = tokio::signal::ctrl_c().await;
    }))
}

//! Thin launcher: `kestrel <command>` executes `kestrel-<command>` from the
//! PATH, so subcommands ship as separate binaries.

use clap::Parser;
use eyre::{Result, WrapErr};
use tracing::debug;

#[derive(Debug, Parser)]
#[command(name = "kestrel", about = "multi-camera network video recorder")]
struct Args {
    /// Command to execute (e.g. run, default-config)
    command: String,
    /// Options passed through to the command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    options: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    debug!("{args:?}");

    let cmd_name = format!("kestrel-{}", args.command);
    let status = std::process::Command::new(&cmd_name)
        .args(&args.options)
        .status()
        .wrap_err_with(|| format!("running '{cmd_name}'"))?;

    if let Some(code) = status.code() {
        std::process::exit(code);
    }
    Ok(())
}

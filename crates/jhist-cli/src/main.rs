#![deny(clippy::all, warnings)]

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use jhist_core::Config;

mod cli;
mod dispatch;

use cli::JhistCli;
use dispatch::dispatch_command;

fn main() -> Result<()> {
    color_eyre::install()?;

    if !cfg!(target_os = "linux") {
        eprintln!("jhist needs Linux (user namespaces, /proc, overlayfs).");
        std::process::exit(1);
    }

    let cli = JhistCli::parse();
    init_tracing(cli.trace, cli.verbose, cli.quiet);

    let config = Config::load().map_err(|err| eyre!("{err:?}"))?;
    let code = dispatch_command(&config, &cli.command).map_err(|err| eyre!("{err:?}"))?;
    if code == 0 {
        Ok(())
    } else {
        std::process::exit(code);
    }
}

fn init_tracing(trace: bool, verbose: u8, quiet: bool) {
    let level = if trace {
        "trace"
    } else if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("jhist={level},jhist_cli={level},jhist_core={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

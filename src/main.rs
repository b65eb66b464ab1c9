//! relayd binary entry point. See the `relayd` library for the core.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

/// uid-addressed TCP frame relay with hot descriptor handover.
#[derive(Parser, Debug)]
#[command(name = "relayd", version)]
struct Args {
    /// TCP listen port.
    #[arg(short = 'p', value_name = "PORT", default_value_t = relayd::DEFAULT_PORT)]
    port: u16,

    /// UNIX control socket path; enables hot handover.
    #[arg(short = 'u', value_name = "PATH")]
    ctrl_socket: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    // Dead destinations must surface as write errors, not kill the process.
    unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };

    let config = relayd::Config {
        port: args.port,
        ctrl_socket: args.ctrl_socket,
    };
    let mut relay = relayd::Relay::new(&config)?;

    signal_hook::flag::register(signal_hook::consts::signal::SIGUSR1, relay.shed_flag())
        .context("register SIGUSR1 handler")?;

    relay.run()
}

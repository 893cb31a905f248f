//! ptyrelay: attach the local terminal to a remote process
//!
//! Connects to the remote side's sockets, puts the terminal in raw mode and
//! relays input, output and resizes until the remote output ends.

mod cli;
mod connector;
mod winch;

use std::ops::ControlFlow;

use clap::Parser;
use tracing::{debug, info, warn};

use ptyrelay_core::{RelayConfig, Session, SessionParams};
use ptyrelay_utils::{init_logging_with_config, LogConfig, Result};

use cli::Cli;
use connector::{Address, SocketConnector};

fn main() {
    let cli = Cli::parse();

    let exit_code = match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("ptyrelay: {}", e);
            1
        }
    };

    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<()> {
    let mut log_config = LogConfig::relay();
    if let Some(filter) = &cli.log {
        log_config = log_config.with_filter(filter);
    }
    if cli.log_stderr {
        log_config = log_config.stderr_output();
    }
    init_logging_with_config(log_config)?;

    let mut config = match &cli.config {
        Some(path) => RelayConfig::load_from(path)?,
        None => RelayConfig::load(),
    };
    if cli.no_raw {
        config.raw = false;
    }

    let stderr = cli.stderr.as_deref().map(Address::parse).transpose()?;
    let control = cli.control.as_deref().map(Address::parse).transpose()?;
    let mut connector = SocketConnector::new(Address::parse(&cli.addr)?)
        .with_stderr(stderr)
        .with_control(control)
        .multiplexed(cli.multiplexed)
        .with_pending_limit(config.max_pending_bytes);

    let params = SessionParams {
        target: cli.addr.clone(),
        tty: !cli.multiplexed,
        stdin_open: !cli.no_stdin,
    };

    winch::install()?;
    let mut session = Session::attach(&mut connector, &params, config)?;
    session.run_with(|session| {
        if winch::take() {
            match session.resize_to_local() {
                Ok(()) => {}
                Err(e) if e.is_peer_closed() => debug!("Control connection gone: {}", e),
                Err(e) => warn!("Resize failed: {}", e),
            }
        }
        Ok(ControlFlow::Continue(()))
    })?;

    info!("session finished");
    Ok(())
}

//! CLI argument parsing

use std::path::PathBuf;

use clap::Parser;

/// Relay the local terminal to a remote process
#[derive(Parser, Debug)]
#[command(name = "ptyrelay")]
#[command(about = "Relay the local terminal to a remote pseudo-terminal")]
#[command(version)]
pub struct Cli {
    /// Remote address carrying stdin and stdout
    ///
    /// Supports TCP and Unix sockets via URL format, or a bare socket path.
    /// Example: tcp://127.0.0.1:3000 or unix:///tmp/shell.sock
    pub addr: String,

    /// Separate connection carrying the remote stderr
    #[arg(long, value_name = "ADDR")]
    pub stderr: Option<String>,

    /// Connection receiving terminal size changes as JSON lines
    #[arg(long, value_name = "ADDR")]
    pub control: Option<String>,

    /// Remote output is framed (the remote process has no tty)
    #[arg(long)]
    pub multiplexed: bool,

    /// Do not relay local input
    #[arg(long)]
    pub no_stdin: bool,

    /// Leave the local terminal in cooked mode
    #[arg(long)]
    pub no_raw: bool,

    /// Configuration file (defaults to ~/.config/ptyrelay/config.toml)
    #[arg(long, env = "PTYRELAY_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "ptyrelay_core=trace"
    #[arg(long, env = "PTYRELAY_LOG", value_name = "FILTER")]
    pub log: Option<String>,

    /// Write logs to stderr instead of the log file
    #[arg(long)]
    pub log_stderr: bool,
}

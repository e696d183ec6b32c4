//! CLI argument parsing with clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Interactive shells over HTTP.
///
/// Allocates a pseudo-terminal per session, attaches a shell to it, and
/// exposes each session's input and output through a small web API with a
/// built-in browser UI.
#[derive(Debug, Parser)]
#[command(name = "webterm", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Serve the multi-session web terminal
    Serve(ServeArgs),

    /// Attach a single shell and mirror its output to stdout
    Bridge(BridgeArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: String,

    /// Shell executable spawned for each session
    #[arg(long, default_value = "/bin/bash")]
    pub shell: String,

    /// Directory holding the browser UI assets
    #[arg(long, default_value = "resource")]
    pub assets: PathBuf,
}

#[derive(Debug, Args)]
pub struct BridgeArgs {
    /// Shell executable to attach
    #[arg(long, default_value = "/bin/bash")]
    pub shell: String,
}

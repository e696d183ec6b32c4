//! webterm entry point.

mod args;
mod bridge;
mod broker;
mod server;

use std::sync::Arc;

use clap::Parser;
use tracing::error;

use crate::args::{Cli, Commands, ServeArgs};
use crate::broker::session::SessionBroker;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve(args) => run_serve(args),
        Commands::Bridge(args) => bridge::run(&args.shell),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Run the multi-session HTTP service.
fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async {
        let broker = Arc::new(SessionBroker::new(args.shell));
        broker.spawn_sweeper();
        server::serve(&args.listen, broker, args.assets).await
    })
}

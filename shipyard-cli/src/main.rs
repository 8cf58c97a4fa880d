mod cli;
mod commands;
mod formatter;

use clap::Parser;
use cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let global = cli.global;
    match cli.command {
        Commands::Init(args) => commands::init::execute(args, &global).await,
        Commands::Build(args) => commands::build::execute(args, &global).await,
        Commands::Ship(cmd) => commands::ship::execute(cmd, &global).await,
        Commands::Crate(cmd) => commands::crates::execute(cmd, &global).await,
        Commands::Daemon(cmd) => commands::daemon::execute(cmd, &global).await,
        Commands::Completion(args) => commands::completion::execute(args),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.global.debug);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use shipyard::daemon::DaemonClient;
use shipyard::{ShipyardOptions, ShipyardRuntime};
use shipyard_shared::constants::envs;

use crate::commands::{build, completion, crates, daemon, init, ship};

#[derive(Parser, Debug)]
#[command(
    name = "shipyard",
    author,
    version,
    about = "Build layered chroot crates and run them as supervised ships"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalFlags {
    /// Base directory for crates, ships, logs and the database
    #[arg(long, global = true, env = envs::SHIPYARD_HOME)]
    pub home: Option<PathBuf>,

    /// Daemon control socket address
    #[arg(long, global = true, env = envs::SHIPYARD_DAEMON_ADDR)]
    pub daemon_addr: Option<String>,

    /// Enable debug logging on stderr
    #[arg(long, global = true)]
    pub debug: bool,
}

impl GlobalFlags {
    pub fn options(&self) -> ShipyardOptions {
        let mut options = ShipyardOptions::default();
        if let Some(home) = &self.home {
            options.home_dir = home.clone();
        }
        if let Some(addr) = &self.daemon_addr {
            options.daemon_addr = addr.clone();
        }
        options
    }

    pub fn create_runtime(&self) -> anyhow::Result<ShipyardRuntime> {
        Ok(ShipyardRuntime::open(self.options())?)
    }

    pub fn client(&self) -> DaemonClient {
        DaemonClient::new(self.options().daemon_addr)
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Prepare the home directory and the root layer
    Init(init::InitArgs),

    /// Build a crate from a build file
    Build(build::BuildArgs),

    /// Manage ships
    #[command(subcommand)]
    Ship(ship::ShipCommand),

    /// Manage crates
    #[command(subcommand)]
    Crate(crates::CrateCommand),

    /// Control the ship daemon
    #[command(subcommand)]
    Daemon(daemon::DaemonCommand),

    /// Generate shell completions
    Completion(completion::CompletionArgs),
}

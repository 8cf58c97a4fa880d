use anyhow::Context;
use clap::Subcommand;
use shipyard::build::BuildFile;
use shipyard::{CrateRecord, Request, ShipyardRuntime};

use crate::formatter::{OutputFormat, ShipRow, print_rows};

#[derive(Subcommand, Debug)]
pub enum ShipCommand {
    /// Create a ship from a crate and start it
    Deploy {
        /// Name of the new ship
        name: String,

        /// Crate to run
        #[arg(short, long)]
        image: String,

        /// Override the crate's runtime command
        #[arg(long)]
        command: Option<String>,
    },

    /// Start an existing ship that is not running
    Start {
        name: String,

        /// Override the crate's runtime command
        #[arg(long)]
        command: Option<String>,
    },

    /// Stop running ships
    Stop {
        #[arg(required = true, num_args = 1..)]
        names: Vec<String>,

        /// Send SIGKILL if the ship survives SIGTERM
        #[arg(short, long)]
        force: bool,
    },

    /// Stop a ship, then start it again
    Restart {
        name: String,

        #[arg(short, long)]
        force: bool,
    },

    /// Remove stopped ships and their roots
    #[command(alias = "rm")]
    Remove {
        #[arg(required = true, num_args = 1..)]
        names: Vec<String>,
    },

    /// List ships
    #[command(alias = "ls")]
    List {
        #[arg(long, value_enum, default_value_t)]
        format: OutputFormat,
    },
}

pub async fn execute(cmd: ShipCommand, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let runtime = global.create_runtime()?;

    match cmd {
        ShipCommand::Deploy {
            name,
            image,
            command,
        } => {
            let record = runtime.get_crate(&image)?;
            let command = match command {
                Some(command) => command,
                None => default_command(&runtime, &record)?,
            };
            let request = Request::Deploy {
                ship_id: name.clone(),
                command,
                log_dir: runtime.layout().log_dir(&name),
                image_id: record.id,
            };
            let response = global.client().send(&request).await?.into_result()?;
            match response.pid {
                Some(pid) => println!("{} (pid {})", name, pid),
                None => println!("{}", name),
            }
        }
        ShipCommand::Start { name, command } => {
            start(&runtime, global, &name, command).await?;
        }
        ShipCommand::Stop { names, force } => {
            let client = global.client();
            let mut errors = Vec::new();
            for name in names {
                let request = Request::Stop {
                    ship_name: name.clone(),
                    force,
                };
                match client.send(&request).await.and_then(|r| r.into_result()) {
                    Ok(response) => {
                        println!("{}", response.message.unwrap_or(name));
                    }
                    Err(e) => {
                        eprintln!("Error stopping ship '{}': {}", name, e);
                        errors.push(name);
                    }
                }
            }
            if !errors.is_empty() {
                anyhow::bail!("Failed to stop: {}", errors.join(", "));
            }
        }
        ShipCommand::Restart { name, force } => {
            let request = Request::Stop {
                ship_name: name.clone(),
                force,
            };
            global
                .client()
                .send(&request)
                .await?
                .into_result()
                .with_context(|| format!("failed to stop ship '{}'", name))?;
            start(&runtime, global, &name, None).await?;
        }
        ShipCommand::Remove { names } => {
            let mut errors = Vec::new();
            for name in names {
                match runtime.remove_ship(&name) {
                    Ok(()) => println!("{}", name),
                    Err(e) => {
                        eprintln!("Error removing ship '{}': {}", name, e);
                        errors.push(name);
                    }
                }
            }
            if !errors.is_empty() {
                anyhow::bail!("Failed to remove: {}", errors.join(", "));
            }
        }
        ShipCommand::List { format } => {
            let rows = runtime
                .list_ships()?
                .into_iter()
                .map(ShipRow::from)
                .collect();
            print_rows::<ShipRow>(rows, format)?;
        }
    }

    Ok(())
}

async fn start(
    runtime: &ShipyardRuntime,
    global: &crate::cli::GlobalFlags,
    name: &str,
    command: Option<String>,
) -> anyhow::Result<()> {
    let ship = runtime.get_ship(name)?;
    let record = runtime
        .db()
        .crates()
        .get_by_id(ship.image_id)?
        .with_context(|| format!("crate of ship '{}' no longer exists", name))?;
    let command = match command {
        Some(command) => command,
        None => default_command(runtime, &record)?,
    };

    let request = Request::Start {
        ship_name: name.to_string(),
        command,
        log_dir: runtime.layout().log_dir(name),
        image_id: record.id,
    };
    let response = global.client().send(&request).await?.into_result()?;
    match response.pid {
        Some(pid) => println!("{} (pid {})", name, pid),
        None => println!("{}", name),
    }
    Ok(())
}

/// Runtime command line recorded in the crate's build file.
fn default_command(runtime: &ShipyardRuntime, record: &CrateRecord) -> anyhow::Result<String> {
    let descriptor = runtime
        .db()
        .descriptors()
        .get(record.descriptor_id)?
        .with_context(|| format!("build file of crate '{}' is missing", record.name))?;
    let file = BuildFile::parse(&descriptor.content)?;
    Ok(file.runtime_command_line())
}

use clap::Subcommand;

use crate::formatter::{CrateRow, OutputFormat, print_rows};

#[derive(Subcommand, Debug)]
pub enum CrateCommand {
    /// List built crates
    #[command(alias = "ls")]
    List {
        #[arg(long, value_enum, default_value_t)]
        format: OutputFormat,
    },

    /// Remove crates and their archives
    #[command(alias = "rm")]
    Remove {
        #[arg(required = true, num_args = 1..)]
        names: Vec<String>,
    },
}

pub async fn execute(cmd: CrateCommand, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let runtime = global.create_runtime()?;

    match cmd {
        CrateCommand::List { format } => {
            let rows = runtime
                .list_crates()?
                .into_iter()
                .map(CrateRow::from)
                .collect();
            print_rows::<CrateRow>(rows, format)
        }
        CrateCommand::Remove { names } => {
            let mut errors = Vec::new();
            for name in names {
                match runtime.remove_crate(&name) {
                    Ok(()) => println!("{}", name),
                    Err(e) => {
                        eprintln!("Error removing crate '{}': {}", name, e);
                        errors.push(name);
                    }
                }
            }
            if !errors.is_empty() {
                anyhow::bail!("Failed to remove: {}", errors.join(", "));
            }
            Ok(())
        }
    }
}

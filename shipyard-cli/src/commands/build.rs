use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use shipyard::exec::ChrootExecutor;

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Name of the crate to build
    pub name: String,

    /// Build file
    #[arg(short, long, default_value = "shipyard.yaml")]
    pub file: PathBuf,

    /// Directory `copy_files` sources are resolved against
    #[arg(short, long, default_value = ".")]
    pub context: PathBuf,
}

pub async fn execute(args: BuildArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read build file {}", args.file.display()))?;
    let runtime = global.create_runtime()?;

    let name = args.name.clone();
    let record = tokio::task::spawn_blocking(move || {
        runtime
            .builder(Arc::new(ChrootExecutor))
            .build(&name, &content, &args.context)
    })
    .await??;

    println!(
        "Built crate {} ({}, {} bytes)",
        record.name, record.digest, record.size_bytes
    );
    Ok(())
}

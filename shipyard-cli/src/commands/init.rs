use std::path::PathBuf;

use clap::Args;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Gzip'd tarball to unpack as the root layer
    #[arg(long)]
    pub rootfs: Option<PathBuf>,
}

pub async fn execute(args: InitArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let runtime = global.create_runtime()?;
    runtime.init_root_layer(args.rootfs.as_deref())?;

    println!("Initialized {}", runtime.layout().home_dir().display());
    Ok(())
}

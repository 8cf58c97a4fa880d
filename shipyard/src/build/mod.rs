//! Crate builds: build file parsing, step execution and archiving.

mod archive;
mod copy;
mod descriptor;
mod pipeline;

pub use archive::{ArchiveInfo, EXCLUDED_PATHS, digest_file, write_archive};
pub use copy::copy_into_root;
pub use descriptor::{BuildContext, BuildFile, BuildStep, CrateConfig};
pub use pipeline::{CrateBuilder, remove_crate};

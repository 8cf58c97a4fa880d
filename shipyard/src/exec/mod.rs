//! Command execution inside merged roots, with streamed output.

mod executor;
mod log_tail;
mod tokenize;

pub use executor::{
    ChrootExecutor, OutputSink, RootEnv, RootExecutor, STDERR_LOG, STDOUT_LOG, chroot_args,
    chroot_command, run_streaming,
};
pub use log_tail::LogTail;
pub use tokenize::{join_command, split_command};

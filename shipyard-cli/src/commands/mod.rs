pub mod build;
pub mod completion;
pub mod crates;
pub mod daemon;
pub mod init;
pub mod ship;

//! Shipyard - layered chroot crates and supervised ships
//!
//! Builds root filesystems ("crates") as stacked overlayfs layers from a YAML
//! build file, archives each layer as a content-addressed `.tar.gz`, and runs
//! crates as long-lived processes ("ships") supervised by a daemon that
//! speaks a JSON control protocol over TCP.

pub mod build;
pub mod daemon;
pub mod db;
pub mod exec;
pub mod layers;
pub mod overlay;
pub mod runtime;
pub mod ship;
pub mod util;

pub use build::{BuildFile, CrateBuilder};
pub use daemon::{Daemon, DaemonClient, DaemonContext};
pub use db::{CrateRecord, Database, ShipRecord};
pub use runtime::ShipyardRuntime;
pub use runtime::layout::{FilesystemLayout, RootKind};
pub use runtime::options::ShipyardOptions;
pub use ship::{ShipState, ShipStatus};
pub use shipyard_shared::errors::{ShipyardError, ShipyardResult};
pub use shipyard_shared::protocol::{Request, Response};

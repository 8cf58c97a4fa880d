//! Overlay roots for crates and ships.
//!
//! Every root lives under `{home}/crates/` or `{home}/ships/` as three
//! sibling directories:
//!
//! ```text
//! {name}        upper: writable layer, becomes the crate's content
//! {name}_work   overlayfs scratch
//! {name}_merge  the merged view a build or ship is chrooted into
//! ```
//!
//! Besides the overlay itself, each merged root receives bind mounts of the
//! host's `/proc`, `/dev`, `/sys` and a private devpts instance.

mod manager;
mod mounter;

pub use manager::OverlayManager;
pub use mounter::{Mounter, SystemMounter, parse_mount_points};

//! Ships: named, supervised runs of a crate.

mod state;

pub use state::{ShipState, ShipStatus};

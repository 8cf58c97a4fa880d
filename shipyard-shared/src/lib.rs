//! Shipyard shared code
//!
//! Types used on both sides of the control socket: the error taxonomy,
//! protocol messages, and constants the CLI and daemon must agree on.

pub mod constants;
pub mod errors;
pub mod protocol;

pub use errors::{ShipyardError, ShipyardResult};
pub use protocol::{Request, Response, ResponseStatus};

//! Umbrella crate for Townhall.
//!
//! Re-exports the protocol, engine and client crates so downstream code can
//! depend on a single crate name (`townhall`).

pub use townhall_client as client;
pub use townhall_engine as engine;
pub use townhall_protocol as protocol;

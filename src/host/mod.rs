//! Host-facing contracts: what the client may send to a session.

pub mod contract;

pub use contract::{ClientEvent, SessionConfig};

//! Network layer: server addresses and blocking connections.

pub mod connection;
pub mod endpoint;

pub use connection::{Connection, Health};
pub use endpoint::Endpoint;

//! Connection module - per-peer protocol state and its satellite tables.
//!
//! Provides:
//! - [`Connection`] - handle exposing the send operations
//! - [`ResponseDescriptor`] - caller expectations for a response
//! - [`ConnectionRegistry`] - peer-address-keyed map of live connections

pub(crate) mod keep_alive;
mod pending;
mod reassembly;
mod registry;
pub(crate) mod state;

pub use pending::ResponseDescriptor;
pub use registry::ConnectionRegistry;
pub use state::{Connection, DisconnectHook};

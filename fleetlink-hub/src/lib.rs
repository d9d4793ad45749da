//! Client side of the Fleetlink hub channel.
//!
//! Provides typed wire frames, a persistent [`connection::HubConnection`]
//! with automatic reconnection, and the invoke/subscribe primitives both
//! the machine agent and the admin console build on.

pub mod connection;
pub mod error;
pub mod frames;
pub mod reconnect;

pub use connection::{ConnectionState, HubConnection, HubEndpoint};
pub use error::HubError;
pub use frames::Frame;

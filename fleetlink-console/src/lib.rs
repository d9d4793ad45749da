//! Admin console client for Fleetlink
//!
//! The console side of the fleet: authenticates against the backend,
//! mirrors the registered device list, subscribes to hub notifications
//! (session requests, unknown machines) and issues device commands.
//! Rendering is left to the embedding UI; this crate exposes the state,
//! the change signals and the operations it needs.

pub mod auth;
pub mod config;
pub mod control;
pub mod credentials;
pub mod devices;
pub mod notifications;

pub use auth::AuthGateway;
pub use config::ConsoleConfig;
pub use control::{ControlLink, ControlSignal};
pub use credentials::{CredentialStore, KeyringStore, MemoryStore};
pub use devices::{DeviceDirectory, DeviceMetrics, DeviceRecord};
pub use notifications::{Notification, NotificationKind, NotificationRouter, RouterSignal};

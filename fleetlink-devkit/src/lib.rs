/*!
# Fleetlink DevKit - Stubs and Utilities for Development

Library for developing and testing Fleetlink components without live
infrastructure:
- Scriptable stub hub speaking the wire frames (no real hub needed)
- Stub backend HTTP server for auth and device routes
- Recording and assertion helpers for exchanged traffic
*/

pub mod backend_stub;
pub mod hub_stub;

pub use backend_stub::StubBackend;
pub use hub_stub::{RecordedInvocation, StubHub};

//! Real-time fan-out hub.
//!
//! One coordinator task owns the client registry; every mutation arrives
//! over its command channel. Broadcasts never block the coordinator: each
//! client has a bounded buffer and a client that cannot keep up is dropped
//! from the registry rather than back-pressuring everyone else.

pub mod hub;
pub mod messages;

pub use hub::*;
pub use messages::*;

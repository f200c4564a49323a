//! Omnichat core contracts and value types.
//!
//! This crate exposes the data structures shared between ingress, the
//! automation pipeline, the fan-out hub, and the background processors. It
//! also provides the signature helpers and the narrow capability interfaces
//! behind which the chat provider and the AI provider sit.

pub mod context;
pub mod error;
pub mod event;
pub mod path_safety;
pub mod provider;
pub mod signature;

pub use context::*;
pub use error::*;
pub use event::*;
pub use provider::*;
pub use signature::*;

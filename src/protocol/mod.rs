//! # Protocol Layer
//!
//! Command-level messages on top of the envelope.
//!
//! ## Components
//! - **Message**: payload types and the commands the engine itself speaks
//! - **Handshake**: key exchange that establishes the session key
//! - **Registry**: command name to body decoder

pub mod handshake;
pub mod message;
pub mod registry;

pub use message::{commands, Payload};
pub use registry::{PacketRegistry, ResponseKind};

//! # IM Protocol Engine
//!
//! Client-side network engine for a binary instant-messaging protocol.
//!
//! ## Layers
//! - [`core`]: tag-value body codec, length-prefixed framing, the sealed envelope
//! - [`protocol`]: built-in commands, key exchange, command registry
//! - [`transport`]: connectors and the persisted session store
//! - [`service`]: request correlation, connection state machine, the [`Engine`] facade
//! - [`utils`]: ciphers, compression, logging, metrics, timeouts
//!
//! ## Lifecycle
//! ```text
//! Idle -> Connecting -> Active -> Closed(reason)
//!             ^                       |
//!             +------ resume ---------+   (not after Shutdown)
//! ```
//!
//! A session key established by the key exchange is cached per account and reused by
//! later connections until it expires.

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::EngineConfig;
pub use error::{ErrorKind, ProtocolError, Result};
pub use protocol::{Payload, PacketRegistry, ResponseKind};
pub use service::{
    CloseReason, ConnectionState, Engine, EngineBuilder, PacketStream, RetryPolicy,
    StateObserver,
};
pub use transport::{Connector, MemoryAcceptor, MemoryConnector, ServerAddress, SessionStore};

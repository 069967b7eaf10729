//! # Service Layer
//!
//! Everything with a task or a timer in it.
//!
//! ## Components
//! - **Correlator**: matches responses to waiting requests, retries, fans out events
//! - **Connection**: read and write tasks of one transport link
//! - **State**: connection lifecycle and observers
//! - **Engine**: the public facade

pub mod connection;
pub(crate) mod context;
pub mod correlator;
pub mod engine;
pub mod state;

pub use correlator::{Correlator, Dispatched, Outbound, RetryPolicy};
pub use engine::{Engine, EngineBuilder, PacketStream};
pub use state::{CloseReason, ConnectionState, StateObserver};

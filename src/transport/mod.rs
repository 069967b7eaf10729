//! # Transport Layer
//!
//! Where bytes come from and where session state is kept between connections.
//!
//! ## Components
//! - **Connector**: opens a duplex byte stream to a server (TCP, or in-memory for tests)
//! - **Session Store**: current session key, ranked server list, on-disk cache

pub mod memory;
pub mod session_store;
pub mod tcp;

pub use memory::{MemoryAcceptor, MemoryConnector};
pub use session_store::{ServerAddress, SessionKeyMaterial, SessionStore};
pub use tcp::{AsyncStream, BoxedStream, Connector, TcpConnector};

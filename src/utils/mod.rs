//! # Utility Modules
//!
//! Building blocks shared by the codec, envelope and service layers.
//!
//! ## Components
//! - **Crypto**: X25519 key agreement, TEA and AES-256-GCM body ciphers
//! - **Compression**: LZ4 and Zstd with size limits and thresholds
//! - **Logging**: `tracing-subscriber` setup from [`crate::config::LoggingConfig`]
//! - **Time**: Unix-millisecond timestamps for session expiry
//! - **Timeout**: Deadline wrapper mapping expiry to `OperationTimeout`
//! - **Replay Cache**: TTL set of answered request keys
//! - **Metrics**: Per-engine atomic counters
//!
//! ## Security
//! - Nonces and key pairs come from the OS RNG
//! - Decompression bomb protection (bounded by the max payload size)
//! - Memory zeroing for key material (zeroize crate)

pub mod compression;
pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod replay_cache;
pub mod time;
pub mod timeout;

pub use metrics::{Metrics, MetricsSnapshot};
pub use replay_cache::ReplayCache;

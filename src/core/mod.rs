//! # Core Protocol Components
//!
//! Byte-level handling of the wire protocol.
//!
//! ## Components
//! - **Tars**: recursive tag-value codec for packet bodies
//! - **Framer**: cuts a byte stream into length-prefixed frames
//! - **Packet**: frame, packet and correlation key types
//! - **Envelope**: versioned, sealed frame layout around a command body
//!
//! ## Inbound Flow
//! ```text
//! bytes -> Framer -> RawPacket -> envelope::unwrap -> Packet -> registry -> IncomingPacket
//! ```
//!
//! ## Security
//! - Frame lengths are checked before buffering
//! - Codec counts are checked against the remaining input before allocating
//! - Nesting depth is capped

pub mod envelope;
pub mod framer;
pub mod packet;
pub mod tars;

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::protocol::message::Payload;

/// A complete frame as cut by the framer, length prefix included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    bytes: Bytes,
}

impl RawPacket {
    pub fn new(bytes: Bytes) -> Self {
        Self { bytes }
    }

    /// Length announced by the prefix (equals `len()` for framer output)
    pub fn declared_len(&self) -> usize {
        match self.bytes.get(..4) {
            Some(prefix) => u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize,
            None => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Everything after the length prefix
    pub fn body(&self) -> &[u8] {
        self.bytes.get(4..).unwrap_or_default()
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

/// An opened envelope: routing metadata plus the plaintext body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: String,
    pub sequence_id: i32,
    pub account: String,
    pub session_id: Bytes,
    pub body: Bytes,
    pub encrypted: bool,
}

impl Packet {
    /// Correlation identity
    pub fn key(&self) -> PacketKey {
        PacketKey::new(self.command.clone(), self.sequence_id)
    }
}

/// The (command name, sequence id) pair a response is matched on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PacketKey {
    pub command: String,
    pub sequence_id: i32,
}

impl PacketKey {
    pub fn new(command: impl Into<String>, sequence_id: i32) -> Self {
        Self {
            command: command.into(),
            sequence_id,
        }
    }
}

impl std::fmt::Display for PacketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.command, self.sequence_id)
    }
}

/// A packet after its body went through the registry decoder.
///
/// A decode failure is carried in `result` so a pending request still completes.
#[derive(Debug)]
pub struct IncomingPacket {
    pub command: String,
    pub sequence_id: i32,
    pub result: Result<Payload, ProtocolError>,
}

impl IncomingPacket {
    pub fn key(&self) -> PacketKey {
        PacketKey::new(self.command.clone(), self.sequence_id)
    }

    /// The decoded payload, or the decode error
    pub fn into_payload(self) -> crate::error::Result<Payload> {
        self.result
    }
}

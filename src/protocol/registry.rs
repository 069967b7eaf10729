use crate::core::packet::{IncomingPacket, Packet};
use crate::core::tars::{self, StructShape, Structured};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::{commands, ExchangeResponse, Payload, ServerListPush};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

type DecodeFn = dyn Fn(&[u8]) -> Result<Payload> + Send + Sync + 'static;

/// Whether a command answers one of our requests or arrives on the server's initiative
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Response,
    Push,
}

struct PacketEntry {
    decode: Box<DecodeFn>,
    kind: ResponseKind,
}

/// Command-name routing table: name → (decoder, response kind).
/// Uses Cow<'static, str> so built-in names are stored without allocating.
#[derive(Clone)]
pub struct PacketRegistry {
    entries: Arc<RwLock<HashMap<Cow<'static, str>, PacketEntry>>>,
}

impl Default for PacketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketRegistry {
    /// Registry with the engine's own commands
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.insert(
            Cow::Borrowed(commands::KEY_EXCHANGE),
            Box::new(|body| decode_struct(body, &ExchangeResponse::shape())),
            ResponseKind::Response,
        );
        registry.insert(
            Cow::Borrowed(commands::HEARTBEAT),
            Box::new(|_| Ok(Payload::Empty)),
            ResponseKind::Response,
        );
        registry.insert(
            Cow::Borrowed(commands::SERVER_LIST_PUSH),
            Box::new(|body| ServerListPush::from_bytes(body).map(Payload::ServerList)),
            ResponseKind::Push,
        );
        registry
    }

    pub fn empty() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn insert(&self, command: Cow<'static, str>, decode: Box<DecodeFn>, kind: ResponseKind) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(command, PacketEntry { decode, kind });
        }
    }

    /// Register a custom decoder for `command`
    pub fn register<F>(&self, command: &str, kind: ResponseKind, decode: F) -> Result<()>
    where
        F: Fn(&[u8]) -> Result<Payload> + Send + Sync + 'static,
    {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_WRITE_LOCK.into()))?;
        entries.insert(
            Cow::Owned(command.to_string()),
            PacketEntry {
                decode: Box::new(decode),
                kind,
            },
        );
        Ok(())
    }

    /// Register a shape-driven decoder producing `Payload::Struct`
    pub fn register_struct(&self, command: &str, shape: StructShape, kind: ResponseKind) -> Result<()> {
        self.register(command, kind, move |body| decode_struct(body, &shape))
    }

    pub fn kind_of(&self, command: &str) -> Option<ResponseKind> {
        self.entries.read().ok()?.get(command).map(|e| e.kind)
    }

    pub fn contains(&self, command: &str) -> bool {
        self.kind_of(command).is_some()
    }

    /// Decode an opened packet's body.
    ///
    /// Unknown commands become `Payload::Unknown`; decode errors are carried in the result.
    pub fn decode(&self, packet: Packet) -> IncomingPacket {
        let result = match self.entries.read() {
            Ok(entries) => match entries.get(packet.command.as_str()) {
                Some(entry) => (entry.decode)(&packet.body),
                None => {
                    collect_unknown(&packet);
                    Ok(Payload::Unknown(packet.body.clone()))
                }
            },
            Err(_) => Err(ProtocolError::Custom(constants::ERR_REGISTRY_READ_LOCK.into())),
        };
        IncomingPacket {
            command: packet.command,
            sequence_id: packet.sequence_id,
            result,
        }
    }
}

fn decode_struct(body: &[u8], shape: &StructShape) -> Result<Payload> {
    tars::decode(body, shape).map(Payload::Struct)
}

fn collect_unknown(packet: &Packet) {
    debug!(
        command = %packet.command,
        sequence_id = packet.sequence_id,
        len = packet.body.len(),
        "Unknown packet"
    );
}

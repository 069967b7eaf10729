use bytes::Bytes;

use crate::core::tars::{Shape, Struct, StructShape, Structured, Value};
use crate::error::{constants, ProtocolError, Result};
use crate::transport::session_store::ServerAddress;

/// Command names the engine itself speaks
pub mod commands {
    pub const KEY_EXCHANGE: &str = "wtlogin.exchange";
    pub const HEARTBEAT: &str = "Heartbeat.Alive";
    pub const SERVER_LIST_PUSH: &str = "ConfigPushSvc.PushReq";
    pub const SERVER_LIST_ACK: &str = "ConfigPushSvc.PushResp";
}

/// Decoded body of an incoming packet
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Empty,
    Struct(Struct),
    ServerList(ServerListPush),
    /// Command without a registered decoder; raw body retained
    Unknown(Bytes),
}

impl Payload {
    pub fn as_struct(&self) -> Option<&Struct> {
        match self {
            Payload::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_struct(self) -> Result<Struct> {
        match self {
            Payload::Struct(s) => Ok(s),
            Payload::Empty => Ok(Struct::new()),
            other => Err(ProtocolError::MalformedEncoding(format!(
                "Expected a struct payload, found {}",
                other.variant_name()
            ))),
        }
    }

    fn variant_name(&self) -> &'static str {
        match self {
            Payload::Empty => "empty",
            Payload::Struct(_) => "struct",
            Payload::ServerList(_) => "server list",
            Payload::Unknown(_) => "unknown",
        }
    }
}

fn fixed<const N: usize>(value: &Struct, tag: u8) -> Result<[u8; N]> {
    let raw = value.require_bytes(tag)?;
    <[u8; N]>::try_from(raw.as_ref()).map_err(|_| {
        ProtocolError::MalformedEncoding(format!("Tag {tag} must hold {N} bytes"))
    })
}

/// First packet of the key exchange, sealed under the bootstrap key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeRequest {
    pub nonce: [u8; 16],
    pub timestamp: u64,
}

impl Structured for ExchangeRequest {
    fn shape() -> StructShape {
        StructShape::new()
            .required(0, Shape::Bytes)
            .required(1, Shape::Long)
    }

    fn to_struct(&self) -> Struct {
        Struct::new()
            .with(0, self.nonce.to_vec())
            .with(1, self.timestamp as i64)
    }

    fn from_struct(value: Struct) -> Result<Self> {
        Ok(Self {
            nonce: fixed(&value, 0)?,
            timestamp: u64::try_from(value.require_i64(1)?)
                .map_err(|_| ProtocolError::HandshakeError(constants::ERR_INVALID_TIMESTAMP.into()))?,
        })
    }
}

/// Server's answer: its nonce, proof of the client nonce, session lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeResponse {
    pub server_nonce: [u8; 16],
    pub nonce_proof: [u8; 32],
    pub ttl_secs: u64,
}

impl Structured for ExchangeResponse {
    fn shape() -> StructShape {
        StructShape::new()
            .required(0, Shape::Bytes)
            .required(1, Shape::Bytes)
            .with_default(2, Shape::Long, 0i64)
    }

    fn to_struct(&self) -> Struct {
        Struct::new()
            .with(0, self.server_nonce.to_vec())
            .with(1, self.nonce_proof.to_vec())
            .with(2, self.ttl_secs as i64)
    }

    fn from_struct(value: Struct) -> Result<Self> {
        Ok(Self {
            server_nonce: fixed(&value, 0)?,
            nonce_proof: fixed(&value, 1)?,
            ttl_secs: value.require_i64(2)?.max(0) as u64,
        })
    }
}

/// Server-pushed addresses, best first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerListPush {
    pub servers: Vec<ServerAddress>,
}

impl ServerListPush {
    fn address_shape() -> StructShape {
        StructShape::new()
            .required(0, Shape::String)
            .required(1, Shape::Int)
    }
}

impl Structured for ServerListPush {
    fn shape() -> StructShape {
        StructShape::new().with_default(
            0,
            Shape::list_of(Shape::Struct(Self::address_shape())),
            Value::List(Vec::new()),
        )
    }

    fn to_struct(&self) -> Struct {
        let servers = self
            .servers
            .iter()
            .map(|s| {
                Value::Struct(
                    Struct::new()
                        .with(0, s.host.as_str())
                        .with(1, i32::from(s.port)),
                )
            })
            .collect::<Vec<_>>();
        Struct::new().with(0, servers)
    }

    fn from_struct(value: Struct) -> Result<Self> {
        let mut servers = Vec::new();
        for entry in value.get(0).and_then(Value::as_list).unwrap_or_default() {
            let entry = entry
                .as_struct()
                .ok_or_else(|| ProtocolError::malformed("Server entry must be a struct"))?;
            let port = u16::try_from(entry.require_i64(1)?)
                .map_err(|_| ProtocolError::malformed("Server port out of range"))?;
            servers.push(ServerAddress::new(entry.require_str(0)?, port));
        }
        Ok(Self { servers })
    }
}

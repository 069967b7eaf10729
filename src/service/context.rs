//! State shared by the engine facade, the state machine and the link tasks.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::config::EngineConfig;
use crate::core::envelope::{self, EnvelopeOptions, KeyRing, Outgoing, Seal};
use crate::core::packet::{IncomingPacket, PacketKey, RawPacket};
use crate::core::tars::Structured;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::handshake::{client_exchange_finish, client_exchange_init};
use crate::protocol::message::{commands, ExchangeResponse};
use crate::protocol::registry::PacketRegistry;
use crate::service::correlator::{Correlator, RetryPolicy};
use crate::transport::session_store::SessionStore;
use crate::transport::tcp::Connector;
use crate::utils::crypto::SymmetricKey;
use crate::utils::metrics::Metrics;

/// Capacity of the unsolicited-packet broadcast
const EVENT_CAPACITY: usize = 256;

pub(crate) struct EngineContext {
    pub config: EngineConfig,
    pub options: EnvelopeOptions,
    pub store: Arc<SessionStore>,
    pub registry: PacketRegistry,
    pub correlator: Correlator,
    pub metrics: Arc<Metrics>,
    pub connector: Arc<dyn Connector>,
    server_key: [u8; 32],
    /// Exchange key while a handshake is in flight
    bootstrap: Mutex<Option<SymmetricKey>>,
    /// Writer of the active link
    writer: RwLock<Option<mpsc::Sender<RawPacket>>>,
    sequence: AtomicI32,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        store: Arc<SessionStore>,
        registry: PacketRegistry,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let metrics = Arc::new(Metrics::new());
        let server_key = config.session.server_key()?;
        Ok(Self {
            options: EnvelopeOptions::from(&config.transport),
            correlator: Correlator::new(
                config.session.completed_request_ttl,
                EVENT_CAPACITY,
                metrics.clone(),
            ),
            server_key,
            store,
            registry,
            metrics,
            connector,
            bootstrap: Mutex::new(None),
            writer: RwLock::new(None),
            sequence: AtomicI32::new(rand::random::<i32>()),
            config,
        })
    }

    /// Next sequence id; wraps on overflow
    pub fn next_sequence(&self) -> i32 {
        self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.client.response_timeout,
            self.config.client.max_attempts,
        )
    }

    /// Keys for opening the next incoming frame
    pub fn keyring(&self) -> KeyRing {
        KeyRing {
            session: self.store.current(),
            bootstrap: self.bootstrap.lock().ok().and_then(|k| *k),
        }
    }

    pub fn publish_writer(&self, writer: Option<mpsc::Sender<RawPacket>>) {
        if let Ok(mut slot) = self.writer.write() {
            *slot = writer;
        }
    }

    /// Writer of the active link
    pub fn writer(&self) -> Result<mpsc::Sender<RawPacket>> {
        self.writer
            .read()
            .ok()
            .and_then(|w| w.clone())
            .ok_or_else(|| ProtocolError::StateTransition(constants::ERR_NOT_ACTIVE.into()))
    }

    fn set_bootstrap(&self, key: Option<SymmetricKey>) {
        if let Ok(mut slot) = self.bootstrap.lock() {
            *slot = key;
        }
    }

    /// Forget the key of an abandoned key exchange
    pub(crate) fn clear_bootstrap(&self) {
        self.set_bootstrap(None);
    }

    fn outgoing(&self, command: &str, sequence_id: i32, session_id: Bytes, body: Bytes) -> Outgoing {
        Outgoing {
            command: command.to_string(),
            sequence_id,
            account: self.config.client.account.clone(),
            session_id,
            body,
        }
    }

    /// Wrap `body` under the current session key
    pub fn session_frame(&self, command: &str, sequence_id: i32, body: Bytes) -> Result<RawPacket> {
        let session = self
            .store
            .valid_session()
            .ok_or_else(|| ProtocolError::StateTransition(constants::ERR_NOT_ACTIVE.into()))?;
        let outgoing = self.outgoing(
            command,
            sequence_id,
            Bytes::copy_from_slice(&session.public_key),
            body,
        );
        envelope::wrap(&outgoing, &Seal::Session(&session.session_key), &self.options)
    }

    /// Send a session-sealed request on `writer` and wait for its answer
    pub async fn request_on(
        &self,
        writer: &mpsc::Sender<RawPacket>,
        command: &str,
        body: Bytes,
        policy: RetryPolicy,
    ) -> Result<IncomingPacket> {
        let sequence_id = self.next_sequence();
        let frame = self.session_frame(command, sequence_id, body)?;
        self.correlator
            .send_and_expect(frame, PacketKey::new(command, sequence_id), writer, policy)
            .await
    }

    /// Run the key exchange over a link that is not yet active
    #[instrument(skip(self, writer), fields(account = %self.config.client.account))]
    pub async fn key_exchange(&self, writer: &mpsc::Sender<RawPacket>) -> Result<()> {
        let (state, request) = client_exchange_init(&self.server_key)?;
        let sequence_id = self.next_sequence();
        let outgoing = self.outgoing(commands::KEY_EXCHANGE, sequence_id, Bytes::new(), request.to_bytes());
        let frame = envelope::wrap(
            &outgoing,
            &Seal::Bootstrap {
                public_key: state.public_key(),
                key: state.exchange_key(),
            },
            &self.options,
        )?;

        self.set_bootstrap(Some(*state.exchange_key()));
        let result = self
            .correlator
            .send_and_expect(
                frame,
                PacketKey::new(commands::KEY_EXCHANGE, sequence_id),
                writer,
                self.policy(),
            )
            .await;
        self.set_bootstrap(None);

        let payload = result?.into_payload()?;
        let response = ExchangeResponse::from_struct(payload.into_struct().map_err(|_| {
            ProtocolError::HandshakeError(constants::ERR_UNEXPECTED_EXCHANGE.into())
        })?)?;
        let material =
            client_exchange_finish(state, &response, self.config.session.default_session_ttl)?;

        self.store.override_session(Some(material), false).await?;
        if let Err(e) = self.store.save_to_cache().await {
            warn!(error = %e, "Failed to persist session");
        }
        self.metrics.handshake();
        debug!("Key exchange complete");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::transport::tcp::TcpConnector;

    fn context() -> EngineContext {
        EngineContext::new(
            EngineConfig::default(),
            Arc::new(SessionStore::memory("1")),
            PacketRegistry::new(),
            Arc::new(TcpConnector),
        )
        .unwrap()
    }

    #[test]
    fn test_sequence_is_monotonic_and_wraps() {
        let ctx = context();
        let a = ctx.next_sequence();
        assert_eq!(ctx.next_sequence(), a.wrapping_add(1));

        ctx.sequence.store(i32::MAX, Ordering::Relaxed);
        assert_eq!(ctx.next_sequence(), i32::MIN);
    }

    #[test]
    fn test_no_writer_until_active() {
        let ctx = context();
        assert!(matches!(ctx.writer(), Err(ProtocolError::StateTransition(_))));
        assert!(ctx.session_frame("X", 1, Bytes::new()).is_err());
    }
}

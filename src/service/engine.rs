//! # Engine
//!
//! The public face of the crate: submit requests, subscribe to unsolicited packets,
//! drive and observe the connection.
//!
//! ```no_run
//! use im_protocol_engine::{Engine, EngineConfig};
//! use im_protocol_engine::core::tars::{Struct, Value};
//!
//! # async fn run() -> im_protocol_engine::Result<()> {
//! let engine = Engine::builder(EngineConfig::default()).build().await?;
//! engine.resume_connection().await?;
//!
//! let request = Struct::new().with(0, Value::Int(42));
//! let response = engine.submit("Profile.Get", &request).await?;
//! println!("{:?}", response.result);
//!
//! engine.close("done").await;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::core::packet::{IncomingPacket, PacketKey, RawPacket};
use crate::core::tars::{self, Struct, Structured};
use crate::error::{ProtocolError, Result};
use crate::protocol::message::{commands, Payload};
use crate::protocol::registry::PacketRegistry;
use crate::service::context::EngineContext;
use crate::service::state::{ConnectionState, StateMachine, StateObserver};
use crate::transport::session_store::{default_servers, SessionStore};
use crate::transport::tcp::{Connector, TcpConnector};
use crate::utils::metrics::MetricsSnapshot;

/// Configures and creates an [`Engine`]
pub struct EngineBuilder {
    config: EngineConfig,
    connector: Option<Arc<dyn Connector>>,
    observers: Vec<Arc<dyn StateObserver>>,
    registry: Option<PacketRegistry>,
}

impl EngineBuilder {
    /// Transport used to reach servers; TCP when not set
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn StateObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Command decoders; the built-in commands are always present in [`PacketRegistry::new`]
    pub fn registry(mut self, registry: PacketRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validate the configuration, load cached state and start the background tasks.
    ///
    /// The engine starts `Idle`; call [`Engine::resume_connection`] to connect.
    pub async fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate_strict()?;

        let defaults = if config.session.servers.is_empty() {
            default_servers()
        } else {
            config.session.servers.clone()
        };
        let store = Arc::new(SessionStore::new(
            config.client.account.clone(),
            config.session.cache_dir.clone(),
            defaults,
        ));
        if store.load_from_cache().await {
            debug!("Using cached session");
        }
        store.load_server_list_from_cache().await;

        let ctx = Arc::new(EngineContext::new(
            config,
            store,
            self.registry.unwrap_or_default(),
            self.connector.unwrap_or_else(|| Arc::new(TcpConnector)),
        )?);
        let machine = StateMachine::new(ctx.clone(), self.observers);
        let push_task = tokio::spawn(handle_pushes(ctx.clone()));

        info!(account = %ctx.config.client.account, "Engine ready");
        Ok(Engine {
            ctx,
            machine,
            push_task,
        })
    }
}

/// A connected (or connectable) protocol client for one account
pub struct Engine {
    ctx: Arc<EngineContext>,
    machine: Arc<StateMachine>,
    push_task: JoinHandle<()>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("account", &self.ctx.config.client.account)
            .field("state", &self.machine.state())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            connector: None,
            observers: Vec::new(),
            registry: None,
        }
    }

    /// Writer of the active link; `ConnectionClosed` once the engine is shut down
    fn writer(&self) -> Result<mpsc::Sender<RawPacket>> {
        if self.machine.is_shut_down() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.ctx.writer()
    }

    /// Send a request and wait for the response with the same command and sequence id.
    ///
    /// # Errors
    /// - `ConnectionClosed` after [`close`](Self::close)
    /// - `StateTransition` when the connection is not active
    /// - `Timeout` after the configured attempts
    /// - `ConnectionClosed` if the link goes away first
    pub async fn submit(&self, command: &str, body: &Struct) -> Result<IncomingPacket> {
        self.submit_raw(command, tars::encode(body)).await
    }

    /// [`submit`](Self::submit) with an already encoded body
    #[instrument(skip(self, body), fields(len = body.len()))]
    pub async fn submit_raw(&self, command: &str, body: Bytes) -> Result<IncomingPacket> {
        let writer = self.writer()?;
        self.ctx
            .request_on(&writer, command, body, self.ctx.policy())
            .await
    }

    /// Typed request/response; an unregistered response command is decoded with `Resp`'s shape
    pub async fn submit_typed<Req, Resp>(&self, command: &str, request: &Req) -> Result<Resp>
    where
        Req: Structured,
        Resp: Structured,
    {
        let response = self.submit_raw(command, request.to_bytes()).await?;
        match response.into_payload()? {
            Payload::Unknown(body) => Resp::from_bytes(&body),
            payload => Resp::from_struct(payload.into_struct()?),
        }
    }

    /// Fire and forget
    pub async fn send_without_expect(&self, command: &str, body: &Struct) -> Result<()> {
        let writer = self.writer()?;
        let frame = self
            .ctx
            .session_frame(command, self.ctx.next_sequence(), tars::encode(body))?;
        self.ctx.correlator.send_without_expect(frame, &writer).await
    }

    /// Stream of unsolicited packets whose command satisfies `filter`.
    ///
    /// Packets arriving before the call are not replayed. A subscriber that falls
    /// behind skips the packets it missed.
    pub fn subscribe<F>(&self, filter: F) -> PacketStream
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        let stream = BroadcastStream::new(self.ctx.correlator.subscribe()).filter_map(move |item| {
            let item = match item {
                Ok(packet) if filter(&packet.command) => Some(packet),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Subscriber lagged, packets skipped");
                    None
                }
            };
            futures::future::ready(item)
        });
        PacketStream {
            inner: Box::pin(stream),
        }
    }

    /// Connect and handshake if needed; returns once the state is `Active`
    pub async fn resume_connection(&self) -> Result<()> {
        self.machine.resume_connection().await
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    /// Watch state changes; the receiver starts at the current state
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.machine.subscribe()
    }

    pub fn session_store(&self) -> &Arc<SessionStore> {
        &self.ctx.store
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    /// Shut down for good. Pending requests fail with `ConnectionClosed`.
    #[instrument(skip(self))]
    pub async fn close(&self, reason: &str) {
        info!(reason, "Closing engine");
        self.machine.close().await;
        self.push_task.abort();
        self.ctx.metrics.log_summary();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.push_task.abort();
        self.machine.abort();
    }
}

/// Unsolicited packets selected by [`Engine::subscribe`]
pub struct PacketStream {
    inner: Pin<Box<dyn Stream<Item = Arc<IncomingPacket>> + Send>>,
}

impl Stream for PacketStream {
    type Item = Arc<IncomingPacket>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Apply server-list pushes and acknowledge them
async fn handle_pushes(ctx: Arc<EngineContext>) {
    let mut events = BroadcastStream::new(ctx.correlator.subscribe());
    while let Some(event) = events.next().await {
        let Ok(packet) = event else {
            continue;
        };
        if packet.command != commands::SERVER_LIST_PUSH {
            continue;
        }
        let Ok(Payload::ServerList(push)) = &packet.result else {
            continue;
        };

        debug!(count = push.servers.len(), "Server list pushed");
        if let Err(e) = ctx.store.add_servers(push.servers.clone(), false).await {
            warn!(error = %e, "Failed to apply server list");
        }
        if let Err(e) = ctx.store.save_server_list_to_cache().await {
            warn!(error = %e, "Failed to persist server list");
        }
        if let Err(e) = acknowledge(&ctx, packet.key()).await {
            warn!(error = %e, "Failed to acknowledge server list push");
        }
    }
}

async fn acknowledge(ctx: &EngineContext, key: PacketKey) -> Result<()> {
    let writer = ctx.writer()?;
    let frame = ctx.session_frame(commands::SERVER_LIST_ACK, key.sequence_id, Bytes::new())?;
    ctx.correlator.send_without_expect(frame, &writer).await
}

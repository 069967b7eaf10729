//! # Connection State Machine
//!
//! Drives one engine's connection through `Idle → Connecting → Active → Closed`.
//!
//! ## Features
//! - **Single transition path**: every state change goes through [`StateMachine::transition`]
//!   under one async mutex; the old state's tasks are stopped before the new state is
//!   published
//! - **No half states**: a failure while connecting records `Closed(reason)`, so the next
//!   `resume_connection` starts clean
//! - **Observers**: notified of every change and of resume attempts; a panicking observer
//!   is logged and skipped
//! - **Link supervision**: transport loss and heartbeat failure close the state, with
//!   optional bounded reconnect
//!
//! `Closed(Shutdown)` is terminal; every other closed state can be resumed.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::commands;
use crate::service::connection::{Link, LinkLossCause, LinkLost};
use crate::service::context::EngineContext;
use crate::service::correlator::RetryPolicy;
use crate::utils::timeout::with_timeout_error;

/// Why the connection is closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called; terminal
    Shutdown,
    ConnectFailed(String),
    TransportLost(String),
    HeartbeatFailed(String),
    /// Building the next state failed
    StateTransition(String),
}

impl CloseReason {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CloseReason::Shutdown)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::ConnectFailed(e) => write!(f, "connect failed: {e}"),
            CloseReason::TransportLost(e) => write!(f, "transport lost: {e}"),
            CloseReason::HeartbeatFailed(e) => write!(f, "heartbeat failed: {e}"),
            CloseReason::StateTransition(e) => write!(f, "state transition failed: {e}"),
        }
    }
}

/// Public view of the connection state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Active,
    Closed(CloseReason),
}

impl ConnectionState {
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Active)
    }
}

/// Receives state machine notifications.
///
/// Calls happen on the task performing the transition; keep them short.
pub trait StateObserver: Send + Sync {
    fn state_changed(&self, _old: &ConnectionState, _new: &ConnectionState) {}

    /// Building a new state failed; the machine is moving to `Closed`
    fn exception_on_creating_state(&self, _error: &ProtocolError) {}

    fn before_resume(&self) {}

    fn after_resume(&self, _result: &Result<()>) {}
}

enum Internal {
    Idle,
    Connecting { link: Link },
    Active { link: Link, scope: CancellationToken, heartbeat: JoinHandle<()> },
    Closed(CloseReason),
}

impl Internal {
    fn public(&self) -> ConnectionState {
        match self {
            Internal::Idle => ConnectionState::Idle,
            Internal::Connecting { .. } => ConnectionState::Connecting,
            Internal::Active { .. } => ConnectionState::Active,
            Internal::Closed(reason) => ConnectionState::Closed(reason.clone()),
        }
    }

    fn link_id(&self) -> Option<u64> {
        match self {
            Internal::Connecting { link } | Internal::Active { link, .. } => Some(link.id),
            _ => None,
        }
    }

    /// Stop everything this state owns
    async fn teardown(self) {
        match self {
            Internal::Connecting { link } => link.shutdown().await,
            Internal::Active {
                link,
                scope,
                heartbeat,
            } => {
                scope.cancel();
                let _ = heartbeat.await;
                link.shutdown().await;
            }
            Internal::Idle | Internal::Closed(_) => {}
        }
    }
}

pub struct StateMachine {
    ctx: Arc<EngineContext>,
    inner: Mutex<Internal>,
    state_tx: watch::Sender<ConnectionState>,
    observers: Vec<Arc<dyn StateObserver>>,
    next_link_id: AtomicU64,
    /// Id of the link owned by the current state; 0 when none
    current_link: AtomicU64,
    lost_tx: mpsc::UnboundedSender<LinkLost>,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StateMachine {
    pub(crate) fn new(ctx: Arc<EngineContext>, observers: Vec<Arc<dyn StateObserver>>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let machine = Arc::new(Self {
            ctx,
            inner: Mutex::new(Internal::Idle),
            state_tx,
            observers,
            next_link_id: AtomicU64::new(1),
            current_link: AtomicU64::new(0),
            lost_tx,
            supervisor: std::sync::Mutex::new(None),
        });
        let handle = tokio::spawn(supervise(Arc::downgrade(&machine), lost_rx));
        if let Ok(mut slot) = machine.supervisor.lock() {
            *slot = Some(handle);
        }
        machine
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn notify<F>(&self, what: &str, f: F)
    where
        F: Fn(&dyn StateObserver),
    {
        for observer in &self.observers {
            if catch_unwind(AssertUnwindSafe(|| f(observer.as_ref()))).is_err() {
                error!(callback = what, "State observer panicked");
            }
        }
    }

    /// The one place state changes: stop the old state, publish the new one
    async fn transition(&self, inner: &mut Internal, next: Internal) {
        let old_public = self.state();
        let new_public = next.public();
        let old = std::mem::replace(inner, next);

        self.current_link
            .store(inner.link_id().unwrap_or(0), Ordering::SeqCst);
        if !matches!(inner, Internal::Active { .. }) {
            self.ctx.publish_writer(None);
        }
        old.teardown().await;
        self.publish(old_public, new_public);
    }

    fn publish(&self, old_public: ConnectionState, new_public: ConnectionState) {
        if old_public != new_public {
            debug!(from = ?old_public, to = ?new_public, "State changed");
            self.state_tx.send_replace(new_public.clone());
            self.notify("state_changed", |o| o.state_changed(&old_public, &new_public));
        }
    }

    /// Record a failure building the next state and close with `reason`
    async fn fail(&self, inner: &mut Internal, error: &ProtocolError, reason: CloseReason) {
        warn!(error = %error, reason = %reason, "State construction failed");
        self.notify("exception_on_creating_state", |o| o.exception_on_creating_state(error));
        self.transition(inner, Internal::Closed(reason)).await;
    }

    /// Bring the connection to `Active`; a no-op when already active.
    ///
    /// # Errors
    /// - `ConnectionClosed` after `close()`
    /// - the connect or handshake error otherwise; the state is then `Closed`
    #[instrument(skip(self))]
    pub async fn resume_connection(&self) -> Result<()> {
        let mut resume = ResumeGuard {
            machine: self,
            inner: self.inner.lock().await,
        };
        self.notify("before_resume", |o| o.before_resume());
        let result = self.resume_locked(&mut resume.inner).await;
        self.notify("after_resume", |o| o.after_resume(&result));
        result
    }

    async fn resume_locked(&self, inner: &mut Internal) -> Result<()> {
        match inner {
            Internal::Active { .. } => return Ok(()),
            Internal::Closed(reason) if reason.is_terminal() => {
                return Err(ProtocolError::ConnectionClosed)
            }
            // Left behind by a cancelled resume; replaced below
            Internal::Connecting { .. } | Internal::Idle | Internal::Closed(_) => {}
        }

        let link = match self.open_link().await {
            Ok(link) => link,
            Err(e) => {
                self.fail(inner, &e, CloseReason::ConnectFailed(e.to_string())).await;
                return Err(e);
            }
        };
        let writer = link.writer();
        self.transition(inner, Internal::Connecting { link }).await;

        if self.ctx.store.valid_session().is_none() {
            if let Err(e) = self.ctx.key_exchange(&writer).await {
                self.fail(inner, &e, CloseReason::StateTransition(e.to_string())).await;
                return Err(e);
            }
        }

        let link = match std::mem::replace(inner, Internal::Idle) {
            Internal::Connecting { link } => link,
            other => {
                // The link was lost while the handshake ran
                *inner = other;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let scope = link.token().child_token();
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.ctx.clone(),
            writer.clone(),
            scope.clone(),
            link.id,
            self.lost_tx.clone(),
        ));
        self.transition(
            inner,
            Internal::Active {
                link,
                scope,
                heartbeat,
            },
        )
        .await;
        self.ctx.publish_writer(Some(writer));
        info!(account = %self.ctx.config.client.account, "Connection active");
        Ok(())
    }

    /// Try servers in rank order; failed servers leave the list
    async fn open_link(&self) -> Result<Link> {
        let servers = self.ctx.store.servers().await;
        let timeout = self.ctx.config.client.connection_timeout;
        let mut last_error = None;

        for server in servers {
            match with_timeout_error(self.ctx.connector.connect(&server), timeout).await {
                Ok(stream) => {
                    self.ctx.metrics.connect();
                    let id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
                    debug!(server = %server, link = id, "Transport connected");
                    return Ok(Link::spawn(
                        id,
                        server,
                        stream,
                        self.ctx.clone(),
                        self.lost_tx.clone(),
                    ));
                }
                Err(e) => {
                    warn!(server = %server, error = %e, "Connect failed");
                    self.ctx.metrics.connect_failure();
                    self.ctx.store.remove_server(&server).await;
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| ProtocolError::StateTransition(constants::ERR_NO_SERVERS.into())))
    }

    /// Close for good: pending requests fail, tasks stop, resume is refused
    pub async fn close(&self) {
        self.ctx.correlator.cancel_all("shutdown");
        let mut inner = self.inner.lock().await;
        self.transition(&mut inner, Internal::Closed(CloseReason::Shutdown))
            .await;
        drop(inner);
        if let Some(handle) = self.supervisor.lock().ok().and_then(|mut s| s.take()) {
            handle.abort();
        }
    }

    async fn on_link_lost(&self, lost: LinkLost) -> bool {
        if self.current_link.load(Ordering::SeqCst) != lost.link_id {
            debug!(link = lost.link_id, "Ignoring loss of a retired link");
            return false;
        }
        // Unblocks a handshake waiting on this link before taking the lock
        self.ctx.correlator.cancel_all("link lost");

        let mut inner = self.inner.lock().await;
        if inner.link_id() != Some(lost.link_id) {
            return false;
        }
        let reason = match lost.cause {
            LinkLossCause::Transport(e) => CloseReason::TransportLost(e),
            LinkLossCause::Heartbeat(e) => CloseReason::HeartbeatFailed(e),
        };
        warn!(link = lost.link_id, reason = %reason, "Link lost");
        self.transition(&mut inner, Internal::Closed(reason)).await;
        true
    }

    async fn reconnect(&self) {
        let client = &self.ctx.config.client;
        for attempt in 1..=client.max_reconnect_attempts {
            tokio::time::sleep(client.reconnect_delay).await;
            match self.resume_connection().await {
                Ok(()) => {
                    info!(attempt, "Reconnected");
                    return;
                }
                Err(ProtocolError::ConnectionClosed) if self.is_shut_down() => return,
                Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed"),
            }
        }
        warn!("Giving up on reconnecting");
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        matches!(self.state(), ConnectionState::Closed(CloseReason::Shutdown))
    }

    /// Cancel the current link without waiting; used when the engine is dropped
    pub(crate) fn abort(&self) {
        if let Some(handle) = self.supervisor.lock().ok().and_then(|mut s| s.take()) {
            handle.abort();
        }
        if let Ok(inner) = self.inner.try_lock() {
            match &*inner {
                Internal::Connecting { link } => link.cancel(),
                Internal::Active { link, scope, .. } => {
                    scope.cancel();
                    link.cancel();
                }
                _ => {}
            }
        }
        self.ctx.correlator.cancel_all("engine dropped");
    }
}

/// Holds the state lock for one `resume_connection` call.
///
/// When the call is dropped mid-handshake the state would still be `Connecting`;
/// the guard closes it so the next resume starts clean.
struct ResumeGuard<'a> {
    machine: &'a StateMachine,
    inner: MutexGuard<'a, Internal>,
}

impl Drop for ResumeGuard<'_> {
    fn drop(&mut self) {
        if !matches!(*self.inner, Internal::Connecting { .. }) {
            return;
        }
        let machine = self.machine;
        let reason = CloseReason::StateTransition(constants::ERR_RESUME_CANCELLED.into());
        warn!(reason = %reason, "Resume dropped while connecting");

        let old = std::mem::replace(&mut *self.inner, Internal::Closed(reason.clone()));
        if let Internal::Connecting { link } = old {
            // Tasks stop on their own once cancelled
            link.cancel();
        }
        machine.current_link.store(0, Ordering::SeqCst);
        machine.ctx.publish_writer(None);
        machine.ctx.clear_bootstrap();
        machine.publish(ConnectionState::Connecting, ConnectionState::Closed(reason));
    }
}

async fn supervise(machine: Weak<StateMachine>, mut lost_rx: mpsc::UnboundedReceiver<LinkLost>) {
    while let Some(lost) = lost_rx.recv().await {
        let Some(machine) = machine.upgrade() else {
            return;
        };
        if machine.on_link_lost(lost).await && machine.ctx.config.client.auto_reconnect {
            machine.reconnect().await;
        }
    }
}

async fn heartbeat_loop(
    ctx: Arc<EngineContext>,
    writer: mpsc::Sender<crate::core::packet::RawPacket>,
    scope: CancellationToken,
    link_id: u64,
    lost: mpsc::UnboundedSender<LinkLost>,
) {
    let client = &ctx.config.client;
    let policy = RetryPolicy::new(client.heartbeat_timeout, 1);
    loop {
        tokio::select! {
            _ = scope.cancelled() => return,
            _ = tokio::time::sleep(client.heartbeat_interval) => {}
        }
        let result = tokio::select! {
            _ = scope.cancelled() => return,
            result = ctx.request_on(&writer, commands::HEARTBEAT, bytes::Bytes::new(), policy) => result,
        };
        match result {
            Ok(_) => debug!("Heartbeat acknowledged"),
            Err(e) => {
                if !scope.is_cancelled() {
                    let _ = lost.send(LinkLost {
                        link_id,
                        cause: LinkLossCause::Heartbeat(e.to_string()),
                    });
                }
                return;
            }
        }
    }
}

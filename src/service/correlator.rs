//! # Request/Response Correlator
//!
//! Matches incoming packets to the requests waiting for them by (command, sequence id).
//!
//! ## Features
//! - **Register before send**: the slot exists before the first byte leaves, so a fast
//!   response cannot be missed
//! - **Bounded retry**: each attempt retransmits the identical frame and waits for
//!   `timeout`; after `max_attempts` the caller gets `Timeout` with the earlier attempt
//!   errors attached
//! - **Exactly once**: a slot is removed when it completes, and the key is remembered for a
//!   while so a late duplicate (answer to an earlier transmission) is dropped
//! - **Event sink**: anything unmatched goes to a broadcast channel

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::core::packet::{IncomingPacket, PacketKey, RawPacket};
use crate::error::{ProtocolError, Result};
use crate::utils::metrics::Metrics;
use crate::utils::replay_cache::ReplayCache;

const COMPLETED_CAPACITY: usize = 4096;

/// Where frames go out
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn transmit(&self, frame: RawPacket) -> Result<()>;
}

#[async_trait]
impl Outbound for mpsc::Sender<RawPacket> {
    async fn transmit(&self, frame: RawPacket) -> Result<()> {
        self.send(frame)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}

/// Per-attempt wait and number of transmissions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(timeout: Duration, max_attempts: u32) -> Self {
        Self {
            timeout,
            max_attempts: max_attempts.max(1),
        }
    }
}

struct PendingRequest {
    slot: oneshot::Sender<Result<IncomingPacket>>,
    created_at: Instant,
}

/// What [`Correlator::dispatch`] did with a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// Completed a waiting request
    Completed,
    /// Answer to an already completed request, dropped
    Duplicate,
    /// Forwarded to subscribers
    Event,
    /// Unsolicited packet that failed to decode
    Dropped,
}

pub struct Correlator {
    pending: Mutex<HashMap<PacketKey, PendingRequest>>,
    completed: Mutex<ReplayCache<PacketKey>>,
    events: broadcast::Sender<Arc<IncomingPacket>>,
    metrics: Arc<Metrics>,
}

/// Removes the slot on every exit path of `send_and_expect`
struct SlotGuard<'a> {
    correlator: &'a Correlator,
    key: &'a PacketKey,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.correlator.pending.lock() {
            pending.remove(self.key);
        }
    }
}

impl Correlator {
    pub fn new(completed_ttl: Duration, event_capacity: usize, metrics: Arc<Metrics>) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            pending: Mutex::new(HashMap::new()),
            completed: Mutex::new(ReplayCache::with_settings(completed_ttl, COMPLETED_CAPACITY)),
            events,
            metrics,
        }
    }

    /// Receiver of unsolicited packets
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<IncomingPacket>> {
        self.events.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn register(&self, key: &PacketKey) -> Result<oneshot::Receiver<Result<IncomingPacket>>> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| ProtocolError::Custom("Pending request table poisoned".into()))?;
        if pending.contains_key(key) {
            return Err(ProtocolError::DuplicateRequest {
                command: key.command.clone(),
                sequence_id: key.sequence_id,
            });
        }
        let (slot, rx) = oneshot::channel();
        pending.insert(
            key.clone(),
            PendingRequest {
                slot,
                created_at: Instant::now(),
            },
        );
        Ok(rx)
    }

    /// Transmit `frame` and wait for the packet matching `key`, retrying per `policy`.
    ///
    /// # Errors
    /// - `DuplicateRequest` if `key` is already in flight
    /// - `Timeout` when every attempt expired
    /// - `ConnectionClosed` when the request was cancelled or the outbound queue is gone
    pub async fn send_and_expect(
        &self,
        frame: RawPacket,
        key: PacketKey,
        outbound: &dyn Outbound,
        policy: RetryPolicy,
    ) -> Result<IncomingPacket> {
        let mut rx = self.register(&key)?;
        let _guard = SlotGuard {
            correlator: self,
            key: &key,
        };
        self.metrics.request();

        let mut suppressed = Vec::new();
        for attempt in 1..=policy.max_attempts {
            if attempt > 1 {
                self.metrics.retry();
                debug!(%key, attempt, "Retransmitting request");
            }
            outbound.transmit(frame.clone()).await?;

            match tokio::time::timeout(policy.timeout, &mut rx).await {
                Ok(Ok(result)) => return result,
                Ok(Err(_)) => return Err(ProtocolError::ConnectionClosed),
                Err(_) => {
                    trace!(%key, attempt, "Attempt timed out");
                    if attempt < policy.max_attempts {
                        suppressed.push(ProtocolError::OperationTimeout);
                    }
                }
            }
        }

        self.metrics.timeout();
        warn!(%key, attempts = policy.max_attempts, "Request timed out");
        Err(ProtocolError::Timeout {
            command: key.command.clone(),
            sequence_id: key.sequence_id,
            attempts: policy.max_attempts,
            timeout: policy.timeout,
            suppressed,
        })
    }

    /// Transmit without registering a slot
    pub async fn send_without_expect(&self, frame: RawPacket, outbound: &dyn Outbound) -> Result<()> {
        outbound.transmit(frame).await
    }

    /// Route one decoded packet
    pub fn dispatch(&self, incoming: IncomingPacket) -> Dispatched {
        let key = incoming.key();
        let waiting = self.pending.lock().ok().and_then(|mut p| p.remove(&key));

        if let Some(request) = waiting {
            if let Ok(mut completed) = self.completed.lock() {
                completed.insert(key.clone());
            }
            trace!(%key, elapsed_ms = request.created_at.elapsed().as_millis() as u64, "Request completed");
            // The waiter may have given up between lookup and send
            let _ = request.slot.send(Ok(incoming));
            return Dispatched::Completed;
        }

        let seen = self
            .completed
            .lock()
            .map(|c| c.contains(&key))
            .unwrap_or(false);
        if seen {
            debug!(%key, "Late duplicate response dropped");
            return Dispatched::Duplicate;
        }

        if let Err(ref e) = incoming.result {
            warn!(%key, error = %e, "Dropping undecodable unsolicited packet");
            return Dispatched::Dropped;
        }

        // No subscribers is not an error
        let _ = self.events.send(Arc::new(incoming));
        Dispatched::Event
    }

    /// Forward a server-initiated packet without matching it against pending requests
    pub fn publish(&self, incoming: IncomingPacket) -> Dispatched {
        if let Err(ref e) = incoming.result {
            warn!(key = %incoming.key(), error = %e, "Dropping undecodable push");
            return Dispatched::Dropped;
        }
        let _ = self.events.send(Arc::new(incoming));
        Dispatched::Event
    }

    /// Fail every waiting request with `ConnectionClosed`
    pub fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().collect(),
            Err(_) => return 0,
        };
        let count = drained.len();
        for (_, request) in drained {
            let _ = request.slot.send(Err(ProtocolError::ConnectionClosed));
        }
        if count > 0 {
            debug!(count, reason, "Cancelled pending requests");
        }
        count
    }
}

//! Duplex channel over one WebSocket.
//!
//! A [`Channel`] is the broker's handle on a connected peer. It never
//! touches the socket directly: outbound frames go into a bounded queue
//! drained by the connection's writer task, so every method here is
//! non-blocking except [`Channel::call`] and [`Channel::ping`], which
//! wait for the peer.
//!
//! ```text
//! broker code ──send/call──▶ Channel ──Outbound──▶ writer task ──▶ socket
//!                              ▲
//! reader task ──resolve/mark_alive (responses, pongs)
//! ```
//!
//! Ordering is preserved per connection because the queue is FIFO and a
//! single writer drains it.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A failed `send` is logged and reported as `false`, never propagated
//! - Pending calls resolve with [`ChannelError::Closed`] when the channel closes

mod rate_limit;

pub use rate_limit::{RateLimiter, RateVerdict};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

use iob_core::ConnectionId;
use iob_protocol::{CloseReason, ErrorBody, ErrorCode, Frame, ProtocolError};

use crate::config::RateLimitConfig;

/// Source of per-socket serial numbers.
static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Which population a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Host,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Items drained by a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// One encoded [`Frame`].
    Text(String),
    /// Transport-level ping.
    Ping,
    /// Close the socket with this reason, then stop writing.
    Close(CloseReason),
}

/// Errors surfaced by channel delivery and calls.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    #[error("outbound queue full for connection {0}")]
    Backpressure(ConnectionId),

    #[error("call {call_id} to {connection_id} timed out after {timeout:?}")]
    Timeout {
        connection_id: ConnectionId,
        call_id: u64,
        timeout: Duration,
    },

    #[error("peer answered {code}: {message}")]
    Remote { code: ErrorCode, message: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

type CallReply = Result<serde_json::Value, ErrorBody>;

/// Handle on one connected peer.
pub struct Channel {
    id: ConnectionId,
    role: Role,
    /// Distinguishes this socket from a later one reusing the same id.
    serial: u64,
    outbound: mpsc::Sender<Outbound>,
    pending: Mutex<HashMap<u64, oneshot::Sender<CallReply>>>,
    next_call_id: AtomicU64,
    inbound_counts: Mutex<HashMap<String, u64>>,
    limiter: Mutex<RateLimiter>,
    last_alive: Mutex<Instant>,
    pong: Notify,
    closed: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
    dropped: AtomicU64,
}

impl Channel {
    /// Creates a channel and the receiving end of its outbound queue.
    pub fn new(
        id: ConnectionId,
        role: Role,
        limits: RateLimitConfig,
        buffer: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let channel = Self {
            id,
            role,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            outbound: tx,
            pending: Mutex::new(HashMap::new()),
            next_call_id: AtomicU64::new(1),
            inbound_counts: Mutex::new(HashMap::new()),
            limiter: Mutex::new(RateLimiter::new(limits)),
            last_alive: Mutex::new(Instant::now()),
            pong: Notify::new(),
            closed: CancellationToken::new(),
            close_reason: Mutex::new(None),
            dropped: AtomicU64::new(0),
        };
        (Arc::new(channel), rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Fire-and-forget delivery of a typed payload.
    ///
    /// Returns `false` if the message could not be queued. The failure is
    /// logged here; callers must not treat it as an error of their own.
    pub fn send<T: Serialize>(&self, payload: &T) -> bool {
        let result = Frame::send(payload)
            .map_err(ChannelError::from)
            .and_then(|frame| self.push_frame(&frame));

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    connection_id = %self.id,
                    role = %self.role,
                    error = %e,
                    "Dropped outbound message"
                );
                false
            }
        }
    }

    /// Sends a call and waits for the peer's response.
    pub async fn call<T: Serialize>(
        &self,
        payload: &T,
        timeout: Duration,
    ) -> Result<serde_json::Value, ChannelError> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::call(call_id, payload)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(call_id, tx);

        if let Err(e) = self.push_frame(&frame) {
            self.pending.lock().remove(&call_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(body))) => Err(ChannelError::Remote {
                code: body.code,
                message: body.message,
            }),
            Ok(Err(_)) => Err(ChannelError::Closed(self.id.clone())),
            Err(_) => {
                self.pending.lock().remove(&call_id);
                Err(ChannelError::Timeout {
                    connection_id: self.id.clone(),
                    call_id,
                    timeout,
                })
            }
        }
    }

    /// Answers a call the peer made.
    pub fn reply(&self, call_id: u64, result: CallReply) -> bool {
        let frame = match result {
            Ok(value) => Frame::ok(call_id, value),
            Err(body) => Frame::err(call_id, body.code, body.message),
        };

        match self.push_frame(&frame) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    connection_id = %self.id,
                    call_id,
                    error = %e,
                    "Failed to queue response"
                );
                false
            }
        }
    }

    fn push_frame(&self, frame: &Frame) -> Result<(), ChannelError> {
        let text = frame.encode()?;
        self.enqueue(Outbound::Text(text))
    }

    fn enqueue(&self, item: Outbound) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed(self.id.clone()));
        }

        self.outbound.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                ChannelError::Backpressure(self.id.clone())
            }
            mpsc::error::TrySendError::Closed(_) => ChannelError::Closed(self.id.clone()),
        })
    }

    /// Messages dropped because the outbound queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Completes a pending call with the peer's response.
    ///
    /// Returns `false` if no call with this id is waiting (late or bogus
    /// response).
    pub fn resolve(
        &self,
        call_id: u64,
        result: Option<serde_json::Value>,
        error: Option<ErrorBody>,
    ) -> bool {
        let Some(tx) = self.pending.lock().remove(&call_id) else {
            debug!(connection_id = %self.id, call_id, "Response for unknown call");
            return false;
        };

        let reply = match error {
            Some(body) => Err(body),
            None => Ok(result.unwrap_or(serde_json::Value::Null)),
        };
        tx.send(reply).is_ok()
    }

    /// Counts an unprompted inbound message and checks the rate limit.
    pub fn record_inbound(&self, method: &str) -> RateVerdict {
        *self
            .inbound_counts
            .lock()
            .entry(method.to_string())
            .or_insert(0) += 1;
        self.limiter.lock().record()
    }

    /// Closes the current rate window. Called once per second.
    pub fn tick_rate_window(&self) -> RateVerdict {
        self.limiter.lock().tick()
    }

    /// Inbound messages seen so far for one method.
    pub fn inbound_count(&self, method: &str) -> u64 {
        self.inbound_counts.lock().get(method).copied().unwrap_or(0)
    }

    /// Snapshot of inbound counts per method.
    pub fn inbound_counts(&self) -> HashMap<String, u64> {
        self.inbound_counts.lock().clone()
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    /// Records proof of life (a pong or any inbound traffic).
    pub fn mark_alive(&self) {
        *self.last_alive.lock() = Instant::now();
        self.pong.notify_waiters();
    }

    /// Time since the peer last proved it was alive.
    pub fn since_alive(&self) -> Duration {
        self.last_alive.lock().elapsed()
    }

    /// Pings the peer and waits up to `timeout` for any sign of life.
    pub async fn ping(&self, timeout: Duration) -> bool {
        // Register interest before the ping leaves so a fast pong is seen.
        let pong = self.pong.notified();

        if let Err(e) = self.enqueue(Outbound::Ping) {
            debug!(connection_id = %self.id, error = %e, "Ping not sent");
            return false;
        }

        tokio::time::timeout(timeout, pong).await.is_ok()
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Closes the connection. Only the first reason is kept.
    ///
    /// Returns `false` if the channel was already closed.
    pub fn close(&self, reason: CloseReason) -> bool {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason.clone());
        }

        info!(
            connection_id = %self.id,
            role = %self.role,
            reason = %reason,
            "Closing connection"
        );

        // The writer also stops on cancellation, so a full queue is fine.
        let _ = self.outbound.try_send(Outbound::Close(reason));
        self.pending.lock().clear();
        self.closed.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Completes once the channel is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("serial", &self.serial)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iob_protocol::{ClientEvent, HostRequest, TransactionRef};
    use iob_core::TransactionId;
    use serde_json::json;

    fn limits() -> RateLimitConfig {
        RateLimitConfig {
            max_per_second: 3,
            alert_threshold: 1,
            history_size: 10,
            history_alert_limit: 5,
        }
    }

    fn channel(buffer: usize) -> (Arc<Channel>, mpsc::Receiver<Outbound>) {
        Channel::new(ConnectionId::new("conn-1"), Role::Client, limits(), buffer)
    }

    fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> Frame {
        match rx.try_recv().unwrap() {
            Outbound::Text(text) => Frame::decode(&text).unwrap(),
            other => panic!("Expected text frame, got {other:?}"),
        }
    }

    fn usurped() -> ClientEvent {
        ClientEvent::ClientUsurped(TransactionRef {
            transaction_id: TransactionId::new("tx-1"),
        })
    }

    #[test]
    fn test_serials_are_unique() {
        let (a, _rx_a) = channel(4);
        let (b, _rx_b) = channel(4);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.serial(), b.serial());
    }

    #[tokio::test]
    async fn test_send_preserves_order() {
        let (ch, mut rx) = channel(8);
        assert!(ch.send(&usurped()));
        assert!(ch.send(&HostRequest::BeginHostShutdown));

        assert_eq!(next_frame(&mut rx).method(), Some("CLIENT_USURPED"));
        assert_eq!(next_frame(&mut rx).method(), Some("BEGIN_HOST_SHUTDOWN"));
    }

    #[tokio::test]
    async fn test_send_to_full_queue_is_swallowed() {
        let (ch, _rx) = channel(1);
        assert!(ch.send(&usurped()));
        assert!(!ch.send(&usurped()));
        assert_eq!(ch.dropped_count(), 1);
    }

    #[tokio::test]
    async fn test_send_after_close_is_swallowed() {
        let (ch, _rx) = channel(4);
        ch.close(CloseReason::Normal);
        assert!(!ch.send(&usurped()));
    }

    #[tokio::test]
    async fn test_call_resolves_with_response() {
        let (ch, mut rx) = channel(4);
        let caller = Arc::clone(&ch);
        let call = tokio::spawn(async move {
            caller
                .call(&HostRequest::BeginHostShutdown, Duration::from_secs(5))
                .await
        });

        let frame = loop {
            if let Some(Outbound::Text(text)) = rx.recv().await {
                break Frame::decode(&text).unwrap();
            }
        };
        let Frame::Call { id, .. } = frame else {
            panic!("Expected call frame");
        };
        assert!(ch.resolve(id, Some(json!({"ok": true})), None));

        let value = call.await.unwrap().unwrap();
        assert_eq!(value["ok"], true);
    }

    #[tokio::test]
    async fn test_call_surfaces_remote_error() {
        let (ch, mut rx) = channel(4);
        let caller = Arc::clone(&ch);
        let call = tokio::spawn(async move {
            caller
                .call(&HostRequest::BeginHostShutdown, Duration::from_secs(5))
                .await
        });

        let Some(Outbound::Text(text)) = rx.recv().await else {
            panic!("Expected text frame");
        };
        let Frame::Call { id, .. } = Frame::decode(&text).unwrap() else {
            panic!("Expected call frame");
        };
        ch.resolve(
            id,
            None,
            Some(ErrorBody {
                code: ErrorCode::NotFound,
                message: "no such page".to_string(),
            }),
        );

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, ChannelError::Remote { code: ErrorCode::NotFound, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out() {
        let (ch, _rx) = channel(4);
        let err = ch
            .call(&HostRequest::BeginHostShutdown, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout { .. }));
        assert!(ch.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_close_fails_pending_calls() {
        let (ch, _rx) = channel(4);
        let caller = Arc::clone(&ch);
        let call = tokio::spawn(async move {
            caller
                .call(&HostRequest::BeginHostShutdown, Duration::from_secs(30))
                .await
        });

        tokio::task::yield_now().await;
        while ch.pending.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        ch.close(CloseReason::ServiceRestart);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, ChannelError::Closed(_)));
    }

    #[tokio::test]
    async fn test_close_keeps_first_reason() {
        let (ch, mut rx) = channel(4);
        assert!(ch.close(CloseReason::superseded()));
        assert!(!ch.close(CloseReason::Normal));
        assert!(ch.is_closed());
        assert_eq!(ch.close_reason(), Some(CloseReason::superseded()));
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Close(CloseReason::superseded())
        );
    }

    #[test]
    fn test_resolve_unknown_call() {
        let (ch, _rx) = channel(4);
        assert!(!ch.resolve(99, None, None));
    }

    #[test]
    fn test_inbound_counts_and_rate_limit() {
        let (ch, _rx) = channel(4);
        for _ in 0..3 {
            assert!(ch.record_inbound("SEND_LOG").is_allowed());
        }
        assert_eq!(ch.inbound_count("SEND_LOG"), 3);
        assert!(!ch.record_inbound("SEND_IO_CALL").is_allowed());
        assert_eq!(ch.inbound_counts().len(), 2);

        assert!(ch.tick_rate_window().is_allowed());
        assert!(ch.record_inbound("SEND_LOG").is_allowed());
    }

    #[tokio::test]
    async fn test_ping_answered_by_mark_alive() {
        let (ch, mut rx) = channel(4);
        let pinger = Arc::clone(&ch);
        let ping = tokio::spawn(async move { pinger.ping(Duration::from_secs(5)).await });

        assert_eq!(rx.recv().await, Some(Outbound::Ping));
        ch.mark_alive();
        assert!(ping.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_times_out() {
        let (ch, _rx) = channel(4);
        assert!(!ch.ping(Duration::from_secs(5)).await);
    }
}

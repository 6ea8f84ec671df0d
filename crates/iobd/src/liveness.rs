//! Liveness monitoring for connections and host instances.
//!
//! Two independent mechanisms:
//!
//! - a heartbeat task per connection that pings the peer every
//!   `heartbeat_interval` and closes it once it has been silent for too
//!   long (`client_unreachable` for clients, `host_stale` for hosts,
//!   measured against the persisted instance)
//! - a process-wide sweep over persisted host instances, independent of
//!   any socket, that marks untouched instances unreachable and deletes
//!   long-dead ones
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Store failures are logged and the affected step is skipped

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use iob_core::{ConnectionId, HostInstanceStatus, Store, StoreResult};
use iob_protocol::CloseReason;

use crate::channel::{Channel, Role};
use crate::config::LivenessConfig;

/// Converts a seconds setting into a chrono window, saturating.
pub(crate) fn window(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

// ============================================================================
// Per-connection heartbeat
// ============================================================================

/// Result of one heartbeat round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// The peer answered.
    Alive,
    /// No answer, but not silent long enough to close.
    Missed,
    /// The channel is closed, now or already.
    Closed,
}

/// Pings `channel` once and applies the outcome.
pub async fn heartbeat_once(
    channel: &Channel,
    store: &dyn Store,
    config: &LivenessConfig,
) -> HeartbeatOutcome {
    if channel.is_closed() {
        return HeartbeatOutcome::Closed;
    }

    if channel.ping(config.ping_timeout()).await {
        if channel.role() == Role::Host {
            refresh_host_instance(store, channel.id(), Utc::now()).await;
        }
        return HeartbeatOutcome::Alive;
    }

    if channel.is_closed() {
        return HeartbeatOutcome::Closed;
    }

    let give_up = match channel.role() {
        Role::Client => channel.since_alive() > config.client_unreachable(),
        Role::Host => match store.host_instance(channel.id()).await {
            Ok(Some(instance)) => {
                instance.untouched_for(window(config.host_stale_secs), Utc::now())
            }
            Ok(None) => true,
            Err(e) => {
                warn!(connection_id = %channel.id(), error = %e, "Host instance lookup failed");
                false
            }
        },
    };

    if give_up {
        warn!(
            connection_id = %channel.id(),
            role = %channel.role(),
            silent_secs = channel.since_alive().as_secs(),
            "Peer unresponsive, closing"
        );
        channel.close(CloseReason::unresponsive());
        return HeartbeatOutcome::Closed;
    }

    debug!(connection_id = %channel.id(), role = %channel.role(), "Heartbeat missed");
    HeartbeatOutcome::Missed
}

/// Marks a live host's instance as touched, and ONLINE unless it is
/// shutting down.
async fn refresh_host_instance(store: &dyn Store, id: &ConnectionId, now: DateTime<Utc>) {
    let instance = match store.host_instance(id).await {
        Ok(Some(instance)) => instance,
        Ok(None) => {
            debug!(connection_id = %id, "Heartbeat for host without instance record");
            return;
        }
        Err(e) => {
            warn!(connection_id = %id, error = %e, "Host instance lookup failed");
            return;
        }
    };

    let result = match instance.status {
        HostInstanceStatus::Online | HostInstanceStatus::ShuttingDown => {
            store.touch_host_instance(id, now).await
        }
        HostInstanceStatus::Unreachable | HostInstanceStatus::Offline => {
            info!(connection_id = %id, from = ?instance.status, "Host instance back online");
            store.set_host_status(id, HostInstanceStatus::Online).await
        }
    };

    if let Err(e) = result {
        warn!(connection_id = %id, error = %e, "Failed to refresh host instance");
    }
}

/// Spawns the heartbeat task for one connection.
///
/// The task exits when the channel closes.
pub fn spawn_heartbeat(
    channel: Arc<Channel>,
    store: Arc<dyn Store>,
    config: LivenessConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = config.heartbeat_interval();
        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = channel.closed() => break,

                _ = tick.tick() => {
                    if heartbeat_once(&channel, store.as_ref(), &config).await
                        == HeartbeatOutcome::Closed
                    {
                        break;
                    }
                }
            }
        }

        debug!(connection_id = %channel.id(), "Heartbeat task stopped");
    })
}

// ============================================================================
// Host instance sweep
// ============================================================================

/// What one sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub marked_unreachable: Vec<ConnectionId>,
    pub deleted: Vec<ConnectionId>,
}

/// Marks instances untouched for `host_unreachable_secs` as UNREACHABLE
/// and deletes UNREACHABLE/OFFLINE ones untouched for
/// `instance_retention_secs`.
pub async fn sweep_host_instances(
    store: &dyn Store,
    config: &LivenessConfig,
    now: DateTime<Utc>,
) -> StoreResult<SweepReport> {
    let unreachable_after = window(config.host_unreachable_secs);
    let retention = window(config.instance_retention_secs);
    let mut report = SweepReport::default();

    for instance in store.host_instances().await? {
        match instance.status {
            HostInstanceStatus::Online | HostInstanceStatus::ShuttingDown => {
                if instance.untouched_for(unreachable_after, now) {
                    store
                        .set_host_status(&instance.id, HostInstanceStatus::Unreachable)
                        .await?;
                    report.marked_unreachable.push(instance.id);
                }
            }
            HostInstanceStatus::Unreachable | HostInstanceStatus::Offline => {
                if instance.untouched_for(retention, now)
                    && store.delete_host_instance(&instance.id).await?
                {
                    report.deleted.push(instance.id);
                }
            }
        }
    }

    Ok(report)
}

/// Spawns the periodic host-instance sweep.
pub fn spawn_instance_sweeper(
    store: Arc<dyn Store>,
    config: LivenessConfig,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = config.sweep_interval();
        let mut tick = interval_at(Instant::now() + period, period);

        info!(interval_secs = period.as_secs(), "Host instance sweeper started");

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => break,

                _ = tick.tick() => {
                    match sweep_host_instances(store.as_ref(), &config, Utc::now()).await {
                        Ok(report) if report != SweepReport::default() => info!(
                            marked_unreachable = report.marked_unreachable.len(),
                            deleted = report.deleted.len(),
                            "Host instance sweep"
                        ),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Host instance sweep failed"),
                    }
                }
            }
        }

        debug!("Host instance sweeper stopped");
    })
}

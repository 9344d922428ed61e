//! Reconciliation engine timing constants.

use std::time::Duration;

/// Periodic reconcile tick. Guarantees drift recovery even when an event
/// is lost; must stay at or below 5s.
pub const RECONCILE_TICK: Duration = Duration::from_secs(3);

/// First retry delay after a failed reconcile.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Upper bound for the exponential retry delay.
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// How long in-flight reconciles may finish after shutdown is signalled.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Capacity of each per-kind watch broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Worker tasks per controller.
pub const WORKERS_PER_CONTROLLER: usize = 4;

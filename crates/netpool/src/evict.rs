//! Background eviction sweep.
//!
//! One task per destination pool. The task holds only a weak reference, so a
//! pool that has been dropped stops its own sweep; shutdown stops it through
//! the pool's cancellation token.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

use crate::lifecycle::Transport;
use crate::pool::Pool;

/// Start the sweep for `pool`, running every `interval`.
pub(crate) fn spawn_sweeper<T: Transport>(pool: &Arc<Pool<T>>, interval: Duration) {
    let weak = Arc::downgrade(pool);
    let cancelled = pool.eviction_token().clone();
    let name = pool.config().name().to_owned();
    let destination = pool.key().clone();

    pool.runtime().spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancelled.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(pool) = weak.upgrade() else { break };
                    pool.evict_expired();
                }
            }
        }

        tracing::trace!(pool = %name, destination = %destination, "eviction sweep stopped");
    });
}

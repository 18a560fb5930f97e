//! Monitor task: keep-alive and idle detection on a fixed tick.

use crate::connection::engine::Shared;
use crate::connection::event::ConnectionEvent;
use crate::connection::state::CloseCause;
use crate::error::constants;
use crate::utils::timeout::MONITOR_TICK;
use std::sync::Arc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Sliding window of the idle check
struct IdleWindow {
    since: Instant,
    bytes: u64,
}

pub(crate) async fn run_monitor(shared: Arc<Shared>) {
    let params = &shared.params;
    let alive_period = params.alive_period;
    let alive_timeout = params.alive_timeout();
    let idle_threshold = params.idle_threshold;
    let idle_period = params.idle_check_period;

    let start = Instant::now();
    let mut next_alive = (!alive_period.is_zero()).then(|| start + alive_period);
    let mut next_idle_check = (idle_threshold > 0).then(|| start + idle_period);
    let mut window = IdleWindow {
        since: start,
        bytes: shared.metrics.total_bytes(),
    };

    let mut tick = interval(MONITOR_TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        let now = Instant::now();

        if let Some(due) = next_alive {
            if now >= due {
                shared.send_alive(now);
                next_alive = Some(now + alive_period);
            }
            let pending = shared.lock_core().alive_pending;
            if let Some(sent) = pending {
                if now.duration_since(sent) > alive_timeout {
                    shared.terminate(
                        CloseCause::AliveTimeout,
                        Some(constants::ERR_ALIVE_TIMEOUT.into()),
                    );
                    break;
                }
            }
        }

        if let Some(due) = next_idle_check {
            if now >= due {
                check_idle(&shared, &mut window, idle_threshold, now);
                next_idle_check = Some(now + idle_period);
            }
        }
    }

    trace!(conn = %shared.short_id, "Monitor stopped");
}

/// Compare the traffic since the last check against the threshold
///
/// Only transitions are reported: the connection starts busy, and an
/// `Idle(true)` is followed by `Idle(false)` only once traffic recovers.
fn check_idle(shared: &Shared, window: &mut IdleWindow, threshold: u64, now: Instant) {
    let total = shared.metrics.total_bytes();
    let elapsed = now.duration_since(window.since).as_secs_f64().max(0.001);
    let moved = total.saturating_sub(window.bytes);
    let per_minute = moved as f64 * 60.0 / elapsed;
    *window = IdleWindow {
        since: now,
        bytes: total,
    };

    let idle = per_minute < threshold as f64;
    let changed = {
        let mut core = shared.lock_core();
        let changed = core.idle != idle;
        core.idle = idle;
        changed
    };
    if changed {
        debug!(conn = %shared.short_id, idle, bytes_per_minute = per_minute as u64, "Idle state changed");
        shared.emit(ConnectionEvent::Idle(idle));
    }
}

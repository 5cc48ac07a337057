//! Dispatch counters
//!
//! Updated from every callback thread, read once at shutdown.

use std::sync::atomic::{AtomicU64, Ordering};

use log::info;

#[derive(Debug, Default)]
pub struct DispatchStats {
    dispatched: AtomicU64,
    handled: AtomicU64,
    defaulted: AtomicU64,
    violations: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct StatsSnapshot {
    pub dispatched: u64,
    pub handled: u64,
    pub defaulted: u64,
    pub violations: u64,
}

impl DispatchStats {
    pub fn record_dispatch(&self, handled: bool) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        if handled {
            self.handled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.defaulted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_violation(&self) {
        self.violations.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            defaulted: self.defaulted.load(Ordering::Relaxed),
            violations: self.violations.load(Ordering::Relaxed),
        }
    }
}

/// Display dispatch statistics
#[allow(clippy::cast_precision_loss)]
pub fn display_statistics(stats: &StatsSnapshot) {
    info!("Dispatch statistics:");
    info!("  Events dispatched: {}", stats.dispatched);
    if stats.dispatched > 0 {
        info!(
            "  Handled: {} ({:.1}%), defaulted: {}",
            stats.handled,
            stats.handled as f64 / stats.dispatched as f64 * 100.0,
            stats.defaulted
        );
    }
    if stats.violations > 0 {
        info!("  Ordering violations: {}", stats.violations);
    }
}

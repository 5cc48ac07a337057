//! Per-session aggregates: exceptions by type, allocations by class and
//! runtime pauses.
//!
//! Everything is keyed by display name, so an unresolved name collapses into
//! [`UNRESOLVED`]. The sink writes a summary at shutdown.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

/// Bucket for subjects whose name could not be resolved
pub const UNRESOLVED: &str = "<unresolved>";

#[derive(Debug, Default)]
pub struct SessionAnalysis {
    exceptions: DashMap<String, u64>,
    allocations: DashMap<String, u64>,
    suspended_at: Mutex<Option<Instant>>,
    pauses: Mutex<Vec<Duration>>,
}

/// Runtime pauses, suspend start to resume start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PauseSummary {
    pub count: usize,
    pub total: Duration,
    pub longest: Duration,
}

/// Point-in-time copy of [`SessionAnalysis`], busiest names first
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct AnalysisSnapshot {
    pub exceptions: Vec<(String, u64)>,
    pub allocations: Vec<(String, u64)>,
    pub pauses: PauseSummary,
}

impl AnalysisSnapshot {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exceptions.is_empty() && self.allocations.is_empty() && self.pauses.count == 0
    }
}

fn bucket(name: &str) -> String {
    if name.is_empty() {
        UNRESOLVED.to_string()
    } else {
        name.to_string()
    }
}

fn ranked(counts: &DashMap<String, u64>) -> Vec<(String, u64)> {
    let mut ranked: Vec<(String, u64)> =
        counts.iter().map(|entry| (entry.key().clone(), *entry.value())).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

impl SessionAnalysis {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_exception(&self, type_name: &str) {
        *self.exceptions.entry(bucket(type_name)).or_insert(0) += 1;
    }

    pub fn record_allocations(&self, class_name: &str, objects: u64) {
        if objects > 0 {
            *self.allocations.entry(bucket(class_name)).or_insert(0) += objects;
        }
    }

    pub fn suspend_started(&self) {
        *self.suspended_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    pub fn suspend_aborted(&self) {
        self.suspended_at.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Close the pause opened by the last suspend, if any
    pub fn resume_started(&self) -> Option<Duration> {
        let started = self.suspended_at.lock().unwrap_or_else(PoisonError::into_inner).take()?;
        let pause = started.elapsed();
        self.pauses.lock().unwrap_or_else(PoisonError::into_inner).push(pause);
        Some(pause)
    }

    #[must_use]
    pub fn snapshot(&self) -> AnalysisSnapshot {
        let pauses = self.pauses.lock().unwrap_or_else(PoisonError::into_inner);
        AnalysisSnapshot {
            exceptions: ranked(&self.exceptions),
            allocations: ranked(&self.allocations),
            pauses: PauseSummary {
                count: pauses.len(),
                total: pauses.iter().sum(),
                longest: pauses.iter().max().copied().unwrap_or_default(),
            },
        }
    }

    /// Summary lines, empty when nothing was recorded
    #[must_use]
    pub fn summary(&self) -> Vec<String> {
        let snapshot = self.snapshot();
        let mut lines = Vec::new();

        let mut section = |title: &str, counts: &[(String, u64)]| {
            if counts.is_empty() {
                return;
            }
            let total: u64 = counts.iter().map(|(_, n)| n).sum();
            lines.push(format!("{title}: {total} across {} types", counts.len()));
            lines.extend(counts.iter().map(|(name, n)| format!("  {n} {name}")));
        };
        section("Exceptions thrown", snapshot.exceptions.as_slice());
        section("Objects allocated", snapshot.allocations.as_slice());

        let pauses = snapshot.pauses;
        if pauses.count > 0 {
            lines.push(format!(
                "Runtime pauses: {}, total {}ms, longest {}ms",
                pauses.count,
                pauses.total.as_millis(),
                pauses.longest.as_millis()
            ));
        }
        lines
    }

    pub fn clear(&self) {
        self.exceptions.clear();
        self.allocations.clear();
        self.suspend_aborted();
        self.pauses.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

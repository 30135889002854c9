//! Off-heap memory pressure accounting.
//!
//! Native allocations are invisible to whatever allocator the host runs.
//! A [`PressureSink`] is told how many foreign bytes each owning handle is
//! responsible for, so a host with a collector (or just a dashboard) can
//! scale its cadence with total process memory rather than Rust-side
//! memory alone. The hint is advisory: a missing notification costs
//! performance, never correctness, and notifying can never fail.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Receiver of off-heap allocation hints.
pub trait PressureSink: Send + Sync {
    /// `bytes` of foreign memory became attributable to a live handle.
    fn add(&self, bytes: usize);

    /// `bytes` previously added were released.
    fn remove(&self, bytes: usize);
}

/// Process-wide counter of outstanding foreign bytes.
///
/// Logs a hint at `debug` level whenever the outstanding total crosses the
/// configured threshold upwards.
pub struct MemoryPressure {
    outstanding: AtomicUsize,
    peak: AtomicUsize,
    notifications: AtomicUsize,
    log_threshold: AtomicUsize,
}

impl MemoryPressure {
    /// Create a counter that logs when `log_threshold` bytes are outstanding.
    pub const fn new(log_threshold: usize) -> Self {
        Self {
            outstanding: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            notifications: AtomicUsize::new(0),
            log_threshold: AtomicUsize::new(log_threshold),
        }
    }

    /// Outstanding total at which a hint is logged.
    pub fn log_threshold(&self) -> usize {
        self.log_threshold.load(Ordering::Relaxed)
    }

    /// Move the log threshold. Applies from the next `add`.
    pub fn set_log_threshold(&self, bytes: usize) {
        self.log_threshold.store(bytes, Ordering::Relaxed);
    }

    /// Foreign bytes currently attributed to live handles.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Highest outstanding total observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Number of `add` notifications received.
    pub fn notifications(&self) -> usize {
        self.notifications.load(Ordering::Relaxed)
    }
}

impl PressureSink for MemoryPressure {
    fn add(&self, bytes: usize) {
        let before = self.outstanding.fetch_add(bytes, Ordering::Relaxed);
        let now = before.saturating_add(bytes);
        self.peak.fetch_max(now, Ordering::Relaxed);
        self.notifications.fetch_add(1, Ordering::Relaxed);
        let threshold = self.log_threshold();
        if before < threshold && now >= threshold {
            log::debug!("foreign memory pressure crossed {threshold} bytes ({now} outstanding)");
        }
    }

    fn remove(&self, bytes: usize) {
        // Saturate rather than wrap: an unmatched remove is a caller bug,
        // not something that may take the counter down with it.
        let _ = self
            .outstanding
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                Some(cur.saturating_sub(bytes))
            });
    }
}

impl fmt::Debug for MemoryPressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPressure")
            .field("outstanding", &self.outstanding())
            .field("peak", &self.peak())
            .field("notifications", &self.notifications())
            .field("log_threshold", &self.log_threshold())
            .finish()
    }
}

static GLOBAL: OnceLock<Arc<MemoryPressure>> = OnceLock::new();

/// The process-wide pressure counter used when no sink is supplied.
///
/// Starts at the default threshold. Owning handles built without a sink
/// move it to their config's `pressure_log_threshold`, so the most recent
/// acquisition's setting is the one in force.
pub fn global() -> Arc<MemoryPressure> {
    GLOBAL
        .get_or_init(|| {
            Arc::new(MemoryPressure::new(
                crate::config::InteropConfig::DEFAULT_PRESSURE_LOG_THRESHOLD,
            ))
        })
        .clone()
}

/// Tell the process-wide counter about `byte_size` foreign bytes.
pub fn notify(byte_size: usize) {
    global().add(byte_size);
}

/// One handle's outstanding contribution to a sink, withdrawn on disposal.
pub(crate) struct PressureTicket {
    bytes: usize,
    sink: Arc<dyn PressureSink>,
}

impl PressureTicket {
    pub(crate) fn issue(bytes: usize, sink: Arc<dyn PressureSink>) -> Self {
        sink.add(bytes);
        Self { bytes, sink }
    }

    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }

    pub(crate) fn withdraw(self) {
        self.sink.remove(self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_track_outstanding() {
        let p = MemoryPressure::new(usize::MAX);
        p.add(1024);
        p.add(512);
        assert_eq!(p.outstanding(), 1536);
        p.remove(1024);
        assert_eq!(p.outstanding(), 512);
        assert_eq!(p.peak(), 1536);
        assert_eq!(p.notifications(), 2);
    }

    #[test]
    fn unmatched_remove_saturates_at_zero() {
        let p = MemoryPressure::new(usize::MAX);
        p.add(10);
        p.remove(100);
        assert_eq!(p.outstanding(), 0);
    }

    #[test]
    fn ticket_withdraws_exactly_what_it_added() {
        let p = Arc::new(MemoryPressure::new(usize::MAX));
        let ticket = PressureTicket::issue(4096, p.clone());
        assert_eq!(ticket.bytes(), 4096);
        assert_eq!(p.outstanding(), 4096);
        ticket.withdraw();
        assert_eq!(p.outstanding(), 0);
    }

    #[test]
    fn threshold_moves_take_effect_on_the_next_add() {
        let p = MemoryPressure::new(usize::MAX);
        p.add(100);
        p.set_log_threshold(150);
        assert_eq!(p.log_threshold(), 150);
        p.add(100);
        assert_eq!(p.outstanding(), 200);
        assert!(format!("{p:?}").contains("log_threshold: 150"));
    }

    #[test]
    fn global_notify_is_infallible() {
        let before = global().notifications();
        notify(64);
        assert!(global().notifications() > before);
        global().remove(64);
    }
}

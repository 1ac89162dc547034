//! Per-server load tracking.
//!
//! Servers report a [`LoadReport`] in every heartbeat. The master keeps a
//! fixed-size rolling window of tick times per server; the window average
//! is what placement decisions consume. A server that has not reported
//! yet averages to zero, which conveniently makes fresh members the most
//! attractive placement targets.

use dashmap::DashMap;

use crate::constants::TICK_WINDOW_SIZE;
use crate::types::{LoadReport, ServerId};

/// Fixed-size rolling window over tick-time samples.
///
/// Appends overwrite the oldest sample once the window is full; the
/// average is maintained incrementally rather than recomputed.
#[derive(Debug, Clone)]
pub struct TickWindow {
    times: Vec<f64>,
    total: f64,
    index: usize,
    filled: usize,
}

impl TickWindow {
    pub fn new(size: usize) -> Self {
        Self {
            times: vec![0.0; size.max(1)],
            total: 0.0,
            index: 0,
            filled: 0,
        }
    }

    pub fn append(&mut self, time: f64) {
        self.total -= self.times[self.index];
        self.times[self.index] = time;
        self.total += time;
        self.index = (self.index + 1) % self.times.len();
        self.filled = (self.filled + 1).min(self.times.len());
    }

    /// Average over the samples recorded so far; zero before any sample.
    pub fn average(&self) -> f64 {
        if self.filled == 0 {
            return 0.0;
        }
        self.total / self.filled as f64
    }
}

impl Default for TickWindow {
    fn default() -> Self {
        Self::new(TICK_WINDOW_SIZE)
    }
}

#[derive(Debug, Default)]
struct ServerLoad {
    window: TickWindow,
    latest: LoadReport,
}

/// Rolling load state for every tracked member.
///
/// Written by the router on each heartbeat, read by placement. Entries
/// are registered on admission and dropped with the session.
#[derive(Debug, Default)]
pub struct LoadTable {
    servers: DashMap<ServerId, ServerLoad>,
}

impl LoadTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a member with an empty window.
    pub fn register(&self, identity: &ServerId) {
        self.servers.entry(identity.clone()).or_default();
    }

    /// Stop tracking a member.
    pub fn remove(&self, identity: &ServerId) {
        self.servers.remove(identity);
    }

    /// Fold one heartbeat report into the member's window.
    pub fn record(&self, identity: &ServerId, report: LoadReport) {
        let mut entry = self.servers.entry(identity.clone()).or_default();
        entry.window.append(report.tick_millis);
        entry.latest = report;
    }

    /// Rolling average tick time, or `None` for an untracked member.
    pub fn average_tick_millis(&self, identity: &ServerId) -> Option<f64> {
        self.servers.get(identity).map(|e| e.window.average())
    }

    /// The most recent raw report, or `None` for an untracked member.
    pub fn latest(&self, identity: &ServerId) -> Option<LoadReport> {
        self.servers.get(identity).map(|e| e.latest)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_average_before_full() {
        let mut window = TickWindow::new(4);
        window.append(10.0);
        window.append(20.0);
        assert_eq!(window.average(), 15.0);
    }

    #[test]
    fn test_window_overwrites_oldest() {
        let mut window = TickWindow::new(2);
        window.append(10.0);
        window.append(20.0);
        window.append(40.0);
        // 10.0 fell out of the window.
        assert_eq!(window.average(), 30.0);
    }

    #[test]
    fn test_load_table_records_heartbeats() {
        let table = LoadTable::new();
        let alpha = ServerId::from("alpha");

        table.register(&alpha);
        assert_eq!(table.average_tick_millis(&alpha), Some(0.0));

        table.record(&alpha, LoadReport::new(45.0, 20.0, 3));
        table.record(&alpha, LoadReport::new(55.0, 18.0, 3));
        assert_eq!(table.average_tick_millis(&alpha), Some(50.0));
        assert_eq!(table.latest(&alpha).unwrap().owned_regions, 3);
    }
}

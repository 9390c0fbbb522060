//! Wall-clock instrumentation of a session.
//!
//! The tracker records the time elapsed between consecutive `track` calls,
//! labelled and tagged with the kind of stage that just finished. When
//! disabled every method reduces to a single branch.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

const TIMINGS_TARGET: &str = "scanmill::timings";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Session bookkeeping between plugin runs
    Overhead,
    Plugin,
    Prepender,
    Appender,
    MilterPlugin,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimingRecord {
    pub label: String,
    pub seconds: f64,
    pub kind: StageKind,
}

#[derive(Debug)]
pub struct TimingTracker {
    enabled: bool,
    port: Option<u16>,
    last: Instant,
    start: Instant,
    real_time: Duration,
    async_times: BTreeMap<String, f64>,
    records: Vec<TimingRecord>,
}

impl TimingTracker {
    pub fn new(enabled: bool) -> Self {
        let now = Instant::now();
        Self {
            enabled,
            port: None,
            last: now,
            start: now,
            real_time: Duration::ZERO,
            async_times: BTreeMap::new(),
            records: Vec::new(),
        }
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Turning the tracker on restarts the reference time.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if enabled {
            self.last = Instant::now();
            self.records.clear();
        }
    }

    /// Start over for the next message of a connection.
    pub fn reset(&mut self) {
        if !self.enabled {
            return;
        }
        let now = Instant::now();
        self.last = now;
        self.start = now;
        self.real_time = Duration::ZERO;
        self.async_times.clear();
        self.records.clear();
    }

    /// Record the time since the previous call under `label`.
    pub fn track(&mut self, label: &str, kind: StageKind) {
        if !self.enabled {
            return;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.last);
        self.real_time = now.duration_since(self.start);
        self.last = now;
        self.records.push(TimingRecord {
            label: label.to_string(),
            seconds: elapsed.as_secs_f64(),
            kind,
        });
    }

    /// Attribute work measured elsewhere (e.g. on another task) to `key`.
    pub fn add_async_time(&mut self, delta: f64, key: Option<&str>) {
        *self
            .async_times
            .entry(key.unwrap_or_default().to_string())
            .or_insert(0.0) += delta;
    }

    pub fn async_time(&self, key: Option<&str>) -> f64 {
        self.async_times
            .get(key.unwrap_or_default())
            .copied()
            .unwrap_or(0.0)
    }

    /// Elapsed time from reset to the last `track` call.
    pub fn real_time(&self) -> Duration {
        self.real_time
    }

    /// Records of one kind, or all of them for `None`.
    pub fn filtered_records(&self, kind: Option<StageKind>) -> Vec<&TimingRecord> {
        if !self.enabled {
            return Vec::new();
        }
        self.records
            .iter()
            .filter(|record| kind.map_or(true, |k| record.kind == k))
            .collect()
    }

    pub fn total_time(&self, kind: Option<StageKind>) -> f64 {
        self.filtered_records(kind)
            .iter()
            .map(|record| record.seconds)
            .sum()
    }

    fn port_label(&self) -> i64 {
        self.port.map(i64::from).unwrap_or(-1)
    }

    /// Log one line per category. Closes the record list with an `end` entry.
    pub fn report(&mut self, suspect_id: &str, with_real_time: bool) {
        if !self.enabled {
            return;
        }
        if self.records.is_empty() {
            log::debug!(target: TIMINGS_TARGET, "no timings to report");
            return;
        }
        self.track("end", StageKind::Overhead);

        let port = self.port_label();
        if with_real_time {
            log::info!(
                target: TIMINGS_TARGET,
                "port: {port}, id: {suspect_id}, real: {:.6}",
                self.real_time.as_secs_f64()
            );
            for (key, value) in &self.async_times {
                let label = if key.is_empty() {
                    "async".to_string()
                } else {
                    format!("async({key})")
                };
                log::info!(target: TIMINGS_TARGET, "port: {port}, id: {suspect_id}, {label}: {value:.6}");
            }
        }
        log::info!(
            target: TIMINGS_TARGET,
            "port: {port}, id: {suspect_id}, total: {:.6}",
            self.total_time(None)
        );
        log::info!(
            target: TIMINGS_TARGET,
            "port: {port}, id: {suspect_id}, overhead: {:.3}",
            self.total_time(Some(StageKind::Overhead))
        );

        for (kind, prefix) in [
            (StageKind::MilterPlugin, "(MPL)"),
            (StageKind::Prepender, "(PRE)"),
            (StageKind::Plugin, "(PLG)"),
            (StageKind::Appender, "(APP)"),
        ] {
            for record in self.filtered_records(Some(kind)) {
                log::info!(
                    target: TIMINGS_TARGET,
                    "port: {port}, id: {suspect_id}, {prefix} {}: {:.3}",
                    record.label,
                    record.seconds
                );
            }
        }
        for record in self.filtered_records(Some(StageKind::Overhead)) {
            log::debug!(
                target: TIMINGS_TARGET,
                "port: {port}, id: {suspect_id}, {}: {:.3}",
                record.label,
                record.seconds
            );
        }
    }

    /// Debug dump of every interval, for plugins keeping their own tracker.
    pub fn report_plugin_time(&mut self, suspect_id: &str, plugin_name: &str) {
        if !self.enabled {
            return;
        }
        self.track("end", StageKind::Overhead);
        let port = self.port_label();
        for record in &self.records {
            log::debug!(
                target: TIMINGS_TARGET,
                "port: {port}, id: {suspect_id}, [{plugin_name}] {}: {:.3}",
                record.label,
                record.seconds
            );
        }
    }
}

impl Default for TimingTracker {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_tracker_is_inert() {
        let mut tracker = TimingTracker::new(false);
        tracker.track("Setup", StageKind::Overhead);
        tracker.track("Rules", StageKind::Plugin);
        assert!(tracker.filtered_records(None).is_empty());
        assert_eq!(tracker.total_time(None), 0.0);
        tracker.report("id", true);
        assert!(tracker.filtered_records(None).is_empty());
    }

    #[test]
    fn test_empty_total_is_zero() {
        let tracker = TimingTracker::new(true);
        assert_eq!(tracker.total_time(None), 0.0);
        assert_eq!(tracker.total_time(Some(StageKind::Plugin)), 0.0);
    }

    #[test]
    fn test_records_keep_order_and_kind() {
        let mut tracker = TimingTracker::new(true);
        tracker.track("Before-Prependers", StageKind::Overhead);
        tracker.track("Skipper", StageKind::Prepender);
        tracker.track("A", StageKind::Plugin);
        tracker.track("B", StageKind::Plugin);
        tracker.track("Stats", StageKind::Appender);

        let labels: Vec<&str> = tracker
            .filtered_records(None)
            .iter()
            .map(|r| r.label.as_str())
            .collect();
        assert_eq!(labels, ["Before-Prependers", "Skipper", "A", "B", "Stats"]);

        let plugins: Vec<&str> = tracker
            .filtered_records(Some(StageKind::Plugin))
            .iter()
            .map(|r| r.label.as_str())
            .collect();
        assert_eq!(plugins, ["A", "B"]);

        let sum = tracker.total_time(Some(StageKind::Plugin))
            + tracker.total_time(Some(StageKind::Prepender))
            + tracker.total_time(Some(StageKind::Appender))
            + tracker.total_time(Some(StageKind::Overhead));
        assert!((sum - tracker.total_time(None)).abs() < 1e-9);
    }

    #[test]
    fn test_reset_clears_records() {
        let mut tracker = TimingTracker::new(true);
        tracker.track("A", StageKind::Plugin);
        tracker.add_async_time(0.5, Some("dns"));
        tracker.reset();
        assert!(tracker.filtered_records(None).is_empty());
        assert_eq!(tracker.async_time(Some("dns")), 0.0);
        assert_eq!(tracker.real_time(), Duration::ZERO);
    }

    #[test]
    fn test_async_time_accumulates() {
        let mut tracker = TimingTracker::new(true);
        tracker.add_async_time(0.25, Some("dns"));
        tracker.add_async_time(0.5, Some("dns"));
        tracker.add_async_time(1.0, None);
        assert!((tracker.async_time(Some("dns")) - 0.75).abs() < 1e-9);
        assert!((tracker.async_time(None) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_report_appends_end_marker() {
        let mut tracker = TimingTracker::new(true).with_port(Some(10025));
        tracker.track("A", StageKind::Plugin);
        tracker.report("abc", true);
        let last = tracker.filtered_records(None).last().map(|r| r.label.clone());
        assert_eq!(last.as_deref(), Some("end"));

        let mut empty = TimingTracker::new(true);
        empty.report("abc", false);
        assert!(empty.filtered_records(None).is_empty());
    }

    #[test]
    fn test_enabling_restarts() {
        let mut tracker = TimingTracker::new(true);
        tracker.track("A", StageKind::Plugin);
        tracker.set_enabled(false);
        assert!(tracker.filtered_records(None).is_empty());
        tracker.set_enabled(true);
        assert!(tracker.filtered_records(None).is_empty());
    }
}

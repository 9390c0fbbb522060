use crate::disposition::{ActionCode, Disposition};
use crate::suspect::Suspect;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::interval;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginStats {
    pub plugin: String,
    pub decisions: u64,
    pub accepts: u64,
    pub deletes: u64,
    pub rejects: u64,
    pub defers: u64,
    pub invalid: u64,
    pub first_decision: Option<DateTime<Utc>>,
    pub last_decision: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalStats {
    pub messages_in: u64,
    pub messages_out: u64,
    pub scanned: u64,
    pub spam: u64,
    pub highspam: u64,
    pub virus: u64,
    pub blocked: u64,
    pub ham: u64,
    pub total_scantime: f64,
    pub accepts: u64,
    pub deletes: u64,
    pub rejects: u64,
    pub defers: u64,
    /// Messages no scanner had an opinion on
    pub no_opinion: u64,
    pub start_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl GlobalStats {
    fn new() -> Self {
        let now = Utc::now();
        GlobalStats {
            messages_in: 0,
            messages_out: 0,
            scanned: 0,
            spam: 0,
            highspam: 0,
            virus: 0,
            blocked: 0,
            ham: 0,
            total_scantime: 0.0,
            accepts: 0,
            deletes: 0,
            rejects: 0,
            defers: 0,
            no_opinion: 0,
            start_time: now,
            last_updated: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub global: GlobalStats,
    pub plugins: Vec<PluginStats>,
}

#[derive(Debug, Clone)]
pub enum StatEvent {
    MessageIn,
    /// Committed back to the MTA
    MessageOut,
    Scanned {
        spam: bool,
        highspam: bool,
        virus: bool,
        blocked: bool,
        scantime: f64,
    },
    Decision {
        action: ActionCode,
        decided_by: Option<String>,
    },
}

impl StatEvent {
    pub fn scanned(suspect: &Suspect, scantime: f64) -> Self {
        StatEvent::Scanned {
            spam: suspect.is_spam(),
            highspam: suspect.is_highspam(),
            virus: suspect.is_virus(),
            blocked: suspect.is_blocked(),
            scantime,
        }
    }
}

struct StatsState {
    global: GlobalStats,
    plugins: BTreeMap<String, PluginStats>,
}

/// Process-wide counters shared by every session.
pub struct StatisticsCollector {
    dump_path: Option<PathBuf>,
    state: Mutex<StatsState>,
}

impl StatisticsCollector {
    /// Counters start from the previous dump at `dump_path` if there is one.
    pub fn new(dump_path: Option<PathBuf>) -> Self {
        let mut state = StatsState {
            global: GlobalStats::new(),
            plugins: BTreeMap::new(),
        };

        if let Some(path) = dump_path.as_deref().filter(|p| p.exists()) {
            match Self::load_from_file(path) {
                Ok(snapshot) => {
                    state.global = snapshot.global;
                    state.plugins = snapshot
                        .plugins
                        .into_iter()
                        .map(|stats| (stats.plugin.clone(), stats))
                        .collect();
                }
                Err(e) => log::warn!("Ignoring unreadable statistics dump: {e:#}"),
            }
        }

        Self {
            dump_path,
            state: Mutex::new(state),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    fn lock(&self) -> MutexGuard<'_, StatsState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_event(&self, event: StatEvent) {
        let mut state = self.lock();
        let now = Utc::now();
        state.global.last_updated = now;

        match event {
            StatEvent::MessageIn => state.global.messages_in += 1,
            StatEvent::MessageOut => state.global.messages_out += 1,
            StatEvent::Scanned {
                spam,
                highspam,
                virus,
                blocked,
                scantime,
            } => {
                let global = &mut state.global;
                global.scanned += 1;
                global.total_scantime += scantime;
                if spam {
                    global.spam += 1;
                }
                if highspam {
                    global.highspam += 1;
                }
                if virus {
                    global.virus += 1;
                }
                if blocked {
                    global.blocked += 1;
                }
                if !(spam || highspam || virus || blocked) {
                    global.ham += 1;
                }
            }
            StatEvent::Decision { action, decided_by } => {
                let disposition = action.disposition();
                let global = &mut state.global;
                match disposition {
                    Some(Disposition::NoOpinion) => global.no_opinion += 1,
                    Some(Disposition::Accept) => global.accepts += 1,
                    Some(Disposition::Delete) => global.deletes += 1,
                    Some(Disposition::Reject) => global.rejects += 1,
                    Some(Disposition::Defer) | None => global.defers += 1,
                }

                if let Some(plugin) = decided_by {
                    let stats = state
                        .plugins
                        .entry(plugin.clone())
                        .or_insert_with(|| PluginStats {
                            plugin,
                            decisions: 0,
                            accepts: 0,
                            deletes: 0,
                            rejects: 0,
                            defers: 0,
                            invalid: 0,
                            first_decision: Some(now),
                            last_decision: Some(now),
                        });
                    stats.decisions += 1;
                    stats.last_decision = Some(now);
                    match disposition {
                        Some(Disposition::Accept) => stats.accepts += 1,
                        Some(Disposition::Delete) => stats.deletes += 1,
                        Some(Disposition::Reject) => stats.rejects += 1,
                        Some(Disposition::Defer) => stats.defers += 1,
                        Some(Disposition::NoOpinion) => {}
                        None => stats.invalid += 1,
                    }
                }
            }
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let state = self.lock();
        let mut plugins: Vec<PluginStats> = state.plugins.values().cloned().collect();
        plugins.sort_by(|a, b| b.decisions.cmp(&a.decisions));
        StatsSnapshot {
            global: state.global.clone(),
            plugins,
        }
    }

    pub fn reset_stats(&self) {
        let mut state = self.lock();
        state.global = GlobalStats::new();
        state.plugins.clear();
    }

    /// Write the current counters as JSON. No-op without a dump path.
    pub fn flush_to_file(&self) -> Result<()> {
        let Some(path) = &self.dump_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create stats directory: {}", parent.display())
            })?;
        }
        let content = serde_json::to_string_pretty(&self.snapshot())?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write statistics to {}", path.display()))?;
        Ok(())
    }

    pub fn load_from_file(path: &Path) -> Result<StatsSnapshot> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read statistics from {}", path.display()))?;
        let snapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse statistics in {}", path.display()))?;
        Ok(snapshot)
    }

    /// Periodically write the counters to disk. Must be called inside a tokio runtime.
    pub fn spawn_flusher(self: Arc<Self>, flush_interval_seconds: u64) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut flush_timer = interval(Duration::from_secs(flush_interval_seconds.max(1)));
            // the first tick completes immediately
            flush_timer.tick().await;
            loop {
                flush_timer.tick().await;
                if let Err(e) = self.flush_to_file() {
                    log::error!("Failed to flush statistics: {e:#}");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(d: Disposition, by: Option<&str>) -> StatEvent {
        StatEvent::Decision {
            action: d.into(),
            decided_by: by.map(str::to_string),
        }
    }

    #[test]
    fn test_counts_messages_and_scans() {
        let stats = StatisticsCollector::in_memory();
        stats.record_event(StatEvent::MessageIn);
        stats.record_event(StatEvent::MessageIn);
        stats.record_event(StatEvent::MessageOut);
        stats.record_event(StatEvent::Scanned {
            spam: true,
            highspam: false,
            virus: false,
            blocked: false,
            scantime: 0.25,
        });
        stats.record_event(StatEvent::Scanned {
            spam: false,
            highspam: false,
            virus: false,
            blocked: false,
            scantime: 0.5,
        });

        let global = stats.snapshot().global;
        assert_eq!(global.messages_in, 2);
        assert_eq!(global.messages_out, 1);
        assert_eq!(global.scanned, 2);
        assert_eq!(global.spam, 1);
        assert_eq!(global.ham, 1);
        assert!((global.total_scantime - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_decisions_per_plugin() {
        let stats = StatisticsCollector::in_memory();
        stats.record_event(decision(Disposition::Reject, Some("RuleScanner")));
        stats.record_event(decision(Disposition::Reject, Some("RuleScanner")));
        stats.record_event(decision(Disposition::Delete, Some("VirusCheck")));
        stats.record_event(decision(Disposition::NoOpinion, None));
        stats.record_event(StatEvent::Decision {
            action: ActionCode::from_raw(9),
            decided_by: Some("Odd".to_string()),
        });

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.global.rejects, 2);
        assert_eq!(snapshot.global.deletes, 1);
        assert_eq!(snapshot.global.no_opinion, 1);
        assert_eq!(snapshot.global.defers, 1);
        assert_eq!(snapshot.plugins[0].plugin, "RuleScanner");
        assert_eq!(snapshot.plugins[0].rejects, 2);
        let odd = snapshot.plugins.iter().find(|p| p.plugin == "Odd").unwrap();
        assert_eq!(odd.invalid, 1);

        stats.reset_stats();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.global.rejects, 0);
        assert!(snapshot.plugins.is_empty());
    }

    #[test]
    fn test_flush_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats").join("dump.json");

        let stats = StatisticsCollector::new(Some(path.clone()));
        stats.record_event(StatEvent::MessageIn);
        stats.record_event(decision(Disposition::Accept, Some("RuleScanner")));
        stats.flush_to_file().unwrap();

        let loaded = StatisticsCollector::load_from_file(&path).unwrap();
        assert_eq!(loaded.global.messages_in, 1);

        let restarted = StatisticsCollector::new(Some(path));
        restarted.record_event(StatEvent::MessageIn);
        assert_eq!(restarted.snapshot().global.messages_in, 2);
        assert_eq!(restarted.snapshot().plugins[0].accepts, 1);
    }

    #[test]
    fn test_in_memory_flush_is_noop() {
        assert!(StatisticsCollector::in_memory().flush_to_file().is_ok());
    }
}

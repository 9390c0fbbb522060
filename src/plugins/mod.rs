//! Built-in, configuration driven plugins.

pub mod rules;
pub mod skipper;
pub mod stats_appender;

pub use rules::RuleScanner;
pub use skipper::SkipperPrepender;
pub use stats_appender::StatsAppender;

use crate::config::{AppenderSpec, PluginsConfig, PrependerSpec, ScannerSpec};
use crate::plugin::{Appender, PluginSet, Prepender, Scanner};
use crate::statistics::StatisticsCollector;
use anyhow::Context;
use std::sync::Arc;

/// Instantiate the configured plugins in order.
pub fn build_plugin_set(
    config: &PluginsConfig,
    stats: Arc<StatisticsCollector>,
) -> anyhow::Result<PluginSet> {
    let mut prependers: Vec<Prepender> = Vec::new();
    for spec in &config.prependers {
        match spec {
            PrependerSpec::SkipperPrepender { section, rules } => {
                let plugin = SkipperPrepender::new(section.clone(), rules.clone())
                    .context("failed to load SkipperPrepender")?;
                prependers.push(Arc::new(plugin));
            }
        }
    }

    let mut scanners: Vec<Scanner> = Vec::new();
    for spec in &config.scanners {
        match spec {
            ScannerSpec::RuleScanner { section, rules } => {
                let plugin = RuleScanner::new(section.clone(), rules.clone())
                    .context("failed to load RuleScanner")?;
                scanners.push(Arc::new(plugin));
            }
        }
    }

    let mut appenders: Vec<Appender> = Vec::new();
    for spec in &config.appenders {
        match spec {
            AppenderSpec::StatsAppender { section } => {
                appenders.push(Arc::new(StatsAppender::new(section.clone(), stats.clone())));
            }
        }
    }

    log::info!(
        "Loaded {} prependers, {} scanners, {} appenders",
        prependers.len(),
        scanners.len(),
        appenders.len()
    );
    Ok(PluginSet::new(prependers, scanners, appenders))
}

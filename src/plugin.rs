use crate::disposition::{ActionCode, Verdict};
use crate::suspect::Suspect;
use std::sync::Arc;

/// Common surface of every plugin kind.
pub trait Plugin: Send + Sync {
    /// Configuration section; identifies the plugin in decision and scan-time records.
    fn section(&self) -> &str;

    /// Short type name, e.g. `RuleScanner`.
    fn kind(&self) -> &str;

    /// `Type` or `Type(section)` when the section was renamed.
    fn display_name(&self) -> String {
        if self.section() == self.kind() {
            self.kind().to_string()
        } else {
            format!("{}({})", self.kind(), self.section())
        }
    }

    /// Configuration sanity check for `--test-config`.
    fn lint(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Content inspection. `Ok(None)` means no opinion.
pub trait ScannerPlugin: Plugin {
    fn examine(&self, suspect: &mut Suspect) -> anyhow::Result<Option<Verdict>>;
}

/// Runs before scanning and may replace the scanner/appender lists for one
/// message. Returning `Ok(None)` leaves a list unchanged.
pub trait PrependerPlugin: Plugin {
    fn plugin_list(
        &self,
        _suspect: &mut Suspect,
        _plugins: &[Scanner],
    ) -> anyhow::Result<Option<Vec<Scanner>>> {
        Ok(None)
    }

    fn appender_list(
        &self,
        _suspect: &mut Suspect,
        _appenders: &[Appender],
    ) -> anyhow::Result<Option<Vec<Appender>>> {
        Ok(None)
    }
}

/// Side effects after the decision (statistics, archiving).
pub trait AppenderPlugin: Plugin {
    fn process(&self, suspect: &mut Suspect, decision: ActionCode) -> anyhow::Result<()>;
}

pub type Scanner = Arc<dyn ScannerPlugin>;
pub type Prepender = Arc<dyn PrependerPlugin>;
pub type Appender = Arc<dyn AppenderPlugin>;

/// The configured plugins, built once and shared read-only by all sessions.
#[derive(Clone, Default)]
pub struct PluginSet {
    pub prependers: Vec<Prepender>,
    pub scanners: Vec<Scanner>,
    pub appenders: Vec<Appender>,
}

impl PluginSet {
    pub fn new(prependers: Vec<Prepender>, scanners: Vec<Scanner>, appenders: Vec<Appender>) -> Self {
        Self {
            prependers,
            scanners,
            appenders,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prependers.is_empty() && self.scanners.is_empty() && self.appenders.is_empty()
    }

    /// Lint every plugin; returns the failures with the plugin's display name.
    pub fn lint(&self) -> Vec<(String, anyhow::Error)> {
        let mut failures = Vec::new();
        lint_all(&self.prependers, &mut failures);
        lint_all(&self.scanners, &mut failures);
        lint_all(&self.appenders, &mut failures);
        failures
    }
}

fn lint_all<P: Plugin + ?Sized>(plugins: &[Arc<P>], failures: &mut Vec<(String, anyhow::Error)>) {
    for plugin in plugins {
        if let Err(e) = plugin.lint() {
            failures.push((plugin.display_name(), e));
        }
    }
}

impl std::fmt::Debug for PluginSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSet")
            .field("prependers", &names(&self.prependers))
            .field("scanners", &names(&self.scanners))
            .field("appenders", &names(&self.appenders))
            .finish()
    }
}

/// Display names of a plugin list, for logging.
pub fn names<P: Plugin + ?Sized>(plugins: &[Arc<P>]) -> Vec<String> {
    plugins.iter().map(|p| p.display_name()).collect()
}

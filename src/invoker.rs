//! Single point where plugin failures are contained.
//!
//! Whatever a plugin does wrong (an `Err` return or a panic) ends up as one
//! entry in the suspect's processing errors and as "no opinion" for the
//! pipeline. Timing is recorded on every path.

use crate::disposition::{ActionCode, Disposition, Verdict};
use crate::plugin::{Appender, AppenderPlugin, PrependerPlugin, Scanner, ScannerPlugin};
use crate::suspect::Suspect;
use crate::timing::{StageKind, TimingTracker};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

/// Normalized outcome of one scanner run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StageResult {
    pub action: ActionCode,
    pub message: Option<String>,
}

impl StageResult {
    pub fn no_opinion() -> Self {
        Self::default()
    }

    /// `None` when the plugin reported a code outside the known range.
    pub fn disposition(&self) -> Option<Disposition> {
        self.action.disposition()
    }
}

impl From<Option<Verdict>> for StageResult {
    fn from(value: Option<Verdict>) -> Self {
        match value {
            Some(verdict) => Self {
                action: verdict.action,
                message: verdict.message,
            },
            None => Self::no_opinion(),
        }
    }
}

/// List changes a prepender asked for; `None` keeps the current list.
#[derive(Default)]
pub struct ListChanges {
    pub scanners: Option<Vec<Scanner>>,
    pub appenders: Option<Vec<Appender>>,
}

pub struct PluginInvoker;

impl PluginInvoker {
    pub fn scan(
        plugin: &dyn ScannerPlugin,
        suspect: &mut Suspect,
        timer: &mut TimingTracker,
    ) -> StageResult {
        let name = plugin.display_name();
        log::debug!("{}: Running plugin {name}", suspect.id);

        let started = Instant::now();
        let outcome = isolate(|| plugin.examine(suspect));
        suspect.add_scantime(plugin.section(), started.elapsed().as_secs_f64());

        let result = match outcome {
            Ok(verdict) => {
                let result = StageResult::from(verdict);
                suspect.add_decision(plugin.section(), result.action);
                result
            }
            Err(e) => {
                log::error!("{}: Plugin {name} failed: {e:#}", suspect.id);
                suspect.add_processing_error(format!("Plugin {name} failed: {e}"));
                StageResult::no_opinion()
            }
        };

        timer.track(&name, StageKind::Plugin);
        result
    }

    /// Both lists are asked for inside one isolation scope: if either call
    /// fails neither change is applied.
    pub fn prepend(
        plugin: &dyn PrependerPlugin,
        suspect: &mut Suspect,
        scanners: &[Scanner],
        appenders: &[Appender],
        timer: &mut TimingTracker,
    ) -> ListChanges {
        let name = plugin.display_name();
        log::debug!("{}: Running prepender {name}", suspect.id);

        let started = Instant::now();
        let outcome = isolate(|| {
            let scanners = plugin.plugin_list(suspect, scanners)?;
            let appenders = plugin.appender_list(suspect, appenders)?;
            Ok(ListChanges {
                scanners,
                appenders,
            })
        });
        suspect.add_scantime(plugin.section(), started.elapsed().as_secs_f64());

        let changes = match outcome {
            Ok(changes) => changes,
            Err(e) => {
                log::error!("{}: Prepender plugin {name} failed: {e:#}", suspect.id);
                suspect.add_processing_error(format!("Prepender {name} failed: {e}"));
                ListChanges::default()
            }
        };

        timer.track(&name, StageKind::Prepender);
        changes
    }

    /// Returns whether the appender completed.
    pub fn append(
        plugin: &dyn AppenderPlugin,
        suspect: &mut Suspect,
        decision: ActionCode,
        timer: &mut TimingTracker,
    ) -> bool {
        let name = plugin.display_name();
        log::debug!("{}: Running appender {name}", suspect.id);

        let started = Instant::now();
        let outcome = isolate(|| plugin.process(suspect, decision));
        suspect.add_scantime(plugin.section(), started.elapsed().as_secs_f64());

        let completed = match outcome {
            Ok(()) => true,
            Err(e) => {
                log::error!("{}: Appender plugin {name} failed: {e:#}", suspect.id);
                suspect.add_processing_error(format!("Appender {name} failed: {e}"));
                false
            }
        };

        timer.track(&name, StageKind::Appender);
        completed
    }
}

/// Run plugin code, turning a panic into an error.
fn isolate<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!("panicked: {}", panic_message(&payload))),
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

use crate::disposition::{ActionCode, Disposition};
use crate::invoker::PluginInvoker;
use crate::plugin::Scanner;
use crate::suspect::Suspect;
use crate::timing::{StageKind, TimingTracker};
use crate::trash::Trash;

/// Result of running the scanner list for one message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanOutcome {
    pub action: ActionCode,
    pub message: Option<String>,
    /// Display name of the plugin that ended the run
    pub decided_by: Option<String>,
}

pub struct PipelineRunner<'a> {
    trash: Option<&'a Trash>,
}

impl<'a> PipelineRunner<'a> {
    pub fn new(trash: Option<&'a Trash>) -> Self {
        Self { trash }
    }

    /// Run scanners in order until one of them has an opinion.
    pub fn run(
        &self,
        scanners: &[Scanner],
        suspect: &mut Suspect,
        timer: &mut TimingTracker,
    ) -> ScanOutcome {
        timer.track("Before-Plugins", StageKind::Overhead);

        for scanner in scanners {
            let result = PluginInvoker::scan(scanner.as_ref(), suspect, timer);
            let name = scanner.display_name();

            match result.disposition() {
                Some(Disposition::NoOpinion) => continue,
                Some(disposition) => {
                    log::debug!("{}: Plugin {name} says: {disposition}", suspect.id);
                    if disposition == Disposition::Delete {
                        log::info!("{}: Plugin {name} says: DELETE", suspect.id);
                        if let Some(trash) = self.trash {
                            trash.store(suspect, &name);
                        }
                    }
                }
                None => {
                    log::error!(
                        "{}: Plugin {name} returned invalid action code {}",
                        suspect.id,
                        result.action.raw()
                    );
                }
            }

            return ScanOutcome {
                action: result.action,
                message: result.message,
                decided_by: Some(name),
            };
        }

        ScanOutcome::default()
    }
}

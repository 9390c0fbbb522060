use crate::invoker::PluginInvoker;
use crate::plugin::{names, Appender, Plugin, PluginSet, Prepender, Scanner};
use crate::suspect::Suspect;
use crate::timing::{StageKind, TimingTracker};
use std::sync::Arc;

/// Plugin lists in effect for one message.
#[derive(Clone)]
pub struct SessionPlugins {
    pub scanners: Vec<Scanner>,
    pub appenders: Vec<Appender>,
}

impl SessionPlugins {
    pub fn from_set(set: &PluginSet) -> Self {
        Self {
            scanners: set.scanners.clone(),
            appenders: set.appenders.clone(),
        }
    }
}

/// Runs the configured prependers over private copies of the shared lists.
pub struct PrependerStage<'a> {
    prependers: &'a [Prepender],
}

impl<'a> PrependerStage<'a> {
    pub fn new(prependers: &'a [Prepender]) -> Self {
        Self { prependers }
    }

    pub fn run(
        &self,
        suspect: &mut Suspect,
        configured: &PluginSet,
        timer: &mut TimingTracker,
    ) -> SessionPlugins {
        timer.track("Before-Prependers", StageKind::Overhead);

        let mut lists = SessionPlugins::from_set(configured);
        for prepender in self.prependers {
            let name = prepender.display_name();
            let changes = PluginInvoker::prepend(
                prepender.as_ref(),
                suspect,
                &lists.scanners,
                &lists.appenders,
                timer,
            );

            if let Some(scanners) = changes.scanners {
                log_changes(&suspect.id, &name, "plugin", &lists.scanners, &scanners);
                lists.scanners = scanners;
            }
            if let Some(appenders) = changes.appenders {
                log_changes(&suspect.id, &name, "appender", &lists.appenders, &appenders);
                lists.appenders = appenders;
            }
        }
        lists
    }
}

fn log_changes<P: Plugin + ?Sized>(
    suspect_id: &str,
    prepender: &str,
    what: &str,
    before: &[Arc<P>],
    after: &[Arc<P>],
) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }
    let before = names(before);
    let after = names(after);
    let removed: Vec<&String> = before.iter().filter(|n| !after.contains(n)).collect();
    let added: Vec<&String> = after.iter().filter(|n| !before.contains(n)).collect();
    if !removed.is_empty() {
        log::debug!("{suspect_id}: {prepender} removed {what}s: {removed:?}");
    }
    if !added.is_empty() {
        log::debug!("{suspect_id}: {prepender} added {what}s: {added:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{buffer_suspect, CountingAppender, FnScanner, ListPrepender};

    fn configured() -> PluginSet {
        PluginSet::new(
            Vec::new(),
            vec![
                Arc::new(FnScanner::new("Spam", |_| Ok(None))),
                Arc::new(FnScanner::new("Virus", |_| Ok(None))),
            ],
            vec![Arc::new(CountingAppender::new("Stats"))],
        )
    }

    fn scanner_names(lists: &SessionPlugins) -> Vec<String> {
        names(&lists.scanners)
    }

    #[test]
    fn test_without_prependers_lists_are_copied() {
        let set = configured();
        let mut timer = TimingTracker::new(true);
        let lists = PrependerStage::new(&[]).run(&mut buffer_suspect(), &set, &mut timer);
        assert_eq!(scanner_names(&lists), ["FnScanner(Spam)", "FnScanner(Virus)"]);
        assert_eq!(lists.appenders.len(), 1);
        assert_eq!(timer.filtered_records(None)[0].label, "Before-Prependers");
    }

    #[test]
    fn test_prepender_removal_is_session_scoped() {
        let set = configured();
        let prependers: Vec<Prepender> = vec![Arc::new(ListPrepender::removing("Skip", "FnScanner(Virus)"))];
        let mut timer = TimingTracker::new(false);

        let first = PrependerStage::new(&prependers).run(&mut buffer_suspect(), &set, &mut timer);
        assert_eq!(scanner_names(&first), ["FnScanner(Spam)"]);

        // the shared set keeps every plugin for the next session
        assert_eq!(names(&set.scanners), ["FnScanner(Spam)", "FnScanner(Virus)"]);
        let second = PrependerStage::new(&[]).run(&mut buffer_suspect(), &set, &mut timer);
        assert_eq!(scanner_names(&second), ["FnScanner(Spam)", "FnScanner(Virus)"]);
    }

    #[test]
    fn test_prependers_chain() {
        let set = configured();
        let prependers: Vec<Prepender> = vec![
            Arc::new(ListPrepender::removing("First", "FnScanner(Spam)")),
            Arc::new(ListPrepender::clearing_appenders("Second")),
        ];
        let mut timer = TimingTracker::new(true);

        let lists = PrependerStage::new(&prependers).run(&mut buffer_suspect(), &set, &mut timer);

        assert_eq!(scanner_names(&lists), ["FnScanner(Virus)"]);
        assert!(lists.appenders.is_empty());
        assert_eq!(timer.filtered_records(Some(StageKind::Prepender)).len(), 2);
    }

    #[test]
    fn test_failing_prepender_keeps_last_good_lists() {
        let set = configured();
        let prependers: Vec<Prepender> = vec![
            Arc::new(ListPrepender::removing("First", "FnScanner(Spam)")),
            Arc::new(ListPrepender::failing("Broken")),
        ];
        let mut suspect = buffer_suspect();
        let mut timer = TimingTracker::new(false);

        let lists = PrependerStage::new(&prependers).run(&mut suspect, &set, &mut timer);

        assert_eq!(scanner_names(&lists), ["FnScanner(Virus)"]);
        assert_eq!(lists.appenders.len(), 1);
        assert_eq!(suspect.processing_errors().len(), 1);
    }
}

use crate::disposition::ActionCode;
use crate::plugin::{AppenderPlugin, Plugin};
use crate::statistics::{StatEvent, StatisticsCollector};
use crate::suspect::Suspect;
use std::sync::Arc;

/// Feeds the final decision of every non-deferred message into the statistics.
pub struct StatsAppender {
    section: String,
    stats: Arc<StatisticsCollector>,
}

impl StatsAppender {
    pub fn new(section: Option<String>, stats: Arc<StatisticsCollector>) -> Self {
        StatsAppender {
            section: section.unwrap_or_else(|| "StatsAppender".to_string()),
            stats,
        }
    }
}

impl Plugin for StatsAppender {
    fn section(&self) -> &str {
        &self.section
    }

    fn kind(&self) -> &str {
        "StatsAppender"
    }
}

impl AppenderPlugin for StatsAppender {
    fn process(&self, suspect: &mut Suspect, decision: ActionCode) -> anyhow::Result<()> {
        // the scanner that produced the final action, if any
        let decided_by = suspect
            .decisions()
            .iter()
            .rev()
            .find(|(_, action)| *action == decision && *action != ActionCode::DUNNO)
            .map(|(stage, _)| stage.clone());
        self.stats.record_event(StatEvent::Decision {
            action: decision,
            decided_by,
        });
        Ok(())
    }
}

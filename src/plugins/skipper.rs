use crate::config::SkipRule;
use crate::plugin::{Appender, Plugin, PrependerPlugin, Scanner};
use crate::suspect::Suspect;
use regex::Regex;
use std::sync::Arc;

struct CompiledSkipRule {
    name: String,
    sender: Option<Regex>,
    recipient: Option<Regex>,
    skip_scanners: Vec<String>,
    skip_appenders: Vec<String>,
}

impl CompiledSkipRule {
    fn compile(rule: SkipRule) -> anyhow::Result<Self> {
        let compile = |pattern: Option<String>| -> anyhow::Result<Option<Regex>> {
            pattern
                .map(|p| {
                    Regex::new(&p)
                        .map_err(|e| anyhow::anyhow!("Invalid regex pattern '{}': {}", p, e))
                })
                .transpose()
        };
        Ok(CompiledSkipRule {
            sender: compile(rule.sender_pattern)?,
            recipient: compile(rule.recipient_pattern)?,
            name: rule.name,
            skip_scanners: rule.skip_scanners,
            skip_appenders: rule.skip_appenders,
        })
    }

    /// All configured patterns must match; a rule without patterns never does.
    fn applies_to(&self, suspect: &Suspect) -> bool {
        if self.sender.is_none() && self.recipient.is_none() {
            return false;
        }
        let sender_ok = self
            .sender
            .as_ref()
            .map_or(true, |re| re.is_match(&suspect.from_address));
        let recipient_ok = self
            .recipient
            .as_ref()
            .map_or(true, |re| suspect.recipients.iter().any(|r| re.is_match(r)));
        sender_ok && recipient_ok
    }
}

/// Drops scanners or appenders for matching envelopes, one message at a time.
pub struct SkipperPrepender {
    section: String,
    rules: Vec<CompiledSkipRule>,
}

impl SkipperPrepender {
    pub fn new(section: Option<String>, rules: Vec<SkipRule>) -> anyhow::Result<Self> {
        let rules = rules
            .into_iter()
            .map(CompiledSkipRule::compile)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(SkipperPrepender {
            section: section.unwrap_or_else(|| "SkipperPrepender".to_string()),
            rules,
        })
    }

    fn skipped<'a>(
        &'a self,
        suspect: &Suspect,
        pick: impl Fn(&'a CompiledSkipRule) -> &'a [String],
    ) -> Vec<&'a str> {
        self.rules
            .iter()
            .filter(|rule| rule.applies_to(suspect))
            .inspect(|rule| log::debug!("{}: skip rule '{}' applies", suspect.id, rule.name))
            .flat_map(|rule| pick(rule).iter().map(String::as_str))
            .collect()
    }
}

/// `None` when nothing would be removed.
fn without<P: Plugin + ?Sized>(current: &[Arc<P>], skipped: &[&str]) -> Option<Vec<Arc<P>>> {
    if skipped.is_empty() {
        return None;
    }
    let kept: Vec<Arc<P>> = current
        .iter()
        .filter(|p| !skipped.contains(&p.display_name().as_str()))
        .cloned()
        .collect();
    (kept.len() != current.len()).then_some(kept)
}

impl Plugin for SkipperPrepender {
    fn section(&self) -> &str {
        &self.section
    }

    fn kind(&self) -> &str {
        "SkipperPrepender"
    }

    fn lint(&self) -> anyhow::Result<()> {
        for rule in &self.rules {
            if rule.sender.is_none() && rule.recipient.is_none() {
                anyhow::bail!("skip rule '{}' has neither sender nor recipient pattern", rule.name);
            }
        }
        Ok(())
    }
}

impl PrependerPlugin for SkipperPrepender {
    fn plugin_list(
        &self,
        suspect: &mut Suspect,
        plugins: &[Scanner],
    ) -> anyhow::Result<Option<Vec<Scanner>>> {
        Ok(without(plugins, &self.skipped(suspect, |r| r.skip_scanners.as_slice())))
    }

    fn appender_list(
        &self,
        suspect: &mut Suspect,
        appenders: &[Appender],
    ) -> anyhow::Result<Option<Vec<Appender>>> {
        Ok(without(appenders, &self.skipped(suspect, |r| r.skip_appenders.as_slice())))
    }
}

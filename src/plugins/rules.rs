use crate::config::{Criteria, ScanRule};
use crate::disposition::{Disposition, Verdict};
use crate::plugin::{Plugin, ScannerPlugin};
use crate::suspect::Suspect;
use regex::Regex;
use std::collections::HashMap;

/// Envelope and header data the rules match against.
#[derive(Debug, Default, Clone)]
pub struct MailContext {
    pub sender: String,
    pub from_header: Option<String>,
    pub recipients: Vec<String>,
    /// Keyed by lowercase header name, first occurrence wins
    pub headers: HashMap<String, String>,
    pub subject: Option<String>,
    pub size: u64,
}

impl MailContext {
    pub fn from_suspect(suspect: &Suspect) -> Self {
        let mut headers = HashMap::new();
        for (name, value) in suspect.headers() {
            headers.entry(name.to_lowercase()).or_insert(value);
        }
        MailContext {
            sender: suspect.from_address.clone(),
            from_header: headers.get("from").cloned(),
            recipients: suspect.recipients.clone(),
            subject: headers.get("subject").cloned(),
            headers,
            size: suspect.size,
        }
    }
}

/// First-match regex rules over envelope, headers and size.
pub struct RuleScanner {
    section: String,
    rules: Vec<ScanRule>,
    compiled_patterns: HashMap<String, Regex>,
}

impl RuleScanner {
    pub fn new(section: Option<String>, rules: Vec<ScanRule>) -> anyhow::Result<Self> {
        let mut scanner = RuleScanner {
            section: section.unwrap_or_else(|| "RuleScanner".to_string()),
            rules,
            compiled_patterns: HashMap::new(),
        };
        scanner.compile_patterns()?;
        Ok(scanner)
    }

    fn compile_patterns(&mut self) -> anyhow::Result<()> {
        let rules = self.rules.clone();
        for rule in &rules {
            self.compile_criteria_patterns(&rule.criteria)?;
        }
        Ok(())
    }

    fn compile_criteria_patterns(&mut self, criteria: &Criteria) -> anyhow::Result<()> {
        match criteria {
            Criteria::SenderPattern { pattern }
            | Criteria::RecipientPattern { pattern }
            | Criteria::SubjectPattern { pattern }
            | Criteria::HeaderPattern { pattern, .. } => {
                if !self.compiled_patterns.contains_key(pattern) {
                    let regex = Regex::new(pattern).map_err(|e| {
                        anyhow::anyhow!("Invalid regex pattern '{}': {}", pattern, e)
                    })?;
                    self.compiled_patterns.insert(pattern.clone(), regex);
                }
            }
            Criteria::SizeAbove { .. } => {}
            Criteria::And { criteria } | Criteria::Or { criteria } => {
                for c in criteria {
                    self.compile_criteria_patterns(c)?;
                }
            }
        }
        Ok(())
    }

    fn matches(&self, pattern: &str, value: &str) -> bool {
        self.compiled_patterns
            .get(pattern)
            .map_or(false, |regex| regex.is_match(value))
    }

    pub fn evaluate_criteria(&self, criteria: &Criteria, context: &MailContext) -> bool {
        match criteria {
            Criteria::SenderPattern { pattern } => {
                // Envelope sender or From header
                self.matches(pattern, &context.sender)
                    || context
                        .from_header
                        .as_deref()
                        .map_or(false, |from| self.matches(pattern, from))
            }
            Criteria::RecipientPattern { pattern } => context
                .recipients
                .iter()
                .any(|recipient| self.matches(pattern, recipient)),
            Criteria::SubjectPattern { pattern } => context
                .subject
                .as_deref()
                .map_or(false, |subject| self.matches(pattern, subject)),
            Criteria::HeaderPattern { header, pattern } => context
                .headers
                .get(&header.to_lowercase())
                .map_or(false, |value| self.matches(pattern, value)),
            Criteria::SizeAbove { bytes } => context.size > *bytes,
            Criteria::And { criteria } => criteria.iter().all(|c| self.evaluate_criteria(c, context)),
            Criteria::Or { criteria } => criteria.iter().any(|c| self.evaluate_criteria(c, context)),
        }
    }

    /// First rule whose criteria match.
    pub fn evaluate(&self, context: &MailContext) -> Option<&ScanRule> {
        self.rules.iter().find(|rule| {
            let matched = self.evaluate_criteria(&rule.criteria, context);
            log::debug!("Rule '{}' evaluation result: {matched}", rule.name);
            matched
        })
    }
}

impl Plugin for RuleScanner {
    fn section(&self) -> &str {
        &self.section
    }

    fn kind(&self) -> &str {
        "RuleScanner"
    }

    fn lint(&self) -> anyhow::Result<()> {
        if self.rules.is_empty() {
            anyhow::bail!("no rules configured");
        }
        Ok(())
    }
}

impl ScannerPlugin for RuleScanner {
    fn examine(&self, suspect: &mut Suspect) -> anyhow::Result<Option<Verdict>> {
        let context = MailContext::from_suspect(suspect);
        let Some(rule) = self.evaluate(&context) else {
            suspect.set_spam(self.section.clone(), false);
            return Ok(None);
        };

        log::info!("{}: matched rule '{}' -> {}", suspect.id, rule.name, rule.action);
        suspect.set_spam(self.section.clone(), rule.tag_spam);
        suspect.set_tag(format!("{}.rule", self.section), rule.name.clone());

        if rule.action == Disposition::NoOpinion {
            return Ok(None);
        }
        Ok(Some(match &rule.message {
            Some(message) => Verdict::with_message(rule.action, message.clone()),
            None => rule.action.into(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disposition::ActionCode;
    use crate::suspect::{MessageSource, TagValue};

    fn rule(name: &str, criteria: Criteria, action: Disposition) -> ScanRule {
        ScanRule {
            name: name.to_string(),
            criteria,
            action,
            message: None,
            tag_spam: false,
        }
    }

    fn suspect_with(from: &str, to: &str, message: &str) -> Suspect {
        Suspect::new(
            from,
            vec![to.to_string()],
            MessageSource::Buffer(message.as_bytes().to_vec()),
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let rules = vec![rule(
            "broken",
            Criteria::SubjectPattern {
                pattern: "(unclosed".to_string(),
            },
            Disposition::Reject,
        )];
        assert!(RuleScanner::new(None, rules).is_err());
    }

    #[test]
    fn test_header_pattern_matching() {
        let scanner = RuleScanner::new(
            None,
            vec![ScanRule {
                message: Some("Mail from suspicious service rejected".to_string()),
                tag_spam: true,
                ..rule(
                    "chinese service",
                    Criteria::HeaderPattern {
                        header: "X-Mailer".to_string(),
                        pattern: r"service\..*\.cn".to_string(),
                    },
                    Disposition::Reject,
                )
            }],
        )
        .unwrap();

        let mut suspect = suspect_with(
            "promo@example.cn",
            "bob@example.net",
            "X-Mailer: service.mail.cn\r\nSubject: hi\r\n\r\nbody",
        );
        let verdict = scanner.examine(&mut suspect).unwrap().unwrap();
        assert_eq!(verdict.action, ActionCode::from(Disposition::Reject));
        assert_eq!(verdict.message.as_deref(), Some("Mail from suspicious service rejected"));
        assert!(suspect.is_spam());
        assert_eq!(
            suspect.tag("RuleScanner.rule"),
            Some(&TagValue::from("chinese service"))
        );

        let mut clean = suspect_with("a@example.org", "bob@example.net", "Subject: hi\r\n\r\nbody");
        assert!(scanner.examine(&mut clean).unwrap().is_none());
        assert!(!clean.is_spam());
    }

    #[test]
    fn test_combination_criteria() {
        let scanner = RuleScanner::new(
            Some("Combo".to_string()),
            vec![rule(
                "invoice from outside to billing",
                Criteria::And {
                    criteria: vec![
                        Criteria::SubjectPattern {
                            pattern: "(?i)invoice".to_string(),
                        },
                        Criteria::Or {
                            criteria: vec![
                                Criteria::RecipientPattern {
                                    pattern: "^billing@".to_string(),
                                },
                                Criteria::SizeAbove { bytes: 1_000_000 },
                            ],
                        },
                    ],
                },
                Disposition::Delete,
            )],
        )
        .unwrap();
        assert_eq!(scanner.display_name(), "RuleScanner(Combo)");

        let mut hit = suspect_with("x@example.org", "billing@example.net", "Subject: Your INVOICE\r\n\r\n.");
        assert_eq!(
            scanner.examine(&mut hit).unwrap().map(|v| v.action),
            Some(ActionCode::from(Disposition::Delete))
        );

        let mut miss = suspect_with("x@example.org", "sales@example.net", "Subject: Your invoice\r\n\r\n.");
        assert!(scanner.examine(&mut miss).unwrap().is_none());
    }

    #[test]
    fn test_sender_matches_from_header() {
        let scanner = RuleScanner::new(
            None,
            vec![rule(
                "spoofed bank",
                Criteria::SenderPattern {
                    pattern: "(?i)bank".to_string(),
                },
                Disposition::Defer,
            )],
        )
        .unwrap();
        let context = MailContext {
            sender: "bounce@mailer.example".to_string(),
            from_header: Some("Your Bank <noreply@example.org>".to_string()),
            ..Default::default()
        };
        assert_eq!(scanner.evaluate(&context).map(|r| r.name.as_str()), Some("spoofed bank"));
    }

    #[test]
    fn test_lint_requires_rules() {
        assert!(RuleScanner::new(None, Vec::new()).unwrap().lint().is_err());
    }
}

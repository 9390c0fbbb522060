use crate::disposition::Disposition;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_LOG_TEMPLATE: &str = "Suspect ${id} from=${from_address} to=${to_address} size=${size} spam=${spam} virus=${virus} modified=${modified} decision=${decision}";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    #[serde(default)]
    pub main: MainConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub statistics: Option<StatisticsConfig>,
}

/// Session behaviour switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MainConfig {
    /// Prefix of every header the session adds
    pub prependaddedheaders: String,
    pub spamstatusheader: bool,
    pub debuginfoheader: bool,
    pub suspectidheader: bool,
    pub scantimelogger: bool,
    pub remove_tmpfiles_on_error: bool,
    /// Empty disables the trash copy of deleted messages
    pub trashdir: String,
    pub trashlog: bool,
    pub address_compliance_fail_action: AddressComplianceFailAction,
    pub address_compliance_fail_message: String,
    /// Empty disables the per-message summary line
    pub logtemplate: String,
}

impl Default for MainConfig {
    fn default() -> Self {
        MainConfig {
            prependaddedheaders: "X-Scanmill-".to_string(),
            spamstatusheader: true,
            debuginfoheader: false,
            suspectidheader: true,
            scantimelogger: false,
            remove_tmpfiles_on_error: true,
            trashdir: String::new(),
            trashlog: false,
            address_compliance_fail_action: AddressComplianceFailAction::Defer,
            address_compliance_fail_message: "invalid sender or recipient address".to_string(),
            logtemplate: DEFAULT_LOG_TEMPLATE.to_string(),
        }
    }
}

/// Outcome for messages with a malformed envelope address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AddressComplianceFailAction {
    #[default]
    Defer,
    Reject,
    Discard,
}

impl AddressComplianceFailAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AddressComplianceFailAction::Defer => "defer",
            AddressComplianceFailAction::Reject => "reject",
            AddressComplianceFailAction::Discard => "discard",
        }
    }
}

impl From<String> for AddressComplianceFailAction {
    fn from(value: String) -> Self {
        match value.trim().to_lowercase().as_str() {
            "defer" => AddressComplianceFailAction::Defer,
            "reject" => AddressComplianceFailAction::Reject,
            "discard" | "delete" => AddressComplianceFailAction::Discard,
            other => {
                log::warn!("Unknown address_compliance_fail_action '{other}', using defer");
                AddressComplianceFailAction::Defer
            }
        }
    }
}

impl From<AddressComplianceFailAction> for String {
    fn from(value: AddressComplianceFailAction) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for AddressComplianceFailAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plugin lists in run order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    pub prependers: Vec<PrependerSpec>,
    pub scanners: Vec<ScannerSpec>,
    pub appenders: Vec<AppenderSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ScannerSpec {
    RuleScanner {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        section: Option<String>,
        rules: Vec<ScanRule>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PrependerSpec {
    SkipperPrepender {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        section: Option<String>,
        rules: Vec<SkipRule>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AppenderSpec {
    StatsAppender {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        section: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRule {
    pub name: String,
    pub criteria: Criteria,
    pub action: Disposition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Flag the suspect as spam for this scanner when the rule matches
    #[serde(default)]
    pub tag_spam: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Criteria {
    SenderPattern {
        pattern: String,
    },
    /// Matches if any recipient matches
    RecipientPattern {
        pattern: String,
    },
    SubjectPattern {
        pattern: String,
    },
    HeaderPattern {
        header: String,
        pattern: String,
    },
    SizeAbove {
        bytes: u64,
    },
    And {
        criteria: Vec<Criteria>,
    },
    Or {
        criteria: Vec<Criteria>,
    },
}

/// Removes plugins for messages whose envelope matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkipRule {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_pattern: Option<String>,
    /// Display names of scanners to drop
    #[serde(default)]
    pub skip_scanners: Vec<String>,
    #[serde(default)]
    pub skip_appenders: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsConfig {
    pub enabled: bool,
    pub dump_path: String,
    pub flush_interval_seconds: u64,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        StatisticsConfig {
            enabled: true,
            dump_path: "/var/lib/scanmill/stats.json".to_string(),
            flush_interval_seconds: 60,
        }
    }
}

fn default_socket_path() -> String {
    "/var/run/scanmill.sock".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket_path: default_socket_path(),
            main: MainConfig::default(),
            plugins: PluginsConfig {
                prependers: vec![PrependerSpec::SkipperPrepender {
                    section: None,
                    rules: vec![SkipRule {
                        name: "Internal mail skips rule checks".to_string(),
                        sender_pattern: Some(r".*@localhost$".to_string()),
                        recipient_pattern: None,
                        skip_scanners: vec!["RuleScanner".to_string()],
                        skip_appenders: Vec::new(),
                    }],
                }],
                scanners: vec![ScannerSpec::RuleScanner {
                    section: None,
                    rules: vec![
                        ScanRule {
                            name: "Block suspicious Chinese services".to_string(),
                            criteria: Criteria::HeaderPattern {
                                header: "X-Mailer".to_string(),
                                pattern: r"service\..*\.cn".to_string(),
                            },
                            action: Disposition::Reject,
                            message: Some("Mail from suspicious service rejected".to_string()),
                            tag_spam: true,
                        },
                        ScanRule {
                            name: "Oversized messages".to_string(),
                            criteria: Criteria::SizeAbove { bytes: 50 * 1024 * 1024 },
                            action: Disposition::Defer,
                            message: Some("message too large right now".to_string()),
                            tag_spam: false,
                        },
                    ],
                }],
                appenders: vec![AppenderSpec::StatsAppender { section: None }],
            },
            statistics: Some(StatisticsConfig::default()),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read configuration file {path}"))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("cannot parse configuration file {path}"))?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

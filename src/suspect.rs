use crate::disposition::ActionCode;
use anyhow::Context;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::Serialize;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

lazy_static! {
    static ref ADDRESS_PATTERN: Regex = Regex::new(r"^[^@\s<>]+@[^@\s<>]+$").unwrap();
    static ref TEMPLATE_VAR: Regex = Regex::new(r"\$\{(@?[a-zA-Z][_a-zA-Z0-9.:]*)\}").unwrap();
}

pub const DEFAULT_REPR_TEMPLATE: &str = "Suspect ${id}: from=${from_address} to=${to_address} size=${size} spam=${spam} blocked=${blocked} virus=${virus} modified=${modified} decision=${decision} tags=${tags}";

/// Tags that hold bookkeeping rather than plugin results.
const TAG_REPR_SKIP: &[&str] = &["decisions", "scantimes", "processingerrors"];
const MAX_TAG_REPR_LEN: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum SuspectError {
    #[error("invalid sender address: {0}")]
    InvalidSender(String),
    #[error("invalid recipient address: {0}")]
    InvalidRecipient(String),
    #[error("suspect has neither a message buffer nor a temp file")]
    MissingSource,
}

impl SuspectError {
    /// Envelope address problems are handled by the address-compliance policy.
    pub fn is_address_error(&self) -> bool {
        matches!(
            self,
            SuspectError::InvalidSender(_) | SuspectError::InvalidRecipient(_)
        )
    }
}

#[derive(Debug, Clone)]
pub enum MessageSource {
    Buffer(Vec<u8>),
    TempFile(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
}

impl TagValue {
    pub fn as_bool(&self) -> bool {
        match self {
            TagValue::Bool(b) => *b,
            TagValue::Int(i) => *i != 0,
            TagValue::Float(f) => *f != 0.0,
            TagValue::Text(s) => !s.is_empty(),
            TagValue::List(l) => !l.is_empty(),
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Bool(b) => write!(f, "{b}"),
            TagValue::Int(i) => write!(f, "{i}"),
            TagValue::Float(v) => write!(f, "{v}"),
            TagValue::Text(s) => f.write_str(s),
            TagValue::List(l) => write!(f, "[{}]", l.join(", ")),
        }
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::Bool(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::Int(value)
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        TagValue::Float(value)
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::Text(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::Text(value)
    }
}

impl From<Vec<String>> for TagValue {
    fn from(value: Vec<String>) -> Self {
        TagValue::List(value)
    }
}

/// Where the temp file backing a suspect stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleanup {
    /// Nothing on disk to remove
    BufferOnly,
    Removed,
    AlreadyRemoved,
    Failed,
}

/// One message being scanned.
///
/// Owned by the session for the lifetime of a single message. Plugins may add
/// tags, flags and headers, or replace the message source.
#[derive(Debug)]
pub struct Suspect {
    pub id: String,
    pub from_address: String,
    pub recipients: Vec<String>,
    pub size: u64,
    pub timestamp: SystemTime,
    source: MessageSource,
    modified_source: Option<Vec<u8>>,
    tempfile_removed: bool,
    tags: BTreeMap<String, TagValue>,
    decisions: Vec<(String, ActionCode)>,
    scantimes: Vec<(String, f64)>,
    processing_errors: Vec<String>,
    spam: BTreeMap<String, bool>,
    highspam: BTreeMap<String, bool>,
    virus: BTreeMap<String, bool>,
    blocked: BTreeMap<String, bool>,
    added_headers: Vec<(String, String)>,
}

impl Suspect {
    pub fn new(
        from_address: impl Into<String>,
        recipients: Vec<String>,
        source: MessageSource,
    ) -> Result<Self, SuspectError> {
        Self::with_id(Self::generate_id(), from_address, recipients, source)
    }

    pub fn with_id(
        id: impl Into<String>,
        from_address: impl Into<String>,
        recipients: Vec<String>,
        source: MessageSource,
    ) -> Result<Self, SuspectError> {
        let id = id.into();
        let from_address = from_address.into();

        for recipient in &recipients {
            if !Self::valid_address(recipient) {
                log::warn!("{id}: Invalid recipient address: {recipient}");
                return Err(SuspectError::InvalidRecipient(recipient.clone()));
            }
        }

        // Empty sender is the null reverse-path of bounces
        if !from_address.is_empty() && !Self::valid_address(&from_address) {
            log::warn!("{id}: Invalid sender address: {from_address}");
            return Err(SuspectError::InvalidSender(from_address));
        }

        let size = match &source {
            MessageSource::Buffer(buffer) if buffer.is_empty() => {
                return Err(SuspectError::MissingSource)
            }
            MessageSource::Buffer(buffer) => buffer.len() as u64,
            MessageSource::TempFile(path) => std::fs::metadata(path)
                .map(|meta| meta.len())
                .map_err(|_| SuspectError::MissingSource)?,
        };

        log::info!(
            "{id} from={from_address}, nrec={}, file={}, size={size}",
            recipients.len(),
            match &source {
                MessageSource::TempFile(path) => path.display().to_string(),
                MessageSource::Buffer(_) => String::new(),
            }
        );

        Ok(Self {
            id,
            from_address,
            recipients,
            size,
            timestamp: SystemTime::now(),
            source,
            modified_source: None,
            tempfile_removed: false,
            tags: BTreeMap::new(),
            decisions: Vec::new(),
            scantimes: Vec::new(),
            processing_errors: Vec::new(),
            spam: BTreeMap::new(),
            highspam: BTreeMap::new(),
            virus: BTreeMap::new(),
            blocked: BTreeMap::new(),
            added_headers: Vec::new(),
        })
    }

    /// 32 hex characters
    pub fn generate_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    pub fn valid_address(address: &str) -> bool {
        ADDRESS_PATTERN.is_match(address)
    }

    pub fn to_address(&self) -> Option<&str> {
        self.recipients.first().map(String::as_str)
    }

    pub fn from_domain(&self) -> Option<&str> {
        domain_of(&self.from_address)
    }

    pub fn to_domain(&self) -> Option<&str> {
        self.to_address().and_then(domain_of)
    }

    // ---- message source ----

    pub fn tempfile(&self) -> Option<&Path> {
        match &self.source {
            MessageSource::TempFile(path) if !self.tempfile_removed => Some(path),
            _ => None,
        }
    }

    pub fn is_buffer_only(&self) -> bool {
        matches!(self.source, MessageSource::Buffer(_))
    }

    pub fn tempfile_name(&self) -> String {
        match &self.source {
            MessageSource::TempFile(path) => path.display().to_string(),
            MessageSource::Buffer(_) => "(buffer-only)".to_string(),
        }
    }

    /// Current message bytes, including modifications made by plugins.
    pub fn source(&self) -> anyhow::Result<Cow<'_, [u8]>> {
        if let Some(modified) = &self.modified_source {
            return Ok(Cow::Borrowed(modified));
        }
        self.original_source()
    }

    pub fn original_source(&self) -> anyhow::Result<Cow<'_, [u8]>> {
        match &self.source {
            MessageSource::Buffer(buffer) => Ok(Cow::Borrowed(buffer)),
            MessageSource::TempFile(path) => std::fs::read(path)
                .map(Cow::Owned)
                .with_context(|| format!("{}: cannot read message from {}", self.id, path.display())),
        }
    }

    pub fn set_source(&mut self, source: Vec<u8>) {
        self.size = source.len() as u64;
        self.modified_source = Some(source);
    }

    pub fn is_modified(&self) -> bool {
        self.modified_source.is_some()
    }

    /// Unfolded header block of the current source.
    pub fn headers(&self) -> Vec<(String, String)> {
        match self.source() {
            Ok(source) => parse_headers(&source),
            Err(e) => {
                log::warn!("{}: cannot parse headers: {e:#}", self.id);
                Vec::new()
            }
        }
    }

    /// First value of a header, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers()
            .into_iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    /// Remove the backing temp file. Safe to call more than once.
    pub fn cleanup(&mut self) -> Cleanup {
        let path = match &self.source {
            MessageSource::Buffer(_) => return Cleanup::BufferOnly,
            MessageSource::TempFile(path) => path,
        };
        if self.tempfile_removed {
            log::warn!("{}: tempfile {} already removed", self.id, path.display());
            return Cleanup::AlreadyRemoved;
        }
        match std::fs::remove_file(path) {
            Ok(()) => {
                log::debug!("{}: Removed tempfile {}", self.id, path.display());
                self.tempfile_removed = true;
                Cleanup::Removed
            }
            Err(e) => {
                log::warn!("{}: Could not remove tempfile {}: {e}", self.id, path.display());
                Cleanup::Failed
            }
        }
    }

    pub fn is_cleaned(&self) -> bool {
        self.is_buffer_only() || self.tempfile_removed
    }

    // ---- tags ----

    pub fn tag(&self, key: &str) -> Option<&TagValue> {
        self.tags.get(key)
    }

    pub fn tag_bool(&self, key: &str) -> bool {
        self.tags.get(key).map(TagValue::as_bool).unwrap_or(false)
    }

    /// Overwrites any existing value.
    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<TagValue>) {
        self.tags.insert(key.into(), value.into());
    }

    /// Write-once: returns false and keeps the old value if the key exists.
    pub fn tag_once(&mut self, key: impl Into<String>, value: impl Into<TagValue>) -> bool {
        match self.tags.entry(key.into()) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(value.into());
                true
            }
        }
    }

    pub fn tags(&self) -> &BTreeMap<String, TagValue> {
        &self.tags
    }

    // ---- bookkeeping written by the session ----

    pub fn add_decision(&mut self, stage: impl Into<String>, action: ActionCode) {
        self.decisions.push((stage.into(), action));
    }

    pub fn decisions(&self) -> &[(String, ActionCode)] {
        &self.decisions
    }

    /// Last recorded decision, DUNNO if none.
    pub fn current_decision(&self) -> ActionCode {
        self.decisions
            .last()
            .map(|(_, action)| *action)
            .unwrap_or_default()
    }

    pub fn add_scantime(&mut self, stage: impl Into<String>, seconds: f64) {
        self.scantimes.push((stage.into(), seconds));
    }

    pub fn scantimes(&self) -> &[(String, f64)] {
        &self.scantimes
    }

    pub fn add_processing_error(&mut self, error: impl Into<String>) {
        self.processing_errors.push(error.into());
    }

    pub fn processing_errors(&self) -> &[String] {
        &self.processing_errors
    }

    // ---- engine flags ----

    pub fn set_spam(&mut self, engine: impl Into<String>, value: bool) {
        self.spam.insert(engine.into(), value);
    }

    pub fn set_highspam(&mut self, engine: impl Into<String>, value: bool) {
        self.highspam.insert(engine.into(), value);
    }

    pub fn set_virus(&mut self, engine: impl Into<String>, value: bool) {
        self.virus.insert(engine.into(), value);
    }

    pub fn set_blocked(&mut self, engine: impl Into<String>, value: bool) {
        self.blocked.insert(engine.into(), value);
    }

    pub fn is_spam(&self) -> bool {
        self.spam.values().any(|v| *v)
    }

    pub fn is_highspam(&self) -> bool {
        self.highspam.values().any(|v| *v)
    }

    pub fn is_virus(&self) -> bool {
        self.virus.values().any(|v| *v)
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.values().any(|v| *v)
    }

    pub fn is_ham(&self) -> bool {
        !(self.is_spam() || self.is_virus() || self.is_blocked() || self.is_highspam())
    }

    // ---- headers added on re-injection ----

    /// Queue a header for re-injection; the same key replaces the old value.
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.added_headers.iter_mut().find(|(k, _)| *k == key) {
            Some(existing) => existing.1 = value,
            None => self.added_headers.push((key, value)),
        }
    }

    pub fn added_headers(&self) -> &[(String, String)] {
        &self.added_headers
    }

    // ---- log formatting ----

    fn short_tag_repr(&self) -> String {
        let parts: Vec<String> = self
            .tags
            .iter()
            .filter(|(key, _)| !TAG_REPR_SKIP.contains(&key.as_str()))
            .map(|(key, value)| {
                let mut repr = value.to_string();
                if repr.len() > MAX_TAG_REPR_LEN {
                    let mut cut = MAX_TAG_REPR_LEN;
                    while !repr.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    repr.truncate(cut);
                    repr.push_str("...");
                }
                format!("'{key}': {repr}")
            })
            .collect();
        format!("{{{}}}", parts.join(", "))
    }

    fn template_value(&self, name: &str) -> Option<String> {
        let value = match name {
            "id" => self.id.clone(),
            "from_address" => self.from_address.clone(),
            "to_address" => self.to_address().unwrap_or_default().to_string(),
            "from_domain" => self.from_domain().unwrap_or_default().to_string(),
            "to_domain" => self.to_domain().unwrap_or_default().to_string(),
            "recipients" => self.recipients.join(","),
            "size" => self.size.to_string(),
            "spam" => yesno(self.is_spam()),
            "highspam" => yesno(self.is_highspam()),
            "blocked" => yesno(self.is_blocked()),
            "virus" => yesno(self.is_virus()),
            "modified" => yesno(self.is_modified()),
            "decision" => self.current_decision().to_string(),
            "tags" => self.short_tag_repr(),
            "fulltags" => format!("{:?}", self.tags),
            other => return self.tags.get(other).map(TagValue::to_string),
        };
        Some(value)
    }

    /// Render a `${name}` template. Unknown names render empty.
    pub fn log_format(&self, template: &str) -> String {
        TEMPLATE_VAR
            .replace_all(template, |caps: &Captures| {
                self.template_value(&caps[1]).unwrap_or_default()
            })
            .into_owned()
    }
}

impl fmt::Display for Suspect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.log_format(DEFAULT_REPR_TEMPLATE))
    }
}

fn yesno(value: bool) -> String {
    if value { "Yes" } else { "No" }.to_string()
}

fn domain_of(address: &str) -> Option<&str> {
    address.rsplit_once('@').map(|(_, domain)| domain)
}

/// Parse the header block of a raw message, joining continuation lines.
pub fn parse_headers(source: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(source);
    let mut headers: Vec<(String, String)> = Vec::new();

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }
    }

    headers
}

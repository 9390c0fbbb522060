//! Offline protocol handler: feeds message files through a session.

use crate::session::{Incoming, ProtocolHandler};
use crate::suspect::{MessageSource, Suspect};
use anyhow::Context;
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    Committed { headers: Vec<(String, String)> },
    Rejected(String),
    Deferred(String),
    Discarded(String),
}

impl fmt::Display for ReplayOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayOutcome::Committed { headers } => {
                write!(f, "ACCEPT")?;
                for (name, value) in headers {
                    write!(f, "\n  {name}: {value}")?;
                }
                Ok(())
            }
            ReplayOutcome::Rejected(message) => write!(f, "REJECT {message}"),
            ReplayOutcome::Deferred(message) => write!(f, "DEFER {message}"),
            ReplayOutcome::Discarded(message) => write!(f, "DISCARD {message}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplayResult {
    pub file: PathBuf,
    /// `None` when no suspect could be built from the file
    pub suspect_id: Option<String>,
    pub outcome: ReplayOutcome,
}

pub struct ReplayProtocolHandler {
    files: VecDeque<PathBuf>,
    sender: String,
    recipients: Vec<String>,
    current: Option<(PathBuf, Option<String>)>,
    results: Vec<ReplayResult>,
}

impl ReplayProtocolHandler {
    pub fn new(files: Vec<PathBuf>, sender: impl Into<String>, recipients: Vec<String>) -> Self {
        Self {
            files: files.into(),
            sender: sender.into(),
            recipients,
            current: None,
            results: Vec::new(),
        }
    }

    pub fn results(&self) -> &[ReplayResult] {
        &self.results
    }

    pub fn into_results(self) -> Vec<ReplayResult> {
        self.results
    }

    fn record(&mut self, outcome: ReplayOutcome) {
        let (file, suspect_id) = self.current.take().unwrap_or_default();
        self.results.push(ReplayResult {
            file,
            suspect_id,
            outcome,
        });
    }
}

impl ProtocolHandler for ReplayProtocolHandler {
    fn get_next_suspect(&mut self) -> anyhow::Result<Option<Incoming>> {
        let Some(file) = self.files.pop_front() else {
            return Ok(None);
        };
        self.current = Some((file.clone(), None));

        let content = std::fs::read(&file)
            .with_context(|| format!("cannot read message file {}", file.display()))?;
        // buffer-only: the input file must survive the session cleanup
        let suspect = Suspect::new(
            self.sender.clone(),
            self.recipients.clone(),
            MessageSource::Buffer(content),
        )?;
        self.current = Some((file, Some(suspect.id.clone())));
        Ok(Some(Incoming::Suspect(suspect)))
    }

    fn health_check_reply(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn commit_back(&mut self, suspect: &Suspect) -> anyhow::Result<()> {
        self.record(ReplayOutcome::Committed {
            headers: suspect.added_headers().to_vec(),
        });
        Ok(())
    }

    fn reject(&mut self, message: &str) -> anyhow::Result<()> {
        self.record(ReplayOutcome::Rejected(message.to_string()));
        Ok(())
    }

    fn defer(&mut self, message: &str) -> anyhow::Result<()> {
        self.record(ReplayOutcome::Deferred(message.to_string()));
        Ok(())
    }

    fn discard(&mut self, message: &str) -> anyhow::Result<()> {
        self.record(ReplayOutcome::Discarded(message.to_string()));
        Ok(())
    }

    fn end_session(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn keep_connection(&self) -> bool {
        true
    }
}

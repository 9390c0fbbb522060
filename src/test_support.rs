//! Fakes shared by the unit tests.

use crate::disposition::{ActionCode, Verdict};
use crate::plugin::{Appender, AppenderPlugin, Plugin, PrependerPlugin, Scanner, ScannerPlugin};
use crate::session::{Incoming, ProtocolHandler};
use crate::suspect::{MessageSource, Suspect, TagValue};
use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub const MESSAGE: &[u8] =
    b"From: Alice <alice@example.org>\r\nTo: bob@example.net\r\nSubject: hello\r\n\r\nbody text\r\n";

pub fn buffer_suspect() -> Suspect {
    Suspect::with_id(
        "abc123",
        "alice@example.org",
        vec!["bob@example.net".to_string()],
        MessageSource::Buffer(MESSAGE.to_vec()),
    )
    .unwrap()
}

/// A suspect backed by a file in `dir`.
pub fn tempfile_suspect(dir: &Path) -> (Suspect, PathBuf) {
    let path = dir.join("incoming.eml");
    std::fs::File::create(&path).unwrap().write_all(MESSAGE).unwrap();
    let suspect = Suspect::with_id(
        "file123",
        "alice@example.org",
        vec!["bob@example.net".to_string()],
        MessageSource::TempFile(path.clone()),
    )
    .unwrap();
    (suspect, path)
}

type ExamineFn = dyn Fn(&mut Suspect) -> anyhow::Result<Option<Verdict>> + Send + Sync;

pub struct FnScanner {
    section: String,
    calls: AtomicUsize,
    examine: Box<ExamineFn>,
}

impl FnScanner {
    pub fn new(
        section: &str,
        examine: impl Fn(&mut Suspect) -> anyhow::Result<Option<Verdict>> + Send + Sync + 'static,
    ) -> Self {
        FnScanner {
            section: section.to_string(),
            calls: AtomicUsize::new(0),
            examine: Box::new(examine),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Plugin for FnScanner {
    fn section(&self) -> &str {
        &self.section
    }

    fn kind(&self) -> &str {
        "FnScanner"
    }
}

impl ScannerPlugin for FnScanner {
    fn examine(&self, suspect: &mut Suspect) -> anyhow::Result<Option<Verdict>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.examine)(suspect)
    }
}

enum ListChange {
    RemoveScanner(String),
    ClearAppenders,
    Fail,
}

pub struct ListPrepender {
    section: String,
    change: ListChange,
}

impl ListPrepender {
    pub fn removing(section: &str, scanner: &str) -> Self {
        Self {
            section: section.to_string(),
            change: ListChange::RemoveScanner(scanner.to_string()),
        }
    }

    pub fn clearing_appenders(section: &str) -> Self {
        Self {
            section: section.to_string(),
            change: ListChange::ClearAppenders,
        }
    }

    pub fn failing(section: &str) -> Self {
        Self {
            section: section.to_string(),
            change: ListChange::Fail,
        }
    }
}

impl Plugin for ListPrepender {
    fn section(&self) -> &str {
        &self.section
    }

    fn kind(&self) -> &str {
        "ListPrepender"
    }
}

impl PrependerPlugin for ListPrepender {
    fn plugin_list(
        &self,
        _suspect: &mut Suspect,
        plugins: &[Scanner],
    ) -> anyhow::Result<Option<Vec<Scanner>>> {
        match &self.change {
            ListChange::RemoveScanner(name) => Ok(Some(
                plugins
                    .iter()
                    .filter(|p| p.display_name() != *name)
                    .cloned()
                    .collect(),
            )),
            ListChange::ClearAppenders => Ok(None),
            ListChange::Fail => anyhow::bail!("lookup table missing"),
        }
    }

    fn appender_list(
        &self,
        _suspect: &mut Suspect,
        _appenders: &[Appender],
    ) -> anyhow::Result<Option<Vec<Appender>>> {
        match self.change {
            ListChange::ClearAppenders => Ok(Some(Vec::new())),
            _ => Ok(None),
        }
    }
}

/// Records what it saw of every message it processed.
pub struct CountingAppender {
    section: String,
    seen: Mutex<Vec<ActionCode>>,
    decision_stages: Mutex<Vec<String>>,
    scantime_stages: Mutex<Vec<String>>,
    last_tags: Mutex<BTreeMap<String, TagValue>>,
    processing_error_counts: Mutex<Vec<usize>>,
}

impl CountingAppender {
    pub fn new(section: &str) -> Self {
        Self {
            section: section.to_string(),
            seen: Mutex::new(Vec::new()),
            decision_stages: Mutex::new(Vec::new()),
            scantime_stages: Mutex::new(Vec::new()),
            last_tags: Mutex::new(BTreeMap::new()),
            processing_error_counts: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<ActionCode> {
        self.seen.lock().unwrap().clone()
    }

    pub fn decision_stages(&self) -> Vec<String> {
        self.decision_stages.lock().unwrap().clone()
    }

    pub fn scantime_stages(&self) -> Vec<String> {
        self.scantime_stages.lock().unwrap().clone()
    }

    pub fn last_tags(&self) -> BTreeMap<String, TagValue> {
        self.last_tags.lock().unwrap().clone()
    }

    /// Number of recorded processing errors per message seen.
    pub fn processing_error_counts(&self) -> Vec<usize> {
        self.processing_error_counts.lock().unwrap().clone()
    }
}

impl Plugin for CountingAppender {
    fn section(&self) -> &str {
        &self.section
    }

    fn kind(&self) -> &str {
        "CountingAppender"
    }
}

impl AppenderPlugin for CountingAppender {
    fn process(&self, suspect: &mut Suspect, decision: ActionCode) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(decision);
        *self.decision_stages.lock().unwrap() =
            suspect.decisions().iter().map(|(stage, _)| stage.clone()).collect();
        *self.scantime_stages.lock().unwrap() =
            suspect.scantimes().iter().map(|(stage, _)| stage.clone()).collect();
        *self.last_tags.lock().unwrap() = suspect.tags().clone();
        self.processing_error_counts
            .lock()
            .unwrap()
            .push(suspect.processing_errors().len());
        Ok(())
    }
}

pub struct FailingAppender {
    section: String,
}

impl FailingAppender {
    pub fn new(section: &str) -> Self {
        Self {
            section: section.to_string(),
        }
    }
}

impl Plugin for FailingAppender {
    fn section(&self) -> &str {
        &self.section
    }

    fn kind(&self) -> &str {
        "FailingAppender"
    }
}

impl AppenderPlugin for FailingAppender {
    fn process(&self, _suspect: &mut Suspect, _decision: ActionCode) -> anyhow::Result<()> {
        anyhow::bail!("archive unavailable")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    HealthCheck,
    Commit,
    Reject(String),
    Defer(String),
    Discard(String),
    EndSession,
}

/// Protocol handler that serves queued suspects and records every reply.
pub struct RecordingProtocol {
    queue: VecDeque<anyhow::Result<Incoming>>,
    calls: Vec<Call>,
    committed: Vec<Vec<(String, String)>>,
    pending_removed: bool,
    pub fail_commit: bool,
    pub fail_reject: bool,
    pub keep_connection: bool,
    pub port: Option<u16>,
}

impl RecordingProtocol {
    pub fn with_suspects(suspects: Vec<Suspect>) -> Self {
        Self {
            queue: suspects.into_iter().map(|s| Ok(Incoming::Suspect(s))).collect(),
            calls: Vec::new(),
            committed: Vec::new(),
            pending_removed: false,
            fail_commit: false,
            fail_reject: false,
            keep_connection: true,
            port: None,
        }
    }

    pub fn push_error_front(&mut self, error: anyhow::Error) {
        self.queue.push_front(Err(error));
    }

    pub fn push_health_check_front(&mut self) {
        self.queue.push_front(Ok(Incoming::HealthCheck));
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    /// Added headers of every committed message.
    pub fn committed(&self) -> &[Vec<(String, String)>] {
        &self.committed
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    pub fn pending_removed(&self) -> bool {
        self.pending_removed
    }
}

impl ProtocolHandler for RecordingProtocol {
    fn get_next_suspect(&mut self) -> anyhow::Result<Option<Incoming>> {
        self.queue.pop_front().transpose()
    }

    fn health_check_reply(&mut self) -> anyhow::Result<()> {
        self.calls.push(Call::HealthCheck);
        Ok(())
    }

    fn commit_back(&mut self, suspect: &Suspect) -> anyhow::Result<()> {
        self.calls.push(Call::Commit);
        if self.fail_commit {
            anyhow::bail!("broken pipe");
        }
        self.committed.push(suspect.added_headers().to_vec());
        Ok(())
    }

    fn reject(&mut self, message: &str) -> anyhow::Result<()> {
        self.calls.push(Call::Reject(message.to_string()));
        if self.fail_reject {
            anyhow::bail!("broken pipe");
        }
        Ok(())
    }

    fn defer(&mut self, message: &str) -> anyhow::Result<()> {
        self.calls.push(Call::Defer(message.to_string()));
        Ok(())
    }

    fn discard(&mut self, message: &str) -> anyhow::Result<()> {
        self.calls.push(Call::Discard(message.to_string()));
        Ok(())
    }

    fn end_session(&mut self) -> anyhow::Result<()> {
        self.calls.push(Call::EndSession);
        Ok(())
    }

    fn keep_connection(&self) -> bool {
        self.keep_connection
    }

    fn incoming_port(&self) -> Option<u16> {
        self.port
    }

    fn remove_pending_tempfile(&mut self) {
        self.pending_removed = true;
    }
}

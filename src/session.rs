//! Per-connection message loop.
//!
//! A `SessionHandler` owns one protocol connection and handles the messages
//! arriving on it one after the other: prependers, scanners, the protocol
//! reply, appenders and temp file cleanup. Plugin failures are contained by
//! the invoker; everything else that goes wrong defers the current message
//! and closes the connection.

use crate::config::{AddressComplianceFailAction, Config};
use crate::disposition::{ActionCode, Disposition};
use crate::invoker::PluginInvoker;
use crate::pipeline::PipelineRunner;
use crate::plugin::PluginSet;
use crate::prepender::{PrependerStage, SessionPlugins};
use crate::statistics::{StatEvent, StatisticsCollector};
use crate::suspect::{Cleanup, Suspect, SuspectError};
use crate::timing::{StageKind, TimingTracker};
use crate::trash::Trash;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

pub const SCANTIME_TAG: &str = "scanmill.scantime";
pub const INCOMING_PORT_TAG: &str = "incomingport";
pub const NO_APPENDERS_TAG: &str = "noappenders";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Receiving,
    Prepending,
    Scanning,
    Deciding,
    Finalizing,
    CleaningUp,
    Closed,
}

/// What the protocol layer produced for the next loop iteration.
#[derive(Debug)]
pub enum Incoming {
    Suspect(Suspect),
    HealthCheck,
}

/// Transport side of a session. All calls may block.
pub trait ProtocolHandler {
    /// `Ok(None)` once the connection has no more messages.
    fn get_next_suspect(&mut self) -> anyhow::Result<Option<Incoming>>;

    fn health_check_reply(&mut self) -> anyhow::Result<()>;

    /// Hand the (possibly modified) message back to the MTA.
    fn commit_back(&mut self, suspect: &Suspect) -> anyhow::Result<()>;

    fn reject(&mut self, message: &str) -> anyhow::Result<()>;

    fn defer(&mut self, message: &str) -> anyhow::Result<()>;

    fn discard(&mut self, message: &str) -> anyhow::Result<()>;

    fn end_session(&mut self) -> anyhow::Result<()>;

    /// Checked after every message.
    fn keep_connection(&self) -> bool;

    fn incoming_port(&self) -> Option<u16> {
        None
    }

    /// Temp storage of a message whose suspect could not be built.
    fn pending_tempfile(&self) -> Option<PathBuf> {
        None
    }

    fn remove_pending_tempfile(&mut self) {}
}

/// Per-message variables; a fresh one is built for every message.
#[derive(Debug, Default)]
struct MessageContext {
    action: ActionCode,
    message: Option<String>,
    decided_by: Option<String>,
    scantime: f64,
    deferred: bool,
}

enum Step {
    Handled,
    HealthCheck,
    Exhausted,
}

pub struct SessionHandler<P: ProtocolHandler> {
    protocol: P,
    config: Arc<Config>,
    plugins: Arc<PluginSet>,
    stats: Arc<StatisticsCollector>,
    trash: Option<Trash>,
    timer: TimingTracker,
    state: SessionState,
}

impl<P: ProtocolHandler> SessionHandler<P> {
    pub fn new(
        protocol: P,
        config: Arc<Config>,
        plugins: Arc<PluginSet>,
        stats: Arc<StatisticsCollector>,
    ) -> Self {
        let timer = TimingTracker::new(config.main.scantimelogger).with_port(protocol.incoming_port());
        let trash = Trash::from_config(&config.main);
        SessionHandler {
            protocol,
            config,
            plugins,
            stats,
            trash,
            timer,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn into_protocol(self) -> P {
        self.protocol
    }

    /// Handle messages until the connection is exhausted or must be dropped.
    pub fn handle_session(&mut self) {
        let mut keep_connection = true;
        let mut count: usize = 0;

        while keep_connection {
            count += 1;
            let prefix = format!("(#{count})");
            self.state = SessionState::Receiving;
            self.timer.reset();
            self.timer.track("SessionHandler-Setup", StageKind::Overhead);

            let mut slot: Option<Suspect> = None;
            let failed = match self.handle_message(&prefix, &mut slot) {
                Ok(Step::Handled) | Ok(Step::HealthCheck) => false,
                Ok(Step::Exhausted) => {
                    log::debug!("{prefix} No suspect retrieved, ending session");
                    count -= 1;
                    break;
                }
                Err(e) => {
                    if !self.handle_error(&prefix, e) {
                        // might end in an infinite loop otherwise
                        keep_connection = false;
                    }
                    true
                }
            };

            self.finish_message(&prefix, slot, failed);

            if keep_connection {
                keep_connection = self.protocol.keep_connection();
            }
            self.state = SessionState::Idle;
            log::debug!("{prefix} Message finished");
        }

        if let Err(e) = self.protocol.end_session() {
            log::debug!("Could not end session cleanly: {e:#}");
        }
        if count > 1 {
            log::info!("Session finished handling multiple suspects ({count}) in same connection");
        }
        self.state = SessionState::Closed;
    }

    fn handle_message(&mut self, prefix: &str, slot: &mut Option<Suspect>) -> anyhow::Result<Step> {
        let suspect = match self.protocol.get_next_suspect()? {
            None => return Ok(Step::Exhausted),
            Some(Incoming::HealthCheck) => {
                log::debug!("{prefix} Health check retrieved");
                self.protocol.health_check_reply()?;
                return Ok(Step::HealthCheck);
            }
            Some(Incoming::Suspect(suspect)) => slot.insert(suspect),
        };

        self.timer.track("Message-Receive-Suspect", StageKind::Overhead);
        self.stats.record_event(StatEvent::MessageIn);

        if suspect.recipients.len() != 1 {
            log::warn!(
                "{prefix} Notice: Message from {} has {} recipients. Plugins supporting only one recipient will see: {}",
                suspect.from_address,
                suspect.recipients.len(),
                suspect.to_address().unwrap_or_default()
            );
        }
        log::debug!(
            "{prefix} Message from {} to {}: {} bytes stored to {}",
            suspect.from_address,
            suspect.to_address().unwrap_or_default(),
            suspect.size,
            suspect.tempfile_name()
        );
        if let Some(port) = self.protocol.incoming_port() {
            suspect.set_tag(INCOMING_PORT_TAG, i64::from(port));
        }

        let plugins = Arc::clone(&self.plugins);

        self.state = SessionState::Prepending;
        let lists = PrependerStage::new(&plugins.prependers).run(suspect, &plugins, &mut self.timer);

        self.state = SessionState::Scanning;
        let mut ctx = MessageContext::default();
        let started = Instant::now();
        let outcome = PipelineRunner::new(self.trash.as_ref()).run(&lists.scanners, suspect, &mut self.timer);
        ctx.action = outcome.action;
        ctx.message = outcome.message;
        ctx.decided_by = outcome.decided_by;

        ctx.scantime = self.add_headers(suspect, started);

        let template = &self.config.main.logtemplate;
        if !template.trim().is_empty() {
            log::info!("{}", suspect.log_format(template));
        }
        log::debug!("{suspect}");
        self.timer.track("Debug-Suspect", StageKind::Overhead);

        self.state = SessionState::Deciding;
        self.dispatch(suspect, &mut ctx)?;

        self.state = SessionState::Finalizing;
        self.run_appenders(suspect, &lists, &ctx);

        self.state = SessionState::CleaningUp;
        if suspect.cleanup() == Cleanup::Removed {
            self.timer.track("Remove-tempfile", StageKind::Overhead);
        }
        Ok(Step::Handled)
    }

    /// Returns the scan duration in seconds.
    fn add_headers(&mut self, suspect: &mut Suspect, scan_started: Instant) -> f64 {
        let main = &self.config.main;
        let prefix = &main.prependaddedheaders;

        if main.spamstatusheader {
            let status = if suspect.is_spam() { "YES" } else { "NO" };
            suspect.add_header(format!("{prefix}Spamstatus"), status);
        }

        let scantime = scan_started.elapsed().as_secs_f64();
        suspect.set_tag(SCANTIME_TAG, format!("{scantime:.4}"));

        if main.debuginfoheader {
            let debuginfo = suspect.to_string();
            suspect.add_header(format!("{prefix}Debuginfo"), debuginfo);
        }
        if main.suspectidheader {
            let id = suspect.id.clone();
            suspect.add_header(format!("{prefix}Suspect"), id);
        }
        self.timer.track("Adding-Headers", StageKind::Overhead);
        scantime
    }

    /// Send the decision to the protocol layer.
    fn dispatch(&mut self, suspect: &Suspect, ctx: &mut MessageContext) -> anyhow::Result<()> {
        match ctx.action.disposition() {
            Some(Disposition::Accept) | Some(Disposition::NoOpinion) => {
                match self.protocol.commit_back(suspect) {
                    Ok(()) => {
                        self.timer.track("Commitback", StageKind::Overhead);
                        self.stats.record_event(StatEvent::MessageOut);
                        self.timer.track("Increase-Stats", StageKind::Overhead);
                    }
                    Err(e) => {
                        ctx.deferred = true;
                        log::error!("{}: Could not commit message. Error: {e:#}", suspect.id);
                        self.defer_quietly(None);
                    }
                }
            }
            Some(Disposition::Delete) => {
                log::info!("MESSAGE DELETED: {}", suspect.id);
                let reply = ctx
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("OK: ({})", suspect.id));
                self.protocol.discard(&reply)?;
            }
            Some(Disposition::Reject) => {
                let reply = format!(
                    "{} ({})",
                    ctx.message.as_deref().unwrap_or("Rejected by content scanner"),
                    suspect.id
                );
                self.protocol.reject(&reply)?;
            }
            Some(Disposition::Defer) => {
                ctx.deferred = true;
                self.defer_quietly(ctx.message.as_deref());
            }
            None => {
                log::error!("{}: Invalid Message action Code: {}. Using DEFER", suspect.id, ctx.action.raw());
                ctx.deferred = true;
                self.defer_quietly(None);
            }
        }
        Ok(())
    }

    fn run_appenders(&mut self, suspect: &mut Suspect, lists: &SessionPlugins, ctx: &MessageContext) {
        if ctx.deferred {
            log::warn!("DEFERRED {}", suspect.id);
            return;
        }

        self.stats.record_event(StatEvent::scanned(suspect, ctx.scantime));
        self.timer.track("Increase-Counters", StageKind::Overhead);

        if suspect.tag_bool(NO_APPENDERS_TAG) {
            log::info!("{}: Skipping all appenders (noappenders tag)", suspect.id);
            return;
        }
        self.timer.track("Before-Appenders", StageKind::Overhead);
        for appender in &lists.appenders {
            PluginInvoker::append(appender.as_ref(), suspect, ctx.action, &mut self.timer);
        }
        if let Some(decided_by) = &ctx.decided_by {
            log::debug!("{}: decision {} by {decided_by}", suspect.id, ctx.action);
        }
    }

    /// Returns whether the connection may be kept.
    fn handle_error(&mut self, prefix: &str, e: anyhow::Error) -> bool {
        match e.downcast_ref::<SuspectError>() {
            Some(err) if err.is_address_error() => {
                log::warn!("{prefix} Invalid send/receive address -> {err}");
                let message = self.config.main.address_compliance_fail_message.clone();
                match self.config.main.address_compliance_fail_action {
                    AddressComplianceFailAction::Defer => self.defer_quietly(Some(&message)),
                    AddressComplianceFailAction::Reject => self.reject_quietly(Some(&message)),
                    AddressComplianceFailAction::Discard => self.discard_quietly(Some(&message)),
                }
                true
            }
            _ => {
                log::error!("{prefix} Exception {e:#}");
                self.defer_quietly(None);
                false
            }
        }
    }

    /// Temp file policy for a failed message, then timings.
    fn finish_message(&mut self, prefix: &str, suspect: Option<Suspect>, failed: bool) {
        let remove_tmpfiles = self.config.main.remove_tmpfiles_on_error;
        match suspect {
            None if failed => {
                let pending = self.protocol.pending_tempfile();
                if remove_tmpfiles {
                    if let Some(path) = &pending {
                        log::debug!("{prefix} Remove tmpfile: {} for failed message", path.display());
                    }
                    self.protocol.remove_pending_tempfile();
                } else {
                    match pending {
                        Some(path) => log::warn!("{prefix} Keep tmpfile: {} for failed message", path.display()),
                        None => log::warn!("{prefix} No tmpfile to keep for failed message"),
                    }
                }
            }
            None => {}
            Some(mut suspect) => {
                if failed && !suspect.is_cleaned() {
                    if remove_tmpfiles {
                        suspect.cleanup();
                    } else {
                        log::warn!("{prefix} Keep tempfile {} for failed message", suspect.tempfile_name());
                    }
                }
                self.timer.report(&suspect.id, false);
            }
        }
    }

    fn defer_quietly(&mut self, message: Option<&str>) {
        let message = message.unwrap_or("internal problem - message deferred");
        if let Err(e) = self.protocol.defer(message) {
            log::debug!("defer failed: {e:#}");
        }
    }

    fn reject_quietly(&mut self, message: Option<&str>) {
        let message = message.unwrap_or("internal problem - reject");
        if let Err(e) = self.protocol.reject(message) {
            log::debug!("reject failed: {e:#}");
        }
    }

    fn discard_quietly(&mut self, message: Option<&str>) {
        let message = message.unwrap_or("internal problem - discard");
        if let Err(e) = self.protocol.discard(message) {
            log::debug!("discard failed: {e:#}");
        }
    }
}

//! Milter front end.
//!
//! indymilter drives the async side. Every connection gets its own session
//! thread for as long as the MTA keeps it open, and finished messages cross
//! over on an mpsc channel. The session answers each one on a oneshot.

use crate::config::Config;
use crate::plugin::PluginSet;
use crate::session::{Incoming, ProtocolHandler, SessionHandler};
use crate::statistics::StatisticsCollector;
use crate::suspect::{MessageSource, Suspect};
use indymilter::{
    run, Actions, Callbacks, Config as IndyConfig, ContextActions, SetErrorReply, Status,
};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot};

/// A finished message waiting for a verdict.
#[derive(Debug)]
pub struct MilterRequest {
    pub sender: String,
    pub recipients: Vec<String>,
    pub message: Vec<u8>,
    pub reply: oneshot::Sender<MilterReply>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MilterVerdict {
    Accept,
    Reject,
    Tempfail,
    Discard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MilterReply {
    pub verdict: MilterVerdict,
    pub message: Option<String>,
    /// Only set on accept.
    pub headers: Vec<(String, String)>,
}

impl MilterReply {
    fn without_headers(verdict: MilterVerdict, message: &str) -> Self {
        MilterReply {
            verdict,
            message: Some(message.to_string()),
            headers: Vec::new(),
        }
    }

    fn status(&self) -> Status {
        match self.verdict {
            MilterVerdict::Accept => Status::Accept,
            MilterVerdict::Reject => Status::Reject,
            MilterVerdict::Tempfail => Status::Tempfail,
            MilterVerdict::Discard => Status::Discard,
        }
    }

    /// SMTP reply code, enhanced status code and text for reject and tempfail.
    pub fn error_reply(&self) -> Option<(&'static str, &'static str, String)> {
        let (rcode, xcode) = match self.verdict {
            MilterVerdict::Reject => ("550", "5.7.1"),
            MilterVerdict::Tempfail => ("451", "4.7.1"),
            MilterVerdict::Accept | MilterVerdict::Discard => return None,
        };
        let text = self.message.as_deref().filter(|m| !m.trim().is_empty())?;
        Some((rcode, xcode, reply_text(text)))
    }
}

/// One reply line: no CR/LF, at most `MAX_REPLY_TEXT` bytes.
fn reply_text(message: &str) -> String {
    let mut text: String = message
        .chars()
        .map(|c| if c == '\r' || c == '\n' || c == '\0' { ' ' } else { c })
        .collect();
    if text.len() > MAX_REPLY_TEXT {
        let mut end = MAX_REPLY_TEXT;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

const MAX_REPLY_TEXT: usize = 900;

/// Session side of one milter connection.
pub struct MilterProtocolHandler {
    requests: mpsc::Receiver<MilterRequest>,
    pending: Option<oneshot::Sender<MilterReply>>,
    client: String,
}

impl MilterProtocolHandler {
    pub fn new(requests: mpsc::Receiver<MilterRequest>, client: impl Into<String>) -> Self {
        MilterProtocolHandler {
            requests,
            pending: None,
            client: client.into(),
        }
    }

    fn answer(&mut self, reply: MilterReply) -> anyhow::Result<()> {
        let Some(pending) = self.pending.take() else {
            anyhow::bail!("no message pending on connection from {}", self.client);
        };
        pending
            .send(reply)
            .map_err(|_| anyhow::anyhow!("milter connection from {} went away", self.client))
    }
}

impl ProtocolHandler for MilterProtocolHandler {
    fn get_next_suspect(&mut self) -> anyhow::Result<Option<Incoming>> {
        let Some(request) = self.requests.blocking_recv() else {
            return Ok(None);
        };
        // the reply slot must exist before the suspect can fail to build
        self.pending = Some(request.reply);
        let suspect = Suspect::new(
            request.sender,
            request.recipients,
            MessageSource::Buffer(request.message),
        )?;
        Ok(Some(Incoming::Suspect(suspect)))
    }

    fn health_check_reply(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn commit_back(&mut self, suspect: &Suspect) -> anyhow::Result<()> {
        self.answer(MilterReply {
            verdict: MilterVerdict::Accept,
            message: None,
            headers: suspect.added_headers().to_vec(),
        })
    }

    fn reject(&mut self, message: &str) -> anyhow::Result<()> {
        self.answer(MilterReply::without_headers(MilterVerdict::Reject, message))
    }

    fn defer(&mut self, message: &str) -> anyhow::Result<()> {
        self.answer(MilterReply::without_headers(MilterVerdict::Tempfail, message))
    }

    fn discard(&mut self, message: &str) -> anyhow::Result<()> {
        self.answer(MilterReply::without_headers(MilterVerdict::Discard, message))
    }

    fn end_session(&mut self) -> anyhow::Result<()> {
        log::debug!("Milter session for {} closed", self.client);
        Ok(())
    }

    fn keep_connection(&self) -> bool {
        true
    }
}

/// Message being received on a connection.
#[derive(Debug, Default)]
struct Envelope {
    sender: String,
    recipients: Vec<String>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

struct ConnState {
    requests: mpsc::Sender<MilterRequest>,
    envelope: Envelope,
}

fn strip_brackets(address: &str) -> String {
    address
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}

/// Run a session for one connection on its own thread.
///
/// Milter connections stay open across messages, so the session lives as
/// long as the connection does.
pub fn spawn_session<P>(
    protocol: P,
    client: &str,
    config: Arc<Config>,
    plugins: Arc<PluginSet>,
    stats: Arc<StatisticsCollector>,
) -> std::io::Result<JoinHandle<()>>
where
    P: ProtocolHandler + Send + 'static,
{
    thread::Builder::new()
        .name(format!("session-{client}"))
        .spawn(move || {
            SessionHandler::new(protocol, config, plugins, stats).handle_session();
        })
}

/// Rebuild the raw message from the header callbacks and body chunks.
pub fn assemble_message(headers: &[(String, String)], body: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(body.len() + headers.len() * 64);
    for (name, value) in headers {
        message.extend_from_slice(name.as_bytes());
        message.extend_from_slice(b": ");
        message.extend_from_slice(value.as_bytes());
        message.extend_from_slice(b"\r\n");
    }
    message.extend_from_slice(b"\r\n");
    message.extend_from_slice(body);
    message
}

pub struct MilterConnector {
    config: Arc<Config>,
    plugins: Arc<PluginSet>,
    stats: Arc<StatisticsCollector>,
}

impl MilterConnector {
    pub fn new(config: Arc<Config>, plugins: Arc<PluginSet>, stats: Arc<StatisticsCollector>) -> Self {
        MilterConnector {
            config,
            plugins,
            stats,
        }
    }

    pub async fn run(&self, socket_path: &str) -> anyhow::Result<()> {
        log::info!("Starting milter on: {}", socket_path);
        // Remove existing socket if it exists
        if std::path::Path::new(socket_path).exists() {
            std::fs::remove_file(socket_path)?;
        }

        let listener = UnixListener::bind(socket_path)?;
        let config = self.config.clone();
        let plugins = self.plugins.clone();
        let stats = self.stats.clone();

        let callbacks: Callbacks<ConnState> = Callbacks {
            connect: Some(Box::new(move |ctx: &mut indymilter::Context<ConnState>, hostname, _addr| {
                let config = config.clone();
                let plugins = plugins.clone();
                let stats = stats.clone();
                Box::pin(async move {
                    let client = hostname.to_string_lossy().to_string();
                    log::debug!("Connection from: {}", client);

                    let (tx, rx) = mpsc::channel(1);
                    let protocol = MilterProtocolHandler::new(rx, client.clone());
                    if let Err(e) = spawn_session(protocol, &client, config, plugins, stats) {
                        log::error!("Cannot start session for {}: {}", client, e);
                        return Status::Tempfail;
                    }
                    ctx.data = Some(ConnState {
                        requests: tx,
                        envelope: Envelope::default(),
                    });
                    Status::Continue
                })
            })),

            mail: Some(Box::new(move |ctx: &mut indymilter::Context<ConnState>, args| {
                Box::pin(async move {
                    let sender = args
                        .first()
                        .map(|s| strip_brackets(&s.to_string_lossy()))
                        .unwrap_or_default();
                    log::debug!("Mail from: {}", sender);
                    if let Some(conn) = ctx.data.as_mut() {
                        conn.envelope = Envelope {
                            sender,
                            ..Default::default()
                        };
                    }
                    Status::Continue
                })
            })),

            rcpt: Some(Box::new(move |ctx: &mut indymilter::Context<ConnState>, args| {
                Box::pin(async move {
                    if let Some(recipient) = args.first().map(|s| strip_brackets(&s.to_string_lossy())) {
                        log::debug!("Rcpt to: {}", recipient);
                        if let Some(conn) = ctx.data.as_mut() {
                            conn.envelope.recipients.push(recipient);
                        }
                    }
                    Status::Continue
                })
            })),

            header: Some(Box::new(move |ctx: &mut indymilter::Context<ConnState>, name, value| {
                Box::pin(async move {
                    if let Some(conn) = ctx.data.as_mut() {
                        conn.envelope.headers.push((
                            name.to_string_lossy().to_string(),
                            value.to_string_lossy().to_string(),
                        ));
                    }
                    Status::Continue
                })
            })),

            body: Some(Box::new(move |ctx: &mut indymilter::Context<ConnState>, body_chunk| {
                Box::pin(async move {
                    if let Some(conn) = ctx.data.as_mut() {
                        conn.envelope.body.extend_from_slice(&body_chunk);
                    }
                    Status::Continue
                })
            })),

            eom: Some(Box::new(move |ctx: &mut indymilter::EomContext<ConnState>| {
                Box::pin(async move {
                    let Some(conn) = ctx.data.as_mut() else {
                        log::error!("End of message without connection state");
                        return Status::Tempfail;
                    };
                    let envelope = std::mem::take(&mut conn.envelope);
                    let requests = conn.requests.clone();

                    let (reply_tx, reply_rx) = oneshot::channel();
                    let request = MilterRequest {
                        sender: envelope.sender,
                        recipients: envelope.recipients,
                        message: assemble_message(&envelope.headers, &envelope.body),
                        reply: reply_tx,
                    };
                    if requests.send(request).await.is_err() {
                        log::error!("Session worker is gone, deferring message");
                        return Status::Tempfail;
                    }
                    let reply = match reply_rx.await {
                        Ok(reply) => reply,
                        Err(_) => {
                            log::error!("Session worker dropped the message, deferring");
                            return Status::Tempfail;
                        }
                    };

                    if let Some(message) = &reply.message {
                        log::info!("{:?}: {}", reply.verdict, message);
                    }
                    if let Some((rcode, xcode, text)) = reply.error_reply() {
                        if let Err(e) = ctx.reply.set_error_reply(rcode, Some(xcode), vec![text]) {
                            log::error!("Failed to set SMTP reply: {}", e);
                        }
                    }
                    for (name, value) in &reply.headers {
                        if let Err(e) = ctx.actions.add_header(name.clone(), value.clone()).await {
                            log::error!("Failed to add header {}: {}", name, e);
                        }
                    }
                    reply.status()
                })
            })),

            abort: Some(Box::new(move |ctx: &mut indymilter::Context<ConnState>| {
                Box::pin(async move {
                    if let Some(conn) = ctx.data.as_mut() {
                        conn.envelope = Envelope::default();
                    }
                    Status::Continue
                })
            })),

            close: Some(Box::new(move |ctx: &mut indymilter::Context<ConnState>| {
                Box::pin(async move {
                    // dropping the sender ends the session worker
                    ctx.data = None;
                    Status::Continue
                })
            })),

            ..Callbacks::new()
        };

        // Configure indymilter to enable ADD_HEADER action
        let config = IndyConfig {
            actions: Actions::ADD_HEADER,
            ..Default::default()
        };

        run(listener, callbacks, config, tokio::signal::ctrl_c()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disposition::{Disposition, Verdict};
    use crate::test_support::FnScanner;

    fn request(recipient: &str, subject: &str) -> (MilterRequest, oneshot::Receiver<MilterReply>) {
        let (reply, rx) = oneshot::channel();
        let headers = vec![("Subject".to_string(), subject.to_string())];
        let request = MilterRequest {
            sender: "alice@example.org".to_string(),
            recipients: vec![recipient.to_string()],
            message: assemble_message(&headers, b"body\r\n"),
            reply,
        };
        (request, rx)
    }

    fn start_session(rx: mpsc::Receiver<MilterRequest>, client: &str) -> JoinHandle<()> {
        let scanner = FnScanner::new("Subject", |s| {
            if s.header("Subject").as_deref() == Some("spam") {
                Ok(Some(Verdict::with_message(Disposition::Reject, "spam detected")))
            } else {
                Ok(None)
            }
        });
        let plugins = PluginSet::new(Vec::new(), vec![Arc::new(scanner)], Vec::new());
        let protocol = MilterProtocolHandler::new(rx, client);
        spawn_session(
            protocol,
            client,
            Arc::new(Config::default()),
            Arc::new(plugins),
            Arc::new(StatisticsCollector::in_memory()),
        )
        .unwrap()
    }

    #[test]
    fn test_pipelined_messages_on_one_connection() {
        let (tx, rx) = mpsc::channel(1);
        let worker = start_session(rx, "localhost");

        let (req, reply) = request("bob@example.net", "hello");
        tx.blocking_send(req).unwrap();
        let reply = reply.blocking_recv().unwrap();
        assert_eq!(reply.verdict, MilterVerdict::Accept);
        assert!(reply
            .headers
            .contains(&("X-Scanmill-Spamstatus".to_string(), "NO".to_string())));

        let (req, reply) = request("bob@example.net", "spam");
        tx.blocking_send(req).unwrap();
        let reply = reply.blocking_recv().unwrap();
        assert_eq!(reply.verdict, MilterVerdict::Reject);
        assert!(reply.message.unwrap().starts_with("spam detected ("));
        assert!(reply.headers.is_empty());

        drop(tx);
        worker.join().unwrap();
    }

    #[test]
    fn test_invalid_recipient_is_deferred() {
        let (tx, rx) = mpsc::channel(1);
        let worker = start_session(rx, "localhost");

        let (req, reply) = request("nobody", "hello");
        tx.blocking_send(req).unwrap();
        let reply = reply.blocking_recv().unwrap();
        assert_eq!(reply.verdict, MilterVerdict::Tempfail);
        assert_eq!(reply.message.as_deref(), Some("invalid sender or recipient address"));

        // connection survives the compliance failure
        let (req, reply) = request("bob@example.net", "hello");
        tx.blocking_send(req).unwrap();
        assert_eq!(reply.blocking_recv().unwrap().verdict, MilterVerdict::Accept);

        drop(tx);
        worker.join().unwrap();
    }

    #[test]
    fn test_idle_connection_does_not_block_others() {
        let (idle_tx, idle_rx) = mpsc::channel(1);
        let idle_worker = start_session(idle_rx, "idle.example");
        let (busy_tx, busy_rx) = mpsc::channel(1);
        let busy_worker = start_session(busy_rx, "busy.example");

        let (req, reply) = request("bob@example.net", "hello");
        busy_tx.blocking_send(req).unwrap();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            let _ = done_tx.send(reply.blocking_recv());
        });
        let reply = done_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("second connection was not served")
            .unwrap();
        assert_eq!(reply.verdict, MilterVerdict::Accept);

        drop(busy_tx);
        busy_worker.join().unwrap();
        drop(idle_tx);
        idle_worker.join().unwrap();
    }

    #[test]
    fn test_error_reply_text() {
        let reject = MilterReply::without_headers(MilterVerdict::Reject, "spam detected (abc)\r\nmore");
        assert_eq!(
            reject.error_reply(),
            Some(("550", "5.7.1", "spam detected (abc)  more".to_string()))
        );
        let defer = MilterReply::without_headers(MilterVerdict::Tempfail, "try later");
        assert_eq!(defer.error_reply().map(|(code, _, _)| code), Some("451"));
        let discard = MilterReply::without_headers(MilterVerdict::Discard, "OK: (abc)");
        assert_eq!(discard.error_reply(), None);

        let long = "x".repeat(2000);
        assert_eq!(reply_text(&long).len(), MAX_REPLY_TEXT);
    }

    #[test]
    fn test_reply_without_pending_message_fails() {
        let (_tx, rx) = mpsc::channel(1);
        let mut handler = MilterProtocolHandler::new(rx, "localhost");
        assert!(handler.defer("later").is_err());
    }

    #[test]
    fn test_assemble_message() {
        let headers = vec![
            ("From".to_string(), "alice@example.org".to_string()),
            ("Subject".to_string(), "hi".to_string()),
        ];
        let message = assemble_message(&headers, b"text");
        assert_eq!(message, b"From: alice@example.org\r\nSubject: hi\r\n\r\ntext".to_vec());
        assert_eq!(strip_brackets(" <bob@example.net> "), "bob@example.net");
        assert_eq!(strip_brackets("<>"), "");
    }
}

//! [`IrcTransport`]: the session-facing handle, and the I/O task behind it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Notify, mpsc};

use palaver_core::ServerConfig;
use palaver_core::error::TransportError;
use palaver_core::event::{Event, MemberSnapshot};
use palaver_core::transport::{EventSink, RosterSource, Transport, TransportFactory};

use crate::connect::{self, Connection};
use crate::irc::{self, Message};
use crate::protocol::Protocol;
use crate::roster::RosterCache;

const COMMAND_QUEUE: usize = 512;
const PING_INTERVAL: Duration = Duration::from_secs(60);
const PING_TIMEOUT: Duration = Duration::from_secs(120);
/// Longest line accepted from the server, tags included. Longer lines are dropped.
const MAX_LINE: usize = 8192;

/// Sender name used for notices the transport raises itself.
const LOCAL_ACTOR: &str = "palaver";

#[derive(Debug)]
enum Command {
    Line(String),
    Quit(String),
}

/// Handle to one IRC connection. Writes are queued to the I/O task.
#[derive(Debug)]
pub struct IrcTransport {
    commands: mpsc::Sender<Command>,
    roster: Arc<RosterCache>,
    closed: AtomicBool,
    /// Wakes the I/O task if the quit could not be queued.
    shutdown: Arc<Notify>,
}

impl IrcTransport {
    fn queue(&self, line: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.commands.try_send(Command::Line(line)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Io("send queue full".into()),
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    fn send(&self, msg: Message) -> Result<(), TransportError> {
        self.queue(msg.to_string())
    }
}

impl RosterSource for IrcTransport {
    fn roster(&self, channel: &str) -> Option<Vec<MemberSnapshot>> {
        self.roster.roster(channel)
    }
}

impl Transport for IrcTransport {
    fn send_message(&self, target: &str, text: &str) -> Result<(), TransportError> {
        for line in text.lines().filter(|l| !l.is_empty()) {
            self.send(Message::new("PRIVMSG", [target, line]))?;
        }
        Ok(())
    }

    fn send_raw_line(&self, line: &str) -> Result<(), TransportError> {
        let line = irc::sanitize(line.trim());
        if line.is_empty() {
            return Ok(());
        }
        self.queue(line.into_owned())
    }

    fn add_channel(&self, name: &str, key: Option<&str>) -> Result<(), TransportError> {
        match key {
            Some(key) => self.send(Message::new("JOIN", [name, key])),
            None => self.send(Message::new("JOIN", [name])),
        }
    }

    fn remove_channel(&self, name: &str, reason: Option<&str>) -> Result<(), TransportError> {
        match reason {
            Some(reason) => self.send(Message::new("PART", [name, reason])),
            None => self.send(Message::new("PART", [name])),
        }
    }

    fn disconnect(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.commands.try_send(Command::Quit(reason.to_string())).is_err() {
            self.shutdown.notify_one();
        }
    }
}

/// Opens [`IrcTransport`]s.
#[derive(Debug, Default, Clone)]
pub struct IrcTransportFactory;

impl IrcTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for IrcTransportFactory {
    async fn connect(&self, config: &ServerConfig, events: EventSink) -> Result<Arc<dyn Transport>, TransportError> {
        let established = connect::establish(config).await?;
        if let Some(fingerprint) = &established.unverified_fingerprint {
            tracing::warn!(host = %config.hostname, %fingerprint, "accepted unverified certificate");
            events
                .deliver(Event::Notice {
                    channel: None,
                    actor: LOCAL_ACTOR.to_string(),
                    text: format!("Unverified certificate accepted, SHA-256 {fingerprint}"),
                })
                .await;
        }

        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let roster = Arc::new(RosterCache::default());
        let shutdown = Arc::new(Notify::new());
        let transport = Arc::new(IrcTransport {
            commands: tx,
            roster: roster.clone(),
            closed: AtomicBool::new(false),
            shutdown: shutdown.clone(),
        });

        let io = IoTask {
            protocol: Protocol::new(config),
            roster,
            events,
            commands: rx,
            shutdown,
        };
        let host = config.hostname.clone();
        tokio::spawn(async move {
            let events = io.events.clone();
            let result = match established.connection {
                Connection::Plain(stream) => {
                    let (reader, writer) = tokio::io::split(stream);
                    io.run(BufReader::new(reader), writer).await
                }
                Connection::Tls(stream) => {
                    let (reader, writer) = tokio::io::split(stream);
                    io.run(BufReader::new(reader), writer).await
                }
            };
            let reason = match result {
                Ok(reason) => reason,
                Err(e) => {
                    tracing::error!(%host, error = %e, "connection failed");
                    Some(e.to_string())
                }
            };
            tracing::info!(%host, reason = reason.as_deref().unwrap_or("closed"), "connection ended");
            events.deliver(Event::ConnectionEnded { reason }).await;
        });

        Ok(transport)
    }
}

struct IoTask {
    protocol: Protocol,
    roster: Arc<RosterCache>,
    events: EventSink,
    commands: mpsc::Receiver<Command>,
    shutdown: Arc<Notify>,
}

/// Why the loop stopped.
enum Stop {
    Local,
    Remote(Option<String>),
}

impl IoTask {
    /// Drive one connection until either side closes it. Returns the reason
    /// reported to the session, if any.
    async fn run<R, W>(mut self, mut reader: R, mut writer: W) -> Result<Option<String>>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        for msg in self.protocol.preamble() {
            write_line(&mut writer, &msg.to_string()).await?;
        }

        let mut lines = LineReader::default();
        let mut last_activity = tokio::time::Instant::now();
        let mut last_ping = last_activity;

        let stop = loop {
            tokio::select! {
                biased;

                cmd = self.commands.recv() => match cmd {
                    Some(Command::Line(line)) => write_line(&mut writer, &line).await?,
                    Some(Command::Quit(reason)) => {
                        write_line(&mut writer, &Message::new("QUIT", [reason.as_str()]).to_string()).await?;
                        break Stop::Local;
                    }
                    None => break Stop::Local,
                },
                _ = self.shutdown.notified() => {
                    let _ = write_line(&mut writer, "QUIT").await;
                    break Stop::Local;
                }
                read = lines.next(&mut reader) => {
                    let Some(line) = read? else {
                        break Stop::Remote(Some("Connection closed by server".to_string()));
                    };
                    last_activity = tokio::time::Instant::now();
                    let Some(msg) = line.as_deref().and_then(Message::parse) else { continue };

                    let out = self.protocol.handle(&msg, &self.roster);
                    for reply in &out.lines {
                        write_line(&mut writer, &reply.to_string()).await?;
                    }
                    for event in out.events {
                        tracing::debug!(event = event.name(), "inbound");
                        if !self.events.deliver(event).await {
                            tracing::debug!("event sink closed");
                            let _ = write_line(&mut writer, "QUIT").await;
                            break;
                        }
                    }
                    if !self.events.is_active() {
                        break Stop::Local;
                    }
                    if let Some(reason) = out.close {
                        break Stop::Remote(Some(reason));
                    }
                }
                _ = tokio::time::sleep_until(last_ping.max(last_activity) + PING_INTERVAL) => {
                    if last_activity.elapsed() > PING_TIMEOUT {
                        break Stop::Remote(Some("Ping timeout".to_string()));
                    }
                    write_line(&mut writer, "PING :keepalive").await?;
                    last_ping = tokio::time::Instant::now();
                }
            }
        };

        let _ = writer.shutdown().await;
        Ok(match stop {
            Stop::Local => None,
            Stop::Remote(reason) => reason,
        })
    }
}

/// Splits the inbound stream into lines. Bytes that aren't UTF-8 are
/// replaced rather than failing the read. Progress lives in `buf`, so
/// dropping a pending `next` inside `select!` loses nothing.
#[derive(Default)]
struct LineReader {
    buf: Vec<u8>,
    overlong: bool,
}

impl LineReader {
    /// `Ok(None)` at end of stream, `Ok(Some(None))` for a dropped overlong line.
    async fn next<R: AsyncBufRead + Unpin>(&mut self, reader: &mut R) -> std::io::Result<Option<Option<String>>> {
        loop {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(None);
            }
            let (used, done) = match available.iter().position(|&b| b == b'\n') {
                Some(i) => (i + 1, true),
                None => (available.len(), false),
            };
            if !self.overlong {
                if self.buf.len() + used > MAX_LINE {
                    self.overlong = true;
                    self.buf.clear();
                } else {
                    self.buf.extend_from_slice(&available[..used]);
                }
            }
            reader.consume(used);
            if done {
                if std::mem::take(&mut self.overlong) {
                    tracing::warn!(max = MAX_LINE, "dropping overlong line");
                    return Ok(Some(None));
                }
                let line = String::from_utf8_lossy(&self.buf).into_owned();
                self.buf.clear();
                return Ok(Some(Some(line)));
            }
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    tracing::trace!(line, "send");
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;
    Ok(())
}

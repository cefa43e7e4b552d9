//! The connection session: one worker task that owns all state.
//!
//! [`ConnectionSession`] is a cheap handle. Every call becomes a [`Request`]
//! on a bounded queue; a single worker task drains that queue and is the
//! only code that mutates [`SessionState`]. Transport events, user commands
//! and sequencer steps all funnel through the same queue, so they are
//! applied one at a time in arrival order.
//!
//! Each connect attempt gets a new generation number. Events and sequencer
//! steps carry the generation they were produced for, and anything tagged
//! with a generation other than the live one is dropped.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::bus::MessageBus;
use crate::command::{CommandIntent, with_channel_sigil};
use crate::config::{ServerConfig, SessionOptions};
use crate::dispatch::{self, Context, Local, Plan};
use crate::error::{ReduceError, SessionError, TransportError};
use crate::event::{Event, MemberSnapshot};
use crate::message::{Message, MessageKind};
use crate::reducer::{self, Effect, SessionState};
use crate::roster::{Channel, ChannelKind};
use crate::sequencer::{self, ScriptLine, Step};
use crate::transport::{EventSink, Outbound, RosterSource, Transport, TransportFactory};

pub use crate::reducer::ConnectionState;

/// Sender name used for client-generated lines.
const SYSTEM_SENDER: &str = "palaver";

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// What a submitted intent asks of the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Done,
    /// The user asked to clear the current buffer.
    Clear,
}

pub(crate) enum Request {
    Inbound {
        generation: u64,
        event: Event,
    },
    TransportReady {
        generation: u64,
        result: Result<Arc<dyn Transport>, TransportError>,
    },
    Automation {
        generation: u64,
        step: Step,
        token: CancellationToken,
    },
    Connect(Reply<()>),
    Disconnect {
        reason: String,
        reply: Reply<()>,
    },
    Send {
        op: Outbound,
        reply: Reply<()>,
    },
    SendMessage {
        target: String,
        text: String,
        reply: Reply<()>,
    },
    UpdateConfig {
        config: Box<ServerConfig>,
        reply: Reply<()>,
    },
    Submit {
        intent: CommandIntent,
        context: Context,
        reply: Reply<Submitted>,
    },
    MarkRead {
        channel: String,
    },
    Channels(Reply<Vec<Channel>>),
}

/// Handle to one server connection.
///
/// Clones share the same worker. The worker shuts down, closing any live
/// transport, when the last handle is dropped.
#[derive(Clone)]
pub struct ConnectionSession {
    tx: mpsc::Sender<Request>,
    bus: MessageBus,
    state: watch::Receiver<ConnectionState>,
    nickname: watch::Receiver<String>,
    _shutdown: Arc<DropGuard>,
}

impl ConnectionSession {
    /// Spawn the session worker. Must be called inside a tokio runtime.
    pub fn new(config: ServerConfig, factory: Arc<dyn TransportFactory>, options: SessionOptions) -> Self {
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let bus = MessageBus::new(options.bus_capacity);
        let state = SessionState::new(&config.nickname, &config.server_name);
        let (state_tx, state_rx) = watch::channel(state.connection.clone());
        let (nick_tx, nick_rx) = watch::channel(state.nickname.clone());
        let shutdown = CancellationToken::new();

        let worker = Worker {
            config,
            options,
            factory,
            state,
            bus: bus.clone(),
            tx: tx.downgrade(),
            generation: 0,
            pending: None,
            link: None,
            sequencer: None,
            state_tx,
            nick_tx,
        };
        tokio::spawn(worker.run(rx, shutdown.clone()));

        Self {
            tx,
            bus,
            state: state_rx,
            nickname: nick_rx,
            _shutdown: Arc::new(shutdown.drop_guard()),
        }
    }

    /// Start connecting. Returns once the attempt is under way; watch
    /// [`Self::state`] for the outcome.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.call(Request::Connect).await
    }

    /// Tear down the connection. Valid in every state.
    pub async fn disconnect(&self, reason: &str) -> Result<(), SessionError> {
        let reason = reason.to_string();
        self.call(|reply| Request::Disconnect { reason, reply }).await
    }

    /// Send a PRIVMSG and log it locally as our own message.
    pub async fn send_message(&self, target: &str, text: &str) -> Result<(), SessionError> {
        let (target, text) = (target.to_string(), text.to_string());
        self.call(|reply| Request::SendMessage { target, text, reply }).await
    }

    pub async fn send_raw(&self, line: &str) -> Result<(), SessionError> {
        self.send(Outbound::raw(line)).await
    }

    pub async fn join(&self, channel: &str) -> Result<(), SessionError> {
        self.send(Outbound::Join { channel: with_channel_sigil(channel), key: None }).await
    }

    pub async fn part(&self, channel: &str) -> Result<(), SessionError> {
        self.send(Outbound::Part { channel: channel.to_string(), reason: None }).await
    }

    /// Replace the configuration. Takes effect on the next connect.
    pub async fn update_config(&self, config: ServerConfig) -> Result<(), SessionError> {
        let config = Box::new(config);
        self.call(|reply| Request::UpdateConfig { config, reply }).await
    }

    /// Execute a parsed command typed in `context`.
    pub async fn submit(&self, intent: CommandIntent, context: Context) -> Result<Submitted, SessionError> {
        self.call(|reply| Request::Submit { intent, context, reply }).await
    }

    pub async fn mark_read(&self, channel: &str) -> Result<(), SessionError> {
        self.tx
            .send(Request::MarkRead { channel: channel.to_string() })
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Snapshot of every buffer, in name order.
    pub async fn channels(&self) -> Result<Vec<Channel>, SessionError> {
        self.call(Request::Channels).await
    }

    pub async fn channel(&self, name: &str) -> Result<Option<Channel>, SessionError> {
        Ok(self.channels().await?.into_iter().find(|c| c.name == name))
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// A receiver that is notified on every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn current_nickname(&self) -> String {
        self.nickname.borrow().clone()
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Message> {
        self.bus.subscribe()
    }

    async fn send(&self, op: Outbound) -> Result<(), SessionError> {
        self.call(|reply| Request::Send { op, reply }).await
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("state", &*self.state.borrow())
            .field("nickname", &*self.nickname.borrow())
            .finish()
    }
}

/// A connect attempt whose transport has not been handed over yet.
struct Pending {
    generation: u64,
    sink: EventSink,
    /// Events the transport delivered before the factory returned.
    early: Vec<Event>,
}

/// The live transport of the current generation.
struct Link {
    generation: u64,
    sink: EventSink,
    transport: Arc<dyn Transport>,
}

struct NoRoster;

impl RosterSource for NoRoster {
    fn roster(&self, _channel: &str) -> Option<Vec<MemberSnapshot>> {
        None
    }
}

struct Worker {
    config: ServerConfig,
    options: SessionOptions,
    factory: Arc<dyn TransportFactory>,
    state: SessionState,
    bus: MessageBus,
    tx: mpsc::WeakSender<Request>,
    generation: u64,
    pending: Option<Pending>,
    link: Option<Link>,
    sequencer: Option<CancellationToken>,
    state_tx: watch::Sender<ConnectionState>,
    nick_tx: watch::Sender<String>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<Request>, shutdown: CancellationToken) {
        loop {
            let request = tokio::select! {
                _ = shutdown.cancelled() => break,
                request = rx.recv() => match request {
                    Some(r) => r,
                    None => break,
                },
            };
            self.handle(request);
            self.sync_watches();
        }
        self.teardown("session closed");
        tracing::debug!(server = %self.config.server_name, "session worker stopped");
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Inbound { generation, event } => self.inbound(generation, event),
            Request::TransportReady { generation, result } => self.transport_ready(generation, result),
            Request::Automation { generation, step, token } => {
                let live = self.link.as_ref().is_some_and(|l| l.generation == generation);
                if !live || token.is_cancelled() {
                    tracing::debug!(generation, ?step, "dropping stale sequencer step");
                    return;
                }
                self.automation(step);
            }
            Request::Connect(reply) => {
                let result = self.connect();
                self.reply(reply, result);
            }
            Request::Disconnect { reason, reply } => {
                self.disconnect(&reason);
                self.reply(reply, Ok(()));
            }
            Request::Send { op, reply } => {
                let result = self.outbound(&op);
                self.reply(reply, result);
            }
            Request::SendMessage { target, text, reply } => {
                let result = self.outbound(&Outbound::Message { target: target.clone(), text: text.clone() });
                if result.is_ok() {
                    let msg = self.state.outgoing(&target, &text);
                    self.bus.publish(msg);
                }
                self.reply(reply, result);
            }
            Request::UpdateConfig { config, reply } => {
                self.update_config(*config);
                self.reply(reply, Ok(()));
            }
            Request::Submit { intent, context, reply } => {
                let result = self.submit(&intent, &context);
                self.reply(reply, result);
            }
            Request::MarkRead { channel } => self.state.mark_read(&channel),
            Request::Channels(reply) => {
                let channels = self.state.channels.iter().cloned().collect();
                self.reply(reply, Ok(channels));
            }
        }
    }

    /// Publish state before answering, so a caller sees the effects of its
    /// own request.
    fn reply<T>(&self, reply: Reply<T>, result: Result<T, SessionError>) {
        self.sync_watches();
        let _ = reply.send(result);
    }

    fn connect(&mut self) -> Result<(), SessionError> {
        if self.state.connection.is_connected() || self.state.connection.is_pending() {
            return Err(SessionError::AlreadyActive);
        }
        if let Err(e) = self.config.validate() {
            tracing::warn!(error = %e, "refusing to connect");
            let msg = self.state.fail(&e.to_string());
            self.bus.publish(msg);
            return Err(e.into());
        }
        let tx = self.tx.upgrade().ok_or(SessionError::Closed)?;
        self.state.begin_connect()?;

        self.generation += 1;
        let generation = self.generation;
        let sink = EventSink::new(generation, tx.clone());
        self.pending = Some(Pending { generation, sink: sink.clone(), early: Vec::new() });

        tracing::info!(
            generation,
            host = %self.config.hostname,
            port = self.config.port,
            tls = self.config.tls,
            "connecting"
        );
        let factory = Arc::clone(&self.factory);
        let config = self.config.clone();
        tokio::spawn(async move {
            let result = factory.connect(&config, sink).await;
            let _ = tx.send(Request::TransportReady { generation, result }).await;
        });
        Ok(())
    }

    fn transport_ready(&mut self, generation: u64, result: Result<Arc<dyn Transport>, TransportError>) {
        let pending = match self.pending.take() {
            Some(p) if p.generation == generation => p,
            other => {
                self.pending = other;
                if let Ok(transport) = result {
                    tracing::debug!(generation, "closing superseded transport");
                    transport.disconnect("superseded");
                }
                return;
            }
        };

        match result {
            Ok(transport) => {
                tracing::info!(generation, server = %self.config.server_name, "transport ready");
                self.link = Some(Link { generation, sink: pending.sink, transport });
                self.apply(Event::ConnectionEstablished);
                for event in pending.early {
                    self.apply(event);
                }
            }
            Err(e) => {
                tracing::error!(generation, error = %e, "connect failed");
                pending.sink.unsubscribe();
                self.apply(Event::ConnectFailed { reason: e.to_string() });
            }
        }
    }

    fn inbound(&mut self, generation: u64, event: Event) {
        if self.link.as_ref().is_some_and(|l| l.generation == generation) {
            self.apply(event);
        } else if let Some(pending) = self.pending.as_mut().filter(|p| p.generation == generation) {
            pending.early.push(event);
        } else {
            tracing::debug!(generation, event = event.name(), "dropping event from stale connection");
        }
    }

    /// Reduce one event into a working copy and commit it only on success.
    fn apply(&mut self, event: Event) {
        let mut next = self.state.clone();
        let result = {
            let roster: &dyn RosterSource = match &self.link {
                Some(link) => link.transport.as_ref(),
                None => &NoRoster,
            };
            catch_unwind(AssertUnwindSafe(|| reducer::reduce(&mut next, &event, roster)))
                .unwrap_or(Err(ReduceError::Panicked(event.name())))
        };
        let reduction = match result {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "dropping faulty event");
                return;
            }
        };
        self.state = next;
        tracing::debug!(event = event.name(), messages = reduction.messages.len(), "event reduced");
        for msg in reduction.messages {
            self.bus.publish(msg);
        }
        for effect in reduction.effects {
            match effect {
                Effect::Registered => self.start_sequencer(),
                Effect::ConnectionClosed => self.teardown("connection closed"),
            }
        }
    }

    fn start_sequencer(&mut self) {
        let Some(generation) = self.link.as_ref().map(|l| l.generation) else { return };
        let Some(tx) = self.tx.upgrade() else { return };
        self.cancel_sequencer();
        let steps = sequencer::steps(&self.config, &self.state.nickname);
        if steps.is_empty() {
            return;
        }
        let token = CancellationToken::new();
        sequencer::spawn(steps, generation, tx, self.options.script_line_delay, token.clone());
        self.sequencer = Some(token);
    }

    fn cancel_sequencer(&mut self) {
        if let Some(token) = self.sequencer.take() {
            token.cancel();
        }
    }

    fn automation(&mut self, step: Step) {
        match step {
            Step::Identify { text } => {
                if let Err(e) = self.outbound(&Outbound::Message { target: "NickServ".into(), text }) {
                    tracing::warn!(error = %e, "identify step failed");
                    return;
                }
                let target = self.state.server_name.clone();
                let nick = self.state.nickname.clone();
                let msg = self.state.log(&target, &nick, "Identifying with NickServ", MessageKind::Notice, true);
                self.bus.publish(msg);
            }
            Step::Script { line } => {
                let result = match sequencer::script_line(&line) {
                    ScriptLine::Raw(raw) => self.outbound(&Outbound::Raw(raw)),
                    ScriptLine::Command(intent) => self.submit(&intent, &Context::default()).map(|_| ()),
                };
                if let Err(e) = result {
                    tracing::warn!(%line, error = %e, "script line failed, skipping");
                }
            }
            Step::Join { channel } => {
                if let Err(e) = self.outbound(&Outbound::Join { channel: channel.clone(), key: None }) {
                    tracing::warn!(%channel, error = %e, "auto-join failed");
                }
            }
        }
    }

    fn outbound(&self, op: &Outbound) -> Result<(), SessionError> {
        match &self.link {
            Some(link) if self.state.connection.is_connected() => Ok(op.apply(link.transport.as_ref())?),
            _ => Err(SessionError::NotConnected),
        }
    }

    fn submit(&mut self, intent: &CommandIntent, context: &Context) -> Result<Submitted, SessionError> {
        let Plan { outbound, local } = match dispatch::plan(intent, context) {
            Ok(plan) => plan,
            Err(e) => {
                self.system(context, e.to_string());
                return Ok(Submitted::Done);
            }
        };
        if !outbound.is_empty() && !self.state.connection.is_connected() {
            return Err(SessionError::NotConnected);
        }
        for op in &outbound {
            self.outbound(op)?;
        }

        let mut outcome = Submitted::Done;
        for action in local {
            match action {
                Local::Echo { target, text } => {
                    let msg = self.state.outgoing(&target, &text);
                    self.bus.publish(msg);
                }
                Local::EchoNotice { target, text } => {
                    let nick = self.state.nickname.clone();
                    let msg = self.state.log(&target, &nick, text, MessageKind::Notice, true);
                    self.bus.publish(msg);
                }
                Local::System(text) => self.system(context, text),
                Local::OpenQuery(nick) => {
                    self.state.channels.ensure(&nick, ChannelKind::Query);
                }
                Local::Ignore(nick) => {
                    let text = if self.state.ignore(&nick) {
                        format!("Ignoring {nick}")
                    } else {
                        format!("{nick} is already ignored")
                    };
                    self.system(context, text);
                }
                Local::Unignore(nick) => {
                    let text = if self.state.unignore(&nick) {
                        format!("No longer ignoring {nick}")
                    } else {
                        format!("{nick} was not ignored")
                    };
                    self.system(context, text);
                }
                Local::Disconnect(reason) => self.disconnect(reason.as_deref().unwrap_or("Leaving")),
                Local::Clear => outcome = Submitted::Clear,
            }
        }
        Ok(outcome)
    }

    fn system(&mut self, context: &Context, text: String) {
        let target = context.target.clone().unwrap_or_else(|| self.state.server_name.clone());
        let msg = self.state.log(&target, SYSTEM_SENDER, text, MessageKind::System, true);
        self.bus.publish(msg);
    }

    fn disconnect(&mut self, reason: &str) {
        let was_live = self.state.connection.is_connected() || self.state.connection.is_pending();
        self.teardown(reason);
        self.state.set_disconnected();
        if was_live {
            tracing::info!(server = %self.state.server_name, %reason, "disconnected");
            let target = self.state.server_name.clone();
            let msg = self.state.log(&target, &target, "Disconnected", MessageKind::Server, false);
            self.bus.publish(msg);
        }
    }

    /// Unsubscribe first, then stop automation, then close the transport.
    fn teardown(&mut self, reason: &str) {
        if let Some(pending) = self.pending.take() {
            pending.sink.unsubscribe();
        }
        let link = self.link.take();
        if let Some(link) = &link {
            link.sink.unsubscribe();
        }
        self.cancel_sequencer();
        if let Some(link) = link {
            tracing::debug!(generation = link.generation, %reason, "closing transport");
            link.transport.disconnect(reason);
        }
    }

    fn update_config(&mut self, config: ServerConfig) {
        if !self.state.connection.is_connected() && !self.state.connection.is_pending() {
            self.state.nickname = config.nickname.clone();
            self.state.server_name = config.server_name.clone();
        }
        tracing::info!(id = %config.id, server = %config.server_name, "configuration replaced");
        self.config = config;
    }

    fn sync_watches(&self) {
        self.state_tx.send_if_modified(|s| {
            if *s == self.state.connection {
                return false;
            }
            *s = self.state.connection.clone();
            true
        });
        self.nick_tx.send_if_modified(|n| {
            if *n == self.state.nickname {
                return false;
            }
            n.clone_from(&self.state.nickname);
            true
        });
    }
}

//! The session state machine.
//!
//! [`reduce`] folds one decoded [`Event`] into a [`SessionState`], returning
//! the log messages it produced and any [`Effect`]s the session must carry
//! out (starting the connect sequencer, tearing down a closed transport).
//! Reduction is synchronous and never does I/O; roster re-syncs read the
//! transport's cached view through [`RosterSource`].

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::error::{ReduceError, SessionError};
use crate::event::{self, Event};
use crate::message::{self, Message, MessageKind, TargetClock};
use crate::roster::{ChannelKind, Channels};
use crate::transport::RosterSource;

/// Connection lifecycle as seen by the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected { server_name: String },
    Error { message: String },
    Reconnecting { attempt: u32 },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    /// Connecting or reconnecting: a transport attempt is in flight.
    pub fn is_pending(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Reconnecting { .. })
    }
}

/// Work the session must do after a reduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Registration completed on this connection; run the connect sequencer.
    Registered,
    /// The transport is gone; drop it and cancel automation.
    ConnectionClosed,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reduction {
    pub messages: Vec<Message>,
    pub effects: Vec<Effect>,
}

/// Everything the reducer owns for one server connection.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub connection: ConnectionState,
    pub channels: Channels,
    pub nickname: String,
    pub server_name: String,
    /// Last topic seen per channel; survives channel entity replacement.
    last_topics: HashMap<String, String>,
    /// Completed registrations over the session's lifetime.
    registrations: u32,
    /// Whether RPL_WELCOME has been handled on the current connection.
    registered: bool,
    /// Consecutive connect attempts since the last success.
    attempts: u32,
    /// Lowercased nicknames whose messages are dropped.
    ignored: BTreeSet<String>,
    clock: TargetClock,
}

impl SessionState {
    pub fn new(nickname: &str, server_name: &str) -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            channels: Channels::default(),
            nickname: nickname.to_string(),
            server_name: server_name.to_string(),
            last_topics: HashMap::new(),
            registrations: 0,
            registered: false,
            attempts: 0,
            ignored: BTreeSet::new(),
            clock: TargetClock::default(),
        }
    }

    pub fn has_connected_before(&self) -> bool {
        self.registrations > 0
    }

    /// Disconnected/Error → Connecting, or Reconnecting once a previous
    /// connection has succeeded. Refused while an attempt or connection is live.
    pub fn begin_connect(&mut self) -> Result<(), SessionError> {
        if self.connection.is_connected() || self.connection.is_pending() {
            return Err(SessionError::AlreadyActive);
        }
        self.registered = false;
        if self.has_connected_before() {
            self.attempts += 1;
            self.connection = ConnectionState::Reconnecting { attempt: self.attempts };
        } else {
            self.connection = ConnectionState::Connecting;
        }
        Ok(())
    }

    /// A connect attempt failed before any transport event arrived.
    pub fn fail(&mut self, reason: &str) -> Message {
        self.connection = ConnectionState::Error { message: reason.to_string() };
        self.registered = false;
        let target = self.server_name.clone();
        self.channels.ensure(&target, ChannelKind::Server);
        self.log(&target, &target, format!("Connection failed: {reason}"), MessageKind::Server, false)
    }

    /// User-requested disconnect: valid from every state.
    pub fn set_disconnected(&mut self) {
        self.connection = ConnectionState::Disconnected;
        self.registered = false;
    }

    pub fn ignore(&mut self, nick: &str) -> bool {
        self.ignored.insert(nick.to_ascii_lowercase())
    }

    pub fn unignore(&mut self, nick: &str) -> bool {
        self.ignored.remove(&nick.to_ascii_lowercase())
    }

    pub fn is_ignored(&self, nick: &str) -> bool {
        !self.ignored.is_empty() && self.ignored.contains(&nick.to_ascii_lowercase())
    }

    pub fn ignored(&self) -> impl Iterator<Item = &String> {
        self.ignored.iter()
    }

    pub fn mark_read(&mut self, channel: &str) {
        if let Some(ch) = self.channels.get_mut(channel) {
            ch.unread_count = 0;
        }
    }

    /// Build a log message, stamping it monotonically for its target and
    /// updating the target's activity counters.
    pub fn log(
        &mut self,
        target: &str,
        sender: &str,
        content: impl Into<String>,
        kind: MessageKind,
        is_self: bool,
    ) -> Message {
        let ts = self.clock.stamp(target);
        if let Some(ch) = self.channels.get_mut(target) {
            ch.last_activity = Some(ts);
            if !is_self && matches!(kind, MessageKind::Normal | MessageKind::Action) {
                ch.unread_count = ch.unread_count.saturating_add(1);
            }
        }
        Message::new(target, sender, content, kind, is_self, ts)
    }

    /// The local echo for text we sent: CTCP ACTION becomes an Action with
    /// the payload unwrapped.
    pub fn outgoing(&mut self, target: &str, text: &str) -> Message {
        let nick = self.nickname.clone();
        match message::unwrap_action(text) {
            Some(action) => self.log(target, &nick, action, MessageKind::Action, true),
            None => self.log(target, &nick, text, MessageKind::Normal, true),
        }
    }

    fn server_log(&mut self, content: impl Into<String>, kind: MessageKind) -> Message {
        let target = self.server_name.clone();
        self.log(&target, &target, content, kind, false)
    }
}

/// Fold one event into `state`.
///
/// On `Err` the caller must discard whatever `state` now holds; the session
/// reduces into a working copy and only commits it on success.
pub fn reduce(
    state: &mut SessionState,
    event: &Event,
    roster: &dyn RosterSource,
) -> Result<Reduction, ReduceError> {
    let mut out = Reduction::default();

    if !event.is_lifecycle() && !state.connection.is_connected() {
        tracing::debug!(event = event.name(), state = ?state.connection, "ignoring event while not connected");
        return Ok(out);
    }

    match event {
        Event::ConnectionEstablished => {
            if !state.connection.is_pending() {
                tracing::debug!(state = ?state.connection, "stray connection_established");
                return Ok(out);
            }
            let server = state.server_name.clone();
            state.connection = ConnectionState::Connected { server_name: server.clone() };
            state.registered = false;
            state.attempts = 0;
            state.channels.ensure(&server, ChannelKind::Server);
            let text = if state.has_connected_before() {
                format!("Reconnected to {server}")
            } else {
                format!("Connected to {server}")
            };
            out.messages.push(state.server_log(text, MessageKind::Server));
        }

        Event::ConnectFailed { reason } => {
            if !state.connection.is_pending() {
                return Ok(out);
            }
            out.messages.push(state.fail(reason));
            out.effects.push(Effect::ConnectionClosed);
        }

        Event::ConnectionEnded { reason } => {
            if !state.connection.is_connected() && !state.connection.is_pending() {
                return Ok(out);
            }
            state.set_disconnected();
            let text = match reason.as_deref().filter(|r| !r.is_empty()) {
                Some(r) => format!("Disconnected: {r}"),
                None => "Disconnected".to_string(),
            };
            out.messages.push(state.server_log(text, MessageKind::Server));
            out.effects.push(Effect::ConnectionClosed);
        }

        Event::Join { channel, user } => {
            require("join", channel, "channel")?;
            require("join", user, "user")?;
            if *user == state.nickname {
                // The roster sync that follows our own join announces the
                // member list; no "has joined" line for ourselves.
                state.channels.create_or_replace(channel, ChannelKind::Channel);
                resync(state, channel, roster);
            } else if state.channels.contains(channel) {
                out.messages.push(state.log(
                    channel,
                    user,
                    format!("{user} has joined {channel}"),
                    MessageKind::Join,
                    false,
                ));
                if !resync(state, channel, roster) {
                    if let Some(ch) = state.channels.get_mut(channel) {
                        ch.upsert_user(user, BTreeSet::new());
                    }
                }
            }
        }

        Event::Part { channel, user, message } => {
            require("part", channel, "channel")?;
            require("part", user, "user")?;
            if *user == state.nickname {
                state.channels.remove(channel);
            } else if state.channels.contains(channel) {
                let text = match message.as_deref().filter(|m| !m.is_empty()) {
                    Some(m) => format!("{user} has left {channel} ({m})"),
                    None => format!("{user} has left {channel}"),
                };
                out.messages.push(state.log(channel, user, text, MessageKind::Part, false));
                if !resync(state, channel, roster) {
                    if let Some(ch) = state.channels.get_mut(channel) {
                        ch.remove_user(user);
                    }
                }
            }
        }

        Event::ChannelMessage { channel, actor, text } => {
            require("channel_message", channel, "channel")?;
            if state.is_ignored(actor) {
                return Ok(out);
            }
            let msg = match message::unwrap_action(text) {
                Some(action) => state.log(channel, actor, action, MessageKind::Action, false),
                None => state.log(channel, actor, text.as_str(), MessageKind::Normal, false),
            };
            out.messages.push(msg);
        }

        Event::PrivateMessage { actor, text } => {
            require("private_message", actor, "actor")?;
            if state.is_ignored(actor) {
                return Ok(out);
            }
            if let Some((command, args)) = message::parse_ctcp(text) {
                let content = if args.is_empty() {
                    format!("Received CTCP {command} from {actor}")
                } else {
                    format!("Received CTCP {command} from {actor}: {args}")
                };
                out.messages.push(state.server_log(content, MessageKind::Ctcp));
                return Ok(out);
            }
            state.channels.ensure(actor, ChannelKind::Query);
            let msg = match message::unwrap_action(text) {
                Some(action) => state.log(actor, actor, action, MessageKind::Action, false),
                None => state.log(actor, actor, text.as_str(), MessageKind::Normal, false),
            };
            out.messages.push(msg);
        }

        Event::Topic { channel, topic, setter } => {
            require("topic", channel, "channel")?;
            if let Some(ch) = state.channels.get_mut(channel) {
                ch.set_topic(Some(topic.clone()));
            }
            if state.last_topics.get(channel) != Some(topic) {
                state.last_topics.insert(channel.clone(), topic.clone());
                let setter = setter.as_deref().filter(|s| !s.is_empty()).unwrap_or("Server");
                out.messages.push(state.log(
                    channel,
                    setter,
                    format!("{setter} set the topic: {topic}"),
                    MessageKind::Topic,
                    false,
                ));
            }
        }

        Event::UsersUpdated { channel, users } => {
            require("users_updated", channel, "channel")?;
            match state.channels.get_mut(channel) {
                Some(ch) => ch.sync_users(users),
                None => tracing::debug!(%channel, "roster for unknown channel"),
            }
        }

        Event::Kick { channel, actor, target, message } => {
            require("kick", channel, "channel")?;
            require("kick", target, "target")?;
            let text = if message.is_empty() {
                format!("{actor} kicked {target} from {channel}")
            } else {
                format!("{actor} kicked {target} from {channel} ({message})")
            };
            out.messages.push(state.log(channel, actor, text, MessageKind::Kick, false));
            if *target == state.nickname {
                state.channels.remove(channel);
            } else if !resync(state, channel, roster) {
                if let Some(ch) = state.channels.get_mut(channel) {
                    ch.remove_user(target);
                }
            }
        }

        Event::Notice { channel, actor, text } => {
            if state.is_ignored(actor) {
                return Ok(out);
            }
            let target = channel.clone().unwrap_or_else(|| state.server_name.clone());
            out.messages.push(state.log(&target, actor, text.as_str(), MessageKind::Notice, false));
        }

        Event::NickChange { old_nick, new_nick } => {
            require("nick_change", old_nick, "old_nick")?;
            require("nick_change", new_nick, "new_nick")?;
            if *old_nick == state.nickname {
                state.nickname = new_nick.clone();
            }
            for name in state.channels.containing(old_nick) {
                if let Some(ch) = state.channels.get_mut(&name) {
                    ch.rename_user(old_nick, new_nick);
                }
                out.messages.push(state.log(
                    &name,
                    new_nick,
                    format!("{old_nick} is now known as {new_nick}"),
                    MessageKind::Nick,
                    false,
                ));
            }
        }

        Event::Quit { user, message } => {
            require("quit", user, "user")?;
            let text = if message.is_empty() {
                format!("{user} has quit")
            } else {
                format!("{user} has quit ({message})")
            };
            for name in state.channels.containing(user) {
                out.messages.push(state.log(&name, user, text.as_str(), MessageKind::Quit, false));
                if let Some(ch) = state.channels.get_mut(&name) {
                    ch.remove_user(user);
                }
            }
        }

        Event::ModeChange { channel, actor, mode } => {
            require("mode_change", channel, "channel")?;
            if state.channels.contains(channel) {
                if !mode.is_empty() {
                    let actor = if actor.is_empty() { "Server" } else { actor.as_str() };
                    out.messages.push(state.log(
                        channel,
                        actor,
                        format!("{actor} sets mode {mode}"),
                        MessageKind::Mode,
                        false,
                    ));
                }
                resync(state, channel, roster);
            }
        }

        Event::Away { user, message } => {
            for name in state.channels.containing(user) {
                if let Some(ch) = state.channels.get_mut(&name) {
                    ch.set_away(user, message.as_deref());
                }
            }
        }

        Event::Invite { channel, actor } => {
            out.messages.push(state.server_log(format!("{actor} invited you to {channel}"), MessageKind::Server));
        }

        Event::Numeric { code, params } => reduce_numeric(state, *code, params, &mut out),
    }

    Ok(out)
}

fn reduce_numeric(state: &mut SessionState, code: u16, params: &[String], out: &mut Reduction) {
    // params[0] is the client nick on every numeric.
    let body = params.get(1..).unwrap_or_default().join(" ");
    match code {
        event::RPL_WELCOME => {
            if state.registered {
                tracing::debug!("duplicate RPL_WELCOME ignored");
                return;
            }
            state.registered = true;
            state.registrations += 1;
            if let Some(nick) = params.first().filter(|n| !n.is_empty()) {
                state.nickname = nick.clone();
            }
            if !body.is_empty() {
                out.messages.push(state.server_log(body, MessageKind::Server));
            }
            out.effects.push(Effect::Registered);
        }
        event::RPL_AWAY
        | event::RPL_WHOISUSER
        | event::RPL_WHOISSERVER
        | event::RPL_WHOISOPERATOR
        | event::RPL_WHOISIDLE
        | event::RPL_WHOISCHANNELS
        | event::RPL_WHOISACCOUNT
        | event::RPL_WHOISSECURE
        | event::RPL_ENDOFWHOIS => {
            out.messages.push(state.server_log(body, MessageKind::Server));
        }
        event::RPL_MOTDSTART | event::RPL_MOTD | event::RPL_ENDOFMOTD | event::ERR_NOMOTD => {
            if state.registrations <= 1 {
                let line = params.last().cloned().unwrap_or_default();
                out.messages.push(state.server_log(line, MessageKind::Server));
            }
        }
        400..=599 => {
            out.messages.push(state.server_log(body, MessageKind::Error));
        }
        _ => tracing::trace!(code, "unhandled numeric"),
    }
}

/// Re-sync `channel` from the transport's roster. Returns false if the
/// transport has no roster for it.
fn resync(state: &mut SessionState, channel: &str, roster: &dyn RosterSource) -> bool {
    let Some(snapshot) = roster.roster(channel) else {
        return false;
    };
    match state.channels.get_mut(channel) {
        Some(ch) => {
            ch.sync_users(&snapshot);
            true
        }
        None => false,
    }
}

fn require(event: &'static str, value: &str, field: &'static str) -> Result<(), ReduceError> {
    if value.is_empty() {
        return Err(ReduceError::Malformed { event, reason: field_reason(field) });
    }
    Ok(())
}

fn field_reason(field: &'static str) -> &'static str {
    match field {
        "channel" => "empty channel name",
        "user" => "empty user",
        "actor" => "empty actor",
        "target" => "empty target",
        "old_nick" => "empty old nick",
        "new_nick" => "empty new nick",
        _ => "empty field",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MemberSnapshot;
    use crate::roster::UserMode;
    use std::collections::HashMap;

    #[derive(Default)]
    struct StaticRoster(HashMap<String, Vec<MemberSnapshot>>);

    impl StaticRoster {
        fn with(mut self, channel: &str, members: &[(&str, &str)]) -> Self {
            self.0.insert(
                channel.to_string(),
                members.iter().map(|(n, m)| MemberSnapshot::new(*n, *m)).collect(),
            );
            self
        }
    }

    impl RosterSource for StaticRoster {
        fn roster(&self, channel: &str) -> Option<Vec<MemberSnapshot>> {
            self.0.get(channel).cloned()
        }
    }

    fn connected() -> SessionState {
        let mut s = SessionState::new("me", "libera");
        s.begin_connect().unwrap();
        reduce(&mut s, &Event::ConnectionEstablished, &StaticRoster::default()).unwrap();
        s
    }

    fn apply(s: &mut SessionState, e: Event) -> Reduction {
        reduce(s, &e, &StaticRoster::default()).unwrap()
    }

    fn join(channel: &str, user: &str) -> Event {
        Event::Join { channel: channel.into(), user: user.into() }
    }

    fn users(channel: &str, members: &[(&str, &str)]) -> Event {
        Event::UsersUpdated {
            channel: channel.into(),
            users: members.iter().map(|(n, m)| MemberSnapshot::new(*n, *m)).collect(),
        }
    }

    fn welcome() -> Event {
        Event::Numeric { code: 1, params: vec!["me".into(), "Welcome to Libera".into()] }
    }

    #[test]
    fn connect_transitions() {
        let mut s = SessionState::new("me", "libera");
        assert_eq!(s.connection, ConnectionState::Disconnected);
        s.begin_connect().unwrap();
        assert_eq!(s.connection, ConnectionState::Connecting);
        assert_eq!(s.begin_connect(), Err(SessionError::AlreadyActive));

        let r = apply(&mut s, Event::ConnectionEstablished);
        assert_eq!(s.connection, ConnectionState::Connected { server_name: "libera".into() });
        assert_eq!(r.messages.len(), 1);
        assert_eq!(r.messages[0].content, "Connected to libera");
        assert_eq!(r.messages[0].kind, MessageKind::Server);
        assert_eq!(s.begin_connect(), Err(SessionError::AlreadyActive));
    }

    #[test]
    fn connect_failure_sets_error() {
        let mut s = SessionState::new("me", "libera");
        s.begin_connect().unwrap();
        let r = apply(&mut s, Event::ConnectFailed { reason: "refused".into() });
        assert_eq!(s.connection, ConnectionState::Error { message: "refused".into() });
        assert_eq!(r.effects, vec![Effect::ConnectionClosed]);
        // Retry is allowed from Error.
        s.begin_connect().unwrap();
        assert_eq!(s.connection, ConnectionState::Connecting);
    }

    #[test]
    fn reconnect_message_after_first_registration() {
        let mut s = connected();
        apply(&mut s, welcome());
        let r = apply(&mut s, Event::ConnectionEnded { reason: Some("ping timeout".into()) });
        assert_eq!(s.connection, ConnectionState::Disconnected);
        assert_eq!(r.messages[0].content, "Disconnected: ping timeout");
        assert_eq!(r.effects, vec![Effect::ConnectionClosed]);

        s.begin_connect().unwrap();
        assert_eq!(s.connection, ConnectionState::Reconnecting { attempt: 1 });
        let r = apply(&mut s, Event::ConnectionEstablished);
        assert_eq!(r.messages[0].content, "Reconnected to libera");
    }

    #[test]
    fn events_ignored_while_disconnected() {
        let mut s = SessionState::new("me", "libera");
        let r = apply(&mut s, join("#rust", "me"));
        assert!(r.messages.is_empty());
        assert!(s.channels.is_empty());
    }

    #[test]
    fn repeated_local_joins_keep_one_entry() {
        let mut s = connected();
        for _ in 0..3 {
            let r = apply(&mut s, join("#rust", "me"));
            assert!(r.messages.is_empty(), "own join is not announced");
            apply(&mut s, users("#rust", &[("me", "@"), ("bob", "")]));
            apply(&mut s, users("#rust", &[("me", "@"), ("bob", "")]));
        }
        apply(&mut s, join("#go", "me"));
        let channels: Vec<_> = s.channels.iter().filter(|c| c.kind == ChannelKind::Channel).collect();
        assert_eq!(channels.len(), 2);
        assert_eq!(s.channels.get("#rust").unwrap().users.len(), 2);
    }

    #[test]
    fn remote_join_announces_and_resyncs() {
        let mut s = connected();
        apply(&mut s, join("#rust", "me"));
        let roster = StaticRoster::default().with("#rust", &[("me", "o"), ("bob", "v")]);
        let r = reduce(&mut s, &join("#rust", "bob"), &roster).unwrap();
        assert_eq!(r.messages.len(), 1);
        assert_eq!(r.messages[0].kind, MessageKind::Join);
        let ch = s.channels.get("#rust").unwrap();
        assert!(ch.users["bob"].modes.contains(&UserMode::Voice));
        assert!(ch.users["me"].modes.contains(&UserMode::Op));
    }

    #[test]
    fn remote_join_without_roster_merges_one_user() {
        let mut s = connected();
        apply(&mut s, join("#rust", "me"));
        apply(&mut s, users("#rust", &[("me", "@")]));
        apply(&mut s, join("#rust", "bob"));
        let ch = s.channels.get("#rust").unwrap();
        assert!(ch.has_user("bob"));
        assert!(ch.users["me"].modes.contains(&UserMode::Op), "others untouched");
    }

    #[test]
    fn local_part_removes_channel() {
        let mut s = connected();
        apply(&mut s, join("#rust", "me"));
        let r = apply(&mut s, Event::Part { channel: "#rust".into(), user: "me".into(), message: None });
        assert!(r.messages.is_empty());
        assert!(!s.channels.contains("#rust"));
    }

    #[test]
    fn remote_part_with_reason() {
        let mut s = connected();
        apply(&mut s, join("#rust", "me"));
        apply(&mut s, users("#rust", &[("me", ""), ("bob", "")]));
        let r = apply(
            &mut s,
            Event::Part { channel: "#rust".into(), user: "bob".into(), message: Some("bye".into()) },
        );
        assert_eq!(r.messages[0].content, "bob has left #rust (bye)");
        assert!(!s.channels.get("#rust").unwrap().has_user("bob"));
    }

    #[test]
    fn channel_action_is_reclassified() {
        let mut s = connected();
        apply(&mut s, join("#rust", "me"));
        let r = apply(
            &mut s,
            Event::ChannelMessage { channel: "#rust".into(), actor: "bob".into(), text: "\x01ACTION waves\x01".into() },
        );
        let m = &r.messages[0];
        assert_eq!(m.kind, MessageKind::Action);
        assert_eq!(m.content, "waves");
        assert!(!m.is_self);
        assert_eq!(s.channels.get("#rust").unwrap().unread_count, 1);
        s.mark_read("#rust");
        assert_eq!(s.channels.get("#rust").unwrap().unread_count, 0);
    }

    #[test]
    fn private_message_creates_query_once() {
        let mut s = connected();
        for _ in 0..2 {
            let r = apply(&mut s, Event::PrivateMessage { actor: "bob".into(), text: "hi".into() });
            assert_eq!(r.messages[0].target, "bob");
            assert_eq!(r.messages[0].kind, MessageKind::Normal);
        }
        let queries: Vec<_> = s.channels.iter().filter(|c| c.kind == ChannelKind::Query).collect();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].unread_count, 2);
    }

    #[test]
    fn ctcp_request_goes_to_server_buffer() {
        let mut s = connected();
        let r = apply(&mut s, Event::PrivateMessage { actor: "bob".into(), text: "\x01VERSION\x01".into() });
        assert_eq!(r.messages[0].kind, MessageKind::Ctcp);
        assert_eq!(r.messages[0].target, "libera");
        assert!(!s.channels.contains("bob"));
    }

    #[test]
    fn topic_dedupes_and_survives_rejoin() {
        let mut s = connected();
        apply(&mut s, join("#rust", "me"));
        let topic = || Event::Topic { channel: "#rust".into(), topic: "Rust!".into(), setter: None };
        let first = apply(&mut s, topic());
        let second = apply(&mut s, topic());
        assert_eq!(first.messages.len(), 1);
        assert_eq!(first.messages[0].sender, "Server");
        assert!(second.messages.is_empty());

        // Rejoin replaces the entity; the re-announced topic is still deduped.
        apply(&mut s, join("#rust", "me"));
        assert_eq!(s.channels.get("#rust").unwrap().topic, None);
        let again = apply(&mut s, topic());
        assert!(again.messages.is_empty());
        assert_eq!(s.channels.get("#rust").unwrap().topic.as_deref(), Some("Rust!"));

        let changed = apply(
            &mut s,
            Event::Topic { channel: "#rust".into(), topic: "New".into(), setter: Some("bob".into()) },
        );
        assert_eq!(changed.messages[0].sender, "bob");
    }

    #[test]
    fn nick_change_touches_only_member_channels() {
        let mut s = connected();
        for (ch, members) in [("#a", vec![("me", ""), ("bob", "@")]), ("#b", vec![("bob", "")]), ("#c", vec![("me", "")])] {
            apply(&mut s, join(ch, "me"));
            apply(&mut s, users(ch, &members));
        }
        let r = apply(&mut s, Event::NickChange { old_nick: "bob".into(), new_nick: "robert".into() });
        let targets: Vec<_> = r.messages.iter().map(|m| m.target.as_str()).collect();
        assert_eq!(targets, vec!["#a", "#b"]);
        assert!(r.messages.iter().all(|m| m.kind == MessageKind::Nick));
        assert_eq!(r.messages[0].content, "bob is now known as robert");
        for ch in ["#a", "#b"] {
            let c = s.channels.get(ch).unwrap();
            assert!(c.has_user("robert") && !c.has_user("bob"));
        }
        assert!(s.channels.get("#a").unwrap().users["robert"].modes.contains(&UserMode::Op));
    }

    #[test]
    fn own_nick_change_updates_nickname() {
        let mut s = connected();
        apply(&mut s, Event::NickChange { old_nick: "me".into(), new_nick: "me_".into() });
        assert_eq!(s.nickname, "me_");
    }

    #[test]
    fn quit_removes_from_every_channel() {
        let mut s = connected();
        for ch in ["#a", "#b", "#c"] {
            apply(&mut s, join(ch, "me"));
        }
        apply(&mut s, users("#a", &[("me", ""), ("bob", "")]));
        apply(&mut s, users("#b", &[("me", ""), ("bob", "v")]));
        apply(&mut s, users("#c", &[("me", "")]));
        let r = apply(&mut s, Event::Quit { user: "bob".into(), message: "Leaving".into() });
        assert_eq!(r.messages.len(), 2);
        assert!(r.messages.iter().all(|m| m.kind == MessageKind::Quit));
        assert!(s.channels.containing("bob").is_empty());
    }

    #[test]
    fn kick_of_self_removes_channel() {
        let mut s = connected();
        apply(&mut s, join("#rust", "me"));
        let r = apply(
            &mut s,
            Event::Kick { channel: "#rust".into(), actor: "op".into(), target: "me".into(), message: "out".into() },
        );
        assert_eq!(r.messages[0].content, "op kicked me from #rust (out)");
        assert!(!s.channels.contains("#rust"));
    }

    #[test]
    fn kick_of_other_removes_user() {
        let mut s = connected();
        apply(&mut s, join("#rust", "me"));
        apply(&mut s, users("#rust", &[("me", "@"), ("troll", "")]));
        apply(
            &mut s,
            Event::Kick { channel: "#rust".into(), actor: "me".into(), target: "troll".into(), message: String::new() },
        );
        assert!(!s.channels.get("#rust").unwrap().has_user("troll"));
    }

    #[test]
    fn users_updated_accepts_both_mode_representations() {
        let mut s = connected();
        apply(&mut s, join("#rust", "me"));
        apply(&mut s, users("#rust", &[("alice", "o"), ("bob", "@"), ("carol", "v"), ("dave", "+")]));
        let ch = s.channels.get("#rust").unwrap();
        assert_eq!(ch.users["alice"].modes, ch.users["bob"].modes);
        assert_eq!(ch.users["carol"].modes, ch.users["dave"].modes);
        assert!(ch.users["carol"].modes.contains(&UserMode::Voice));
    }

    #[test]
    fn mode_change_resyncs_roster() {
        let mut s = connected();
        apply(&mut s, join("#rust", "me"));
        apply(&mut s, users("#rust", &[("me", ""), ("bob", "")]));
        let roster = StaticRoster::default().with("#rust", &[("me", ""), ("bob", "@")]);
        let r = reduce(
            &mut s,
            &Event::ModeChange { channel: "#rust".into(), actor: "me".into(), mode: "+o bob".into() },
            &roster,
        )
        .unwrap();
        assert_eq!(r.messages[0].kind, MessageKind::Mode);
        assert!(s.channels.get("#rust").unwrap().users["bob"].modes.contains(&UserMode::Op));
    }

    #[test]
    fn away_updates_member_state() {
        let mut s = connected();
        apply(&mut s, join("#rust", "me"));
        apply(&mut s, users("#rust", &[("bob", "")]));
        apply(&mut s, Event::Away { user: "bob".into(), message: Some("lunch".into()) });
        assert!(s.channels.get("#rust").unwrap().users["bob"].is_away);
        apply(&mut s, Event::Away { user: "bob".into(), message: None });
        assert!(!s.channels.get("#rust").unwrap().users["bob"].is_away);
    }

    #[test]
    fn welcome_registers_once_per_connection() {
        let mut s = connected();
        let r = apply(&mut s, welcome());
        assert_eq!(r.effects, vec![Effect::Registered]);
        assert!(s.has_connected_before());
        assert!(apply(&mut s, welcome()).effects.is_empty());
    }

    #[test]
    fn motd_only_on_first_connection() {
        let motd = || Event::Numeric { code: 372, params: vec!["me".into(), "- hello".into()] };
        let mut s = connected();
        apply(&mut s, welcome());
        assert_eq!(apply(&mut s, motd()).messages.len(), 1);

        apply(&mut s, Event::ConnectionEnded { reason: None });
        s.begin_connect().unwrap();
        apply(&mut s, Event::ConnectionEstablished);
        apply(&mut s, welcome());
        assert!(apply(&mut s, motd()).messages.is_empty());
    }

    #[test]
    fn whois_lines_are_server_messages() {
        let mut s = connected();
        let r = apply(
            &mut s,
            Event::Numeric {
                code: 311,
                params: vec!["me".into(), "bob".into(), "~b".into(), "host".into(), "*".into(), "Bob".into()],
            },
        );
        assert_eq!(r.messages[0].kind, MessageKind::Server);
        assert_eq!(r.messages[0].content, "bob ~b host * Bob");
        let end = apply(
            &mut s,
            Event::Numeric { code: 318, params: vec!["me".into(), "bob".into(), "End of /WHOIS list.".into()] },
        );
        assert_eq!(end.messages.len(), 1);
    }

    #[test]
    fn error_numerics_are_errors() {
        let mut s = connected();
        let r = apply(
            &mut s,
            Event::Numeric { code: 433, params: vec!["me".into(), "bob".into(), "Nickname is already in use".into()] },
        );
        assert_eq!(r.messages[0].kind, MessageKind::Error);
    }

    #[test]
    fn ignored_nicks_are_dropped() {
        let mut s = connected();
        apply(&mut s, join("#rust", "me"));
        s.ignore("Troll");
        let r = apply(
            &mut s,
            Event::ChannelMessage { channel: "#rust".into(), actor: "troll".into(), text: "spam".into() },
        );
        assert!(r.messages.is_empty());
        s.unignore("TROLL");
        assert!(!s.is_ignored("troll"));
    }

    #[test]
    fn malformed_event_is_an_error() {
        let mut s = connected();
        let err = reduce(&mut s, &join("", "bob"), &StaticRoster::default()).unwrap_err();
        assert!(matches!(err, ReduceError::Malformed { event: "join", .. }));
    }

    #[test]
    fn timestamps_monotonic_per_target() {
        let mut s = connected();
        apply(&mut s, join("#rust", "me"));
        let mut last = None;
        for i in 0..20 {
            let r = apply(
                &mut s,
                Event::ChannelMessage { channel: "#rust".into(), actor: "bob".into(), text: i.to_string() },
            );
            let ts = r.messages[0].timestamp;
            if let Some(prev) = last {
                assert!(ts >= prev);
            }
            last = Some(ts);
        }
    }

    #[test]
    fn outgoing_action_echo() {
        let mut s = connected();
        let m = s.outgoing("#rust", "\x01ACTION dances\x01");
        assert_eq!(m.kind, MessageKind::Action);
        assert_eq!(m.content, "dances");
        assert!(m.is_self);
        assert_eq!(m.sender, "me");
    }
}

//! Decoded protocol events delivered by a transport.
//!
//! Transports parse the wire; the session only ever sees these values.

/// Welcome numeric: registration complete.
pub const RPL_WELCOME: u16 = 1;
pub const RPL_AWAY: u16 = 301;
pub const RPL_WHOISUSER: u16 = 311;
pub const RPL_WHOISSERVER: u16 = 312;
pub const RPL_WHOISOPERATOR: u16 = 313;
pub const RPL_WHOISIDLE: u16 = 317;
pub const RPL_ENDOFWHOIS: u16 = 318;
pub const RPL_WHOISCHANNELS: u16 = 319;
pub const RPL_WHOISACCOUNT: u16 = 330;
pub const RPL_WHOISSECURE: u16 = 671;
pub const RPL_MOTDSTART: u16 = 375;
pub const RPL_MOTD: u16 = 372;
pub const RPL_ENDOFMOTD: u16 = 376;
pub const ERR_NOMOTD: u16 = 422;

/// One roster entry as the transport sees it.
///
/// `modes` carries either symbolic mode letters (`o`, `v`, ...) or display
/// prefixes (`@`, `+`, ...), depending on what the server dialect gave the
/// transport. Both are accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberSnapshot {
    pub nickname: String,
    pub modes: String,
}

impl MemberSnapshot {
    pub fn new(nickname: impl Into<String>, modes: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            modes: modes.into(),
        }
    }
}

/// Events the transport emits, already decoded from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Socket is up and registration has started. The session raises this
    /// itself once the factory hands back a transport.
    ConnectionEstablished,

    /// The connection attempt failed before it was established.
    ConnectFailed { reason: String },

    /// An established connection closed.
    ConnectionEnded { reason: Option<String> },

    Join {
        channel: String,
        user: String,
    },

    Part {
        channel: String,
        user: String,
        message: Option<String>,
    },

    ChannelMessage {
        channel: String,
        actor: String,
        text: String,
    },

    PrivateMessage {
        actor: String,
        text: String,
    },

    /// Topic changed or reported on join. `setter` is `None` when the
    /// server did not name a human setter.
    Topic {
        channel: String,
        topic: String,
        setter: Option<String>,
    },

    /// Full, authoritative roster for one channel.
    UsersUpdated {
        channel: String,
        users: Vec<MemberSnapshot>,
    },

    Kick {
        channel: String,
        actor: String,
        target: String,
        message: String,
    },

    /// `channel` is `None` for notices addressed to us directly.
    Notice {
        channel: Option<String>,
        actor: String,
        text: String,
    },

    NickChange {
        old_nick: String,
        new_nick: String,
    },

    Quit {
        user: String,
        message: String,
    },

    /// A channel mode changed. Per-user privilege flags may have moved.
    ModeChange {
        channel: String,
        actor: String,
        mode: String,
    },

    /// away-notify: `message` is `Some` when going away, `None` on return.
    Away {
        user: String,
        message: Option<String>,
    },

    Invite {
        channel: String,
        actor: String,
    },

    /// Any numeric reply. `params` are the wire parameters, starting with
    /// the client nick.
    Numeric { code: u16, params: Vec<String> },
}

impl Event {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Event::ConnectionEstablished => "connection_established",
            Event::ConnectFailed { .. } => "connect_failed",
            Event::ConnectionEnded { .. } => "connection_ended",
            Event::Join { .. } => "join",
            Event::Part { .. } => "part",
            Event::ChannelMessage { .. } => "channel_message",
            Event::PrivateMessage { .. } => "private_message",
            Event::Topic { .. } => "topic",
            Event::UsersUpdated { .. } => "users_updated",
            Event::Kick { .. } => "kick",
            Event::Notice { .. } => "notice",
            Event::NickChange { .. } => "nick_change",
            Event::Quit { .. } => "quit",
            Event::ModeChange { .. } => "mode_change",
            Event::Away { .. } => "away",
            Event::Invite { .. } => "invite",
            Event::Numeric { .. } => "numeric",
        }
    }

    /// Lifecycle events are accepted in any state; everything else needs a
    /// live connection.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Event::ConnectionEstablished | Event::ConnectFailed { .. } | Event::ConnectionEnded { .. }
        )
    }
}

//! Client-side IRC protocol state: registration, capability negotiation,
//! SASL PLAIN, keepalive replies, nick-collision fallback, and decoding of
//! server lines into session events.
//!
//! [`Protocol`] is pure. The run loop feeds it parsed lines and writes back
//! whatever it asks for, which keeps every protocol rule testable without a
//! socket.

use base64::Engine;

use palaver_core::ServerConfig;
use palaver_core::command::is_channel_name;
use palaver_core::event::Event;
use palaver_core::message::{CTCP_DELIM, parse_ctcp, unwrap_action};

use crate::irc::Message;
use crate::roster::{ChanModes, PrefixMap, RosterCache};

const MAX_NICK_TRIES: u32 = 5;

/// Capabilities requested whenever the server offers them.
const WANTED_CAPS: &[&str] = &["multi-prefix", "away-notify"];

/// What to do after one inbound line.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Output {
    /// Lines to write, in order.
    pub lines: Vec<Message>,
    /// Events to deliver to the session, in order.
    pub events: Vec<Event>,
    /// Close the connection with this reason.
    pub close: Option<String>,
}

impl Output {
    fn send(&mut self, msg: Message) {
        self.lines.push(msg);
    }

    fn emit(&mut self, event: Event) {
        self.events.push(event);
    }
}

#[derive(Debug)]
pub struct Protocol {
    nick: String,
    base_nick: String,
    alt_nick: Option<String>,
    user: String,
    realname: String,
    password: Option<String>,
    sasl: Option<(String, String)>,
    registered: bool,
    nick_tries: u32,
    /// CAP LS continuation lines.
    offered: Vec<String>,
}

impl Protocol {
    pub fn new(config: &ServerConfig) -> Self {
        let sasl = match (&config.sasl_username, &config.sasl_password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some((u.clone(), p.clone())),
            _ => None,
        };
        Self {
            nick: config.nickname.clone(),
            base_nick: config.nickname.clone(),
            alt_nick: config.alt_nickname.clone().filter(|n| !n.trim().is_empty()),
            user: config.username().to_string(),
            realname: config.realname().to_string(),
            password: config.server_password.clone().filter(|p| !p.is_empty()),
            sasl,
            registered: false,
            nick_tries: 0,
            offered: Vec::new(),
        }
    }

    /// Our nick as the server currently knows it.
    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Lines sent right after the socket is up.
    pub fn preamble(&self) -> Vec<Message> {
        let mut lines = vec![Message::new("CAP", ["LS", "302"])];
        if let Some(password) = &self.password {
            lines.push(Message::new("PASS", [password.as_str()]));
        }
        lines.push(Message::new("NICK", [self.nick.as_str()]));
        lines.push(Message::new("USER", [self.user.as_str(), "0", "*", self.realname.as_str()]));
        lines
    }

    /// Handle one server line. The roster is updated before the matching
    /// event is emitted.
    pub fn handle(&mut self, msg: &Message, roster: &RosterCache) -> Output {
        let mut out = Output::default();
        if let Some(code) = msg.numeric() {
            self.numeric(code, msg, roster, &mut out);
            return out;
        }
        let actor = msg.nick().unwrap_or_default().to_string();
        match msg.command.as_str() {
            "PING" => out.send(Message::new("PONG", msg.params.clone())),
            "CAP" => self.cap(msg, &mut out),
            "AUTHENTICATE" => self.authenticate(msg, &mut out),
            "ERROR" => {
                out.close = Some(msg.param(0).unwrap_or("Closing link").to_string());
            }
            "JOIN" => {
                let Some(channel) = msg.param(0) else { return out };
                if actor == self.nick {
                    roster.joined(channel, &actor);
                } else {
                    roster.add(channel, &actor);
                }
                out.emit(Event::Join { channel: channel.to_string(), user: actor });
            }
            "PART" => {
                let Some(channel) = msg.param(0) else { return out };
                if actor == self.nick {
                    roster.forget(channel);
                } else {
                    roster.remove(channel, &actor);
                }
                out.emit(Event::Part {
                    channel: channel.to_string(),
                    user: actor,
                    message: msg.param(1).map(String::from),
                });
            }
            "KICK" => {
                let (Some(channel), Some(target)) = (msg.param(0), msg.param(1)) else { return out };
                if target == self.nick {
                    roster.forget(channel);
                } else {
                    roster.remove(channel, target);
                }
                out.emit(Event::Kick {
                    channel: channel.to_string(),
                    actor,
                    target: target.to_string(),
                    message: msg.param(2).unwrap_or_default().to_string(),
                });
            }
            "QUIT" => {
                roster.quit(&actor);
                out.emit(Event::Quit { user: actor, message: msg.param(0).unwrap_or_default().to_string() });
            }
            "NICK" => {
                let Some(new_nick) = msg.param(0) else { return out };
                roster.rename(&actor, new_nick);
                if actor == self.nick {
                    self.nick = new_nick.to_string();
                }
                out.emit(Event::NickChange { old_nick: actor, new_nick: new_nick.to_string() });
            }
            "MODE" => {
                let Some(target) = msg.param(0) else { return out };
                if !is_channel_name(target) || msg.params.len() < 2 {
                    tracing::debug!(target, "ignoring user mode change");
                    return out;
                }
                roster.apply_mode(target, &msg.params[1], &msg.params[2..]);
                out.emit(Event::ModeChange {
                    channel: target.to_string(),
                    actor: msg.nick().unwrap_or("server").to_string(),
                    mode: msg.params[1..].join(" "),
                });
            }
            "TOPIC" => {
                let Some(channel) = msg.param(0) else { return out };
                out.emit(Event::Topic {
                    channel: channel.to_string(),
                    topic: msg.param(1).unwrap_or_default().to_string(),
                    setter: Some(actor),
                });
            }
            "PRIVMSG" => self.privmsg(msg, actor, &mut out),
            "NOTICE" => {
                let (Some(target), Some(text)) = (msg.param(0), msg.param(1)) else { return out };
                let channel = is_channel_name(target).then(|| target.to_string());
                let actor = if msg.from_user() {
                    actor
                } else {
                    msg.source.clone().unwrap_or_else(|| "server".to_string())
                };
                if msg.from_user() && channel.is_none() && text.starts_with(CTCP_DELIM) {
                    // CTCP reply
                    let body = text.trim_matches(CTCP_DELIM);
                    out.emit(Event::Notice { channel: None, actor, text: format!("CTCP reply: {body}") });
                    return out;
                }
                out.emit(Event::Notice { channel, actor, text: text.to_string() });
            }
            "AWAY" => out.emit(Event::Away { user: actor, message: msg.param(0).map(String::from) }),
            "INVITE" => {
                let Some(channel) = msg.param(1) else { return out };
                out.emit(Event::Invite { channel: channel.to_string(), actor });
            }
            other => tracing::trace!(command = other, "unhandled command"),
        }
        out
    }

    fn privmsg(&self, msg: &Message, actor: String, out: &mut Output) {
        let (Some(target), Some(text)) = (msg.param(0), msg.param(1)) else { return };
        let in_channel = is_channel_name(target);

        if unwrap_action(text).is_none() {
            if let Some((command, args)) = parse_ctcp(text) {
                if let Some(reply) = ctcp_reply(command, args) {
                    out.send(Message::new("NOTICE", [actor.clone(), reply]));
                }
                if in_channel {
                    tracing::debug!(command, channel = target, "dropping channel CTCP");
                    return;
                }
            }
        }

        if in_channel {
            out.emit(Event::ChannelMessage { channel: target.to_string(), actor, text: text.to_string() });
        } else {
            out.emit(Event::PrivateMessage { actor, text: text.to_string() });
        }
    }

    fn numeric(&mut self, code: u16, msg: &Message, roster: &RosterCache, out: &mut Output) {
        match code {
            1 => {
                self.registered = true;
                if let Some(nick) = msg.param(0) {
                    self.nick = nick.to_string();
                }
            }
            5 => {
                for token in msg.params.iter().skip(1) {
                    if let Some(value) = token.strip_prefix("PREFIX=") {
                        match PrefixMap::parse(value) {
                            Some(prefixes) => roster.set_prefixes(prefixes),
                            None => tracing::warn!(value, "unparseable PREFIX"),
                        }
                    } else if let Some(value) = token.strip_prefix("CHANMODES=") {
                        roster.set_chanmodes(ChanModes::parse(value));
                    }
                }
            }
            // RPL_TOPIC
            332 => {
                if let (Some(channel), Some(topic)) = (msg.param(1), msg.param(2)) {
                    out.emit(Event::Topic { channel: channel.to_string(), topic: topic.to_string(), setter: None });
                }
                return;
            }
            // RPL_NAMREPLY: me = #chan :names
            353 => {
                if let (Some(channel), Some(names)) = (msg.param(2), msg.param(3)) {
                    roster.names(channel, names);
                }
                return;
            }
            // RPL_ENDOFNAMES
            366 => {
                if let Some(channel) = msg.param(1) {
                    if let Some(users) = roster.end_names(channel) {
                        out.emit(Event::UsersUpdated { channel: channel.to_string(), users });
                    }
                }
                return;
            }
            // ERR_NICKNAMEINUSE
            433 if !self.registered => {
                self.nick_tries += 1;
                if self.nick_tries > MAX_NICK_TRIES {
                    out.close = Some("Nickname in use".to_string());
                } else {
                    self.nick = self.fallback_nick();
                    tracing::info!(nick = %self.nick, "nickname in use, retrying");
                    out.send(Message::new("NICK", [self.nick.as_str()]));
                }
            }
            // RPL_SASLSUCCESS, ERR_SASLFAIL, ERR_SASLTOOLONG, ERR_SASLABORTED
            903 | 904 | 905 | 906 => {
                if code != 903 {
                    tracing::warn!(code, "SASL authentication failed");
                }
                out.send(Message::new("CAP", ["END"]));
            }
            _ => {}
        }
        out.emit(Event::Numeric { code, params: msg.params.clone() });
    }

    fn fallback_nick(&self) -> String {
        match &self.alt_nick {
            Some(alt) if self.nick_tries == 1 && *alt != self.base_nick => alt.clone(),
            _ => format!("{}{}", self.base_nick, self.nick_tries),
        }
    }

    fn cap(&mut self, msg: &Message, out: &mut Output) {
        let sub = msg.param(1).map(str::to_ascii_uppercase);
        match sub.as_deref() {
            Some("LS") => {
                // `CAP * LS * :caps` marks a continuation line.
                let more = msg.params.len() > 3 && msg.params[2] == "*";
                let caps = msg.params.last().map(String::as_str).unwrap_or_default();
                self.offered.extend(caps.split_whitespace().map(|c| c.split('=').next().unwrap_or(c).to_string()));
                if more {
                    return;
                }
                let offered = std::mem::take(&mut self.offered);
                let mut wanted: Vec<&str> =
                    WANTED_CAPS.iter().copied().filter(|c| offered.iter().any(|o| o == c)).collect();
                if self.sasl.is_some() && offered.iter().any(|o| o == "sasl") {
                    wanted.push("sasl");
                }
                if wanted.is_empty() {
                    out.send(Message::new("CAP", ["END"]));
                } else {
                    out.send(Message::new("CAP", ["REQ".to_string(), wanted.join(" ")]));
                }
            }
            Some("ACK") => {
                let caps = msg.params.last().map(String::as_str).unwrap_or_default();
                if self.sasl.is_some() && caps.split_whitespace().any(|c| c == "sasl") {
                    out.send(Message::new("AUTHENTICATE", ["PLAIN"]));
                } else {
                    out.send(Message::new("CAP", ["END"]));
                }
            }
            Some("NAK") => out.send(Message::new("CAP", ["END"])),
            _ => {}
        }
    }

    fn authenticate(&mut self, msg: &Message, out: &mut Output) {
        if msg.param(0) != Some("+") {
            return;
        }
        let Some((user, pass)) = &self.sasl else {
            out.send(Message::new("AUTHENTICATE", ["*"]));
            return;
        };
        out.send(Message::new("AUTHENTICATE", [sasl_plain(user, pass)]));
    }
}

/// `authzid \0 authcid \0 password`, base64.
pub fn sasl_plain(user: &str, pass: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(format!("{user}\0{user}\0{pass}"))
}

fn ctcp_reply(command: &str, args: &str) -> Option<String> {
    match command.to_ascii_uppercase().as_str() {
        "VERSION" => Some(format!("{CTCP_DELIM}VERSION palaver {}{CTCP_DELIM}", env!("CARGO_PKG_VERSION"))),
        "PING" => Some(format!("{CTCP_DELIM}PING {args}{CTCP_DELIM}")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_core::event::MemberSnapshot;

    fn config() -> ServerConfig {
        ServerConfig {
            hostname: "irc.example.net".into(),
            nickname: "alice".into(),
            ..Default::default()
        }
    }

    fn feed(p: &mut Protocol, roster: &RosterCache, line: &str) -> Output {
        p.handle(&Message::parse(line).unwrap(), roster)
    }

    fn lines(out: &Output) -> Vec<String> {
        out.lines.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn preamble_with_password() {
        let cfg = ServerConfig {
            server_password: Some("secret".into()),
            realname: Some("Alice Liddell".into()),
            ..config()
        };
        let lines: Vec<String> = Protocol::new(&cfg).preamble().iter().map(ToString::to_string).collect();
        assert_eq!(
            lines,
            vec!["CAP LS 302", "PASS secret", "NICK alice", "USER alice 0 * :Alice Liddell"]
        );
    }

    #[test]
    fn ping_pong() {
        let mut p = Protocol::new(&config());
        let out = feed(&mut p, &RosterCache::default(), "PING :irc.example.net");
        assert_eq!(lines(&out), vec!["PONG irc.example.net"]);
        assert!(out.events.is_empty());
    }

    #[test]
    fn caps_without_sasl() {
        let mut p = Protocol::new(&config());
        let roster = RosterCache::default();
        let out = feed(&mut p, &roster, ":srv CAP * LS :multi-prefix sasl=PLAIN away-notify");
        assert_eq!(lines(&out), vec!["CAP REQ :multi-prefix away-notify"]);
        let out = feed(&mut p, &roster, ":srv CAP * ACK :multi-prefix away-notify");
        assert_eq!(lines(&out), vec!["CAP END"]);
    }

    #[test]
    fn cap_ls_continuation() {
        let mut p = Protocol::new(&config());
        let roster = RosterCache::default();
        assert!(feed(&mut p, &roster, ":srv CAP * LS * :multi-prefix").lines.is_empty());
        let out = feed(&mut p, &roster, ":srv CAP * LS :chghost");
        assert_eq!(lines(&out), vec!["CAP REQ multi-prefix"]);
    }

    #[test]
    fn sasl_plain_flow() {
        let cfg = ServerConfig {
            sasl_username: Some("alice".into()),
            sasl_password: Some("pw".into()),
            ..config()
        };
        let mut p = Protocol::new(&cfg);
        let roster = RosterCache::default();
        let out = feed(&mut p, &roster, ":srv CAP * LS :sasl");
        assert_eq!(lines(&out), vec!["CAP REQ sasl"]);
        let out = feed(&mut p, &roster, ":srv CAP alice ACK :sasl");
        assert_eq!(lines(&out), vec!["AUTHENTICATE PLAIN"]);
        let out = feed(&mut p, &roster, "AUTHENTICATE +");
        assert_eq!(lines(&out), vec![format!("AUTHENTICATE {}", sasl_plain("alice", "pw"))]);
        let out = feed(&mut p, &roster, ":srv 903 alice :SASL authentication successful");
        assert_eq!(lines(&out), vec!["CAP END"]);
        assert_eq!(sasl_plain("alice", "pw"), "YWxpY2UAYWxpY2UAcHc=");
    }

    #[test]
    fn nick_collision_fallback() {
        let cfg = ServerConfig { alt_nickname: Some("alice_".into()), ..config() };
        let mut p = Protocol::new(&cfg);
        let roster = RosterCache::default();
        let out = feed(&mut p, &roster, ":srv 433 * alice :Nickname is already in use");
        assert_eq!(lines(&out), vec!["NICK alice_"]);
        let out = feed(&mut p, &roster, ":srv 433 * alice_ :Nickname is already in use");
        assert_eq!(lines(&out), vec!["NICK alice2"]);
        for _ in 0..3 {
            feed(&mut p, &roster, ":srv 433 * x :in use");
        }
        let out = feed(&mut p, &roster, ":srv 433 * x :in use");
        assert_eq!(out.close.as_deref(), Some("Nickname in use"));
    }

    #[test]
    fn collision_after_registration_is_just_a_numeric() {
        let mut p = Protocol::new(&config());
        let roster = RosterCache::default();
        feed(&mut p, &roster, ":srv 001 alice1 :Welcome");
        assert!(p.is_registered());
        assert_eq!(p.nick(), "alice1");
        let out = feed(&mut p, &roster, ":srv 433 alice1 bob :Nickname is already in use");
        assert!(out.lines.is_empty());
        assert!(matches!(out.events[..], [Event::Numeric { code: 433, .. }]));
    }

    #[test]
    fn join_and_names_produce_roster_snapshot() {
        let mut p = Protocol::new(&config());
        let roster = RosterCache::default();
        let out = feed(&mut p, &roster, ":alice!a@h JOIN #rust");
        assert_eq!(out.events, vec![Event::Join { channel: "#rust".into(), user: "alice".into() }]);
        assert_eq!(roster.snapshot("#rust").unwrap(), vec![MemberSnapshot::new("alice", "")]);

        assert!(feed(&mut p, &roster, ":srv 353 alice = #rust :alice @bob").events.is_empty());
        let out = feed(&mut p, &roster, ":srv 366 alice #rust :End of /NAMES list.");
        assert_eq!(
            out.events,
            vec![Event::UsersUpdated {
                channel: "#rust".into(),
                users: vec![MemberSnapshot::new("alice", ""), MemberSnapshot::new("bob", "o")],
            }]
        );
    }

    #[test]
    fn isupport_prefix_is_honoured() {
        let mut p = Protocol::new(&config());
        let roster = RosterCache::default();
        feed(&mut p, &roster, ":srv 005 alice PREFIX=(ov)@+ CHANMODES=b,k,l,nt :are supported");
        feed(&mut p, &roster, ":alice!a@h JOIN #c");
        feed(&mut p, &roster, ":srv 353 alice = #c :alice %carol");
        feed(&mut p, &roster, ":srv 366 alice #c :End");
        // '%' is not a prefix on this server, so it stays in the nick.
        assert!(roster.snapshot("#c").unwrap().iter().any(|m| m.nickname == "%carol"));
    }

    #[test]
    fn mode_updates_roster_before_event() {
        let mut p = Protocol::new(&config());
        let roster = RosterCache::default();
        feed(&mut p, &roster, ":alice!a@h JOIN #c");
        feed(&mut p, &roster, ":bob!b@h JOIN #c");
        let out = feed(&mut p, &roster, ":alice!a@h MODE #c +o bob");
        assert_eq!(
            out.events,
            vec![Event::ModeChange { channel: "#c".into(), actor: "alice".into(), mode: "+o bob".into() }]
        );
        assert!(roster.snapshot("#c").unwrap().contains(&MemberSnapshot::new("bob", "o")));
        assert!(feed(&mut p, &roster, ":alice MODE alice +i").events.is_empty());
    }

    #[test]
    fn privmsg_routing_and_ctcp() {
        let mut p = Protocol::new(&config());
        let roster = RosterCache::default();
        let out = feed(&mut p, &roster, ":bob!b@h PRIVMSG #rust :hi");
        assert_eq!(
            out.events,
            vec![Event::ChannelMessage { channel: "#rust".into(), actor: "bob".into(), text: "hi".into() }]
        );
        let out = feed(&mut p, &roster, ":bob!b@h PRIVMSG alice :\x01ACTION waves\x01");
        assert_eq!(
            out.events,
            vec![Event::PrivateMessage { actor: "bob".into(), text: "\x01ACTION waves\x01".into() }]
        );

        let out = feed(&mut p, &roster, ":bob!b@h PRIVMSG alice :\x01VERSION\x01");
        assert_eq!(out.lines.len(), 1);
        assert!(out.lines[0].to_string().starts_with("NOTICE bob :\x01VERSION palaver "));
        assert_eq!(out.events.len(), 1, "private CTCP still reaches the session");

        let out = feed(&mut p, &roster, ":bob!b@h PRIVMSG #rust :\x01PING 123\x01");
        assert_eq!(lines(&out), vec!["NOTICE bob :\x01PING 123\x01"]);
        assert!(out.events.is_empty());
    }

    #[test]
    fn notices() {
        let mut p = Protocol::new(&config());
        let roster = RosterCache::default();
        let out = feed(&mut p, &roster, ":irc.example.net NOTICE * :*** Looking up your hostname");
        assert_eq!(
            out.events,
            vec![Event::Notice {
                channel: None,
                actor: "irc.example.net".into(),
                text: "*** Looking up your hostname".into()
            }]
        );
        let out = feed(&mut p, &roster, ":bob!b@h NOTICE #rust :heads up");
        assert_eq!(
            out.events,
            vec![Event::Notice { channel: Some("#rust".into()), actor: "bob".into(), text: "heads up".into() }]
        );
    }

    #[test]
    fn self_part_and_kick_forget_channel() {
        let mut p = Protocol::new(&config());
        let roster = RosterCache::default();
        feed(&mut p, &roster, ":alice!a@h JOIN #a");
        feed(&mut p, &roster, ":alice!a@h JOIN #b");
        feed(&mut p, &roster, ":alice!a@h PART #a :bye");
        assert!(roster.snapshot("#a").is_none());
        let out = feed(&mut p, &roster, ":op!o@h KICK #b alice :out");
        assert!(roster.snapshot("#b").is_none());
        assert_eq!(
            out.events,
            vec![Event::Kick { channel: "#b".into(), actor: "op".into(), target: "alice".into(), message: "out".into() }]
        );
    }

    #[test]
    fn own_nick_change_is_tracked() {
        let mut p = Protocol::new(&config());
        let roster = RosterCache::default();
        feed(&mut p, &roster, ":alice!a@h JOIN #a");
        feed(&mut p, &roster, ":alice!a@h NICK alicia");
        assert_eq!(p.nick(), "alicia");
        assert!(roster.snapshot("#a").unwrap().iter().any(|m| m.nickname == "alicia"));
    }

    #[test]
    fn topic_sources() {
        let mut p = Protocol::new(&config());
        let roster = RosterCache::default();
        let out = feed(&mut p, &roster, ":srv 332 alice #rust :Welcome");
        assert_eq!(
            out.events,
            vec![Event::Topic { channel: "#rust".into(), topic: "Welcome".into(), setter: None }]
        );
        let out = feed(&mut p, &roster, ":bob!b@h TOPIC #rust :New");
        assert_eq!(
            out.events,
            vec![Event::Topic { channel: "#rust".into(), topic: "New".into(), setter: Some("bob".into()) }]
        );
    }

    #[test]
    fn error_closes() {
        let mut p = Protocol::new(&config());
        let out = feed(&mut p, &RosterCache::default(), "ERROR :Closing Link: (Ping timeout)");
        assert_eq!(out.close.as_deref(), Some("Closing Link: (Ping timeout)"));
    }
}

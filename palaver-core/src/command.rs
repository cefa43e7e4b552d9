//! Slash-command parsing.
//!
//! [`parse`] is pure and total: every input maps to a [`CommandIntent`].
//! Text without the `/` prefix, or with a doubled `//` prefix, is
//! `NotACommand`; the UI strips one `/` from the latter and sends it as a
//! literal message. A known command with missing arguments, or an unknown
//! command name, becomes `Unknown` so the caller can decide whether to send
//! it as a raw line.

/// The command prefix character.
pub const COMMAND_PREFIX: char = '/';

/// Characters that start a channel name.
pub const CHANNEL_SIGILS: [char; 4] = ['#', '&', '+', '!'];

/// A parsed user command.
///
/// Channel arguments marked `Option` are omitted when the user relies on the
/// current buffer; the dispatcher fills them from context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandIntent {
    // Channel operations
    Join { channel: String, key: Option<String> },
    Part { channel: Option<String>, reason: Option<String> },
    Cycle { channel: Option<String>, reason: Option<String> },
    Topic { channel: Option<String>, topic: Option<String> },
    Invite { nick: String, channel: Option<String> },
    List { filter: Option<String> },
    Names { channel: Option<String> },

    // Messaging
    Message { target: String, text: String },
    Query { nick: String, text: Option<String> },
    Me { action: String },
    Notice { target: String, text: String },
    Ctcp { target: String, command: String, args: Option<String> },

    // User
    Nick { nick: String },
    Whois { nick: String },
    Who { mask: String },
    Away { message: String },
    Back,
    Ignore { nick: String },
    Unignore { nick: String },

    // Moderation
    Kick { channel: Option<String>, nick: String, reason: Option<String> },
    Ban { channel: Option<String>, mask: String },
    Unban { channel: Option<String>, mask: String },
    KickBan { channel: Option<String>, nick: String, reason: Option<String> },
    Voice { channel: Option<String>, nicks: Vec<String> },
    Devoice { channel: Option<String>, nicks: Vec<String> },
    Op { channel: Option<String>, nicks: Vec<String> },
    Deop { channel: Option<String>, nicks: Vec<String> },
    Quiet { channel: Option<String>, mask: String },
    Unquiet { channel: Option<String>, mask: String },
    Mode { target: Option<String>, modes: String },

    // Services
    Identify { args: String },
    NickServ { command: String },
    ChanServ { command: String },
    MemoServ { command: String },

    // Server
    Quit { message: Option<String> },
    Raw { line: String },
    Ping { target: Option<String> },
    Time { server: Option<String> },
    Version { server: Option<String> },
    Motd { server: Option<String> },
    Info { server: Option<String> },
    Links { mask: Option<String> },
    Map,
    Lusers,
    Admin { server: Option<String> },

    // Operator
    Oper { name: String, password: String },
    Kill { nick: String, reason: Option<String> },
    Kline { mask: String, reason: Option<String> },
    Gline { mask: String, reason: Option<String> },
    Zline { mask: String, reason: Option<String> },
    Rehash,
    Restart,
    Die,
    Wallops { message: String },
    Sajoin { nick: String, channel: String },

    // Client-local
    Clear,
    Sysinfo,
    Help { topic: Option<String> },

    /// Unrecognized command, or a known one missing required arguments.
    Unknown { command: String, args: String },
    NotACommand,
}

/// One line of `/help` output.
pub struct CommandHelp {
    pub name: &'static str,
    pub usage: &'static str,
}

macro_rules! help {
    ($($name:literal => $usage:literal),* $(,)?) => {
        &[$(CommandHelp { name: $name, usage: $usage }),*]
    };
}

/// Every command the parser understands, in help order.
pub const COMMANDS: &[CommandHelp] = help! {
    "join" => "/join <channel>[,<channel>] [key]  (alias /j)",
    "part" => "/part [channel] [reason]  (alias /leave)",
    "cycle" => "/cycle [channel] [reason]",
    "topic" => "/topic [channel] [new topic]",
    "invite" => "/invite <nick> [channel]",
    "list" => "/list [filter]",
    "names" => "/names [channel]",
    "msg" => "/msg <target> <text>  (alias /m)",
    "query" => "/query <nick> [text]  (alias /q)",
    "me" => "/me <action>",
    "notice" => "/notice <target> <text>",
    "ctcp" => "/ctcp <target> <command> [args]",
    "nick" => "/nick <newnick>",
    "whois" => "/whois <nick>  (alias /w)",
    "who" => "/who <mask>",
    "away" => "/away <message>",
    "back" => "/back",
    "ignore" => "/ignore <nick>",
    "unignore" => "/unignore <nick>",
    "kick" => "/kick [channel] <nick> [reason]  (alias /k)",
    "ban" => "/ban [channel] <nick|mask>",
    "unban" => "/unban [channel] <nick|mask>",
    "kb" => "/kb [channel] <nick> [reason]  (alias /kickban)",
    "voice" => "/voice [channel] <nick>...",
    "devoice" => "/devoice [channel] <nick>...",
    "op" => "/op [channel] <nick>...",
    "deop" => "/deop [channel] <nick>...",
    "quiet" => "/quiet [channel] <nick|mask>",
    "unquiet" => "/unquiet [channel] <nick|mask>",
    "mode" => "/mode [target] <modes> [args]",
    "identify" => "/identify [account] <password>",
    "ns" => "/ns <command>  (alias /nickserv)",
    "cs" => "/cs <command>  (alias /chanserv)",
    "ms" => "/ms <command>  (alias /memoserv)",
    "quit" => "/quit [message]  (alias /exit)",
    "raw" => "/raw <line>  (alias /quote)",
    "ping" => "/ping [target]",
    "time" => "/time [server]",
    "version" => "/version [server]",
    "motd" => "/motd [server]",
    "info" => "/info [server]",
    "links" => "/links [mask]",
    "map" => "/map",
    "lusers" => "/lusers",
    "admin" => "/admin [server]",
    "oper" => "/oper <name> <password>",
    "kill" => "/kill <nick> [reason]",
    "kline" => "/kline <mask> [reason]",
    "gline" => "/gline <mask> [reason]",
    "zline" => "/zline <mask> [reason]",
    "rehash" => "/rehash",
    "restart" => "/restart",
    "die" => "/die",
    "wallops" => "/wallops <message>",
    "sajoin" => "/sajoin <nick> <channel>  (alias /saje)",
    "clear" => "/clear",
    "sysinfo" => "/sysinfo",
    "help" => "/help [command]",
};

/// Parse one line of user input.
pub fn parse(text: &str) -> CommandIntent {
    let Some(rest) = text.strip_prefix(COMMAND_PREFIX) else {
        return CommandIntent::NotACommand;
    };
    if rest.starts_with(COMMAND_PREFIX) {
        return CommandIntent::NotACommand;
    }

    let (name, args) = match rest.find(char::is_whitespace) {
        Some(i) => (&rest[..i], rest[i..].trim()),
        None => (rest, ""),
    };
    let lower = name.to_ascii_lowercase();

    parse_named(canonical(&lower), args).unwrap_or_else(|| CommandIntent::Unknown {
        command: name.to_string(),
        args: args.to_string(),
    })
}

/// Resolve aliases to the canonical command name.
fn canonical(name: &str) -> &str {
    match name {
        "j" => "join",
        "leave" => "part",
        "hop" | "rejoin" => "cycle",
        "n" => "names",
        "m" => "msg",
        "q" => "query",
        "w" => "whois",
        "k" => "kick",
        "kickban" | "bk" => "kb",
        "nickserv" => "ns",
        "chanserv" => "cs",
        "memoserv" => "ms",
        "exit" | "disconnect" => "quit",
        "quote" => "raw",
        "saje" => "sajoin",
        "wallop" => "wallops",
        other => other,
    }
}

fn parse_named(name: &str, args: &str) -> Option<CommandIntent> {
    use CommandIntent as C;

    let intent = match name {
        "join" => {
            let [channels, key] = split_args::<2>(args);
            let channel = channels?
                .split(',')
                .filter(|c| !c.is_empty())
                .map(with_channel_sigil)
                .collect::<Vec<_>>()
                .join(",");
            if channel.is_empty() {
                return None;
            }
            C::Join { channel, key: key.map(String::from) }
        }
        "part" => {
            let (channel, reason) = split_channel(args);
            C::Part { channel, reason: non_empty(reason) }
        }
        "cycle" => {
            let (channel, reason) = split_channel(args);
            C::Cycle { channel, reason: non_empty(reason) }
        }
        "topic" => {
            let (channel, topic) = split_channel(args);
            C::Topic { channel, topic: non_empty(topic) }
        }
        "invite" => {
            let [nick, channel] = split_args::<2>(args);
            C::Invite { nick: nick?.to_string(), channel: channel.map(String::from) }
        }
        "list" => C::List { filter: non_empty(args) },
        "names" => C::Names { channel: non_empty(args) },

        "msg" => {
            let [target, text] = split_args::<2>(args);
            C::Message { target: target?.to_string(), text: text?.to_string() }
        }
        "query" => {
            let [nick, text] = split_args::<2>(args);
            C::Query { nick: nick?.to_string(), text: text.map(String::from) }
        }
        "me" => C::Me { action: non_empty(args)? },
        "notice" => {
            let [target, text] = split_args::<2>(args);
            C::Notice { target: target?.to_string(), text: text?.to_string() }
        }
        "ctcp" => {
            let [target, command, rest] = split_args::<3>(args);
            C::Ctcp {
                target: target?.to_string(),
                command: command?.to_ascii_uppercase(),
                args: rest.map(String::from),
            }
        }

        "nick" => C::Nick { nick: first_word(args)? },
        "whois" => C::Whois { nick: first_word(args)? },
        "who" => C::Who { mask: first_word(args)? },
        "away" => C::Away { message: non_empty(args)? },
        "back" => C::Back,
        "ignore" => C::Ignore { nick: first_word(args)? },
        "unignore" => C::Unignore { nick: first_word(args)? },

        "kick" | "kb" => {
            let (channel, rest) = split_channel(args);
            let [nick, reason] = split_args::<2>(rest);
            let nick = nick?.to_string();
            let reason = reason.map(String::from);
            if name == "kick" {
                C::Kick { channel, nick, reason }
            } else {
                C::KickBan { channel, nick, reason }
            }
        }
        "ban" | "unban" | "quiet" | "unquiet" => {
            let (channel, rest) = split_channel(args);
            let mask = first_word(rest)?;
            match name {
                "ban" => C::Ban { channel, mask },
                "unban" => C::Unban { channel, mask },
                "quiet" => C::Quiet { channel, mask },
                _ => C::Unquiet { channel, mask },
            }
        }
        "voice" | "devoice" | "op" | "deop" => {
            let (channel, rest) = split_channel(args);
            let nicks: Vec<String> = rest.split_whitespace().map(String::from).collect();
            if nicks.is_empty() {
                return None;
            }
            match name {
                "voice" => C::Voice { channel, nicks },
                "devoice" => C::Devoice { channel, nicks },
                "op" => C::Op { channel, nicks },
                _ => C::Deop { channel, nicks },
            }
        }
        "mode" => {
            let args = non_empty(args)?;
            if args.starts_with(['+', '-']) {
                C::Mode { target: None, modes: args }
            } else {
                let [target, modes] = split_args::<2>(&args);
                C::Mode {
                    target: target.map(String::from),
                    modes: modes.unwrap_or_default().to_string(),
                }
            }
        }

        "identify" => C::Identify { args: non_empty(args)? },
        "ns" => C::NickServ { command: non_empty(args)? },
        "cs" => C::ChanServ { command: non_empty(args)? },
        "ms" => C::MemoServ { command: non_empty(args)? },

        "quit" => C::Quit { message: non_empty(args) },
        "raw" => C::Raw { line: non_empty(args)? },
        "ping" => C::Ping { target: first_word(args) },
        "time" => C::Time { server: first_word(args) },
        "version" => C::Version { server: first_word(args) },
        "motd" => C::Motd { server: first_word(args) },
        "info" => C::Info { server: first_word(args) },
        "links" => C::Links { mask: first_word(args) },
        "map" => C::Map,
        "lusers" => C::Lusers,
        "admin" => C::Admin { server: first_word(args) },

        "oper" => {
            let [name, password] = split_args::<2>(args);
            C::Oper { name: name?.to_string(), password: password?.to_string() }
        }
        "kill" | "kline" | "gline" | "zline" => {
            let [target, reason] = split_args::<2>(args);
            let target = target?.to_string();
            let reason = reason.map(String::from);
            match name {
                "kill" => C::Kill { nick: target, reason },
                "kline" => C::Kline { mask: target, reason },
                "gline" => C::Gline { mask: target, reason },
                _ => C::Zline { mask: target, reason },
            }
        }
        "rehash" => C::Rehash,
        "restart" => C::Restart,
        "die" => C::Die,
        "wallops" => C::Wallops { message: non_empty(args)? },
        "sajoin" => {
            let [nick, channel] = split_args::<2>(args);
            C::Sajoin { nick: nick?.to_string(), channel: channel?.to_string() }
        }

        "clear" => C::Clear,
        "sysinfo" => C::Sysinfo,
        "help" => C::Help { topic: first_word(args).map(|t| t.trim_start_matches(COMMAND_PREFIX).to_ascii_lowercase()) },

        _ => return None,
    };
    Some(intent)
}

/// Whitespace-split `args` into at most `N` pieces; the last piece keeps the
/// rest of the line. Missing pieces are `None`.
pub fn split_args<const N: usize>(args: &str) -> [Option<&str>; N] {
    let mut out = [None; N];
    let mut rest = args.trim();
    for (i, slot) in out.iter_mut().enumerate() {
        if rest.is_empty() {
            break;
        }
        if i + 1 == N {
            *slot = Some(rest);
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(end) => {
                *slot = Some(&rest[..end]);
                rest = rest[end..].trim_start();
            }
            None => {
                *slot = Some(rest);
                rest = "";
            }
        }
    }
    out
}

/// Peel a leading channel name off `args`, if there is one.
fn split_channel(args: &str) -> (Option<String>, &str) {
    let [first, rest] = split_args::<2>(args);
    match first {
        Some(first) if is_channel_name(first) => (Some(first.to_string()), rest.unwrap_or("")),
        _ => (None, args.trim()),
    }
}

fn first_word(args: &str) -> Option<String> {
    args.split_whitespace().next().map(String::from)
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

pub fn is_channel_name(name: &str) -> bool {
    name.starts_with(CHANNEL_SIGILS)
}

/// Prefix `#` unless `name` already starts with a channel sigil.
pub fn with_channel_sigil(name: &str) -> String {
    let name = name.trim();
    if is_channel_name(name) {
        name.to_string()
    } else {
        format!("#{name}")
    }
}

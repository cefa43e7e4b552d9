//! Maps parsed [`CommandIntent`]s to outbound protocol operations.
//!
//! [`plan`] is pure. It never touches session state; anything that must
//! happen locally (echoing our own message, updating the ignore list,
//! disconnecting) comes back as a [`Local`] action for the session worker.

use thiserror::Error;

use crate::command::{COMMAND_PREFIX, COMMANDS, CommandIntent, is_channel_name};
use crate::message;
use crate::transport::Outbound;

/// Where a command was typed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    /// The buffer the user is looking at: a channel, a query nick, or none.
    pub target: Option<String>,
}

impl Context {
    pub fn in_buffer(target: impl Into<String>) -> Self {
        Self { target: Some(target.into()) }
    }

    fn channel(&self) -> Option<&str> {
        self.target.as_deref().filter(|t| is_channel_name(t))
    }
}

/// Work that stays inside the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Local {
    /// Log a self-originated message to `target` (CTCP ACTION unwrapped).
    Echo { target: String, text: String },
    /// Log a self-originated notice.
    EchoNotice { target: String, text: String },
    /// Client-side informational line.
    System(String),
    OpenQuery(String),
    Ignore(String),
    Unignore(String),
    Disconnect(Option<String>),
    /// Clearing a buffer is a UI concern; handed back to the caller.
    Clear,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Plan {
    pub outbound: Vec<Outbound>,
    pub local: Vec<Local>,
}

impl Plan {
    fn send(line: impl Into<String>) -> Self {
        Self { outbound: vec![Outbound::raw(line)], local: Vec::new() }
    }

    fn local(action: Local) -> Self {
        Self { outbound: Vec::new(), local: vec![action] }
    }

    fn message(target: &str, text: String) -> Self {
        if is_service(target) {
            return Self::service(target, &text);
        }
        Self {
            outbound: vec![Outbound::Message { target: target.to_string(), text: text.clone() }],
            local: vec![Local::Echo { target: target.to_string(), text }],
        }
    }

    /// Services get plain PRIVMSGs with no local echo; they may carry passwords.
    fn service(service: &str, text: &str) -> Self {
        Self {
            outbound: vec![Outbound::Message { target: service.to_string(), text: text.to_string() }],
            local: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("/{0} needs a channel")]
    NeedsChannel(&'static str),
    #[error("/{0} needs a target")]
    NeedsTarget(&'static str),
}

pub fn plan(intent: &CommandIntent, ctx: &Context) -> Result<Plan, DispatchError> {
    use CommandIntent as C;

    let plan = match intent {
        C::Join { channel, key } => {
            let outbound = channel
                .split(',')
                .filter(|c| !c.is_empty())
                .enumerate()
                .map(|(i, c)| Outbound::Join {
                    channel: c.to_string(),
                    key: if i == 0 { key.clone() } else { None },
                })
                .collect();
            Plan { outbound, local: Vec::new() }
        }
        C::Part { channel, reason } => {
            let channel = channel_or(channel, ctx, "part")?;
            Plan {
                outbound: vec![Outbound::Part { channel, reason: reason.clone() }],
                local: Vec::new(),
            }
        }
        C::Cycle { channel, reason } => {
            let channel = channel_or(channel, ctx, "cycle")?;
            Plan {
                outbound: vec![
                    Outbound::Part { channel: channel.clone(), reason: reason.clone() },
                    Outbound::Join { channel, key: None },
                ],
                local: Vec::new(),
            }
        }
        C::Topic { channel, topic } => {
            let channel = channel_or(channel, ctx, "topic")?;
            match topic {
                Some(t) => Plan::send(format!("TOPIC {channel} :{t}")),
                None => Plan::send(format!("TOPIC {channel}")),
            }
        }
        C::Invite { nick, channel } => {
            let channel = channel_or(channel, ctx, "invite")?;
            Plan::send(format!("INVITE {nick} {channel}"))
        }
        C::List { filter } => Plan::send(with_arg("LIST", filter.as_deref())),
        C::Names { channel } => {
            let channel = channel.as_deref().or(ctx.channel());
            Plan::send(with_arg("NAMES", channel))
        }

        C::Message { target, text } => Plan::message(target, text.clone()),
        C::Query { nick, text } => {
            let mut plan = match text {
                Some(text) => Plan::message(nick, text.clone()),
                None => Plan::default(),
            };
            plan.local.insert(0, Local::OpenQuery(nick.clone()));
            plan
        }
        C::Me { action } => {
            let target = ctx.target.as_deref().ok_or(DispatchError::NeedsTarget("me"))?;
            Plan::message(target, message::wrap_action(action))
        }
        C::Notice { target, text } => Plan {
            outbound: vec![Outbound::raw(format!("NOTICE {target} :{text}"))],
            local: vec![Local::EchoNotice { target: target.clone(), text: text.clone() }],
        },
        C::Ctcp { target, command, args } => {
            let text = match args {
                Some(a) => format!("\x01{command} {a}\x01"),
                None => format!("\x01{command}\x01"),
            };
            Plan {
                outbound: vec![Outbound::Message { target: target.clone(), text }],
                local: vec![Local::System(format!("CTCP {command} sent to {target}"))],
            }
        }

        C::Nick { nick } => Plan::send(format!("NICK {nick}")),
        C::Whois { nick } => Plan::send(format!("WHOIS {nick}")),
        C::Who { mask } => Plan::send(format!("WHO {mask}")),
        C::Away { message } => Plan::send(format!("AWAY :{message}")),
        C::Back => Plan::send("AWAY"),
        C::Ignore { nick } => Plan::local(Local::Ignore(nick.clone())),
        C::Unignore { nick } => Plan::local(Local::Unignore(nick.clone())),

        C::Kick { channel, nick, reason } => {
            let channel = channel_or(channel, ctx, "kick")?;
            Plan::send(kick_line(&channel, nick, reason.as_deref()))
        }
        C::Ban { channel, mask } => mode_mask(channel, ctx, "ban", "+b", mask)?,
        C::Unban { channel, mask } => mode_mask(channel, ctx, "unban", "-b", mask)?,
        C::Quiet { channel, mask } => mode_mask(channel, ctx, "quiet", "+q", mask)?,
        C::Unquiet { channel, mask } => mode_mask(channel, ctx, "unquiet", "-q", mask)?,
        C::KickBan { channel, nick, reason } => {
            let channel = channel_or(channel, ctx, "kb")?;
            Plan {
                outbound: vec![
                    Outbound::raw(format!("MODE {channel} +b {}", ban_mask(nick))),
                    Outbound::raw(kick_line(&channel, nick, reason.as_deref())),
                ],
                local: Vec::new(),
            }
        }
        C::Voice { channel, nicks } => member_mode(channel, ctx, "voice", '+', 'v', nicks)?,
        C::Devoice { channel, nicks } => member_mode(channel, ctx, "devoice", '-', 'v', nicks)?,
        C::Op { channel, nicks } => member_mode(channel, ctx, "op", '+', 'o', nicks)?,
        C::Deop { channel, nicks } => member_mode(channel, ctx, "deop", '-', 'o', nicks)?,
        C::Mode { target, modes } => {
            let target = target
                .as_deref()
                .or(ctx.target.as_deref())
                .ok_or(DispatchError::NeedsTarget("mode"))?;
            Plan::send(with_arg(&format!("MODE {target}"), Some(modes.as_str()).filter(|m| !m.is_empty())))
        }

        C::Identify { args } => Plan::service("NickServ", &format!("IDENTIFY {args}")),
        C::NickServ { command } => Plan::service("NickServ", command),
        C::ChanServ { command } => Plan::service("ChanServ", command),
        C::MemoServ { command } => Plan::service("MemoServ", command),

        C::Quit { message } => Plan::local(Local::Disconnect(message.clone())),
        C::Raw { line } => Plan::send(line.clone()),
        C::Ping { target: Some(nick) } => {
            let stamp = chrono::Utc::now().timestamp_millis();
            Plan {
                outbound: vec![Outbound::Message { target: nick.clone(), text: format!("\x01PING {stamp}\x01") }],
                local: vec![Local::System(format!("CTCP PING sent to {nick}"))],
            }
        }
        C::Ping { target: None } => Plan::send(format!("PING :{}", chrono::Utc::now().timestamp_millis())),
        C::Time { server } => Plan::send(with_arg("TIME", server.as_deref())),
        C::Version { server } => Plan::send(with_arg("VERSION", server.as_deref())),
        C::Motd { server } => Plan::send(with_arg("MOTD", server.as_deref())),
        C::Info { server } => Plan::send(with_arg("INFO", server.as_deref())),
        C::Links { mask } => Plan::send(with_arg("LINKS", mask.as_deref())),
        C::Map => Plan::send("MAP"),
        C::Lusers => Plan::send("LUSERS"),
        C::Admin { server } => Plan::send(with_arg("ADMIN", server.as_deref())),

        C::Oper { name, password } => Plan::send(format!("OPER {name} {password}")),
        C::Kill { nick, reason } => Plan::send(with_trailing(&format!("KILL {nick}"), reason.as_deref())),
        C::Kline { mask, reason } => Plan::send(with_trailing(&format!("KLINE {mask}"), reason.as_deref())),
        C::Gline { mask, reason } => Plan::send(with_trailing(&format!("GLINE {mask}"), reason.as_deref())),
        C::Zline { mask, reason } => Plan::send(with_trailing(&format!("ZLINE {mask}"), reason.as_deref())),
        C::Rehash => Plan::send("REHASH"),
        C::Restart => Plan::send("RESTART"),
        C::Die => Plan::send("DIE"),
        C::Wallops { message } => Plan::send(format!("WALLOPS :{message}")),
        C::Sajoin { nick, channel } => Plan::send(format!("SAJOIN {nick} {channel}")),

        C::Clear => Plan::local(Local::Clear),
        C::Sysinfo => Plan::local(Local::System(sysinfo())),
        C::Help { topic } => Plan { outbound: Vec::new(), local: help(topic.as_deref()) },

        C::Unknown { command, args } => {
            Plan::send(with_arg(&command.to_ascii_uppercase(), Some(args.as_str()).filter(|a| !a.is_empty())))
        }
        C::NotACommand => Plan::default(),
    };
    Ok(plan)
}

/// NickServ, ChanServ and friends.
fn is_service(target: &str) -> bool {
    !target.starts_with(['#', '&']) && target.to_ascii_lowercase().ends_with("serv")
}

fn channel_or(channel: &Option<String>, ctx: &Context, command: &'static str) -> Result<String, DispatchError> {
    channel
        .as_deref()
        .or(ctx.channel())
        .map(String::from)
        .ok_or(DispatchError::NeedsChannel(command))
}

fn mode_mask(
    channel: &Option<String>,
    ctx: &Context,
    command: &'static str,
    mode: &str,
    mask: &str,
) -> Result<Plan, DispatchError> {
    let channel = channel_or(channel, ctx, command)?;
    Ok(Plan::send(format!("MODE {channel} {mode} {}", ban_mask(mask))))
}

fn member_mode(
    channel: &Option<String>,
    ctx: &Context,
    command: &'static str,
    sign: char,
    letter: char,
    nicks: &[String],
) -> Result<Plan, DispatchError> {
    let channel = channel_or(channel, ctx, command)?;
    let letters: String = std::iter::once(sign)
        .chain(std::iter::repeat_n(letter, nicks.len()))
        .collect();
    Ok(Plan::send(format!("MODE {channel} {letters} {}", nicks.join(" "))))
}

/// A bare nick becomes `nick!*@*`; anything that already looks like a mask
/// is left alone.
pub fn ban_mask(mask: &str) -> String {
    if mask.contains(['!', '@', '*', '$', ':']) {
        mask.to_string()
    } else {
        format!("{mask}!*@*")
    }
}

fn kick_line(channel: &str, nick: &str, reason: Option<&str>) -> String {
    with_trailing(&format!("KICK {channel} {nick}"), reason)
}

fn with_arg(command: &str, arg: Option<&str>) -> String {
    match arg {
        Some(a) => format!("{command} {a}"),
        None => command.to_string(),
    }
}

fn with_trailing(command: &str, trailing: Option<&str>) -> String {
    match trailing {
        Some(t) => format!("{command} :{t}"),
        None => command.to_string(),
    }
}

fn sysinfo() -> String {
    format!(
        "palaver {} on {}/{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

fn help(topic: Option<&str>) -> Vec<Local> {
    match topic {
        Some(topic) => match COMMANDS.iter().find(|c| c.name == topic) {
            Some(c) => vec![Local::System(c.usage.to_string())],
            None => vec![Local::System(format!("No help for {COMMAND_PREFIX}{topic}"))],
        },
        None => std::iter::once(Local::System("Commands:".to_string()))
            .chain(COMMANDS.iter().map(|c| Local::System(format!("  {}", c.usage))))
            .collect(),
    }
}

//! palaver: a line-mode IRC client.
//!
//! Reads commands and text from stdin, prints the chat log to stdout.
//! Type `/help` for commands, `/switch <buffer>` to change where plain text
//! goes, `//text` to send text starting with a slash.

mod config;
mod input;
mod render;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use palaver_core::dispatch::Context;
use palaver_core::session::Submitted;
use palaver_core::{CommandIntent, ConnectionSession, SessionError};
use palaver_irc::IrcTransportFactory;

use crate::config::{FileConfig, Overrides};
use crate::input::Input;

#[derive(Parser)]
#[command(name = "palaver", version, about = "Line-mode IRC client")]
struct Cli {
    /// IRC server (host or host:port)
    server: Option<String>,

    /// Port, if not given with the server
    #[arg(short, long)]
    port: Option<u16>,

    /// Connect with TLS (implied by port 6697)
    #[arg(long)]
    tls: bool,

    /// Nickname
    #[arg(short, long)]
    nick: Option<String>,

    /// Channels to join after registration, comma-separated
    #[arg(short, long)]
    channels: Option<String>,

    /// SASL PLAIN account name
    #[arg(long)]
    sasl_user: Option<String>,

    /// SASL PLAIN password
    #[arg(long, env = "PALAVER_SASL_PASSWORD", hide_env_values = true)]
    sasl_password: Option<String>,

    /// NickServ password, sent after registration
    #[arg(long, env = "PALAVER_NICKSERV_PASSWORD", hide_env_values = true)]
    nickserv_password: Option<String>,

    /// Proxy URL: socks5://[user:pass@]host:port or http://host:port
    #[arg(long)]
    proxy: Option<String>,

    /// Pause between on-connect script lines, in milliseconds
    #[arg(long)]
    script_delay_ms: Option<u64>,

    /// Config file (default: ~/.config/palaver/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            server: self.server.clone(),
            port: self.port,
            tls: self.tls,
            nick: self.nick.clone(),
            channels: self.channels.clone(),
            sasl_user: self.sasl_user.clone(),
            sasl_password: self.sasl_password.clone(),
            nickserv_password: self.nickserv_password.clone(),
            proxy: self.proxy.clone(),
            script_delay_ms: self.script_delay_ms,
        }
    }
}

fn init_logging() -> Result<()> {
    // JSON logs with PALAVER_LOG_JSON=1, human-readable otherwise. Logs go
    // to stderr so they don't interleave with the chat on stdout.
    let json_logs = std::env::var("PALAVER_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("palaver=info"))?;
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    let path = cli.config.clone().unwrap_or_else(config::default_path);
    let file = FileConfig::load(&path)?;
    let (server, options) = config::resolve(&cli.overrides(), file)?;
    server.validate()?;
    tracing::info!(host = %server.hostname, port = server.port, tls = server.tls, nick = %server.nickname, "starting");

    let session = ConnectionSession::new(server, Arc::new(IrcTransportFactory::new()), options);
    let printer = tokio::spawn(print_messages(session.subscribe()));
    session.connect().await?;

    let mut focus: Option<String> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        };
        match handle_line(&session, &mut focus, &line).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => eprintln!("!!! {e}"),
        }
    }

    session.disconnect("Leaving").await?;
    drop(session);
    let _ = tokio::time::timeout(Duration::from_secs(2), printer).await;
    Ok(())
}

/// Returns `Ok(false)` when the user asked to quit.
async fn handle_line(session: &ConnectionSession, focus: &mut Option<String>, line: &str) -> Result<bool, SessionError> {
    match input::classify(line) {
        Input::Empty => {}
        Input::Say(text) => match focus.as_deref() {
            Some(target) => session.send_message(target, &text).await?,
            None => eprintln!("!!! no current buffer; use /switch <channel> or /join"),
        },
        Input::Switch(name) => {
            println!("-- now talking in {name}");
            *focus = Some(name);
        }
        Input::Buffers => {
            for channel in session.channels().await? {
                let marker = if focus.as_deref() == Some(channel.name.as_str()) { '*' } else { ' ' };
                println!("{marker} {} ({} users, {} unread)", channel.name, channel.users.len(), channel.unread_count);
            }
        }
        Input::Command(intent) => {
            let quitting = matches!(intent, CommandIntent::Quit { .. });
            let next_focus = input::focus_after(&intent);
            let context = Context { target: focus.clone() };
            match session.submit(intent, context).await? {
                Submitted::Clear => println!("\x1b[2J\x1b[H"),
                Submitted::Done => {}
            }
            if let Some(name) = next_focus {
                *focus = Some(name);
            }
            if let Some(name) = focus.as_deref() {
                session.mark_read(name).await?;
            }
            if quitting {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

async fn print_messages(mut rx: broadcast::Receiver<palaver_core::Message>) {
    loop {
        match rx.recv().await {
            Ok(msg) => println!("{}", render::line(&msg)),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "output fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

//! Post-registration automation: NickServ identify, the on-connect script,
//! then auto-join.
//!
//! The sequencer never touches the transport. It walks its step list and
//! posts each step to the session worker tagged with the connection
//! generation, so steps are serialized with inbound events and a step from
//! a torn-down connection is dropped by the worker. Between script lines it
//! sleeps for the configured flood delay; cancellation is observed at every
//! await point.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::command::{self, COMMAND_PREFIX, CommandIntent};
use crate::config::ServerConfig;
use crate::session::Request;

/// One unit of automation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Send `text` to NickServ.
    Identify { text: String },
    /// One on-connect script line, as configured.
    Script { line: String },
    Join { channel: String },
}

/// How the worker should execute a script line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptLine {
    Command(CommandIntent),
    /// Not a command we understand; send the text as a protocol line.
    Raw(String),
}

/// Build the automation steps for a freshly registered connection.
pub fn steps(config: &ServerConfig, nickname: &str) -> Vec<Step> {
    let mut out = Vec::new();
    if let Some(text) = config.identify_text(nickname) {
        out.push(Step::Identify { text });
    }
    out.extend(config.script_lines().into_iter().map(|line| Step::Script { line }));
    out.extend(config.auto_join_list().into_iter().map(|channel| Step::Join { channel }));
    out
}

/// Interpret a script line, adding the command prefix if it is missing.
pub fn script_line(line: &str) -> ScriptLine {
    let line = line.trim();
    let bare = line.strip_prefix(COMMAND_PREFIX).unwrap_or(line);
    match command::parse(&format!("{COMMAND_PREFIX}{bare}")) {
        CommandIntent::Unknown { .. } | CommandIntent::NotACommand => ScriptLine::Raw(bare.to_string()),
        intent => ScriptLine::Command(intent),
    }
}

/// Run `steps` on a background task until done or `token` is cancelled.
pub(crate) fn spawn(
    steps: Vec<Step>,
    generation: u64,
    tx: mpsc::Sender<Request>,
    delay: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let total = steps.len();
        tracing::debug!(generation, steps = total, "connect sequencer started");
        let mut previous_was_script = false;
        for (i, step) in steps.into_iter().enumerate() {
            let is_script = matches!(step, Step::Script { .. });
            if is_script && previous_was_script {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            previous_was_script = is_script;

            let request = Request::Automation {
                generation,
                step,
                token: token.clone(),
            };
            tokio::select! {
                _ = token.cancelled() => break,
                sent = tx.send(request) => {
                    if sent.is_err() {
                        tracing::debug!(generation, "session gone, sequencer stopping");
                        return;
                    }
                }
            }
            tracing::trace!(generation, step = i + 1, total, "sequencer step queued");
        }
        if token.is_cancelled() {
            tracing::info!(generation, "connect sequencer cancelled");
        } else {
            tracing::debug!(generation, "connect sequencer finished");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServerConfig {
        ServerConfig {
            hostname: "irc.example.net".into(),
            nickname: "alice".into(),
            nickserv_password: Some("hunter2".into()),
            on_connect_script: "MODE alice +x\n\n/msg bob hi\n".into(),
            auto_join_channels: "foo, #bar,,".into(),
            ..Default::default()
        }
    }

    #[test]
    fn steps_in_order() {
        let steps = steps(&config(), "alice");
        assert_eq!(
            steps,
            vec![
                Step::Identify { text: "IDENTIFY hunter2".into() },
                Step::Script { line: "MODE alice +x".into() },
                Step::Script { line: "/msg bob hi".into() },
                Step::Join { channel: "#foo".into() },
                Step::Join { channel: "#bar".into() },
            ]
        );
    }

    #[test]
    fn no_identify_without_password() {
        let cfg = ServerConfig { nickserv_password: None, ..config() };
        assert!(!steps(&cfg, "alice").iter().any(|s| matches!(s, Step::Identify { .. })));
    }

    #[test]
    fn script_lines_gain_prefix() {
        assert_eq!(
            script_line("mode alice +x"),
            ScriptLine::Command(CommandIntent::Mode { target: Some("alice".into()), modes: "+x".into() })
        );
        assert_eq!(
            script_line("/join #rust"),
            ScriptLine::Command(CommandIntent::Join { channel: "#rust".into(), key: None })
        );
    }

    #[test]
    fn unknown_script_lines_go_raw() {
        assert_eq!(script_line("KNOCK #secret"), ScriptLine::Raw("KNOCK #secret".into()));
        assert_eq!(script_line("/FOO bar"), ScriptLine::Raw("FOO bar".into()));
        assert_eq!(
            script_line("PRIVMSG NickServ :IDENTIFY hunter2"),
            ScriptLine::Raw("PRIVMSG NickServ :IDENTIFY hunter2".into())
        );
        // "/msg" without text is a known command missing arguments.
        assert_eq!(script_line("msg"), ScriptLine::Raw("msg".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_between_lines() {
        let (tx, mut rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        let steps = vec![
            Step::Script { line: "a".into() },
            Step::Script { line: "b".into() },
            Step::Script { line: "c".into() },
        ];
        let handle = spawn(steps, 7, tx, Duration::from_secs(5), token.clone());

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, Request::Automation { generation: 7, step: Step::Script { ref line }, .. } if line == "a"));
        token.cancel();
        handle.await.unwrap();
        assert!(rx.recv().await.is_none(), "no step after cancellation");
    }

    #[tokio::test(start_paused = true)]
    async fn script_lines_are_spaced_by_delay() {
        let (tx, mut rx) = mpsc::channel(16);
        let steps = vec![
            Step::Script { line: "a".into() },
            Step::Script { line: "b".into() },
            Step::Join { channel: "#x".into() },
        ];
        let start = tokio::time::Instant::now();
        spawn(steps, 1, tx, Duration::from_millis(500), CancellationToken::new());
        rx.recv().await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        rx.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(500));
        let join = rx.recv().await.unwrap();
        assert!(matches!(join, Request::Automation { step: Step::Join { .. }, .. }));
        assert!(start.elapsed() < Duration::from_millis(1000), "joins are not delayed");
    }
}

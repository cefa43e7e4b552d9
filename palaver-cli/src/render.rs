//! Plain-text rendering of chat log messages for the terminal.

use chrono::Local;

use palaver_core::{Message, MessageKind};

/// One terminal line for `msg`.
pub fn line(msg: &Message) -> String {
    let time = msg.timestamp.with_timezone(&Local).format("%H:%M:%S");
    format!("{time} [{}] {}", msg.target, body(msg))
}

fn body(msg: &Message) -> String {
    let (sender, content) = (&msg.sender, &msg.content);
    match msg.kind {
        MessageKind::Normal => format!("<{sender}> {content}"),
        MessageKind::Action => format!("* {sender} {content}"),
        MessageKind::Notice => format!("-{sender}- {content}"),
        MessageKind::Join => format!("--> {content}"),
        MessageKind::Part | MessageKind::Quit | MessageKind::Kick => format!("<-- {content}"),
        MessageKind::Nick | MessageKind::Topic | MessageKind::Mode => format!("--- {content}"),
        MessageKind::Error => format!("!!! {content}"),
        MessageKind::Ctcp => format!("CTCP from {sender}: {content}"),
        MessageKind::Server | MessageKind::System => format!("-- {content}"),
    }
}

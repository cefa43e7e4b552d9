//! What a line typed at the prompt means.

use palaver_core::command::{self, COMMAND_PREFIX, CommandIntent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Empty,
    /// Plain text for the current buffer.
    Say(String),
    /// Change the current buffer (`/switch name`, `/buf name`).
    Switch(String),
    /// List open buffers (`/buffers`).
    Buffers,
    Command(CommandIntent),
}

pub fn classify(line: &str) -> Input {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Input::Empty;
    }
    // `//text` sends `/text` literally.
    if let Some(rest) = line.strip_prefix(COMMAND_PREFIX) {
        if rest.starts_with(COMMAND_PREFIX) {
            return Input::Say(rest.to_string());
        }
        let (name, args) = rest.split_once(' ').unwrap_or((rest, ""));
        match name.to_ascii_lowercase().as_str() {
            "switch" | "buf" if !args.trim().is_empty() => return Input::Switch(args.trim().to_string()),
            "buffers" => return Input::Buffers,
            _ => {}
        }
    }
    match command::parse(line) {
        CommandIntent::NotACommand => Input::Say(line.to_string()),
        intent => Input::Command(intent),
    }
}

/// The buffer a command moves the user to, if any.
pub fn focus_after(intent: &CommandIntent) -> Option<String> {
    match intent {
        CommandIntent::Join { channel, .. } => {
            channel.split(',').next().map(|c| command::with_channel_sigil(c.trim()))
        }
        CommandIntent::Query { nick, .. } => Some(nick.clone()),
        _ => None,
    }
}

//! Chat control commands (`/new`, `/status`, ...).

pub const SUPPORTED: &str = "/new /reset /status /help";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/new` or `/reset`: drop the conversation history.
    Reset,
    Status,
    Help,
    Unknown(String),
}

/// Whether the text is addressed to the bot itself rather than the model.
pub fn is_control_command(text: &str) -> bool {
    text.trim_start().starts_with('/')
}

pub fn parse(input: &str) -> Option<Command> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    let name = trimmed
        .split_whitespace()
        .next()
        .unwrap_or(trimmed)
        .to_ascii_lowercase();
    Some(match name.as_str() {
        "/new" | "/reset" => Command::Reset,
        "/status" => Command::Status,
        "/help" => Command::Help,
        _ => Command::Unknown(name),
    })
}

pub fn help_text() -> String {
    [
        "Commands:",
        "/new or /reset - start a fresh conversation",
        "/status - show model, uptime and history size",
        "/help - show this list",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_commands_case_insensitively() {
        assert_eq!(parse("  /NEW "), Some(Command::Reset));
        assert_eq!(parse("/reset now"), Some(Command::Reset));
        assert_eq!(parse("/status"), Some(Command::Status));
        assert_eq!(parse("/help"), Some(Command::Help));
        assert_eq!(
            parse("/model gpt"),
            Some(Command::Unknown("/model".to_string()))
        );
    }

    #[test]
    fn plain_text_is_not_a_command() {
        assert_eq!(parse("hello /new"), None);
        assert!(!is_control_command("hello"));
        assert!(is_control_command("  /status"));
    }
}

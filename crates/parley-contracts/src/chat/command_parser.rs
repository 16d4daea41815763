use super::command_registry::{
    CommandKind, CommandSpec, NO_ARG_COMMANDS, RAW_ARG_COMMANDS, SINGLE_PATH_COMMANDS,
};
use crate::preferences::Theme;

/// One line of user input, classified before anything is dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Noop,
    PlainText(String),
    ImageGeneration(String),
    NewChat,
    ListChats,
    SwitchChat(String),
    DeleteChat(Option<String>),
    Attach(String),
    Detach,
    Summarize,
    Export(Option<String>),
    Copy,
    Voice(Option<bool>),
    Theme(Option<Theme>),
    Listen,
    Help,
    Unknown { command: String, arg: String },
}

fn find_kind(command: &str, specs: &[CommandSpec]) -> Option<CommandKind> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.kind)
}

fn parse_path_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

fn parse_single_path_arg(arg: &str) -> String {
    let parts = parse_path_args(arg);
    match parts.len() {
        0 => String::new(),
        1 => parts[0].clone(),
        _ => parts.join(" "),
    }
}

fn parse_switch(arg: &str) -> Option<bool> {
    match arg.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Some(true),
        "off" | "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

fn non_empty(arg: &str) -> Option<String> {
    let trimmed = arg.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn unknown(command: String, arg: &str) -> ChatCommand {
    ChatCommand::Unknown {
        command,
        arg: arg.to_string(),
    }
}

pub fn parse_command(text: &str) -> ChatCommand {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return ChatCommand::Noop;
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let arg = slash_tail[command_len..].trim();

            if let Some(kind) = find_kind(&command, RAW_ARG_COMMANDS) {
                return match kind {
                    CommandKind::Generate => ChatCommand::ImageGeneration(arg.to_string()),
                    CommandKind::SwitchChat => match non_empty(arg) {
                        Some(id) => ChatCommand::SwitchChat(id),
                        None => unknown(command, arg),
                    },
                    CommandKind::DeleteChat => ChatCommand::DeleteChat(non_empty(arg)),
                    CommandKind::Voice if arg.is_empty() => ChatCommand::Voice(None),
                    CommandKind::Voice => match parse_switch(arg) {
                        Some(enabled) => ChatCommand::Voice(Some(enabled)),
                        None => unknown(command, arg),
                    },
                    CommandKind::Theme if arg.is_empty() => ChatCommand::Theme(None),
                    CommandKind::Theme => match Theme::parse(arg) {
                        Some(theme) => ChatCommand::Theme(Some(theme)),
                        None => unknown(command, arg),
                    },
                    _ => unknown(command, arg),
                };
            }

            if let Some(kind) = find_kind(&command, SINGLE_PATH_COMMANDS) {
                let path = parse_single_path_arg(arg);
                return match kind {
                    CommandKind::Attach if path.is_empty() => unknown(command, arg),
                    CommandKind::Attach => ChatCommand::Attach(path),
                    CommandKind::Export => ChatCommand::Export(non_empty(&path)),
                    _ => unknown(command, arg),
                };
            }

            if let Some(kind) = find_kind(&command, NO_ARG_COMMANDS) {
                return match kind {
                    CommandKind::NewChat => ChatCommand::NewChat,
                    CommandKind::ListChats => ChatCommand::ListChats,
                    CommandKind::Detach => ChatCommand::Detach,
                    CommandKind::Summarize => ChatCommand::Summarize,
                    CommandKind::Copy => ChatCommand::Copy,
                    CommandKind::Listen => ChatCommand::Listen,
                    CommandKind::Help => ChatCommand::Help,
                    _ => unknown(command, arg),
                };
            }

            return unknown(command, arg);
        }
    }

    ChatCommand::PlainText(raw_trimmed.to_string())
}

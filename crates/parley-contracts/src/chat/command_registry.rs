#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CommandKind {
    Generate,
    NewChat,
    ListChats,
    SwitchChat,
    DeleteChat,
    Attach,
    Detach,
    Summarize,
    Export,
    Copy,
    Voice,
    Theme,
    Listen,
    Help,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub kind: CommandKind,
}

/// Commands whose argument is the remaining text, verbatim.
pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "generate",
        kind: CommandKind::Generate,
    },
    CommandSpec {
        command: "switch",
        kind: CommandKind::SwitchChat,
    },
    CommandSpec {
        command: "delete",
        kind: CommandKind::DeleteChat,
    },
    CommandSpec {
        command: "voice",
        kind: CommandKind::Voice,
    },
    CommandSpec {
        command: "theme",
        kind: CommandKind::Theme,
    },
];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "attach",
        kind: CommandKind::Attach,
    },
    CommandSpec {
        command: "export",
        kind: CommandKind::Export,
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "new",
        kind: CommandKind::NewChat,
    },
    CommandSpec {
        command: "list",
        kind: CommandKind::ListChats,
    },
    CommandSpec {
        command: "detach",
        kind: CommandKind::Detach,
    },
    CommandSpec {
        command: "summarize",
        kind: CommandKind::Summarize,
    },
    CommandSpec {
        command: "copy",
        kind: CommandKind::Copy,
    },
    CommandSpec {
        command: "listen",
        kind: CommandKind::Listen,
    },
    CommandSpec {
        command: "help",
        kind: CommandKind::Help,
    },
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/generate <prompt>",
    "/attach <path>",
    "/detach",
    "/new",
    "/list",
    "/switch <id>",
    "/delete [id]",
    "/summarize",
    "/export [path]",
    "/copy",
    "/voice [on|off]",
    "/theme [light|dark]",
    "/listen",
    "/help",
];

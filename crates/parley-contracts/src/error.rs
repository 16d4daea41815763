use thiserror::Error;

use crate::speech::SpeechInputError;

/// Failures the chat state machine reports to its host.
///
/// Remote-call failures are not listed here: they are caught at the turn
/// boundary and turned into error-role messages instead of propagating.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("missing API credentials: set {0}")]
    MissingCredentials(String),
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
    #[error("unsupported attachment type '{0}' (expected png, jpeg, webp, heic, heif or gif)")]
    UnsupportedAttachment(String),
    #[error("attachment is {size} bytes; the limit is {limit} bytes")]
    AttachmentTooLarge { size: u64, limit: u64 },
    #[error("nothing to send")]
    EmptyPrompt,
    #[error("a turn is already in progress")]
    TurnInFlight,
    #[error("no turn is in progress")]
    NoTurnInFlight,
    #[error("conversation '{0}' not found")]
    UnknownConversation(String),
    #[error("stream cannot {action} while {phase}")]
    InvalidStreamTransition {
        action: &'static str,
        phase: &'static str,
    },
    #[error(transparent)]
    SpeechInput(#[from] SpeechInputError),
}

impl ChatError {
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::MissingCredentials(_) | ChatError::UnknownProvider(_) => "configuration",
            ChatError::UnsupportedAttachment(_)
            | ChatError::AttachmentTooLarge { .. }
            | ChatError::EmptyPrompt => "input_validation",
            ChatError::TurnInFlight
            | ChatError::NoTurnInFlight
            | ChatError::UnknownConversation(_)
            | ChatError::InvalidStreamTransition { .. } => "state",
            ChatError::SpeechInput(_) => "speech_input",
        }
    }
}

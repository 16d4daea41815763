use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::chat::{parse_command, ChatCommand};
use crate::conversation::{Conversation, ImageData, Message, Role};
use crate::stream::strip_stop_marker;

pub const DEFAULT_IMAGE_PROMPT: &str = "Describe this image.";

/// Cooperative cancellation flag shared between the loop that consumes a
/// stream and whoever wants it stopped.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnKind {
    ImageGeneration { prompt: String },
    ImageUnderstanding { prompt: String, image: ImageData },
    TextChat { prompt: String },
}

impl TurnKind {
    /// Picks the remote path for one submission. Only `/generate` is a
    /// directive here: it wins over an attachment. Any other text, slash
    /// prefixed or not, goes to image understanding when an image is
    /// attached and streams otherwise.
    pub fn classify(text: &str, attachment: Option<ImageData>) -> Option<Self> {
        match parse_command(text) {
            ChatCommand::ImageGeneration(prompt) => {
                if prompt.trim().is_empty() {
                    return None;
                }
                Some(TurnKind::ImageGeneration { prompt })
            }
            ChatCommand::Noop => attachment.map(|image| TurnKind::ImageUnderstanding {
                prompt: DEFAULT_IMAGE_PROMPT.to_string(),
                image,
            }),
            ChatCommand::PlainText(prompt) => Some(Self::from_text(prompt, attachment)),
            _ => Some(Self::from_text(text.trim().to_string(), attachment)),
        }
    }

    fn from_text(prompt: String, attachment: Option<ImageData>) -> Self {
        match attachment {
            Some(image) => TurnKind::ImageUnderstanding { prompt, image },
            None => TurnKind::TextChat { prompt },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TurnKind::ImageGeneration { .. } => "image_generation",
            TurnKind::ImageUnderstanding { .. } => "image_understanding",
            TurnKind::TextChat { .. } => "text_chat",
        }
    }

    pub fn prompt(&self) -> &str {
        match self {
            TurnKind::ImageGeneration { prompt }
            | TurnKind::ImageUnderstanding { prompt, .. }
            | TurnKind::TextChat { prompt } => prompt,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, TurnKind::TextChat { .. })
    }

    /// The user message recorded for this turn.
    pub fn user_message(&self, raw_text: &str) -> Message {
        match self {
            TurnKind::ImageGeneration { .. } => Message::user(raw_text.trim(), None),
            TurnKind::ImageUnderstanding { prompt, image } => {
                Message::user(prompt.clone(), Some(image.clone()))
            }
            TurnKind::TextChat { prompt } => Message::user(prompt.clone(), None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTurn {
    pub role: Role,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct PendingTurn {
    pub conversation_id: String,
    pub user_message_id: String,
    pub placeholder_id: String,
    pub kind: TurnKind,
    pub first_turn: bool,
    pub cancel: CancelToken,
}

impl PendingTurn {
    /// Prior exchange to send with this turn, selected by identity and role:
    /// the turn's own messages, errors and pending replies are left out.
    pub fn history(&self, conversation: &Conversation) -> Vec<HistoryTurn> {
        conversation
            .messages
            .iter()
            .filter(|message| {
                message.id != self.user_message_id && message.id != self.placeholder_id
            })
            .filter(|message| !message.pending && message.role != Role::Error)
            .filter_map(|message| {
                let text = strip_stop_marker(&message.content).trim().to_string();
                if text.is_empty() {
                    return None;
                }
                Some(HistoryTurn {
                    role: message.role,
                    text,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed { message: Message },
    Cancelled { message: Message },
    Failed { error: String, message: Message },
}

impl TurnOutcome {
    pub fn message(&self) -> &Message {
        match self {
            TurnOutcome::Completed { message }
            | TurnOutcome::Cancelled { message }
            | TurnOutcome::Failed { message, .. } => message,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            TurnOutcome::Completed { .. } => "completed",
            TurnOutcome::Cancelled { .. } => "cancelled",
            TurnOutcome::Failed { .. } => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CancelToken, PendingTurn, TurnKind, DEFAULT_IMAGE_PROMPT};
    use crate::conversation::{Conversation, ImageData, Message, Role};
    use crate::stream::STOP_MARKER;

    fn image() -> ImageData {
        ImageData::from_bytes("image/png", &[1, 2, 3])
    }

    #[test]
    fn attachment_never_streams_even_with_text() {
        let kind = TurnKind::classify("what is this?", Some(image()));
        assert!(matches!(
            kind,
            Some(TurnKind::ImageUnderstanding { ref prompt, .. }) if prompt == "what is this?"
        ));
        assert!(!kind.map(|kind| kind.is_streaming()).unwrap_or(true));
    }

    #[test]
    fn attachment_alone_uses_default_prompt() {
        let kind = TurnKind::classify("", Some(image()));
        assert_eq!(
            kind.as_ref().map(TurnKind::prompt),
            Some(DEFAULT_IMAGE_PROMPT)
        );
    }

    #[test]
    fn generate_directive_wins_over_attachment() {
        let kind = TurnKind::classify("/generate a castle", Some(image()));
        assert_eq!(
            kind,
            Some(TurnKind::ImageGeneration {
                prompt: "a castle".to_string()
            })
        );
        assert_eq!(TurnKind::classify("/generate   ", None), None);
    }

    #[test]
    fn plain_text_streams() {
        let kind = TurnKind::classify("hello", None);
        assert_eq!(
            kind,
            Some(TurnKind::TextChat {
                prompt: "hello".to_string()
            })
        );
        assert_eq!(TurnKind::classify("", None), None);
    }

    #[test]
    fn slash_prefixed_text_is_sent_verbatim() {
        let kind = TurnKind::classify("  /etc/hosts: what is this file for? ", None);
        assert_eq!(
            kind,
            Some(TurnKind::TextChat {
                prompt: "/etc/hosts: what is this file for?".to_string()
            })
        );
        assert_eq!(
            TurnKind::classify("/new", None).map(|kind| kind.prompt().to_string()),
            Some("/new".to_string())
        );
    }

    #[test]
    fn slash_prefixed_text_with_attachment_asks_about_image() {
        let kind = TurnKind::classify("/x", Some(image()));
        assert!(matches!(
            kind,
            Some(TurnKind::ImageUnderstanding { ref prompt, .. }) if prompt == "/x"
        ));
    }

    #[test]
    fn history_filters_by_identity_and_role() {
        let mut conversation = Conversation::new("1", 1);
        conversation.messages.push(Message::user("first", None));
        conversation
            .messages
            .push(Message::model(format!("partial{STOP_MARKER}"), None));
        conversation.messages.push(Message::error("network down"));
        let user = Message::user("second", None);
        let placeholder = Message::placeholder();
        let pending = PendingTurn {
            conversation_id: "1".to_string(),
            user_message_id: user.id.clone(),
            placeholder_id: placeholder.id.clone(),
            kind: TurnKind::TextChat {
                prompt: "second".to_string(),
            },
            first_turn: false,
            cancel: CancelToken::new(),
        };
        conversation.messages.push(user);
        conversation.messages.push(placeholder);
        // A reply appended after the placeholder must not confuse selection.
        conversation.messages.push(Message::model("late", None));

        let history = pending.history(&conversation);
        let texts = history
            .iter()
            .map(|turn| (turn.role, turn.text.as_str()))
            .collect::<Vec<(Role, &str)>>();
        assert_eq!(
            texts,
            vec![
                (Role::User, "first"),
                (Role::Model, "partial"),
                (Role::Model, "late")
            ]
        );
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }
}

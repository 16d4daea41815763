use parley_contracts::conversation::{Conversation, Role};
use parley_contracts::stream::strip_stop_marker;

use crate::service::{GenerativeService, TextRequest};

pub const NOTHING_TO_SUMMARIZE: &str = "Nothing to summarize yet.";

const SUMMARY_INSTRUCTION: &str =
    "Summarize the conversation below in a few short bullet points. Keep it factual.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryOutcome {
    pub failed: bool,
    pub text: String,
}

/// Plain `You:`/`Model:` transcript of the conversation. Error messages,
/// pending replies and image-only turns are left out.
pub fn transcript(conversation: &Conversation) -> String {
    conversation
        .messages
        .iter()
        .filter(|message| !message.pending && message.role != Role::Error)
        .filter_map(|message| {
            let text = strip_stop_marker(&message.content).trim();
            if text.is_empty() {
                return None;
            }
            Some(format!("{}: {}", message.role.label(), text))
        })
        .collect::<Vec<String>>()
        .join("\n")
}

/// Summarizes a conversation without modifying it. Failures come back as
/// visible text with `failed` set.
pub fn summarize(
    service: &dyn GenerativeService,
    model: &str,
    conversation: &Conversation,
) -> SummaryOutcome {
    let transcript = transcript(conversation);
    if transcript.is_empty() {
        return SummaryOutcome {
            failed: false,
            text: NOTHING_TO_SUMMARIZE.to_string(),
        };
    }
    let request = TextRequest {
        system_instruction: Some(SUMMARY_INSTRUCTION.to_string()),
        ..TextRequest::single(model, transcript)
    };
    match service.generate_text(&request) {
        Ok(text) if !text.trim().is_empty() => SummaryOutcome {
            failed: false,
            text: text.trim().to_string(),
        },
        Ok(_) => SummaryOutcome {
            failed: true,
            text: "Summary failed: the model returned an empty response.".to_string(),
        },
        Err(err) => SummaryOutcome {
            failed: true,
            text: format!("Summary failed: {err:#}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use parley_contracts::conversation::{Conversation, Message};
    use parley_contracts::stream::STOP_MARKER;

    use super::{summarize, transcript, NOTHING_TO_SUMMARIZE};
    use crate::dryrun::DryrunService;

    #[test]
    fn transcript_skips_errors_and_pending() {
        let mut conversation = Conversation::new("1", 1);
        conversation.messages.push(Message::user("hello", None));
        conversation
            .messages
            .push(Message::model(format!("Hi{STOP_MARKER}"), None));
        conversation.messages.push(Message::error("boom"));
        conversation.messages.push(Message::placeholder());
        assert_eq!(transcript(&conversation), "You: hello\nModel: Hi");
    }

    #[test]
    fn empty_conversation_has_nothing_to_summarize() {
        let conversation = Conversation::new("1", 1);
        let outcome = summarize(&DryrunService, "dryrun-text-1", &conversation);
        assert!(!outcome.failed);
        assert_eq!(outcome.text, NOTHING_TO_SUMMARIZE);
    }

    #[test]
    fn summary_leaves_conversation_untouched() {
        let mut conversation = Conversation::new("1", 1);
        conversation.messages.push(Message::user("hello", None));
        let before = conversation.clone();
        let outcome = summarize(&DryrunService, "dryrun-text-1", &conversation);
        assert!(!outcome.failed);
        assert_eq!(outcome.text, "Echo: You: hello");
        assert_eq!(conversation, before);
    }
}

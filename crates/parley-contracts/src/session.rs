use crate::conversation::{ConversationStore, ImageData, Message};
use crate::error::ChatError;
use crate::preferences::Preferences;
use crate::stream::{StreamAssembler, StreamPhase};
use crate::turn::{CancelToken, PendingTurn, TurnKind, TurnOutcome};

pub const EMPTY_REPLY_ERROR: &str = "The model returned an empty response.";

/// Everything the chat surface renders from, plus the in-flight turn.
///
/// All turn transitions go through this type so the loading flag, the
/// placeholder message and the stream assembler cannot drift apart.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub store: ConversationStore,
    pub preferences: Preferences,
    pub draft: String,
    pub staged_image: Option<ImageData>,
    recording: bool,
    loading: bool,
    assembler: StreamAssembler,
    pending: Option<PendingTurn>,
}

impl SessionState {
    pub fn new(store: ConversationStore, preferences: Preferences) -> Self {
        Self {
            store,
            preferences,
            draft: String::new(),
            staged_image: None,
            recording: false,
            loading: false,
            assembler: StreamAssembler::new(),
            pending: None,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn set_recording(&mut self, recording: bool) {
        self.recording = recording;
    }

    pub fn pending(&self) -> Option<&PendingTurn> {
        self.pending.as_ref()
    }

    pub fn stream_phase(&self) -> StreamPhase {
        self.assembler.phase()
    }

    pub fn request_cancel(&self) {
        if let Some(pending) = &self.pending {
            pending.cancel.cancel();
        }
    }

    /// Starts a turn in the active conversation: records the user message
    /// and a placeholder reply, and raises the loading flag. The staged
    /// image and the draft are consumed only when the turn starts.
    pub fn begin_turn(&mut self, text: &str) -> Result<PendingTurn, ChatError> {
        if self.loading {
            return Err(ChatError::TurnInFlight);
        }
        let kind =
            TurnKind::classify(text, self.staged_image.clone()).ok_or(ChatError::EmptyPrompt)?;
        let conversation_id = self.store.active_id().to_string();
        let first_turn = self.store.active().user_turns() == 0;

        let user = kind.user_message(text);
        let placeholder = Message::placeholder();
        let pending = PendingTurn {
            conversation_id: conversation_id.clone(),
            user_message_id: user.id.clone(),
            placeholder_id: placeholder.id.clone(),
            kind,
            first_turn,
            cancel: CancelToken::new(),
        };
        if pending.kind.is_streaming() {
            self.assembler.begin()?;
        }
        self.store.append_message(&conversation_id, user)?;
        self.store.append_message(&conversation_id, placeholder)?;

        self.staged_image = None;
        self.draft.clear();
        self.loading = true;
        self.pending = Some(pending.clone());
        Ok(pending)
    }

    /// Applies one streamed chunk to the placeholder, in place.
    pub fn apply_chunk(&mut self, chunk: &str) -> Result<String, ChatError> {
        let pending = self.pending.as_ref().ok_or(ChatError::NoTurnInFlight)?;
        let display = self.assembler.push(chunk)?;
        if let Some(message) = self
            .store
            .message_mut(&pending.conversation_id, &pending.placeholder_id)
        {
            message.content.clear();
            message.content.push_str(&display);
        }
        Ok(display)
    }

    /// Ends a streamed turn normally. A stream that produced no text is
    /// reported as an error rather than left as an empty reply.
    pub fn finish_stream(&mut self) -> Result<TurnOutcome, ChatError> {
        let text = self.assembler.finalize()?;
        if text.trim().is_empty() {
            return self.replace_placeholder_with_error(EMPTY_REPLY_ERROR);
        }
        let message = self.settle_placeholder(text)?;
        Ok(TurnOutcome::Completed { message })
    }

    /// Stops a streamed turn, keeping partial output plus the stop marker.
    pub fn cancel_stream(&mut self) -> Result<TurnOutcome, ChatError> {
        let text = self.assembler.cancel()?;
        let message = self.settle_placeholder(text)?;
        Ok(TurnOutcome::Cancelled { message })
    }

    /// Ends a non-streamed turn by replacing the placeholder with the reply.
    pub fn complete_turn(
        &mut self,
        content: String,
        image: Option<ImageData>,
    ) -> Result<TurnOutcome, ChatError> {
        let pending = self.take_pending()?;
        if content.trim().is_empty() && image.is_none() {
            self.pending = Some(pending);
            return self.replace_placeholder_with_error(EMPTY_REPLY_ERROR);
        }
        let message = Message::model(content, image);
        self.store.replace_message(
            &pending.conversation_id,
            &pending.placeholder_id,
            message.clone(),
        )?;
        Ok(TurnOutcome::Completed { message })
    }

    /// Records a remote failure. Before any output the placeholder becomes
    /// the error message; after partial output the partial text is kept and
    /// the error is appended after it.
    pub fn fail_turn(&mut self, error: &str) -> Result<TurnOutcome, ChatError> {
        let partial = if self.assembler.phase().is_active() {
            self.assembler.abort()
        } else {
            String::new()
        };
        if partial.trim().is_empty() {
            return self.replace_placeholder_with_error(error);
        }

        let pending = self.take_pending()?;
        self.store.replace_message(
            &pending.conversation_id,
            &pending.placeholder_id,
            Message {
                id: pending.placeholder_id.clone(),
                ..Message::model(partial, None)
            },
        )?;
        let message = Message::error(error);
        self.store
            .append_message(&pending.conversation_id, message.clone())?;
        Ok(TurnOutcome::Failed {
            error: error.to_string(),
            message,
        })
    }

    fn replace_placeholder_with_error(&mut self, error: &str) -> Result<TurnOutcome, ChatError> {
        if self.assembler.phase().is_active() {
            self.assembler.abort();
        }
        let pending = self.take_pending()?;
        let message = Message::error(error);
        self.store.replace_message(
            &pending.conversation_id,
            &pending.placeholder_id,
            message.clone(),
        )?;
        Ok(TurnOutcome::Failed {
            error: error.to_string(),
            message,
        })
    }

    /// Writes final text into the placeholder and clears its pending flag,
    /// keeping the message identity.
    fn settle_placeholder(&mut self, text: String) -> Result<Message, ChatError> {
        let pending = self.take_pending()?;
        let message = self
            .store
            .message_mut(&pending.conversation_id, &pending.placeholder_id)
            .ok_or_else(|| ChatError::UnknownConversation(pending.conversation_id.clone()))?;
        message.content = text;
        message.pending = false;
        Ok(message.clone())
    }

    fn take_pending(&mut self) -> Result<PendingTurn, ChatError> {
        let pending = self.pending.take().ok_or(ChatError::NoTurnInFlight)?;
        self.loading = false;
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::{SessionState, EMPTY_REPLY_ERROR};
    use crate::conversation::{ConversationStore, ImageData, Role};
    use crate::error::ChatError;
    use crate::preferences::Preferences;
    use crate::stream::{StreamPhase, STOP_MARKER};
    use crate::turn::{HistoryTurn, TurnOutcome};

    fn session() -> SessionState {
        SessionState::new(ConversationStore::new(), Preferences::default())
    }

    fn snapshot(state: &SessionState) -> Vec<(Role, String)> {
        state
            .store
            .active()
            .messages
            .iter()
            .map(|message| (message.role, message.content.clone()))
            .collect()
    }

    #[test]
    fn hello_example_walkthrough() -> anyhow::Result<()> {
        let mut state = session();
        assert_eq!(state.store.active().title, "New Chat");
        assert!(state.store.active().messages.is_empty());

        let pending = state.begin_turn("hello")?;
        assert!(pending.first_turn);
        assert!(state.is_loading());
        assert_eq!(
            snapshot(&state),
            vec![(Role::User, "hello".to_string()), (Role::Model, String::new())]
        );

        state.apply_chunk("Hi")?;
        assert_eq!(snapshot(&state)[1].1, "Hi▋");
        state.apply_chunk("there")?;
        assert_eq!(snapshot(&state)[1].1, "Hithere▋");

        let outcome = state.finish_stream()?;
        assert_eq!(outcome.message().content, "Hithere");
        assert_eq!(snapshot(&state)[1].1, "Hithere");
        assert!(!state.is_loading());
        assert!(state
            .store
            .active()
            .messages
            .iter()
            .all(|message| !message.pending));
        Ok(())
    }

    #[test]
    fn placeholder_keeps_identity_while_streaming() -> anyhow::Result<()> {
        let mut state = session();
        let pending = state.begin_turn("hello")?;
        state.apply_chunk("a")?;
        state.apply_chunk("b")?;
        let outcome = state.finish_stream()?;
        assert_eq!(outcome.message().id, pending.placeholder_id);
        Ok(())
    }

    #[test]
    fn second_turn_while_loading_is_rejected() -> anyhow::Result<()> {
        let mut state = session();
        state.begin_turn("one")?;
        assert_eq!(state.begin_turn("two").err(), Some(ChatError::TurnInFlight));
        assert_eq!(state.store.active().messages.len(), 2);
        Ok(())
    }

    #[test]
    fn cancel_mid_stream_appends_marker_once() -> anyhow::Result<()> {
        let mut state = session();
        state.begin_turn("tell me a story")?;
        state.apply_chunk("Once upon")?;
        let outcome = state.cancel_stream()?;
        assert!(matches!(outcome, TurnOutcome::Cancelled { .. }));
        assert!(!state.is_loading());
        let content = snapshot(&state)[1].1.clone();
        assert_eq!(content, format!("Once upon{STOP_MARKER}"));
        assert_eq!(content.matches(STOP_MARKER).count(), 1);
        assert!(state.cancel_stream().is_err());
        assert_eq!(state.stream_phase(), StreamPhase::Cancelled);
        Ok(())
    }

    #[test]
    fn cancel_before_first_chunk_keeps_only_marker() -> anyhow::Result<()> {
        let mut state = session();
        state.begin_turn("hello")?;
        assert_eq!(state.stream_phase(), StreamPhase::AwaitingFirstChunk);
        let outcome = state.cancel_stream()?;
        assert!(matches!(outcome, TurnOutcome::Cancelled { .. }));
        assert_eq!(outcome.message().content, STOP_MARKER);
        assert!(!state.is_loading());
        assert!(state.pending().is_none());

        let next = state.begin_turn("again")?;
        assert_eq!(
            next.history(state.store.active()),
            vec![HistoryTurn {
                role: Role::User,
                text: "hello".to_string()
            }]
        );
        Ok(())
    }

    #[test]
    fn slash_prefixed_text_starts_a_turn() -> anyhow::Result<()> {
        let mut state = session();
        let pending = state.begin_turn("/etc/hosts: what is this file for?")?;
        assert!(pending.kind.is_streaming());
        state.fail_turn("offline")?;

        state.staged_image = Some(ImageData::from_bytes("image/png", &[9]));
        let pending = state.begin_turn("/x")?;
        assert!(!pending.kind.is_streaming());
        assert_eq!(pending.kind.prompt(), "/x");
        assert!(state.staged_image.is_none());
        Ok(())
    }

    #[test]
    fn empty_stream_becomes_error_message() -> anyhow::Result<()> {
        let mut state = session();
        state.begin_turn("hello")?;
        let outcome = state.finish_stream()?;
        assert!(matches!(outcome, TurnOutcome::Failed { .. }));
        assert_eq!(snapshot(&state)[1], (Role::Error, EMPTY_REPLY_ERROR.to_string()));
        assert!(!state.is_loading());
        Ok(())
    }

    #[test]
    fn failure_before_output_replaces_placeholder() -> anyhow::Result<()> {
        let mut state = session();
        state.begin_turn("hello")?;
        state.fail_turn("quota exceeded")?;
        assert_eq!(
            snapshot(&state),
            vec![
                (Role::User, "hello".to_string()),
                (Role::Error, "quota exceeded".to_string())
            ]
        );
        assert!(!state.is_loading());
        Ok(())
    }

    #[test]
    fn failure_after_output_keeps_partial_text() -> anyhow::Result<()> {
        let mut state = session();
        state.begin_turn("hello")?;
        state.apply_chunk("Half an ans")?;
        state.fail_turn("connection reset")?;
        assert_eq!(
            snapshot(&state),
            vec![
                (Role::User, "hello".to_string()),
                (Role::Model, "Half an ans".to_string()),
                (Role::Error, "connection reset".to_string())
            ]
        );
        assert!(state.store.active().messages.iter().all(|m| !m.pending));
        Ok(())
    }

    #[test]
    fn attachment_turn_consumes_staged_image() -> anyhow::Result<()> {
        let mut state = session();
        state.staged_image = Some(ImageData::from_bytes("image/png", &[9]));
        let pending = state.begin_turn("what is it")?;
        assert!(!pending.kind.is_streaming());
        assert!(state.staged_image.is_none());
        assert_eq!(state.stream_phase(), StreamPhase::Idle);
        assert!(state.store.active().messages[0].image.is_some());

        let outcome = state.complete_turn("A single pixel.".to_string(), None)?;
        assert_eq!(outcome.message().content, "A single pixel.");
        assert_eq!(snapshot(&state)[1], (Role::Model, "A single pixel.".to_string()));
        Ok(())
    }

    #[test]
    fn rejected_turn_keeps_staged_image() {
        let mut state = session();
        state.staged_image = Some(ImageData::from_bytes("image/png", &[9]));
        state.loading_for_test();
        assert!(state.begin_turn("x").is_err());
        assert!(state.staged_image.is_some());
    }

    #[test]
    fn chunk_without_turn_is_rejected() {
        let mut state = session();
        assert_eq!(state.apply_chunk("x").err(), Some(ChatError::NoTurnInFlight));
    }

    #[test]
    fn second_turn_is_not_first() -> anyhow::Result<()> {
        let mut state = session();
        state.begin_turn("one")?;
        state.apply_chunk("1")?;
        state.finish_stream()?;
        let pending = state.begin_turn("two")?;
        assert!(!pending.first_turn);
        Ok(())
    }

    #[test]
    fn request_cancel_sets_turn_token() -> anyhow::Result<()> {
        let mut state = session();
        let pending = state.begin_turn("one")?;
        state.request_cancel();
        assert!(pending.cancel.is_cancelled());
        Ok(())
    }

    impl SessionState {
        fn loading_for_test(&mut self) {
            self.loading = true;
        }
    }
}

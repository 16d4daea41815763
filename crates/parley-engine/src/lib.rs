pub mod config;
pub mod dryrun;
pub mod gemini;
pub mod service;
pub mod speech;
pub mod summary;
pub mod title;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use parley_contracts::attachments::{load_attachment, MAX_ATTACHMENT_BYTES};
use parley_contracts::conversation::{Conversation, Role};
use parley_contracts::error::ChatError;
use parley_contracts::events::{EventKind, EventWriter};
use parley_contracts::export::{export_file_name, render_markdown};
use parley_contracts::models::{
    ModelSelector, ModelSpec, CAPABILITY_EDIT, CAPABILITY_IMAGE, CAPABILITY_TEXT,
    CAPABILITY_VISION,
};
use parley_contracts::persistence::{load_preferences, load_store, save_preferences, save_store};
use parley_contracts::preferences::Theme;
use parley_contracts::session::SessionState;
use parley_contracts::speech::{speakable_text, SpeechInputError};
use parley_contracts::storage::{FileKeyValueStore, KeyValueStore};
use parley_contracts::stream::strip_stop_marker;
use parley_contracts::turn::{CancelToken, PendingTurn, TurnKind, TurnOutcome};
use serde_json::{json, Value};

pub use config::{EngineConfig, EnvSource, GeminiSettings};
pub use service::{
    default_service_registry, ChunkStream, GenerativeService, ImageGenerationRequest,
    ServiceRegistry, ServiceReply, TextRequest, VisionRequest,
};
pub use speech::{CommandRecognizer, CommandSynthesizer, SpeechRecognizer, SpeechSynthesizer};
pub use summary::SummaryOutcome;
pub use title::TitleResult;

use crate::title::TitleQueue;

const SYSTEM_INSTRUCTION: &str =
    "You are a helpful assistant. Answer clearly and use Markdown when it helps.";

/// Models requested on the command line; `None` takes the provider default.
#[derive(Debug, Clone, Default)]
pub struct ModelRequests {
    pub text: Option<String>,
    pub image: Option<String>,
    pub vision: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedModels {
    pub text: ModelSpec,
    pub image: ModelSpec,
    pub vision: ModelSpec,
}

/// Progress reported to the caller while a turn runs.
#[derive(Debug, Clone)]
pub enum TurnProgress {
    Started {
        conversation_id: String,
        kind: &'static str,
        streaming: bool,
        cancel: CancelToken,
    },
    Chunk {
        delta: String,
        display: String,
    },
    Finished(TurnOutcome),
}

/// Owns the session state and drives every turn against one generative
/// service. All mutation happens on the caller's thread; only title
/// requests run in the background.
pub struct ChatEngine {
    session_id: String,
    state: SessionState,
    storage: Box<dyn KeyValueStore>,
    events: EventWriter,
    service: Arc<dyn GenerativeService>,
    models: ResolvedModels,
    titles: TitleQueue,
    synthesizer: Option<Box<dyn SpeechSynthesizer>>,
    recognizer: Option<Box<dyn SpeechRecognizer>>,
    turns: u64,
}

impl ChatEngine {
    pub fn new(
        service: Arc<dyn GenerativeService>,
        mut storage: Box<dyn KeyValueStore>,
        events: EventWriter,
        requests: &ModelRequests,
    ) -> Result<Self> {
        let store = load_store(storage.as_mut());
        let preferences = load_preferences(storage.as_mut());
        let session_id = events.session_id().to_string();

        let selector = ModelSelector::new(None);
        let provider = service.name().to_string();
        let mut fallbacks = Vec::new();
        let mut resolve = |requested: Option<&str>, capability: &str| -> Result<ModelSpec> {
            let selection = selector
                .select_from(Some(provider.as_str()), requested, capability)
                .map_err(|err| anyhow!(err))?;
            if let Some(reason) = selection.fallback_reason {
                fallbacks.push((capability.to_string(), selection.model.name.clone(), reason));
            }
            Ok(selection.model)
        };
        let models = ResolvedModels {
            text: resolve(requests.text.as_deref(), CAPABILITY_TEXT)?,
            image: resolve(requests.image.as_deref(), CAPABILITY_IMAGE)?,
            vision: resolve(requests.vision.as_deref(), CAPABILITY_VISION)?,
        };

        let mut engine = Self {
            session_id,
            state: SessionState::new(store, preferences),
            storage,
            events,
            service,
            models,
            titles: TitleQueue::new(),
            synthesizer: None,
            recognizer: None,
            turns: 0,
        };
        engine.persist()?;
        engine.emit(
            EventKind::SessionStarted,
            json!({
                "provider": provider,
                "text_model": engine.models.text.name,
                "image_model": engine.models.image.name,
                "vision_model": engine.models.vision.name,
                "conversations": engine.state.store.len(),
                "active_conversation_id": engine.state.store.active_id(),
            }),
        )?;
        for (capability, model, reason) in fallbacks {
            engine.emit(
                EventKind::ModelFallback,
                json!({ "capability": capability, "model": model, "reason": reason }),
            )?;
        }
        Ok(engine)
    }

    /// Builds an engine from configuration: provider lookup, credential
    /// check, on-disk storage, event log and speech commands.
    pub fn open(config: &EngineConfig, requests: &ModelRequests) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
        let registry = default_service_registry(&config.gemini)?;
        let service = registry
            .get(&config.provider)
            .ok_or_else(|| ChatError::UnknownProvider(config.provider.clone()))?;
        if !service.has_credentials() {
            return Err(
                ChatError::MissingCredentials("GEMINI_API_KEY or GOOGLE_API_KEY".to_string())
                    .into(),
            );
        }
        let events = EventWriter::start(&config.events_path);
        let storage = Box::new(FileKeyValueStore::new(config.storage_path()));
        let mut engine = Self::new(service, storage, events, requests)?;
        if let Some(raw) = config.tts_command.as_deref() {
            engine.set_synthesizer(Box::new(CommandSynthesizer::new(raw)?));
        }
        if let Some(raw) = config.stt_command.as_deref() {
            engine.set_recognizer(Box::new(CommandRecognizer::new(raw)?));
        }
        Ok(engine)
    }

    pub fn set_synthesizer(&mut self, synthesizer: Box<dyn SpeechSynthesizer>) {
        self.synthesizer = Some(synthesizer);
    }

    pub fn set_recognizer(&mut self, recognizer: Box<dyn SpeechRecognizer>) {
        self.recognizer = Some(recognizer);
    }

    pub fn can_speak(&self) -> bool {
        self.synthesizer.is_some()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn models(&self) -> &ResolvedModels {
        &self.models
    }

    pub fn service_name(&self) -> &str {
        self.service.name()
    }

    pub fn event_writer(&self) -> EventWriter {
        self.events.clone()
    }

    pub fn new_conversation(&mut self) -> Result<String> {
        let id = self.state.store.create().id.clone();
        self.persist()?;
        self.emit(EventKind::ConversationCreated, json!({ "conversation_id": id }))?;
        Ok(id)
    }

    pub fn switch(&mut self, id: &str) -> Result<()> {
        self.state.store.switch_active(id)?;
        self.persist()?;
        self.emit(EventKind::ConversationSwitched, json!({ "conversation_id": id }))?;
        Ok(())
    }

    /// Deletes a conversation (the active one when `id` is `None`) and
    /// returns the removed conversation.
    pub fn delete(&mut self, id: Option<&str>) -> Result<Conversation> {
        let target = id
            .map(str::to_string)
            .unwrap_or_else(|| self.state.store.active_id().to_string());
        let removed = self.state.store.delete(&target)?;
        self.persist()?;
        self.emit(
            EventKind::ConversationDeleted,
            json!({
                "conversation_id": removed.id,
                "active_conversation_id": self.state.store.active_id(),
            }),
        )?;
        Ok(removed)
    }

    pub fn stage_attachment(&mut self, path: &Path) -> Result<()> {
        let image = load_attachment(path, MAX_ATTACHMENT_BYTES)?;
        self.state.staged_image = Some(image);
        Ok(())
    }

    pub fn clear_attachment(&mut self) -> bool {
        self.state.staged_image.take().is_some()
    }

    /// Runs one turn to a terminal state. Remote failures end the turn with
    /// an error message instead of returning `Err`; `Err` means the turn
    /// was rejected or local state could not be saved. Once the turn has
    /// started, it is always settled before `Err` is returned.
    pub fn submit<F>(&mut self, text: &str, mut on_update: F) -> Result<TurnOutcome>
    where
        F: FnMut(&TurnProgress),
    {
        let pending = self.state.begin_turn(text)?;
        if let Err(err) = self.announce_turn(&pending) {
            self.state.fail_turn(&error_text(&err))?;
            return Err(err);
        }
        on_update(&TurnProgress::Started {
            conversation_id: pending.conversation_id.clone(),
            kind: pending.kind.name(),
            streaming: pending.kind.is_streaming(),
            cancel: pending.cancel.clone(),
        });

        let outcome = match &pending.kind {
            TurnKind::TextChat { prompt } => self.run_stream(&pending, prompt, &mut on_update)?,
            TurnKind::ImageGeneration { prompt } => {
                let request = ImageGenerationRequest {
                    model: self.models.image.name.clone(),
                    prompt: prompt.clone(),
                };
                let result = self.service.generate_image(&request);
                self.settle_reply(result)?
            }
            TurnKind::ImageUnderstanding { prompt, image } => {
                let request = VisionRequest {
                    model: self.models.vision.name.clone(),
                    prompt: prompt.clone(),
                    image: image.clone(),
                    allow_image_output: self.models.vision.supports(CAPABILITY_EDIT),
                };
                let result = self.service.understand_image(&request);
                self.settle_reply(result)?
            }
        };
        self.turns += 1;
        if pending.first_turn {
            self.titles.spawn(
                Arc::clone(&self.service),
                self.models.text.name.clone(),
                pending.conversation_id.clone(),
                pending.kind.prompt().to_string(),
            );
        }
        on_update(&TurnProgress::Finished(outcome.clone()));

        // The turn is settled in memory from here on; local write failures
        // are reported without reopening it.
        self.persist()?;
        self.record_outcome(&pending, &outcome)?;
        if let TurnOutcome::Completed { message } = &outcome {
            if self.state.preferences.voice_enabled {
                self.speak(&message.content)?;
            }
        }
        Ok(outcome)
    }

    fn announce_turn(&mut self, pending: &PendingTurn) -> Result<()> {
        self.persist()?;
        self.emit(
            EventKind::TurnStarted,
            json!({
                "conversation_id": pending.conversation_id,
                "kind": pending.kind.name(),
                "first_turn": pending.first_turn,
            }),
        )
    }

    fn run_stream<F>(
        &mut self,
        pending: &PendingTurn,
        prompt: &str,
        on_update: &mut F,
    ) -> Result<TurnOutcome>
    where
        F: FnMut(&TurnProgress),
    {
        let history = self
            .state
            .store
            .get(&pending.conversation_id)
            .map(|conversation| pending.history(conversation))
            .unwrap_or_default();
        let request = TextRequest {
            model: self.models.text.name.clone(),
            system_instruction: Some(SYSTEM_INSTRUCTION.to_string()),
            history,
            prompt: prompt.to_string(),
        };
        let stream = match self.service.stream_text(&request) {
            Ok(stream) => stream,
            Err(err) => return Ok(self.state.fail_turn(&error_text(&err))?),
        };
        for item in stream {
            if pending.cancel.is_cancelled() {
                break;
            }
            match item {
                Ok(delta) => {
                    if delta.is_empty() {
                        continue;
                    }
                    let display = self.state.apply_chunk(&delta)?;
                    on_update(&TurnProgress::Chunk { delta, display });
                }
                Err(err) => return Ok(self.state.fail_turn(&error_text(&err))?),
            }
        }
        if pending.cancel.is_cancelled() {
            return Ok(self.state.cancel_stream()?);
        }
        Ok(self.state.finish_stream()?)
    }

    fn settle_reply(&mut self, result: Result<ServiceReply>) -> Result<TurnOutcome> {
        let outcome = match result {
            Ok(reply) => self.state.complete_turn(reply.text.trim().to_string(), reply.image)?,
            Err(err) => self.state.fail_turn(&error_text(&err))?,
        };
        Ok(outcome)
    }

    fn record_outcome(&self, pending: &PendingTurn, outcome: &TurnOutcome) -> Result<()> {
        let message = outcome.message();
        let mut payload = json!({
            "conversation_id": pending.conversation_id,
            "kind": pending.kind.name(),
            "message_id": message.id,
            "chars": message.content.chars().count(),
            "has_image": message.image.is_some(),
        });
        let kind = match outcome {
            TurnOutcome::Completed { .. } => EventKind::TurnCompleted,
            TurnOutcome::Cancelled { .. } => EventKind::TurnCancelled,
            TurnOutcome::Failed { error, .. } => {
                payload["error"] = Value::String(error.clone());
                EventKind::TurnFailed
            }
        };
        self.emit(kind, payload)
    }

    fn speak(&self, content: &str) -> Result<()> {
        let text = speakable_text(content);
        if text.is_empty() {
            return Ok(());
        }
        let error = match self.synthesizer.as_ref() {
            Some(synthesizer) => synthesizer.speak(&text).err().map(|err| format!("{err:#}")),
            None => Some("PARLEY_TTS_COMMAND is not set".to_string()),
        };
        if let Some(error) = error {
            self.emit(
                EventKind::SpeechFailed,
                json!({ "direction": "output", "error": error }),
            )?;
        }
        Ok(())
    }

    /// Applies titles that have arrived since the last poll.
    pub fn poll_titles(&mut self) -> Result<Vec<TitleResult>> {
        let results = self.titles.drain();
        self.apply_titles(results)
    }

    /// Blocks until outstanding title requests finish or `timeout` passes.
    pub fn wait_for_titles(&mut self, timeout: Duration) -> Result<Vec<TitleResult>> {
        let results = self.titles.wait(timeout);
        self.apply_titles(results)
    }

    fn apply_titles(&mut self, results: Vec<TitleResult>) -> Result<Vec<TitleResult>> {
        let mut applied = Vec::new();
        for result in results {
            if self
                .state
                .store
                .set_title(&result.conversation_id, &result.title)
                .is_err()
            {
                continue;
            }
            self.emit(
                EventKind::TitleGenerated,
                json!({
                    "conversation_id": result.conversation_id,
                    "title": result.title,
                    "fallback": result.fell_back(),
                    "error": result.error,
                }),
            )?;
            applied.push(result);
        }
        if !applied.is_empty() {
            self.persist()?;
        }
        Ok(applied)
    }

    pub fn summarize_active(&self) -> Result<SummaryOutcome> {
        let conversation = self.state.store.active();
        let outcome = summary::summarize(
            self.service.as_ref(),
            &self.models.text.name,
            conversation,
        );
        self.emit(
            EventKind::SummaryGenerated,
            json!({
                "conversation_id": conversation.id,
                "failed": outcome.failed,
            }),
        )?;
        Ok(outcome)
    }

    pub fn set_voice(&mut self, enabled: bool) -> Result<()> {
        self.state.preferences.voice_enabled = enabled;
        save_preferences(self.storage.as_mut(), &self.state.preferences)
    }

    pub fn set_theme(&mut self, theme: Theme) -> Result<()> {
        self.state.preferences.theme = theme;
        save_preferences(self.storage.as_mut(), &self.state.preferences)
    }

    /// Records one utterance into the draft. The recording flag is raised
    /// only while the recognizer runs. Recognizer failures come back as
    /// `ChatError::SpeechInput`.
    pub fn listen(&mut self) -> Result<String> {
        let result = match self.recognizer.as_ref() {
            Some(recognizer) => {
                self.state.set_recording(true);
                let result = recognizer.listen();
                self.state.set_recording(false);
                result
            }
            None => Err(SpeechInputError::Unavailable(
                "PARLEY_STT_COMMAND is not set".to_string(),
            )),
        };
        match result {
            Ok(transcript) => {
                self.state.draft = transcript.clone();
                Ok(transcript)
            }
            Err(err) => {
                let error = ChatError::from(err);
                self.emit(
                    EventKind::SpeechFailed,
                    json!({
                        "direction": "input",
                        "kind": error.kind(),
                        "error": error.to_string(),
                    }),
                )?;
                Err(error.into())
            }
        }
    }

    /// Markdown export of a conversation (the active one when `id` is
    /// `None`), with its suggested file name.
    pub fn export_markdown(&self, id: Option<&str>) -> Result<(String, String)> {
        let conversation = match id {
            Some(id) => self
                .state
                .store
                .get(id)
                .ok_or_else(|| ChatError::UnknownConversation(id.to_string()))?,
            None => self.state.store.active(),
        };
        Ok((
            export_file_name(conversation),
            render_markdown(conversation, Utc::now()),
        ))
    }

    /// Text of the latest finished model reply in the active conversation.
    pub fn last_model_text(&self) -> Option<String> {
        self.state
            .store
            .active()
            .messages
            .iter()
            .rev()
            .filter(|message| message.role == Role::Model && !message.pending)
            .map(|message| strip_stop_marker(&message.content).trim().to_string())
            .find(|text| !text.is_empty())
    }

    pub fn finish(&mut self) -> Result<()> {
        self.persist()?;
        self.emit(
            EventKind::SessionFinished,
            json!({
                "turns": self.turns,
                "conversations": self.state.store.len(),
            }),
        )
    }

    fn persist(&mut self) -> Result<()> {
        save_store(self.storage.as_mut(), &self.state.store)?;
        save_preferences(self.storage.as_mut(), &self.state.preferences)
    }

    fn emit(&self, kind: EventKind, payload: Value) -> Result<()> {
        self.events.emit(kind, payload)?;
        Ok(())
    }
}

fn error_text(err: &anyhow::Error) -> String {
    let text = format!("{err:#}");
    if text.chars().count() <= 600 {
        return text;
    }
    text.chars().take(600).collect::<String>() + "…"
}

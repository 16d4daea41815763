use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parley_contracts::conversation::DEFAULT_TITLE;

use crate::service::{GenerativeService, TextRequest};

const TITLE_MAX_WORDS: usize = 5;
const TITLE_MAX_CHARS: usize = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleResult {
    pub conversation_id: String,
    pub title: String,
    pub error: Option<String>,
}

impl TitleResult {
    pub fn fell_back(&self) -> bool {
        self.error.is_some()
    }
}

pub fn title_prompt(first_message: &str) -> String {
    format!(
        "Write a short title of at most {TITLE_MAX_WORDS} words for a conversation that starts \
         with the message below. Reply with the title only, no quotes or punctuation at the end.\n\n\
         {}",
        first_message.trim()
    )
}

/// Normalizes a model reply into a title: first non-empty line, quotes and
/// markup removed, at most five words and sixty characters.
pub fn clean_title(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|line| !line.is_empty())?;
    let line = line
        .trim_start_matches(|ch: char| ch == '#' || ch.is_whitespace())
        .trim_start_matches("Title:")
        .trim_start_matches("title:");
    let unquoted = line
        .trim()
        .trim_matches(|ch: char| matches!(ch, '"' | '\'' | '`' | '*' | '“' | '”'))
        .trim_end_matches(['.', '!', '?', ':', ';'])
        .trim();
    let words = unquoted
        .split_whitespace()
        .take(TITLE_MAX_WORDS)
        .collect::<Vec<&str>>()
        .join(" ");
    let clipped = words
        .chars()
        .take(TITLE_MAX_CHARS)
        .collect::<String>()
        .trim_end()
        .to_string();
    if clipped.is_empty() {
        return None;
    }
    Some(clipped)
}

/// Asks the service for a title. Never fails: any problem yields the
/// default title with the reason attached.
pub fn generate_title(
    service: &dyn GenerativeService,
    model: &str,
    conversation_id: &str,
    first_message: &str,
) -> TitleResult {
    let fallback = |error: String| TitleResult {
        conversation_id: conversation_id.to_string(),
        title: DEFAULT_TITLE.to_string(),
        error: Some(error),
    };
    if !service.has_credentials() {
        return fallback(format!("{} credentials missing", service.name()));
    }
    let request = TextRequest::single(model, title_prompt(first_message));
    match service.generate_text(&request) {
        Ok(raw) => match clean_title(&raw) {
            Some(title) => TitleResult {
                conversation_id: conversation_id.to_string(),
                title,
                error: None,
            },
            None => fallback("empty title".to_string()),
        },
        Err(err) => fallback(format!("{err:#}")),
    }
}

/// Background title requests. Results come back over a channel and are
/// applied by whoever owns the conversation store.
pub struct TitleQueue {
    tx: Sender<TitleResult>,
    rx: Receiver<TitleResult>,
    in_flight: usize,
}

impl Default for TitleQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TitleQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx,
            in_flight: 0,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn spawn(
        &mut self,
        service: Arc<dyn GenerativeService>,
        model: String,
        conversation_id: String,
        first_message: String,
    ) {
        let tx = self.tx.clone();
        self.in_flight += 1;
        thread::spawn(move || {
            let result =
                generate_title(service.as_ref(), &model, &conversation_id, &first_message);
            let _ = tx.send(result);
        });
    }

    /// Results that have already arrived, without blocking.
    pub fn drain(&mut self) -> Vec<TitleResult> {
        let mut out = Vec::new();
        while let Ok(result) = self.rx.try_recv() {
            out.push(result);
        }
        self.in_flight = self.in_flight.saturating_sub(out.len());
        out
    }

    /// Blocks until every outstanding request reports or `timeout` passes.
    pub fn wait(&mut self, timeout: Duration) -> Vec<TitleResult> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        while self.in_flight > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(result) => {
                    self.in_flight -= 1;
                    out.push(result);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::bail;

    use super::{clean_title, generate_title, TitleQueue};
    use crate::dryrun::DryrunService;
    use crate::service::{
        ChunkStream, GenerativeService, ImageGenerationRequest, ServiceReply, TextRequest,
        VisionRequest,
    };

    struct FailingService;

    impl GenerativeService for FailingService {
        fn name(&self) -> &str {
            "failing"
        }

        fn has_credentials(&self) -> bool {
            true
        }

        fn generate_text(&self, _request: &TextRequest) -> anyhow::Result<String> {
            bail!("quota exceeded")
        }

        fn stream_text(&self, _request: &TextRequest) -> anyhow::Result<ChunkStream> {
            bail!("quota exceeded")
        }

        fn generate_image(&self, _request: &ImageGenerationRequest) -> anyhow::Result<ServiceReply> {
            bail!("quota exceeded")
        }

        fn understand_image(&self, _request: &VisionRequest) -> anyhow::Result<ServiceReply> {
            bail!("quota exceeded")
        }
    }

    #[test]
    fn clean_title_trims_quotes_and_clips_words() {
        assert_eq!(
            clean_title("\"Rust Ownership Basics.\"\n"),
            Some("Rust Ownership Basics".to_string())
        );
        assert_eq!(
            clean_title("Title: one two three four five six seven"),
            Some("one two three four five".to_string())
        );
        assert_eq!(clean_title("   \n  "), None);
        let long = "a".repeat(80);
        assert_eq!(clean_title(&long).map(|title| title.chars().count()), Some(60));
    }

    #[test]
    fn failure_degrades_to_default_title() {
        let result = generate_title(&FailingService, "m", "1", "hello");
        assert_eq!(result.title, "New Chat");
        assert!(result.fell_back());
        assert_eq!(result.error.as_deref(), Some("quota exceeded"));
    }

    #[test]
    fn queue_delivers_results_over_channel() {
        let mut queue = TitleQueue::new();
        queue.spawn(
            Arc::new(DryrunService),
            "dryrun-text-1".to_string(),
            "42".to_string(),
            "hello".to_string(),
        );
        assert_eq!(queue.in_flight(), 1);
        let results = queue.wait(Duration::from_secs(5));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].conversation_id, "42");
        assert!(!results[0].fell_back());
        assert!(results[0].title.starts_with("Echo"));
        assert_eq!(queue.in_flight(), 0);
        assert!(queue.drain().is_empty());
    }
}

use crate::error::ChatError;

/// Appended to the displayed text while a reply is still generating.
pub const CURSOR_GLYPH: char = '▋';

/// Appended to partial output when the user stops a reply.
pub const STOP_MARKER: &str = "\n\n[stopped by user]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    AwaitingFirstChunk,
    Streaming,
    Finalized,
    Cancelled,
}

impl StreamPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamPhase::Idle => "idle",
            StreamPhase::AwaitingFirstChunk => "awaiting the first chunk",
            StreamPhase::Streaming => "streaming",
            StreamPhase::Finalized => "finalized",
            StreamPhase::Cancelled => "cancelled",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            StreamPhase::AwaitingFirstChunk | StreamPhase::Streaming
        )
    }
}

/// Stitches streamed chunks into one reply.
///
/// The accumulated text never contains the cursor glyph; the glyph only
/// exists in [`StreamAssembler::display`], so chunk boundaries cannot
/// duplicate or swallow it.
#[derive(Debug, Clone)]
pub struct StreamAssembler {
    phase: StreamPhase,
    text: String,
    chunks: usize,
}

impl Default for StreamAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self {
            phase: StreamPhase::Idle,
            text: String::new(),
            chunks: 0,
        }
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn begin(&mut self) -> Result<(), ChatError> {
        if self.phase.is_active() {
            return Err(self.invalid("begin"));
        }
        self.phase = StreamPhase::AwaitingFirstChunk;
        self.text.clear();
        self.chunks = 0;
        Ok(())
    }

    /// Applies one chunk and returns the text to display.
    pub fn push(&mut self, chunk: &str) -> Result<String, ChatError> {
        if !self.phase.is_active() {
            return Err(self.invalid("accept a chunk"));
        }
        self.text.push_str(chunk);
        self.chunks += 1;
        self.phase = StreamPhase::Streaming;
        Ok(self.display())
    }

    pub fn display(&self) -> String {
        if self.phase.is_active() {
            let mut shown = String::with_capacity(self.text.len() + CURSOR_GLYPH.len_utf8());
            shown.push_str(&self.text);
            shown.push(CURSOR_GLYPH);
            shown
        } else {
            self.text.clone()
        }
    }

    pub fn finalize(&mut self) -> Result<String, ChatError> {
        if !self.phase.is_active() {
            return Err(self.invalid("finalize"));
        }
        self.phase = StreamPhase::Finalized;
        Ok(self.text.clone())
    }

    /// Stops the stream, keeping partial output followed by the stop marker.
    pub fn cancel(&mut self) -> Result<String, ChatError> {
        if !self.phase.is_active() {
            return Err(self.invalid("cancel"));
        }
        self.phase = StreamPhase::Cancelled;
        self.text.push_str(STOP_MARKER);
        Ok(self.text.clone())
    }

    /// Abandons the stream after a transport failure.
    pub fn abort(&mut self) -> String {
        let partial = std::mem::take(&mut self.text);
        self.phase = StreamPhase::Idle;
        self.chunks = 0;
        partial
    }

    fn invalid(&self, action: &'static str) -> ChatError {
        ChatError::InvalidStreamTransition {
            action,
            phase: self.phase.as_str(),
        }
    }
}

/// Removes the stop marker from a cancelled reply.
pub fn strip_stop_marker(text: &str) -> &str {
    text.strip_suffix(STOP_MARKER).unwrap_or(text)
}

#[cfg(test)]
mod tests {
    use super::{strip_stop_marker, StreamAssembler, StreamPhase, CURSOR_GLYPH, STOP_MARKER};

    #[test]
    fn example_stream_shows_cursor_then_finalizes() -> anyhow::Result<()> {
        let mut assembler = StreamAssembler::new();
        assembler.begin()?;
        assert_eq!(assembler.phase(), StreamPhase::AwaitingFirstChunk);
        assert_eq!(assembler.push("Hi")?, "Hi▋");
        assert_eq!(assembler.push("there")?, "Hithere▋");
        assert_eq!(assembler.finalize()?, "Hithere");
        assert_eq!(assembler.phase(), StreamPhase::Finalized);
        Ok(())
    }

    #[test]
    fn finalize_equals_concatenation_for_any_chunking() -> anyhow::Result<()> {
        let source = "a▋b ▋▋ unicode: żółw 🐢 end▋";
        let chars = source.chars().collect::<Vec<char>>();
        for width in 1..=chars.len() {
            let mut assembler = StreamAssembler::new();
            assembler.begin()?;
            for piece in chars.chunks(width) {
                let chunk = piece.iter().collect::<String>();
                let shown = assembler.push(&chunk)?;
                assert_eq!(shown, format!("{}{CURSOR_GLYPH}", assembler.text()));
                assert!(source.starts_with(assembler.text()));
            }
            assert_eq!(assembler.finalize()?, source);
        }
        Ok(())
    }

    #[test]
    fn cancel_appends_marker_once() -> anyhow::Result<()> {
        let mut assembler = StreamAssembler::new();
        assembler.begin()?;
        assembler.push("partial")?;
        let text = assembler.cancel()?;
        assert_eq!(text, format!("partial{STOP_MARKER}"));
        assert!(assembler.cancel().is_err());
        assert_eq!(assembler.text().matches(STOP_MARKER).count(), 1);
        assert_eq!(strip_stop_marker(&text), "partial");
        Ok(())
    }

    #[test]
    fn invalid_transitions_are_rejected() -> anyhow::Result<()> {
        let mut assembler = StreamAssembler::new();
        assert!(assembler.push("x").is_err());
        assert!(assembler.finalize().is_err());
        assembler.begin()?;
        assert!(assembler.begin().is_err());
        assembler.finalize()?;
        assert!(assembler.push("late").is_err());
        assembler.begin()?;
        assert_eq!(assembler.text(), "");
        Ok(())
    }

    #[test]
    fn display_drops_cursor_after_finalize() -> anyhow::Result<()> {
        let mut assembler = StreamAssembler::new();
        assembler.begin()?;
        assert_eq!(assembler.display(), "▋");
        assembler.push("done")?;
        assembler.finalize()?;
        assert_eq!(assembler.display(), "done");
        Ok(())
    }
}

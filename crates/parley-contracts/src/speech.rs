use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::stream::{strip_stop_marker, CURSOR_GLYPH};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpeechInputError {
    #[error("speech input is not available: {0}")]
    Unavailable(String),
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("no speech detected")]
    NoSpeech,
    #[error("speech recognition failed: {0}")]
    Failed(String),
}

struct SpeechPatterns {
    fenced_code: Regex,
    image: Regex,
    link: Regex,
    inline_code: Regex,
    emphasis: Regex,
    line_markers: Regex,
    whitespace: Regex,
}

fn patterns() -> &'static SpeechPatterns {
    static PATTERNS: OnceLock<SpeechPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| SpeechPatterns {
        fenced_code: Regex::new(r"(?s)```.*?(```|$)").expect("valid fenced code pattern"),
        image: Regex::new(r"!\[([^\]]*)\]\([^)]*\)").expect("valid image pattern"),
        link: Regex::new(r"\[([^\]]+)\]\([^)]*\)").expect("valid link pattern"),
        inline_code: Regex::new(r"`([^`]*)`").expect("valid inline code pattern"),
        emphasis: Regex::new(r"(\*\*|__|\*|~~)").expect("valid emphasis pattern"),
        line_markers: Regex::new(r"(?m)^\s*(#{1,6}\s+|>\s?|[-*+]\s+|\d+\.\s+)")
            .expect("valid line marker pattern"),
        whitespace: Regex::new(r"\s+").expect("valid whitespace pattern"),
    })
}

/// Plain text to hand to a speech synthesizer: code blocks and images are
/// dropped, markdown markup is removed and whitespace collapsed.
pub fn speakable_text(markdown: &str) -> String {
    let p = patterns();
    let text = strip_stop_marker(markdown).replace(CURSOR_GLYPH, "");
    let text = p.fenced_code.replace_all(&text, " ");
    let text = p.image.replace_all(&text, " ");
    let text = p.link.replace_all(&text, "$1");
    let text = p.inline_code.replace_all(&text, "$1");
    let text = p.line_markers.replace_all(&text, "");
    let text = p.emphasis.replace_all(&text, "");
    p.whitespace.replace_all(&text, " ").trim().to_string()
}

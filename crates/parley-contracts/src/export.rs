use chrono::{DateTime, Utc};

use crate::conversation::Conversation;

/// Renders a conversation as a Markdown transcript. Pending placeholders
/// are skipped; inline images are embedded as data URLs.
pub fn render_markdown(conversation: &Conversation, exported_at: DateTime<Utc>) -> String {
    let mut lines = vec![
        format!("# {}", conversation.title),
        String::new(),
        format!("_Exported {}_", exported_at.format("%Y-%m-%d %H:%M UTC")),
    ];
    for message in &conversation.messages {
        if message.pending {
            continue;
        }
        lines.push(String::new());
        lines.push(format!("**{}**", message.role.label()));
        lines.push(String::new());
        let content = message.content.as_str();
        if !content.trim().is_empty() {
            lines.push(content.trim_end().to_string());
        }
        if let Some(image) = &message.image {
            if !content.trim().is_empty() {
                lines.push(String::new());
            }
            lines.push(format!("![image]({})", image.data_url()));
        }
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// File name for an exported conversation: a lowercase slug of the title.
pub fn export_file_name(conversation: &Conversation) -> String {
    let mut slug = String::new();
    for ch in conversation.title.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        format!("conversation-{}.md", conversation.id)
    } else {
        format!("{slug}.md")
    }
}

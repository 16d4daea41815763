use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::conversation::{Conversation, ConversationStore};
use crate::preferences::{Preferences, Theme};
use crate::storage::KeyValueStore;

pub const KEY_CONVERSATIONS: &str = "conversations";
pub const KEY_CURRENT_CONVERSATION: &str = "currentConversationId";
pub const KEY_THEME: &str = "theme";
pub const KEY_VOICE_ENABLED: &str = "voiceEnabled";

/// Rebuilds the conversation store. Entries that fail to parse are skipped
/// rather than failing the whole load.
pub fn load_store(kv: &mut dyn KeyValueStore) -> ConversationStore {
    let mut conversations = BTreeMap::new();
    if let Some(Value::Object(entries)) = kv.get(KEY_CONVERSATIONS) {
        for (id, entry) in entries {
            if let Ok(mut conversation) = serde_json::from_value::<Conversation>(entry) {
                conversation.id = id.clone();
                conversations.insert(id, conversation);
            }
        }
    }
    let active = kv
        .get(KEY_CURRENT_CONVERSATION)
        .and_then(|value| value.as_str().map(str::to_string));
    ConversationStore::bootstrap(conversations, active)
}

pub fn load_preferences(kv: &mut dyn KeyValueStore) -> Preferences {
    let defaults = Preferences::default();
    Preferences {
        theme: kv
            .get(KEY_THEME)
            .and_then(|value| value.as_str().and_then(Theme::parse))
            .unwrap_or(defaults.theme),
        voice_enabled: kv
            .get(KEY_VOICE_ENABLED)
            .and_then(|value| value.as_bool())
            .unwrap_or(defaults.voice_enabled),
    }
}

/// Writes every conversation (without image payloads) and the active id.
pub fn save_store(kv: &mut dyn KeyValueStore, store: &ConversationStore) -> anyhow::Result<()> {
    let mut entries = Map::new();
    for (id, conversation) in store.conversations() {
        entries.insert(id.clone(), serde_json::to_value(conversation.without_images())?);
    }
    kv.set(KEY_CONVERSATIONS, Value::Object(entries))?;
    kv.set(
        KEY_CURRENT_CONVERSATION,
        Value::String(store.active_id().to_string()),
    )
}

pub fn save_preferences(kv: &mut dyn KeyValueStore, preferences: &Preferences) -> anyhow::Result<()> {
    kv.set(KEY_THEME, Value::String(preferences.theme.as_str().to_string()))?;
    kv.set(KEY_VOICE_ENABLED, Value::Bool(preferences.voice_enabled))
}

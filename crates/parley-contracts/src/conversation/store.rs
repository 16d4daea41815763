use std::collections::BTreeMap;

use chrono::Utc;

use super::model::{Conversation, Message, Role};
use crate::error::ChatError;

const INTERRUPTED_REPLY: &str = "Response interrupted before it finished.";

/// In-memory map of conversations plus the active selection.
///
/// The store is never empty: every path that could remove the last
/// conversation synthesizes a fresh one, so `active()` always resolves.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationStore {
    conversations: BTreeMap<String, Conversation>,
    active_id: String,
    last_created_at: i64,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::bootstrap(BTreeMap::new(), None)
    }

    /// Rebuilds a store from persisted state.
    pub fn bootstrap(
        conversations: BTreeMap<String, Conversation>,
        active_id: Option<String>,
    ) -> Self {
        let last_created_at = conversations
            .values()
            .map(|conversation| conversation.created_at)
            .max()
            .unwrap_or(0);
        let mut store = Self {
            conversations,
            active_id: String::new(),
            last_created_at,
        };
        for conversation in store.conversations.values_mut() {
            for message in &mut conversation.messages {
                if message.pending {
                    *message = Message {
                        id: message.id.clone(),
                        role: Role::Error,
                        content: INTERRUPTED_REPLY.to_string(),
                        image: None,
                        pending: false,
                    };
                }
            }
        }

        match active_id.filter(|id| store.conversations.contains_key(id)) {
            Some(id) => store.active_id = id,
            None => match store.most_recent_id() {
                Some(id) => store.active_id = id,
                None => {
                    store.create();
                }
            },
        }
        store
    }

    pub fn create(&mut self) -> &Conversation {
        self.create_at(Utc::now().timestamp_millis())
    }

    /// Creates a conversation stamped no earlier than `now_ms`; ids stay
    /// strictly increasing even when several are created in the same
    /// millisecond.
    pub fn create_at(&mut self, now_ms: i64) -> &Conversation {
        let created_at = now_ms.max(self.last_created_at + 1);
        self.last_created_at = created_at;
        let id = created_at.to_string();
        self.conversations
            .insert(id.clone(), Conversation::new(id.clone(), created_at));
        self.active_id = id.clone();
        &self.conversations[&id]
    }

    pub fn switch_active(&mut self, id: &str) -> Result<(), ChatError> {
        if !self.conversations.contains_key(id) {
            return Err(ChatError::UnknownConversation(id.to_string()));
        }
        self.active_id = id.to_string();
        Ok(())
    }

    /// Deletes a conversation. Deleting the active one moves the selection
    /// to the most recently created survivor, or to a fresh conversation
    /// when none remain.
    pub fn delete(&mut self, id: &str) -> Result<Conversation, ChatError> {
        let removed = self
            .conversations
            .remove(id)
            .ok_or_else(|| ChatError::UnknownConversation(id.to_string()))?;
        if self.active_id == id {
            match self.most_recent_id() {
                Some(next) => self.active_id = next,
                None => {
                    self.create();
                }
            }
        }
        Ok(removed)
    }

    pub fn append_message(&mut self, id: &str, message: Message) -> Result<(), ChatError> {
        self.get_mut(id)?.messages.push(message);
        Ok(())
    }

    /// Mutates the last message of a conversation in place. Returns false
    /// when the conversation has no messages.
    pub fn mutate_last_message<F>(&mut self, id: &str, mutate: F) -> Result<bool, ChatError>
    where
        F: FnOnce(&mut Message),
    {
        match self.get_mut(id)?.messages.last_mut() {
            Some(message) => {
                mutate(message);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replaces the message with `message_id`, keeping its position.
    pub fn replace_message(
        &mut self,
        id: &str,
        message_id: &str,
        message: Message,
    ) -> Result<bool, ChatError> {
        let conversation = self.get_mut(id)?;
        match conversation
            .messages
            .iter_mut()
            .find(|existing| existing.id == message_id)
        {
            Some(slot) => {
                *slot = message;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn message_mut(&mut self, id: &str, message_id: &str) -> Option<&mut Message> {
        self.conversations
            .get_mut(id)?
            .messages
            .iter_mut()
            .find(|message| message.id == message_id)
    }

    pub fn set_title(&mut self, id: &str, title: &str) -> Result<(), ChatError> {
        self.get_mut(id)?.title = title.to_string();
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    pub fn active(&self) -> &Conversation {
        &self.conversations[&self.active_id]
    }

    pub fn active_id(&self) -> &str {
        &self.active_id
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn conversations(&self) -> &BTreeMap<String, Conversation> {
        &self.conversations
    }

    pub fn list_recent_first(&self) -> Vec<&Conversation> {
        let mut items = self.conversations.values().collect::<Vec<&Conversation>>();
        items.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        items
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Conversation, ChatError> {
        self.conversations
            .get_mut(id)
            .ok_or_else(|| ChatError::UnknownConversation(id.to_string()))
    }

    fn most_recent_id(&self) -> Option<String> {
        self.conversations
            .values()
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
            .map(|conversation| conversation.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::ConversationStore;
    use crate::conversation::{Conversation, Message, Role, DEFAULT_TITLE};
    use crate::error::ChatError;

    #[test]
    fn new_store_starts_with_default_conversation() {
        let store = ConversationStore::new();
        assert_eq!(store.len(), 1);
        assert_eq!(store.active().title, DEFAULT_TITLE);
        assert!(store.active().messages.is_empty());
    }

    #[test]
    fn create_keeps_ids_ordered_within_one_millisecond() {
        let mut store = ConversationStore::bootstrap(BTreeMap::new(), None);
        let first = store.create_at(5_000).id.clone();
        let second = store.create_at(5_000).id.clone();
        let third = store.create_at(4_000).id.clone();
        assert!(first.parse::<i64>().unwrap_or(0) < second.parse::<i64>().unwrap_or(0));
        assert!(second.parse::<i64>().unwrap_or(0) < third.parse::<i64>().unwrap_or(0));
        assert_eq!(store.active_id(), third);
    }

    #[test]
    fn deleting_only_conversation_synthesizes_fresh_one() -> anyhow::Result<()> {
        let mut store = ConversationStore::new();
        let only = store.active_id().to_string();
        store.append_message(&only, Message::user("hi", None))?;

        store.delete(&only)?;
        assert_eq!(store.len(), 1);
        assert_ne!(store.active_id(), only);
        assert!(store.active().messages.is_empty());
        assert_eq!(store.active().title, DEFAULT_TITLE);
        Ok(())
    }

    #[test]
    fn deleting_active_selects_most_recent_survivor() -> anyhow::Result<()> {
        let mut store = ConversationStore::new();
        let a = store.create_at(i64::MAX / 4).id.clone();
        let b = store.create_at(0).id.clone();
        let c = store.create_at(0).id.clone();
        store.switch_active(&a)?;

        store.delete(&a)?;
        assert_eq!(store.active_id(), c);
        assert!(store.get(&b).is_some());
        Ok(())
    }

    #[test]
    fn deleting_non_active_keeps_active_id() -> anyhow::Result<()> {
        let mut store = ConversationStore::new();
        let first = store.active_id().to_string();
        let second = store.create().id.clone();
        store.delete(&first)?;
        assert_eq!(store.active_id(), second);
        assert_eq!(store.len(), 1);
        Ok(())
    }

    #[test]
    fn unknown_ids_are_errors() {
        let mut store = ConversationStore::new();
        assert_eq!(
            store.switch_active("nope"),
            Err(ChatError::UnknownConversation("nope".to_string()))
        );
        assert!(store.delete("nope").is_err());
        assert!(store.append_message("nope", Message::error("x")).is_err());
    }

    #[test]
    fn mutate_and_replace_preserve_order() -> anyhow::Result<()> {
        let mut store = ConversationStore::new();
        let id = store.active_id().to_string();
        store.append_message(&id, Message::user("q", None))?;
        let placeholder = Message::placeholder();
        let placeholder_id = placeholder.id.clone();
        store.append_message(&id, placeholder)?;

        assert!(store.mutate_last_message(&id, |message| message.content.push_str("par"))?);
        assert_eq!(store.active().messages[1].content, "par");

        let replaced = store.replace_message(&id, &placeholder_id, Message::error("boom"))?;
        assert!(replaced);
        let roles = store
            .active()
            .messages
            .iter()
            .map(|message| message.role)
            .collect::<Vec<Role>>();
        assert_eq!(roles, vec![Role::User, Role::Error]);
        Ok(())
    }

    #[test]
    fn bootstrap_repairs_pending_messages_and_picks_recent() {
        let mut older = Conversation::new("100", 100);
        older.messages.push(Message::user("q", None));
        older.messages.push(Message::placeholder());
        let newer = Conversation::new("200", 200);

        let mut map = BTreeMap::new();
        map.insert(older.id.clone(), older);
        map.insert(newer.id.clone(), newer);

        let store = ConversationStore::bootstrap(map, Some("missing".to_string()));
        assert_eq!(store.active_id(), "200");
        let messages = store
            .get("100")
            .map(|conversation| conversation.messages.clone())
            .unwrap_or_default();
        assert_eq!(messages[1].role, Role::Error);
        assert!(!messages[1].pending);
    }

    #[test]
    fn list_recent_first_orders_by_creation() {
        let mut store = ConversationStore::bootstrap(BTreeMap::new(), None);
        store.create_at(10);
        store.create_at(30);
        store.create_at(20);
        let ids = store
            .list_recent_first()
            .into_iter()
            .map(|conversation| conversation.created_at)
            .collect::<Vec<i64>>();
        let mut sorted = ids.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(ids, sorted);
    }
}

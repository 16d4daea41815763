use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_TITLE: &str = "New Chat";

/// Content of a model message that has been created but not yet received
/// any output.
pub const PLACEHOLDER_CONTENT: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    Error,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Role::User => "You",
            Role::Model => "Model",
            Role::Error => "Error",
        }
    }
}

/// Inline image payload, base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageData {
    pub mime_type: String,
    pub data: String,
}

impl ImageData {
    pub fn from_bytes(mime_type: &str, bytes: &[u8]) -> Self {
        Self {
            mime_type: mime_type.to_string(),
            data: BASE64.encode(bytes),
        }
    }

    pub fn decode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(BASE64.decode(self.data.as_bytes())?)
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }

    pub fn extension(&self) -> &'static str {
        match self.mime_type.to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" => "jpg",
            "image/webp" => "webp",
            "image/gif" => "gif",
            "image/heic" => "heic",
            "image/heif" => "heif",
            _ => "png",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageData>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pending: bool,
}

impl Message {
    fn build(role: Role, content: String, image: Option<ImageData>, pending: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            image,
            pending,
        }
    }

    pub fn user(content: impl Into<String>, image: Option<ImageData>) -> Self {
        Self::build(Role::User, content.into(), image, false)
    }

    pub fn model(content: impl Into<String>, image: Option<ImageData>) -> Self {
        Self::build(Role::Model, content.into(), image, false)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::build(Role::Error, content.into(), None, false)
    }

    pub fn placeholder() -> Self {
        Self::build(Role::Model, PLACEHOLDER_CONTENT.to_string(), None, true)
    }

    pub fn is_placeholder(&self) -> bool {
        self.pending && self.role == Role::Model
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: i64,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, created_at: i64) -> Self {
        Self {
            id: id.into(),
            title: DEFAULT_TITLE.to_string(),
            created_at,
            messages: Vec::new(),
        }
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn message(&self, message_id: &str) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == message_id)
    }

    pub fn user_turns(&self) -> usize {
        self.messages
            .iter()
            .filter(|message| message.role == Role::User)
            .count()
    }

    /// Copy suitable for persistence: image payloads are dropped.
    pub fn without_images(&self) -> Self {
        let mut copy = self.clone();
        for message in &mut copy.messages {
            message.image = None;
        }
        copy
    }
}

mod model;
mod store;

pub use model::{Conversation, ImageData, Message, Role, DEFAULT_TITLE, PLACEHOLDER_CONTENT};
pub use store::ConversationStore;

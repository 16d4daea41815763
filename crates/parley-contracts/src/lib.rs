pub mod attachments;
pub mod chat;
pub mod conversation;
pub mod error;
pub mod events;
pub mod export;
pub mod models;
pub mod persistence;
pub mod preferences;
pub mod session;
pub mod speech;
pub mod storage;
pub mod stream;
pub mod turn;

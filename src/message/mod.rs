//! Message Handling Module
//!
//! Persistence, the conversation views, and delivery of outbound messages.

pub mod channel_model;
pub mod message_types;
pub mod router;
pub mod sqlite_store;
pub mod storage;

pub use channel_model::ChannelModel;
pub use message_types::{ChannelId, ChannelProfile, Message};
pub use router::{DeliveryCoordinator, DeliveryHandle, DeliveryReport};
pub use sqlite_store::SqliteMessageStore;
pub use storage::{MemoryMessageStore, MessageStore};

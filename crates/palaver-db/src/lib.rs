pub mod conversation_store;
pub mod memory_store;

pub use conversation_store::{
    ConversationRow, ConversationStore, MessageMetrics, NewMessage, ScoredMessage, StoredMessage,
};
pub use memory_store::{MemoryFact, MemoryStore};

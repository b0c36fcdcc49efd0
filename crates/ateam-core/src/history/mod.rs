//! Append-only message log port

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::types::Message;

pub mod export;
pub mod sqlite;

pub use export::{export_room, render_markdown};
pub use sqlite::{RoomSummary, SqliteHistory};

/// Durable transcript storage. Implementations assign ids on append.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Store `message` and return it with its assigned id
    async fn append(&self, room: &str, message: Message) -> Result<Message>;

    /// Every message of `room`, in insertion order
    async fn load(&self, room: &str) -> Result<Vec<Message>>;
}

/// Process-local store. Ids increase monotonically across all rooms.
#[derive(Default)]
pub struct InMemoryHistory {
    inner: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    next_id: u64,
    rooms: HashMap<String, Vec<Message>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a room with an existing transcript, assigning fresh ids
    pub async fn with_messages(self, room: &str, messages: Vec<Message>) -> Self {
        for message in messages {
            // in-memory appends cannot fail
            let _ = self.append(room, message).await;
        }
        self
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistory {
    async fn append(&self, room: &str, mut message: Message) -> Result<Message> {
        let mut state = self.inner.lock().await;
        state.next_id += 1;
        message.id = state.next_id;
        state
            .rooms
            .entry(room.to_string())
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn load(&self, room: &str) -> Result<Vec<Message>> {
        let state = self.inner.lock().await;
        Ok(state.rooms.get(room).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_assigns_increasing_ids() {
        let history = InMemoryHistory::new();
        let a = history.append("r1", Message::user("one")).await.unwrap();
        let b = history.append("r2", Message::user("two")).await.unwrap();
        let c = history.append("r1", Message::user("three")).await.unwrap();
        assert!(a.id < b.id && b.id < c.id);

        let r1 = history.load("r1").await.unwrap();
        assert_eq!(r1.len(), 2);
        assert_eq!(r1[1].content, "three");
        assert!(history.load("empty").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_with_messages_seeds_room() {
        let history = InMemoryHistory::new()
            .with_messages("r", vec![Message::system("intro"), Message::user("hi")])
            .await;
        let msgs = history.load("r").await.unwrap();
        assert_eq!(msgs.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2]);
    }
}

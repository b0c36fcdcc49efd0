//! SQLite history: one `history.db` per room under the rooms directory

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::Serialize;
use serde_json::Map;
use tracing::{debug, info, warn};

use super::HistoryStore;
use crate::session::validate_room_name;
use crate::types::{Message, Role};

const DB_FILE: &str = "history.db";

type Rooms = Arc<Mutex<HashMap<String, Arc<Mutex<Connection>>>>>;

/// A room found on disk
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomSummary {
    pub name: String,
    pub message_count: u64,
    pub last_active: Option<DateTime<Utc>>,
}

/// Persistent store. Each room's database is opened on first use and kept
/// open; ids are the database row ids, increasing per room.
pub struct SqliteHistory {
    rooms_dir: PathBuf,
    rooms: Rooms,
}

impl SqliteHistory {
    pub fn new(rooms_dir: impl Into<PathBuf>) -> Self {
        Self {
            rooms_dir: rooms_dir.into(),
            rooms: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn rooms_dir(&self) -> &Path {
        &self.rooms_dir
    }

    /// Rooms with a history database, most recently active first
    pub async fn list_rooms(&self) -> Result<Vec<RoomSummary>> {
        let rooms_dir = self.rooms_dir.clone();
        let rooms = Arc::clone(&self.rooms);

        tokio::task::spawn_blocking(move || {
            let mut summaries = Vec::new();
            let entries = match std::fs::read_dir(&rooms_dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(summaries),
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to read rooms directory {}", rooms_dir.display())
                    });
                }
            };

            for entry in entries.filter_map(|e| e.ok()) {
                let name = entry.file_name().to_string_lossy().to_string();
                if validate_room_name(&name).is_err() || !entry.path().join(DB_FILE).is_file() {
                    continue;
                }
                let conn = match open_room(&rooms, &rooms_dir, &name) {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Skipping room '{}': {:#}", name, e);
                        continue;
                    }
                };
                let conn = lock(&conn);
                let (count, last): (i64, Option<String>) = conn.query_row(
                    "SELECT COUNT(*), MAX(timestamp) FROM messages",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                summaries.push(RoomSummary {
                    name,
                    message_count: count as u64,
                    last_active: last.as_deref().and_then(parse_timestamp),
                });
            }

            summaries.sort_by(|a, b| {
                b.last_active
                    .cmp(&a.last_active)
                    .then_with(|| a.name.cmp(&b.name))
            });
            Ok(summaries)
        })
        .await
        .context("spawn_blocking task panicked")?
    }
}

fn lock(conn: &Mutex<Connection>) -> std::sync::MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|poisoned| {
        warn!("Database mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Cached connection for `room`, opening and migrating the database if needed
fn open_room(rooms: &Rooms, rooms_dir: &Path, room: &str) -> Result<Arc<Mutex<Connection>>> {
    validate_room_name(room)?;
    let mut cache = rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(conn) = cache.get(room) {
        return Ok(Arc::clone(conn));
    }

    let dir = rooms_dir.join(room);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create room directory {}", dir.display()))?;
    let path = dir.join(DB_FILE);
    let conn = Connection::open(&path)
        .with_context(|| format!("Failed to open history database {}", path.display()))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            agent_name TEXT,
            model_used TEXT,
            prompt_tokens INTEGER,
            completion_tokens INTEGER,
            is_summary INTEGER NOT NULL DEFAULT 0,
            metadata TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp)",
        [],
    )?;
    info!("Opened history for room '{}' at {}", room, path.display());

    let conn = Arc::new(Mutex::new(conn));
    cache.insert(room.to_string(), Arc::clone(&conn));
    Ok(conn)
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_role(s: &str) -> Role {
    match s {
        "user" => Role::User,
        "assistant" => Role::Assistant,
        _ => Role::System,
    }
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let metadata_str: Option<String> = row.get(9)?;
    let metadata = metadata_str
        .map(|s| serde_json::from_str::<Map<String, serde_json::Value>>(&s))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })?
        .unwrap_or_default();

    let timestamp: String = row.get(1)?;
    let role: String = row.get(2)?;
    Ok(Message {
        id: row.get::<_, i64>(0)? as u64,
        timestamp: parse_timestamp(&timestamp).unwrap_or_else(Utc::now),
        role: parse_role(&role),
        content: row.get(3)?,
        agent_name: row.get(4)?,
        model_used: row.get(5)?,
        prompt_tokens: row.get(6)?,
        completion_tokens: row.get(7)?,
        is_summary: row.get(8)?,
        metadata,
    })
}

#[async_trait]
impl HistoryStore for SqliteHistory {
    async fn append(&self, room: &str, mut message: Message) -> Result<Message> {
        let rooms = Arc::clone(&self.rooms);
        let rooms_dir = self.rooms_dir.clone();
        let room = room.to_owned();

        tokio::task::spawn_blocking(move || {
            let conn = open_room(&rooms, &rooms_dir, &room)?;
            let metadata_json = if message.metadata.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&message.metadata)?)
            };
            let conn = lock(&conn);
            conn.execute(
                "INSERT INTO messages (timestamp, role, content, agent_name, model_used,
                                       prompt_tokens, completion_tokens, is_summary, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    message.timestamp.to_rfc3339(),
                    message.role.to_string(),
                    &message.content,
                    &message.agent_name,
                    &message.model_used,
                    message.prompt_tokens,
                    message.completion_tokens,
                    message.is_summary,
                    metadata_json,
                ],
            )?;
            message.id = conn.last_insert_rowid() as u64;
            debug!("Appended message {} to room '{}'", message.id, room);
            Ok(message)
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    async fn load(&self, room: &str) -> Result<Vec<Message>> {
        let rooms = Arc::clone(&self.rooms);
        let rooms_dir = self.rooms_dir.clone();
        let room = room.to_owned();

        tokio::task::spawn_blocking(move || {
            let conn = open_room(&rooms, &rooms_dir, &room)?;
            let conn = lock(&conn);
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, role, content, agent_name, model_used,
                        prompt_tokens, completion_tokens, is_summary, metadata
                 FROM messages ORDER BY id ASC",
            )?;
            let messages = stmt
                .query_map([], row_to_message)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(messages)
        })
        .await
        .context("spawn_blocking task panicked")?
    }
}

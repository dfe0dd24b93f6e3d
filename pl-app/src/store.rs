//! Append-only transcript store over SQLite.
//!
//! Messages are the system of record for conversation replay and agent
//! history reconstruction: insert-only, totally ordered by
//! `(created_at, id)`.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use pl_llm::Role;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Chat,
    AgentPlan,
    ToolCall,
    ToolOutput,
    UserConfirmation,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::AgentPlan => "agent_plan",
            Self::ToolCall => "tool_call",
            Self::ToolOutput => "tool_output",
            Self::UserConfirmation => "user_confirmation",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "chat" => Ok(Self::Chat),
            "agent_plan" => Ok(Self::AgentPlan),
            "tool_call" => Ok(Self::ToolCall),
            "tool_output" => Ok(Self::ToolOutput),
            "user_confirmation" => Ok(Self::UserConfirmation),
            other => Err(anyhow!("unknown message type {other:?}")),
        }
    }
}

fn parse_role(raw: &str) -> Result<Role> {
    match raw {
        "user" => Ok(Role::User),
        "model" => Ok(Role::Model),
        other => Err(anyhow!("unknown role {other:?}")),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRecord {
    pub id: Uuid,
    pub title: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub id: i64,
    pub chat_id: Uuid,
    pub role: Role,
    /// Rendered HTML shown by the web layer.
    pub content: String,
    /// Plain representation; the only form ever fed back to the model.
    pub raw_content: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
}

pub struct ChatStore {
    conn: Mutex<Connection>,
}

impl ChatStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening database {}", path.display()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("store lock poisoned"))
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS chats (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    model TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_id TEXT NOT NULL REFERENCES chats(id),
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    raw_content TEXT NOT NULL,
    message_type TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_chat_created
    ON messages (chat_id, created_at);
"#,
        )?;
        Ok(())
    }

    pub fn create_chat(&self, id: Uuid, title: &str, model: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO chats (id, title, model, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id.to_string(), title, model, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_chat(&self, id: Uuid) -> Result<Option<ChatRecord>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT id, title, model, created_at FROM chats WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id.to_string()], chat_from_row)?;
        rows.next().transpose().map_err(Into::into)
    }

    pub fn list_chats(&self) -> Result<Vec<ChatRecord>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT id, title, model, created_at FROM chats ORDER BY created_at DESC")?;
        let rows = stmt.query_map([], chat_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn set_title(&self, id: Uuid, title: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE chats SET title = ?1 WHERE id = ?2",
            params![title, id.to_string()],
        )?;
        Ok(())
    }

    /// Deleting a chat cascades its messages.
    pub fn delete_chat(&self, id: Uuid) -> Result<bool> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM messages WHERE chat_id = ?1",
            params![id.to_string()],
        )?;
        let n = conn.execute("DELETE FROM chats WHERE id = ?1", params![id.to_string()])?;
        Ok(n > 0)
    }

    pub fn append_message(
        &self,
        chat_id: Uuid,
        role: Role,
        content: &str,
        raw_content: &str,
        kind: MessageKind,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO messages (chat_id, role, content, raw_content, message_type, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                chat_id.to_string(),
                role.as_str(),
                content,
                raw_content,
                kind.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// All messages of one chat in transcript order. The autoincrement id
    /// breaks ties within a single timestamp tick.
    pub fn messages_for_chat(&self, chat_id: Uuid) -> Result<Vec<MessageRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, role, content, raw_content, message_type, created_at \
             FROM messages WHERE chat_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![chat_id.to_string()], message_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }
}

fn chat_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatRecord> {
    let id: String = row.get(0)?;
    let created_at: String = row.get(3)?;
    Ok(ChatRecord {
        id: parse_uuid_column(&id, 0)?,
        title: row.get(1)?,
        model: row.get(2)?,
        created_at: parse_time_column(&created_at, 3)?,
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let chat_id: String = row.get(1)?;
    let role: String = row.get(2)?;
    let kind: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        chat_id: parse_uuid_column(&chat_id, 1)?,
        role: parse_role(&role).map_err(|e| column_error(2, e))?,
        content: row.get(3)?,
        raw_content: row.get(4)?,
        kind: MessageKind::parse(&kind).map_err(|e| column_error(5, e))?,
        created_at: parse_time_column(&created_at, 6)?,
    })
}

fn parse_uuid_column(raw: &str, index: usize) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| column_error(index, anyhow!(e)))
}

fn parse_time_column(raw: &str, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| column_error(index, anyhow!(e)))
}

fn column_error(index: usize, e: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        format!("{e}").into(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_replay_in_insertion_order() {
        let store = ChatStore::open_in_memory().unwrap();
        let chat = Uuid::new_v4();
        store.create_chat(chat, "New Chat", "gemini-2.5-flash").unwrap();

        store
            .append_message(chat, Role::User, "u1", "u1", MessageKind::Chat)
            .unwrap();
        store
            .append_message(chat, Role::Model, "p", "p", MessageKind::AgentPlan)
            .unwrap();
        store
            .append_message(chat, Role::Model, "t", "t", MessageKind::ToolOutput)
            .unwrap();

        let messages = store.messages_for_chat(chat).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].kind, MessageKind::Chat);
        assert_eq!(messages[1].kind, MessageKind::AgentPlan);
        assert_eq!(messages[2].kind, MessageKind::ToolOutput);
        assert!(messages.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn delete_chat_cascades_messages() {
        let store = ChatStore::open_in_memory().unwrap();
        let chat = Uuid::new_v4();
        store.create_chat(chat, "t", "m").unwrap();
        store
            .append_message(chat, Role::User, "hello", "hello", MessageKind::Chat)
            .unwrap();

        assert!(store.delete_chat(chat).unwrap());
        assert!(store.get_chat(chat).unwrap().is_none());
        assert!(store.messages_for_chat(chat).unwrap().is_empty());
        assert!(!store.delete_chat(chat).unwrap());
    }

    #[test]
    fn title_updates_are_visible() {
        let store = ChatStore::open_in_memory().unwrap();
        let chat = Uuid::new_v4();
        store.create_chat(chat, "New Chat", "m").unwrap();
        store.set_title(chat, "Quarterly report summary").unwrap();
        let rec = store.get_chat(chat).unwrap().unwrap();
        assert_eq!(rec.title, "Quarterly report summary");
    }

    #[test]
    fn list_chats_returns_newest_first() {
        let store = ChatStore::open_in_memory().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.create_chat(a, "a", "m").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.create_chat(b, "b", "m").unwrap();

        let chats = store.list_chats().unwrap();
        assert_eq!(chats.len(), 2);
        assert_eq!(chats[0].id, b);
    }
}

//! SQLite-backed chat history.
//!
//! Three tables: `chat`, `message` (ordered by `position` within a chat) and
//! `attachment` (ordered by `position` within a message). Deletes cascade by hand
//! inside a transaction.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use shared::message::{Attachment, AttachmentContent, AttachmentKind, Message, Role};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::store::{ChatStore, StoredSession};

pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the database file inside `data_dir`.
    pub fn new(data_dir: &Path) -> Result<Self> {
        // Ensure parent directory exists
        std::fs::create_dir_all(data_dir)?;
        Self::open(&data_dir.join("parley.db"))
    }

    /// Open (or create) a database at exactly `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("opening {}", db_path.display()))?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chat (
                id TEXT NOT NULL PRIMARY KEY,
                name TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS message (
                id TEXT NOT NULL PRIMARY KEY,
                chat_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                role TEXT NOT NULL,
                model TEXT,
                date_time TEXT NOT NULL,
                finished_at TEXT,
                content TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS attachment (
                id TEXT NOT NULL PRIMARY KEY,
                message_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                type TEXT NOT NULL,
                name TEXT NOT NULL,
                content BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS message_chat ON message(chat_id, position);
            CREATE INDEX IF NOT EXISTS attachment_message ON attachment(message_id, position);",
        )?;
        Ok(())
    }

    fn insert_message_tx(tx: &Transaction<'_>, chat_id: &str, message: &Message) -> Result<()> {
        let position: i64 = tx.query_row(
            "SELECT COALESCE(MAX(position), -1) + 1 FROM message WHERE chat_id = ?1",
            params![chat_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO message (id, chat_id, position, role, model, date_time, finished_at, content)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.id,
                chat_id,
                position,
                message.role.as_str(),
                message.model,
                message.created_at.to_rfc3339(),
                message.finished_at.map(|t| t.to_rfc3339()),
                message.content,
            ],
        )?;
        for (index, attachment) in message.attachments.iter().enumerate() {
            let bytes: &[u8] = match &attachment.content {
                AttachmentContent::Binary(bytes) => bytes,
                AttachmentContent::Text(text) => text.as_bytes(),
            };
            tx.execute(
                "INSERT INTO attachment (id, message_id, position, type, name, content)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    attachment.id,
                    message.id,
                    index as i64,
                    attachment.kind.as_str(),
                    attachment.name,
                    bytes,
                ],
            )?;
        }
        Ok(())
    }

    fn load_attachments(conn: &Connection) -> Result<HashMap<String, Vec<Attachment>>> {
        let mut stmt = conn.prepare(
            "SELECT id, message_id, type, name, content FROM attachment ORDER BY message_id, position",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Vec<u8>>(4)?,
            ))
        })?;

        let mut by_message: HashMap<String, Vec<Attachment>> = HashMap::new();
        for row in rows {
            let (id, message_id, kind, name, bytes) = row?;
            let kind = AttachmentKind::parse(&kind)
                .ok_or_else(|| anyhow!("unknown attachment type '{}'", kind))?;
            let content = if kind == AttachmentKind::Image {
                AttachmentContent::Binary(bytes)
            } else {
                AttachmentContent::Text(String::from_utf8_lossy(&bytes).into_owned())
            };
            by_message.entry(message_id).or_default().push(Attachment {
                id,
                name,
                kind,
                content,
            });
        }
        Ok(by_message)
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("bad timestamp '{}'", value))?
        .with_timezone(&Utc))
}

impl ChatStore for SqliteStore {
    fn insert_session(&self, id: &str, name: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO chat (id, name) VALUES (?1, ?2)",
            params![id, name],
        )?;
        Ok(())
    }

    fn insert_session_with_messages(&self, session: &StoredSession) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO chat (id, name) VALUES (?1, ?2)",
            params![session.id, session.name],
        )?;
        for message in &session.messages {
            Self::insert_message_tx(&tx, &session.id, message)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn rename_session(&self, id: &str, name: &str) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute("UPDATE chat SET name = ?1 WHERE id = ?2", params![name, id])?;
        if changed == 0 {
            return Err(anyhow!("chat {} not stored", id));
        }
        Ok(())
    }

    fn delete_session(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM attachment WHERE message_id IN (SELECT id FROM message WHERE chat_id = ?1)",
            params![id],
        )?;
        tx.execute("DELETE FROM message WHERE chat_id = ?1", params![id])?;
        tx.execute("DELETE FROM chat WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    fn insert_message(&self, session_id: &str, message: &Message) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let exists = tx
            .query_row("SELECT 1 FROM chat WHERE id = ?1", params![session_id], |_| Ok(()))
            .optional()?;
        if exists.is_none() {
            return Err(anyhow!("chat {} not stored", session_id));
        }
        Self::insert_message_tx(&tx, session_id, message)?;
        tx.commit()?;
        Ok(())
    }

    fn update_message(&self, message: &Message) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE message SET content = ?1, finished_at = ?2 WHERE id = ?3",
            params![
                message.content,
                message.finished_at.map(|t| t.to_rfc3339()),
                message.id,
            ],
        )?;
        if changed == 0 {
            return Err(anyhow!("message {} not stored", message.id));
        }
        Ok(())
    }

    fn delete_message(&self, message_id: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM attachment WHERE message_id = ?1", params![message_id])?;
        let changed = tx.execute("DELETE FROM message WHERE id = ?1", params![message_id])?;
        if changed == 0 {
            return Err(anyhow!("message {} not stored", message_id));
        }
        tx.commit()?;
        Ok(())
    }

    fn load_sessions(&self) -> Result<Vec<StoredSession>> {
        let conn = self.conn.lock();
        let mut attachments = Self::load_attachments(&conn)?;

        let mut chats_stmt = conn.prepare(
            "SELECT chat.id, chat.name, MAX(message.date_time) AS latest
             FROM chat LEFT JOIN message ON chat.id = message.chat_id
             GROUP BY chat.id ORDER BY latest DESC",
        )?;
        let chats = chats_stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut msg_stmt = conn.prepare(
            "SELECT id, role, model, date_time, finished_at, content
             FROM message WHERE chat_id = ?1 ORDER BY position",
        )?;

        let mut sessions = Vec::with_capacity(chats.len());
        for (id, name) in chats {
            let rows = msg_stmt
                .query_map(params![id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut messages = Vec::with_capacity(rows.len());
            for (msg_id, role, model, created, finished, content) in rows {
                let role =
                    Role::parse(&role).ok_or_else(|| anyhow!("unknown role '{}'", role))?;
                messages.push(Message {
                    attachments: attachments.remove(&msg_id).unwrap_or_default(),
                    id: msg_id,
                    role,
                    model,
                    created_at: parse_time(&created)?,
                    finished_at: finished.as_deref().map(parse_time).transpose()?,
                    content,
                });
            }
            sessions.push(StoredSession { id, name, messages });
        }
        Ok(sessions)
    }
}

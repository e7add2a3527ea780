// SQLite-backed session store with in-memory temporary sessions.
//
// Every mutating operation takes the single store lock and releases it on
// all exit paths (RAII guard). Message ordinal position is identity:
// history edits are tail truncations, never splices.

pub mod migration;
pub mod schema;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use base64::Engine;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::sys_warn;

/// Auto-truncated titles keep at most this many characters.
pub const TITLE_MAX_CHARS: usize = 30;
/// Attachment names are clipped to this many characters after trimming.
pub const ATTACHMENT_NAME_MAX_CHARS: usize = 200;

/// Helper for standardized database error messages.
pub fn db_error(context: &str) -> impl Fn(rusqlite::Error) -> String + '_ {
    move |e| format!("Failed to {context}: {e}")
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session not found")]
    NotFound,
    #[error("Message index out of range")]
    IndexOutOfRange,
    #[error("{0}")]
    Db(String),
}

impl From<String> for StoreError {
    fn from(msg: String) -> Self {
        StoreError::Db(msg)
    }
}

/// A file attached to one message. `content` is either plain text or a
/// `data:<mime>;base64,<payload>` URL for images.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    pub content: String,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "meta_is_empty")]
    pub meta: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

fn meta_is_empty(meta: &Value) -> bool {
    match meta {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub is_temporary: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug)]
struct TempSession {
    title: String,
    created_at: i64,
    updated_at: i64,
    messages: Vec<Message>,
}

struct StoreInner {
    conn: Connection,
    temp: HashMap<String, TempSession>,
    current: Option<String>,
}

pub struct SessionStore {
    inner: Mutex<StoreInner>,
}

pub type SharedSessionStore = Arc<SessionStore>;

pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl SessionStore {
    /// Open (or create) the store at `db_path`. A legacy `sessions.json`
    /// beside it is imported once into an empty database.
    pub fn open(db_path: &Path, legacy_path: Option<&Path>) -> Result<Self, String> {
        let conn = Connection::open(db_path).map_err(db_error("open database"))?;
        Self::init(conn, legacy_path)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory().map_err(db_error("open database"))?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, legacy_path: Option<&Path>) -> Result<Self, String> {
        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(db_error("enable foreign keys"))?;
        // WAL keeps readers off the writer's back; in-memory DBs decline it
        let _ = conn.query_row("PRAGMA journal_mode = WAL", [], |row| {
            row.get::<_, String>(0)
        });

        schema::initialize(&conn)?;

        if let Some(legacy) = legacy_path {
            migration::import_legacy_sessions(&conn, legacy)?;
        }

        let current = load_current(&conn);

        Ok(SessionStore {
            inner: Mutex::new(StoreInner {
                conn,
                temp: HashMap::new(),
                current,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().expect("Session store lock poisoned")
    }

    /// Create a session and make it current. Temporary sessions never
    /// touch disk and disappear with the process.
    pub fn create_session(&self, title: &str, is_temporary: bool) -> Result<String, StoreError> {
        let mut inner = self.lock();
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_millis();

        if is_temporary {
            inner.temp.insert(
                id.clone(),
                TempSession {
                    title: title.to_string(),
                    created_at: now,
                    updated_at: now,
                    messages: Vec::new(),
                },
            );
        } else {
            inner
                .conn
                .execute(
                    "INSERT INTO sessions (id, title, is_temporary, created_at, updated_at)
                     VALUES (?1, ?2, 0, ?3, ?3)",
                    params![id, title, now],
                )
                .map_err(db_error("create session"))?;
        }

        set_current_locked(&mut inner, Some(id.clone()), !is_temporary)?;
        Ok(id)
    }

    /// Delete a session and everything cascading from it. Returns the new
    /// current session id (unset when the deleted one was current).
    pub fn delete_session(&self, id: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.lock();

        if inner.temp.remove(id).is_none() {
            let removed = inner
                .conn
                .execute("DELETE FROM sessions WHERE id = ?1", [id])
                .map_err(db_error("delete session"))?;
            if removed == 0 {
                return Err(StoreError::NotFound);
            }
        }

        if inner.current.as_deref() == Some(id) {
            set_current_locked(&mut inner, None, true)?;
        }
        Ok(inner.current.clone())
    }

    pub fn session_exists(&self, id: &str) -> bool {
        let inner = self.lock();
        inner.temp.contains_key(id) || persistent_exists(&inner.conn, id)
    }

    /// Mark a session current; persisted only for persistent sessions so a
    /// temporary current never leaks into the database.
    pub fn set_current(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let is_temp = inner.temp.contains_key(id);
        if !is_temp && !persistent_exists(&inner.conn, id) {
            return Err(StoreError::NotFound);
        }
        set_current_locked(&mut inner, Some(id.to_string()), !is_temp)
    }

    pub fn current_session_id(&self) -> Option<String> {
        self.lock().current.clone()
    }

    /// All sessions, persistent first (updated_at desc), then temporary.
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let inner = self.lock();

        let mut stmt = inner
            .conn
            .prepare(
                "SELECT id, title, created_at, updated_at
                 FROM sessions ORDER BY updated_at DESC, id",
            )
            .map_err(db_error("prepare session list"))?;

        let mut sessions: Vec<SessionSummary> = stmt
            .query_map([], |row| {
                Ok(SessionSummary {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    is_temporary: false,
                    created_at: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            })
            .map_err(db_error("query sessions"))?
            .filter_map(|r| r.ok())
            .collect();

        let mut temp: Vec<SessionSummary> = inner
            .temp
            .iter()
            .map(|(id, s)| SessionSummary {
                id: id.clone(),
                title: s.title.clone(),
                is_temporary: true,
                created_at: s.created_at,
                updated_at: s.updated_at,
            })
            .collect();
        temp.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        sessions.extend(temp);

        Ok(sessions)
    }

    /// Ordered messages with attachments inlined per message.
    pub fn get_history(&self, id: &str) -> Result<Vec<Message>, StoreError> {
        let inner = self.lock();

        if let Some(session) = inner.temp.get(id) {
            return Ok(session.messages.clone());
        }
        if !persistent_exists(&inner.conn, id) {
            return Err(StoreError::NotFound);
        }

        let mut stmt = inner
            .conn
            .prepare(
                "SELECT id, role, content, meta FROM messages
                 WHERE session_id = ?1 ORDER BY id",
            )
            .map_err(db_error("prepare history"))?;

        let rows: Vec<(i64, String, String, Option<String>)> = stmt
            .query_map([id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .map_err(db_error("query history"))?
            .filter_map(|r| r.ok())
            .collect();

        let mut att_stmt = inner
            .conn
            .prepare(
                "SELECT name, kind, mime, content, truncated, size FROM attachments
                 WHERE message_id = ?1 ORDER BY id",
            )
            .map_err(db_error("prepare attachments"))?;

        let mut messages = Vec::with_capacity(rows.len());
        for (msg_id, role, content, meta) in rows {
            let attachments: Vec<Attachment> = att_stmt
                .query_map([msg_id], |row| {
                    Ok(Attachment {
                        name: row.get(0)?,
                        kind: row.get(1)?,
                        mime: row.get(2)?,
                        content: row.get(3)?,
                        truncated: row.get::<_, i64>(4)? != 0,
                        size: row.get(5)?,
                    })
                })
                .map_err(db_error("query attachments"))?
                .filter_map(|r| r.ok())
                .collect();

            messages.push(Message {
                role,
                content,
                meta: parse_meta(meta.as_deref()),
                attachments,
            });
        }

        Ok(messages)
    }

    /// Append a message (with normalized attachments) and bump updated_at.
    pub fn add_message(
        &self,
        id: &str,
        role: &str,
        content: &str,
        meta: Value,
        attachments: Vec<Attachment>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let now = now_millis();
        let attachments: Vec<Attachment> =
            attachments.into_iter().map(normalize_attachment).collect();

        if let Some(session) = inner.temp.get_mut(id) {
            session.messages.push(Message {
                role: role.to_string(),
                content: content.to_string(),
                meta,
                attachments,
            });
            session.updated_at = now;
            return Ok(());
        }

        if !persistent_exists(&inner.conn, id) {
            return Err(StoreError::NotFound);
        }

        let tx = inner
            .conn
            .transaction()
            .map_err(db_error("begin transaction"))?;

        tx.execute(
            "INSERT INTO messages (session_id, role, content, created_at, meta)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, role, content, now, encode_meta(&meta)],
        )
        .map_err(db_error("insert message"))?;
        let message_id = tx.last_insert_rowid();

        for att in &attachments {
            tx.execute(
                "INSERT INTO attachments
                 (message_id, session_id, name, kind, mime, content, truncated, size)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    message_id,
                    id,
                    att.name,
                    att.kind,
                    att.mime,
                    att.content,
                    att.truncated as i64,
                    att.size
                ],
            )
            .map_err(db_error("insert attachment"))?;
        }

        tx.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )
        .map_err(db_error("bump session timestamp"))?;

        tx.commit().map_err(db_error("commit message"))?;
        Ok(())
    }

    pub fn message_count(&self, id: &str) -> Result<usize, StoreError> {
        let inner = self.lock();
        if let Some(session) = inner.temp.get(id) {
            return Ok(session.messages.len());
        }
        if !persistent_exists(&inner.conn, id) {
            return Err(StoreError::NotFound);
        }
        let count: i64 = inner
            .conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
                [id],
                |row| row.get(0),
            )
            .map_err(db_error("count messages"))?;
        Ok(count as usize)
    }

    /// Update the content of the message at `index` and drop everything
    /// after it: the edited message becomes the new tail.
    pub fn edit_message(&self, id: &str, index: usize, content: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let now = now_millis();

        if let Some(session) = inner.temp.get_mut(id) {
            if index >= session.messages.len() {
                return Err(StoreError::IndexOutOfRange);
            }
            session.messages[index].content = content.to_string();
            session.messages.truncate(index + 1);
            session.updated_at = now;
            return Ok(());
        }

        if !persistent_exists(&inner.conn, id) {
            return Err(StoreError::NotFound);
        }

        let ids = message_ids(&inner.conn, id)?;
        let Some(&target) = ids.get(index) else {
            return Err(StoreError::IndexOutOfRange);
        };

        let tx = inner
            .conn
            .transaction()
            .map_err(db_error("begin transaction"))?;
        tx.execute(
            "UPDATE messages SET content = ?1 WHERE id = ?2",
            params![content, target],
        )
        .map_err(db_error("edit message"))?;
        tx.execute(
            "DELETE FROM messages WHERE session_id = ?1 AND id > ?2",
            params![id, target],
        )
        .map_err(db_error("truncate after edit"))?;
        tx.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )
        .map_err(db_error("bump session timestamp"))?;
        tx.commit().map_err(db_error("commit edit"))?;
        Ok(())
    }

    /// Remove all messages with ordinal >= `end`. Idempotent.
    pub fn truncate_history(&self, id: &str, end: usize) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let now = now_millis();

        if let Some(session) = inner.temp.get_mut(id) {
            if end < session.messages.len() {
                session.messages.truncate(end);
                session.updated_at = now;
            }
            return Ok(());
        }

        if !persistent_exists(&inner.conn, id) {
            return Err(StoreError::NotFound);
        }

        let ids = message_ids(&inner.conn, id)?;
        let Some(&first_removed) = ids.get(end) else {
            return Ok(()); // Already short enough
        };

        inner
            .conn
            .execute(
                "DELETE FROM messages WHERE session_id = ?1 AND id >= ?2",
                params![id, first_removed],
            )
            .map_err(db_error("truncate history"))?;
        inner
            .conn
            .execute(
                "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                params![now, id],
            )
            .map_err(db_error("bump session timestamp"))?;
        Ok(())
    }

    pub fn clear_session(&self, id: &str) -> Result<(), StoreError> {
        self.truncate_history(id, 0)
    }

    /// Auto-title from content: clipped to 30 chars with an ellipsis
    /// suffix only when clipping happened. Returns the stored title.
    pub fn update_title(&self, id: &str, raw: &str) -> Result<String, StoreError> {
        let title = auto_title(raw);
        self.store_title(id, &title)?;
        Ok(title)
    }

    /// Caller-provided rename, stored verbatim.
    pub fn rename_session(&self, id: &str, title: &str) -> Result<(), StoreError> {
        self.store_title(id, title)
    }

    fn store_title(&self, id: &str, title: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(session) = inner.temp.get_mut(id) {
            session.title = title.to_string();
            return Ok(());
        }
        let updated = inner
            .conn
            .execute(
                "UPDATE sessions SET title = ?1 WHERE id = ?2",
                params![title, id],
            )
            .map_err(db_error("update title"))?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Byte footprint: message content bytes plus attachment sizes.
    pub fn session_size(&self, id: &str) -> Result<i64, StoreError> {
        let inner = self.lock();

        if let Some(session) = inner.temp.get(id) {
            let total: i64 = session
                .messages
                .iter()
                .map(|m| {
                    m.content.len() as i64
                        + m.attachments.iter().map(|a| a.size).sum::<i64>()
                })
                .sum();
            return Ok(total);
        }

        if !persistent_exists(&inner.conn, id) {
            return Err(StoreError::NotFound);
        }

        let content_bytes: i64 = inner
            .conn
            .query_row(
                "SELECT COALESCE(SUM(LENGTH(CAST(content AS BLOB))), 0)
                 FROM messages WHERE session_id = ?1",
                [id],
                |row| row.get(0),
            )
            .map_err(db_error("sum message bytes"))?;
        let attachment_bytes: i64 = inner
            .conn
            .query_row(
                "SELECT COALESCE(SUM(size), 0) FROM attachments WHERE session_id = ?1",
                [id],
                |row| row.get(0),
            )
            .map_err(db_error("sum attachment bytes"))?;
        Ok(content_bytes + attachment_bytes)
    }
}

fn persistent_exists(conn: &Connection, id: &str) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM sessions WHERE id = ?1",
        [id],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n > 0)
    .unwrap_or(false)
}

fn message_ids(conn: &Connection, session_id: &str) -> Result<Vec<i64>, StoreError> {
    let mut stmt = conn
        .prepare("SELECT id FROM messages WHERE session_id = ?1 ORDER BY id")
        .map_err(db_error("prepare message ids"))?;
    let ids = stmt
        .query_map([session_id], |row| row.get(0))
        .map_err(db_error("query message ids"))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(ids)
}

fn load_current(conn: &Connection) -> Option<String> {
    let id: String = conn
        .query_row(
            "SELECT value FROM app_state WHERE key = 'current_session_id'",
            [],
            |row| row.get(0),
        )
        .ok()?;
    persistent_exists(conn, &id).then_some(id)
}

fn set_current_locked(
    inner: &mut StoreInner,
    id: Option<String>,
    persist: bool,
) -> Result<(), StoreError> {
    inner.current = id.clone();
    if !persist {
        return Ok(());
    }
    match id {
        Some(id) => inner
            .conn
            .execute(
                "INSERT INTO app_state (key, value) VALUES ('current_session_id', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [id],
            )
            .map(|_| ())
            .map_err(|e| StoreError::Db(db_error("persist current session")(e))),
        None => inner
            .conn
            .execute("DELETE FROM app_state WHERE key = 'current_session_id'", [])
            .map(|_| ())
            .map_err(|e| StoreError::Db(db_error("clear current session")(e))),
    }
}

fn parse_meta(raw: Option<&str>) -> Value {
    raw.and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_else(|| Value::Object(Default::default()))
}

fn encode_meta(meta: &Value) -> Option<String> {
    if meta_is_empty(meta) {
        None
    } else {
        serde_json::to_string(meta).ok()
    }
}

/// Clip a raw title to 30 chars, appending an ellipsis only when clipped.
pub fn auto_title(raw: &str) -> String {
    let mut chars = raw.chars();
    let clipped: String = chars.by_ref().take(TITLE_MAX_CHARS).collect();
    if chars.next().is_some() {
        format!("{clipped}...")
    } else {
        clipped
    }
}

/// Normalize an incoming attachment: trim and clip the name, infer the
/// kind from the mime type or data-URL prefix when unset, and compute the
/// decoded byte size. Unknown kinds are kept as-is with a warning.
pub fn normalize_attachment(mut att: Attachment) -> Attachment {
    att.name = att
        .name
        .trim()
        .chars()
        .take(ATTACHMENT_NAME_MAX_CHARS)
        .collect();

    if att.kind.is_empty() {
        att.kind = infer_kind(&att);
    } else if att.kind != "text" && att.kind != "image" {
        sys_warn!("Unknown attachment kind '{}' on '{}'", att.kind, att.name);
    }

    att.size = decoded_size(&att.content) as i64;
    att
}

fn infer_kind(att: &Attachment) -> String {
    if let Some(mime) = &att.mime {
        if mime.starts_with("image/") {
            return "image".to_string();
        }
    }
    if att.content.starts_with("data:image") {
        return "image".to_string();
    }
    "text".to_string()
}

/// Decoded byte count: base64 payload length for data-URLs, UTF-8 byte
/// length otherwise.
pub fn decoded_size(content: &str) -> usize {
    if content.starts_with("data:") {
        if let Some((_, payload)) = content.split_once(',') {
            return base64::engine::general_purpose::STANDARD
                .decode(payload.trim())
                .map(|bytes| bytes.len())
                .unwrap_or_else(|_| payload.len() * 3 / 4);
        }
    }
    content.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text_attachment(name: &str, content: &str) -> Attachment {
        Attachment {
            name: name.to_string(),
            kind: String::new(),
            mime: None,
            content: content.to_string(),
            truncated: false,
            size: 0,
        }
    }

    #[test]
    fn test_create_sets_current() {
        let store = SessionStore::open_in_memory().unwrap();
        let id = store.create_session("Chat A", false).unwrap();
        assert_eq!(store.current_session_id(), Some(id.clone()));
        assert!(store.session_exists(&id));
    }

    #[test]
    fn test_add_and_get_history_roundtrip() {
        let store = SessionStore::open_in_memory().unwrap();
        let id = store.create_session("A", false).unwrap();

        store
            .add_message(&id, "user", "hello", json!({}), vec![])
            .unwrap();
        store
            .add_message(
                &id,
                "assistant",
                "hi there",
                json!({"think_duration": 1.25}),
                vec![],
            )
            .unwrap();

        let history = store.get_history(&id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, "user");
        assert_eq!(history[0].content, "hello");
        assert_eq!(history[1].meta["think_duration"], 1.25);
    }

    #[test]
    fn test_attachment_roundtrip_preserves_order_and_content() {
        // Stored attachments come back byte-for-byte, in order
        let store = SessionStore::open_in_memory().unwrap();
        let id = store.create_session("A", false).unwrap();

        let atts = vec![
            text_attachment("  notes.txt  ", "line one\nline two"),
            text_attachment("data.csv", "a,b,c"),
        ];
        store
            .add_message(&id, "user", "see files", json!({}), atts)
            .unwrap();

        let history = store.get_history(&id).unwrap();
        let stored = &history[0].attachments;
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].name, "notes.txt"); // trimmed
        assert_eq!(stored[0].content, "line one\nline two");
        assert_eq!(stored[0].kind, "text"); // inferred
        assert_eq!(stored[0].size, 17);
        assert_eq!(stored[1].name, "data.csv");
    }

    #[test]
    fn test_attachment_size_decodes_data_url() {
        let payload = base64::engine::general_purpose::STANDARD.encode([0u8; 300]);
        let att = normalize_attachment(Attachment {
            name: "pic.png".to_string(),
            kind: String::new(),
            mime: None,
            content: format!("data:image/png;base64,{payload}"),
            truncated: false,
            size: 0,
        });
        assert_eq!(att.kind, "image");
        assert_eq!(att.size, 300);
    }

    #[test]
    fn test_unknown_kind_kept() {
        let att = normalize_attachment(Attachment {
            name: "clip.wav".to_string(),
            kind: "audio".to_string(),
            mime: Some("audio/wav".to_string()),
            content: "data:audio/wav;base64,AAAA".to_string(),
            truncated: false,
            size: 0,
        });
        assert_eq!(att.kind, "audio");
        assert_eq!(att.size, 3);
    }

    #[test]
    fn test_edit_truncates_tail() {
        // Editing index i leaves exactly history[..i] plus the edit
        let store = SessionStore::open_in_memory().unwrap();
        let id = store.create_session("A", false).unwrap();
        for (role, content) in [("user", "q1"), ("assistant", "a1"), ("user", "q2")] {
            store
                .add_message(&id, role, content, json!({}), vec![])
                .unwrap();
        }

        store.edit_message(&id, 0, "hello").unwrap();

        let history = store.get_history(&id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, "user");
        assert_eq!(history[0].content, "hello");
    }

    #[test]
    fn test_edit_out_of_range() {
        let store = SessionStore::open_in_memory().unwrap();
        let id = store.create_session("A", false).unwrap();
        assert!(matches!(
            store.edit_message(&id, 0, "x"),
            Err(StoreError::IndexOutOfRange)
        ));
    }

    #[test]
    fn test_truncate_idempotent() {
        // Truncating twice equals truncating once
        let store = SessionStore::open_in_memory().unwrap();
        let id = store.create_session("A", false).unwrap();
        for (role, content) in [
            ("user", "q1"),
            ("assistant", "a1"),
            ("user", "q2"),
            ("assistant", "a2"),
        ] {
            store
                .add_message(&id, role, content, json!({}), vec![])
                .unwrap();
        }

        store.truncate_history(&id, 3).unwrap();
        let first = store.get_history(&id).unwrap();
        store.truncate_history(&id, 3).unwrap();
        let second = store.get_history(&id).unwrap();

        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 3);
        assert_eq!(first[2].content, "q2");
    }

    #[test]
    fn test_truncate_deletes_attachments() {
        let store = SessionStore::open_in_memory().unwrap();
        let id = store.create_session("A", false).unwrap();
        store
            .add_message(&id, "user", "q1", json!({}), vec![])
            .unwrap();
        store
            .add_message(
                &id,
                "user",
                "q2",
                json!({}),
                vec![text_attachment("f.txt", "body")],
            )
            .unwrap();

        store.truncate_history(&id, 1).unwrap();
        assert_eq!(store.session_size(&id).unwrap(), 2); // just "q1"
    }

    #[test]
    fn test_clear_session() {
        let store = SessionStore::open_in_memory().unwrap();
        let id = store.create_session("A", false).unwrap();
        store
            .add_message(&id, "user", "q1", json!({}), vec![])
            .unwrap();
        store.clear_session(&id).unwrap();
        assert!(store.get_history(&id).unwrap().is_empty());
    }

    #[test]
    fn test_auto_title_truncation() {
        assert_eq!(auto_title("short"), "short");
        let long = "x".repeat(45);
        let titled = auto_title(&long);
        assert_eq!(titled, format!("{}...", "x".repeat(30)));
        // Idempotence for short input
        assert_eq!(auto_title("exactly thirty chars of title!"), "exactly thirty chars of title!");
    }

    #[test]
    fn test_rename_verbatim() {
        let store = SessionStore::open_in_memory().unwrap();
        let id = store.create_session("A", false).unwrap();
        let long = "y".repeat(60);
        store.rename_session(&id, &long).unwrap();
        let sessions = store.list_sessions().unwrap();
        assert_eq!(sessions[0].title, long);
    }

    #[test]
    fn test_list_orders_temp_after_persistent() {
        let store = SessionStore::open_in_memory().unwrap();
        let temp = store.create_session("Temp", true).unwrap();
        let persistent = store.create_session("Kept", false).unwrap();

        let sessions = store.list_sessions().unwrap();
        assert_eq!(sessions[0].id, persistent);
        assert_eq!(sessions[1].id, temp);
        assert!(sessions[1].is_temporary);
    }

    #[test]
    fn test_temp_session_never_hits_disk() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("sessions.db");

        let temp_id;
        let kept_id;
        {
            let store = SessionStore::open(&db_path, None).unwrap();
            temp_id = store.create_session("Scratch", true).unwrap();
            kept_id = store.create_session("Kept", false).unwrap();
            store
                .add_message(&temp_id, "user", "secret", json!({}), vec![])
                .unwrap();
        }

        let reopened = SessionStore::open(&db_path, None).unwrap();
        assert!(!reopened.session_exists(&temp_id));
        assert!(reopened.session_exists(&kept_id));
        assert_eq!(reopened.current_session_id(), Some(kept_id));
    }

    #[test]
    fn test_delete_unsets_current() {
        let store = SessionStore::open_in_memory().unwrap();
        let id = store.create_session("A", false).unwrap();
        let current = store.delete_session(&id).unwrap();
        assert_eq!(current, None);
        assert_eq!(store.current_session_id(), None);
        assert!(matches!(
            store.delete_session(&id),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_session_size_counts_bytes() {
        let store = SessionStore::open_in_memory().unwrap();
        let id = store.create_session("A", false).unwrap();
        store
            .add_message(
                &id,
                "user",
                "abcd",
                json!({}),
                vec![text_attachment("f.txt", "12345678")],
            )
            .unwrap();
        assert_eq!(store.session_size(&id).unwrap(), 4 + 8);
    }

    #[test]
    fn test_retry_truncates_assistant_tail() {
        // Retry of the assistant at index 3 drops it and everything after
        let store = SessionStore::open_in_memory().unwrap();
        let id = store.create_session("A", false).unwrap();
        for (role, content) in [
            ("user", "q1"),
            ("assistant", "a1"),
            ("user", "q2"),
            ("assistant", "a2"),
        ] {
            store
                .add_message(&id, role, content, json!({}), vec![])
                .unwrap();
        }

        store.truncate_history(&id, 3).unwrap();
        let history = store.get_history(&id).unwrap();
        let flat: Vec<(String, String)> = history
            .into_iter()
            .map(|m| (m.role, m.content))
            .collect();
        assert_eq!(
            flat,
            vec![
                ("user".to_string(), "q1".to_string()),
                ("assistant".to_string(), "a1".to_string()),
                ("user".to_string(), "q2".to_string()),
            ]
        );
    }
}

// Database schema for the session store

use rusqlite::Connection;

use super::db_error;

const CREATE_SESSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    is_temporary INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
"#;

const CREATE_MESSAGES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    meta TEXT,
    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
)
"#;

const CREATE_MESSAGES_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_messages_session
ON messages(session_id, id)
"#;

const CREATE_ATTACHMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS attachments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id INTEGER NOT NULL,
    session_id TEXT NOT NULL,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    mime TEXT,
    content TEXT NOT NULL,
    truncated INTEGER NOT NULL DEFAULT 0,
    size INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
)
"#;

const CREATE_ATTACHMENTS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_attachments_message
ON attachments(message_id, id)
"#;

const CREATE_APP_STATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS app_state (
    key TEXT PRIMARY KEY,
    value TEXT
)
"#;

/// Initialize the schema (create all tables and indexes).
pub fn initialize(conn: &Connection) -> Result<(), String> {
    let statements = [
        ("sessions", CREATE_SESSIONS_TABLE),
        ("messages", CREATE_MESSAGES_TABLE),
        ("messages_index", CREATE_MESSAGES_INDEX),
        ("attachments", CREATE_ATTACHMENTS_TABLE),
        ("attachments_index", CREATE_ATTACHMENTS_INDEX),
        ("app_state", CREATE_APP_STATE_TABLE),
    ];

    for (name, sql) in statements.iter() {
        conn.execute(sql, [])
            .map_err(db_error(&format!("create {name}")))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_schema() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();

        let result = initialize(&conn);
        assert!(result.is_ok(), "Schema initialization failed: {result:?}");

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"sessions".to_string()));
        assert!(tables.contains(&"messages".to_string()));
        assert!(tables.contains(&"attachments".to_string()));
        assert!(tables.contains(&"app_state".to_string()));
    }

    #[test]
    fn test_cascade_from_sessions_to_attachments() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        initialize(&conn).unwrap();

        conn.execute(
            "INSERT INTO sessions (id, title, is_temporary, created_at, updated_at)
             VALUES ('s1', 'T', 0, 1, 1)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO messages (session_id, role, content, created_at)
             VALUES ('s1', 'user', 'hi', 1)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO attachments (message_id, session_id, name, kind, content, size)
             VALUES (1, 's1', 'a.txt', 'text', 'x', 1)",
            [],
        )
        .unwrap();

        conn.execute("DELETE FROM sessions WHERE id = 's1'", []).unwrap();

        let messages: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
            .unwrap();
        let attachments: i64 = conn
            .query_row("SELECT COUNT(*) FROM attachments", [], |r| r.get(0))
            .unwrap();
        assert_eq!(messages, 0);
        assert_eq!(attachments, 0);
    }
}

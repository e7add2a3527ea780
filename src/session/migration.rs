// One-shot import of the legacy JSON session file into SQLite.
//
// Runs only against an empty sessions table; the imported file is renamed
// with a .bak suffix so the import cannot run twice on the same data.

use std::path::Path;

use rusqlite::{params, Connection};
use serde_json::Value;

use super::{db_error, now_millis};
use crate::{sys_info, sys_warn};

/// Import `sessions.json` if present and the store is empty. Returns the
/// number of imported sessions.
pub fn import_legacy_sessions(conn: &Connection, legacy_path: &Path) -> Result<u32, String> {
    if !legacy_path.exists() {
        return Ok(0);
    }

    let existing: i64 = conn
        .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))
        .map_err(db_error("count sessions"))?;
    if existing > 0 {
        return Ok(0);
    }

    let raw = std::fs::read_to_string(legacy_path)
        .map_err(|e| format!("Failed to read legacy sessions: {e}"))?;
    let data: Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            sys_warn!("Legacy sessions file unreadable, skipping import: {}", e);
            return Ok(0);
        }
    };

    let Some(sessions) = data.get("sessions").and_then(|v| v.as_object()) else {
        return Ok(0);
    };

    let mut imported = 0u32;
    for (sid, session) in sessions {
        if let Err(e) = import_single_session(conn, sid, session) {
            sys_warn!("Failed to import legacy session {}: {}", sid, e);
            continue;
        }
        imported += 1;
    }

    // Restore the remembered current session when it survived the import
    if let Some(current) = data.get("current_session_id").and_then(|v| v.as_str()) {
        if sessions.contains_key(current) {
            let _ = conn.execute(
                "INSERT INTO app_state (key, value) VALUES ('current_session_id', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [current],
            );
        }
    }

    let backup = backup_path(legacy_path);
    if let Err(e) = std::fs::rename(legacy_path, &backup) {
        sys_warn!("Could not rename legacy sessions file: {}", e);
    }

    sys_info!("Imported {} legacy sessions", imported);
    Ok(imported)
}

fn import_single_session(conn: &Connection, sid: &str, session: &Value) -> Result<(), String> {
    let title = session
        .get("title")
        .and_then(|v| v.as_str())
        .unwrap_or("New Chat");
    let now = now_millis();

    // Imported sessions are always persistent
    conn.execute(
        "INSERT INTO sessions (id, title, is_temporary, created_at, updated_at)
         VALUES (?1, ?2, 0, ?3, ?3)",
        params![sid, title, now],
    )
    .map_err(db_error("insert legacy session"))?;

    let Some(history) = session.get("history").and_then(|v| v.as_array()) else {
        return Ok(());
    };

    for entry in history {
        let role = entry.get("role").and_then(|v| v.as_str()).unwrap_or("user");
        let content = entry.get("content").and_then(|v| v.as_str()).unwrap_or("");

        // Everything besides the structural keys survives in meta
        let mut meta = serde_json::Map::new();
        if let Some(map) = entry.as_object() {
            for (key, value) in map {
                if key == "role" || key == "content" || key == "attachments" {
                    continue;
                }
                meta.insert(key.clone(), value.clone());
            }
        }
        let meta_text = if meta.is_empty() {
            None
        } else {
            serde_json::to_string(&Value::Object(meta)).ok()
        };

        conn.execute(
            "INSERT INTO messages (session_id, role, content, created_at, meta)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![sid, role, content, now, meta_text],
        )
        .map_err(db_error("insert legacy message"))?;
        let message_id = conn.last_insert_rowid();

        if let Some(attachments) = entry.get("attachments").and_then(|v| v.as_array()) {
            for raw in attachments {
                let Ok(att) = serde_json::from_value::<super::Attachment>(raw.clone()) else {
                    continue;
                };
                let att = super::normalize_attachment(att);
                conn.execute(
                    "INSERT INTO attachments
                     (message_id, session_id, name, kind, mime, content, truncated, size)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        message_id,
                        sid,
                        att.name,
                        att.kind,
                        att.mime,
                        att.content,
                        att.truncated as i64,
                        att.size
                    ],
                )
                .map_err(db_error("insert legacy attachment"))?;
            }
        }
    }

    Ok(())
}

fn backup_path(legacy_path: &Path) -> std::path::PathBuf {
    let mut name = legacy_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "sessions.json".to_string());
    name.push_str(".bak");
    legacy_path.with_file_name(name)
}

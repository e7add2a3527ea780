// Chat streaming route handlers: prompt assembly from session history,
// SSE token forwarding, and persistence of the streamed reply.

use std::convert::Infallible;
use std::time::Instant;

use hyper::body::Bytes;
use hyper::{Body, Request, Response, StatusCode};
use serde_json::{json, Value};

use crate::app_config::{default_config, MAX_FILE_BYTES};
use crate::events::{sse_frame, ChannelEvent};
use crate::models::{ChatRegenerateRequest, ChatStreamRequest};
use crate::request_parsing::parse_json_body;
use crate::response_helpers::{json_error, json_response, sse_response};
use crate::session::{normalize_attachment, Attachment, Message};
use crate::sys_info;

use super::{store_error, SharedAppState};

/// Drop empty attachments, normalize names/kinds, and truncate oversized
/// text payloads at the byte boundary.
pub fn sanitize_attachments(raw: Vec<Attachment>) -> Vec<Attachment> {
    raw.into_iter()
        .filter_map(|att| {
            if att.name.trim().is_empty() || att.content.is_empty() {
                return None;
            }
            let mut att = normalize_attachment(att);
            if att.kind == "text" && att.content.len() > MAX_FILE_BYTES {
                att.content = truncate_utf8(&att.content, MAX_FILE_BYTES);
                att.truncated = true;
                att.size = att.content.len() as i64;
            }
            Some(att)
        })
        .collect()
}

/// Cut at the byte cap, discarding a trailing partial UTF-8 sequence.
fn truncate_utf8(content: &str, max_bytes: usize) -> String {
    if content.len() <= max_bytes {
        return content.to_string();
    }
    let bytes = &content.as_bytes()[..max_bytes];
    match std::str::from_utf8(bytes) {
        Ok(valid) => valid.to_string(),
        Err(e) => String::from_utf8_lossy(&bytes[..e.valid_up_to()]).into_owned(),
    }
}

/// Render text attachments into the prompt as a bracketed block.
fn format_attachments(attachments: &[&Attachment]) -> String {
    let mut lines = vec!["[Attachments]".to_string()];
    for att in attachments {
        if att.content.is_empty() {
            continue;
        }
        lines.push(format!("[File: {}]", att.name));
        lines.push(att.content.clone());
        lines.push("[/File]".to_string());
    }
    lines.join("\n")
}

/// Fold text attachments into the message content; image attachments
/// ride along for the VLM path.
fn merge_message_attachments(message: &Message) -> Message {
    let (images, texts): (Vec<&Attachment>, Vec<&Attachment>) = message
        .attachments
        .iter()
        .partition(|att| att.kind.eq_ignore_ascii_case("image"));

    let mut content = message.content.clone();
    if !texts.is_empty() {
        let block = format_attachments(&texts);
        content = if content.is_empty() {
            block
        } else {
            format!("{content}\n\n{block}")
        };
    }

    Message {
        role: message.role.clone(),
        content,
        meta: json!({}),
        attachments: images.into_iter().cloned().collect(),
    }
}

/// Build the prompt messages: system prompt, then the history window
/// (`max_history_turns` turns; 0 keeps only the last message).
pub fn build_messages(history: &[Message], config: &Value) -> Vec<Message> {
    let system_prompt = config
        .get("system_prompt")
        .and_then(Value::as_str)
        .unwrap_or("");
    let max_turns = config
        .get("max_history_turns")
        .and_then(Value::as_i64)
        .unwrap_or(10);

    let window: &[Message] = if max_turns > 0 {
        let keep = (max_turns as usize) * 2;
        &history[history.len().saturating_sub(keep)..]
    } else if history.is_empty() {
        &[]
    } else {
        &history[history.len() - 1..]
    };

    let mut messages = Vec::with_capacity(window.len() + 1);
    if !system_prompt.is_empty() {
        messages.push(Message {
            role: "system".to_string(),
            content: system_prompt.to_string(),
            meta: json!({}),
            attachments: vec![],
        });
    }
    messages.extend(window.iter().map(merge_message_attachments));
    messages
}

fn merged_config(client: Option<&Value>) -> Value {
    let mut config = default_config();
    if let (Some(base), Some(Value::Object(overrides))) = (config.as_object_mut(), client) {
        for (key, value) in overrides {
            base.insert(key.clone(), value.clone());
        }
    }
    config
}

/// POST /api/chat/stream
pub async fn handle_chat_stream(
    req: Request<Body>,
    state: SharedAppState,
) -> Result<Response<Body>, Infallible> {
    let body: ChatStreamRequest = match parse_json_body(req.into_body()).await {
        Ok(r) => r,
        Err(e) => return Ok(e),
    };

    let history_before = match state.store.get_history(&body.session_id) {
        Ok(history) => history,
        Err(e) => return Ok(store_error(e)),
    };
    if history_before.is_empty() {
        let _ = state.store.update_title(&body.session_id, &body.text);
    }

    let attachments = sanitize_attachments(body.attachments.unwrap_or_default());
    if let Err(e) = state.store.add_message(
        &body.session_id,
        "user",
        &body.text,
        json!({}),
        attachments,
    ) {
        return Ok(store_error(e));
    }
    let _ = state.store.set_current(&body.session_id);

    let history = match state.store.get_history(&body.session_id) {
        Ok(history) => history,
        Err(e) => return Ok(store_error(e)),
    };

    let config = merged_config(body.config.as_ref());
    let messages = build_messages(&history, &config);
    Ok(stream_generation(state, body.session_id, messages, config))
}

/// POST /api/chat/regenerate: re-runs the model over the existing
/// history; the last message must be from the user.
pub async fn handle_chat_regenerate(
    req: Request<Body>,
    state: SharedAppState,
) -> Result<Response<Body>, Infallible> {
    let body: ChatRegenerateRequest = match parse_json_body(req.into_body()).await {
        Ok(r) => r,
        Err(e) => return Ok(e),
    };

    let history = match state.store.get_history(&body.session_id) {
        Ok(history) => history,
        Err(e) => return Ok(store_error(e)),
    };
    if history.is_empty() {
        return Ok(json_error(StatusCode::BAD_REQUEST, "No messages to regenerate"));
    }
    if history.last().map(|m| m.role.as_str()) != Some("user") {
        return Ok(json_error(
            StatusCode::BAD_REQUEST,
            "Last message must be a user message",
        ));
    }

    let config = merged_config(body.config.as_ref());
    let messages = build_messages(&history, &config);
    Ok(stream_generation(state, body.session_id, messages, config))
}

/// POST /api/chat/stop
pub async fn handle_chat_stop(state: SharedAppState) -> Result<Response<Body>, Infallible> {
    state.llm.stop_generation();
    Ok(json_response(StatusCode::OK, &json!({"ok": true})))
}

/// Start the generation and bridge its event channel onto an SSE body.
/// The assistant reply is persisted after the stream ends, whether the
/// client stayed connected or not.
fn stream_generation(
    state: SharedAppState,
    session_id: String,
    messages: Vec<Message>,
    config: Value,
) -> Response<Body> {
    let mut rx = match state.llm.generate(messages, config) {
        Ok(rx) => rx,
        Err(e) => {
            // Failure to even start streams as a single error frame
            let frame = sse_frame(&ChannelEvent::Error { message: e });
            return sse_response(Body::from(frame));
        }
    };

    let (mut sender, body) = Body::channel();

    tokio::spawn(async move {
        let mut assistant_text = String::new();
        let mut client_gone = false;
        let mut think = ThinkTracker::default();

        while let Some(event) = rx.recv().await {
            if let ChannelEvent::Token { token } = &event {
                assistant_text.push_str(token);
                think.observe(&assistant_text);
            }
            let terminal = event.is_terminal();

            if !client_gone {
                let frame = sse_frame(&event);
                if sender.send_data(Bytes::from(frame)).await.is_err() {
                    // Client dropped: cancel and keep draining so the
                    // producer is never blocked on a dead channel
                    client_gone = true;
                    state.llm.stop_generation();
                }
            }
            if terminal {
                break;
            }
        }

        if !assistant_text.is_empty() {
            let meta = match think.duration_secs() {
                Some(duration) => json!({"think_duration": duration}),
                None => json!({}),
            };
            if let Err(e) =
                state
                    .store
                    .add_message(&session_id, "assistant", &assistant_text, meta, vec![])
            {
                sys_info!("Failed to persist assistant reply: {}", e);
            }
        }
    });

    sse_response(body)
}

/// Wall-time between the <think> marker opening and closing in the
/// streamed text. UI metadata only; lives in the message meta bag.
#[derive(Default)]
struct ThinkTracker {
    opened: Option<Instant>,
    duration: Option<f64>,
}

impl ThinkTracker {
    fn observe(&mut self, accumulated: &str) {
        if self.opened.is_none() && accumulated.contains("<think>") {
            self.opened = Some(Instant::now());
        }
        if self.duration.is_none() {
            if let Some(started) = self.opened {
                if accumulated.contains("</think>") {
                    self.duration = Some(started.elapsed().as_secs_f64());
                }
            }
        }
    }

    fn duration_secs(&self) -> Option<f64> {
        self.duration.map(|d| (d * 100.0).round() / 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, content: &str) -> Message {
        Message {
            role: role.to_string(),
            content: content.to_string(),
            meta: json!({}),
            attachments: vec![],
        }
    }

    fn text_att(name: &str, content: &str) -> Attachment {
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
    fn test_sanitize_truncates_oversized_text() {
        // A 600 KiB attachment is cut to exactly the cap
        let big = "a".repeat(600 * 1024);
        let out = sanitize_attachments(vec![text_att("big.txt", &big)]);
        assert_eq!(out.len(), 1);
        assert!(out[0].truncated);
        assert_eq!(out[0].size, MAX_FILE_BYTES as i64);
        assert_eq!(out[0].content.len(), 524_288);
    }

    #[test]
    fn test_sanitize_skips_empty() {
        let out = sanitize_attachments(vec![
            text_att("", "body"),
            text_att("a.txt", ""),
            text_att("ok.txt", "body"),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "ok.txt");
    }

    #[test]
    fn test_truncate_utf8_never_splits_a_char() {
        // "é" is two bytes; an odd cap lands mid-character
        let content = "é".repeat(10);
        let cut = truncate_utf8(&content, 5);
        assert_eq!(cut, "éé");
        assert!(cut.len() <= 5);
    }

    #[test]
    fn test_build_messages_windows_history() {
        let history: Vec<Message> = (0..10)
            .map(|i| {
                let role = if i % 2 == 0 { "user" } else { "assistant" };
                msg(role, &format!("m{i}"))
            })
            .collect();

        let config = json!({"system_prompt": "be brief", "max_history_turns": 2});
        let messages = build_messages(&history, &config);

        assert_eq!(messages.len(), 5); // system + last 2 turns
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].content, "m6");
        assert_eq!(messages[4].content, "m9");
    }

    #[test]
    fn test_build_messages_zero_turns_keeps_last() {
        let history = vec![msg("user", "old"), msg("assistant", "a"), msg("user", "new")];
        let config = json!({"system_prompt": "", "max_history_turns": 0});
        let messages = build_messages(&history, &config);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "new");
    }

    #[test]
    fn test_merge_splits_text_and_image_attachments() {
        let mut message = msg("user", "see these");
        message.attachments = vec![
            Attachment {
                name: "notes.txt".to_string(),
                kind: "text".to_string(),
                mime: None,
                content: "line".to_string(),
                truncated: false,
                size: 4,
            },
            Attachment {
                name: "pic.png".to_string(),
                kind: "image".to_string(),
                mime: Some("image/png".to_string()),
                content: "data:image/png;base64,AAAA".to_string(),
                truncated: false,
                size: 3,
            },
        ];

        let merged = merge_message_attachments(&message);
        assert!(merged.content.contains("[File: notes.txt]"));
        assert!(merged.content.contains("line"));
        assert_eq!(merged.attachments.len(), 1);
        assert_eq!(merged.attachments[0].kind, "image");
    }

    #[test]
    fn test_merged_config_overlays_client_values() {
        let config = merged_config(Some(&json!({"temperature": 0.2, "custom": 1})));
        assert_eq!(config["temperature"], 0.2);
        assert_eq!(config["top_p"], 0.9);
        assert_eq!(config["custom"], 1);
    }
}

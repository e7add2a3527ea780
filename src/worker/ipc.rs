//! IPC protocol for host ↔ inference-worker communication.
//!
//! JSON Lines (one object per line) over the child's stdin/stdout pipes.
//! The command stream and the event stream are the only contract between
//! the two processes; nothing else is shared.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::{Attachment, Message};

/// Request sent from the host to the worker via stdin.
#[derive(Serialize, Deserialize, Debug)]
pub struct WorkerRequest {
    /// Monotonic request ID for correlating events. 0 = fire-and-forget.
    pub id: u64,
    pub command: WorkerCommand,
}

/// Commands the host can send to the worker.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Load (or reuse) a model pipeline.
    Load(LoadSpec),
    /// Start one generation. At most one runs at a time.
    Generate {
        messages: Vec<Message>,
        config: Value,
    },
    /// Cooperative cancellation: sets the stop flag observed by the
    /// token streamer.
    Stop,
    /// Graceful shutdown.
    Shutdown,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoadSpec {
    pub source: String,
    pub model_id: String,
    pub path: String,
    pub device: String,
    pub max_prompt_len: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_max_sequence_length: Option<u32>,
    /// Forces a full pipeline rebuild even when nothing else changed.
    #[serde(default)]
    pub cache_bust: bool,
}

/// Event sent from the worker to the host via stdout.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerEventMsg {
    /// Matches the request ID that produced the event.
    pub id: u64,
    pub event: WorkerEvent,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Informational load progress; zero or more per load.
    LoadStage { stage: String, message: String },
    /// Exactly once per successful load.
    Loaded {
        model_id: String,
        device: String,
        kind: String,
    },
    /// Terminal for the current load or generate.
    Error { msg: String },
    /// One decoded sub-token.
    Token { token: String },
    /// Images produced by an image pipeline.
    Image { attachments: Vec<Attachment> },
    /// Exactly once per generate, after the last token/image/error.
    Finished { stats: GenerationStats },
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct GenerationStats {
    pub tokens: u64,
    pub time: f64,
    pub speed: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<u64>,
}

impl WorkerEventMsg {
    pub fn new(id: u64, event: WorkerEvent) -> Self {
        Self { id, event }
    }

    pub fn error(id: u64, msg: impl Into<String>) -> Self {
        Self {
            id,
            event: WorkerEvent::Error { msg: msg.into() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_roundtrip() {
        let request = WorkerRequest {
            id: 7,
            command: WorkerCommand::Load(LoadSpec {
                source: "local".to_string(),
                model_id: "OpenVINO/Qwen3-8B-int4-cw-ov".to_string(),
                path: "/models/qwen3".to_string(),
                device: "NPU".to_string(),
                max_prompt_len: 16384,
                image_max_sequence_length: None,
                cache_bust: false,
            }),
        };

        let line = serde_json::to_string(&request).unwrap();
        let parsed: WorkerRequest = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.id, 7);
        match parsed.command {
            WorkerCommand::Load(spec) => {
                assert_eq!(spec.device, "NPU");
                assert_eq!(spec.max_prompt_len, 16384);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_stop_is_bare_tag() {
        let line =
            serde_json::to_string(&WorkerRequest { id: 0, command: WorkerCommand::Stop })
                .unwrap();
        assert_eq!(line, r#"{"id":0,"command":{"type":"stop"}}"#);
    }

    #[test]
    fn test_event_roundtrip() {
        let event = WorkerEventMsg::new(
            3,
            WorkerEvent::Finished {
                stats: GenerationStats {
                    tokens: 42,
                    time: 1.5,
                    speed: 28.0,
                    images: None,
                },
            },
        );
        let line = serde_json::to_string(&event).unwrap();
        assert!(line.contains(r#""type":"finished""#));
        assert!(!line.contains("images"));

        let parsed: WorkerEventMsg = serde_json::from_str(&line).unwrap();
        match parsed.event {
            WorkerEvent::Finished { stats } => assert_eq!(stats.tokens, 42),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_generate_carries_message_meta() {
        let request = WorkerRequest {
            id: 1,
            command: WorkerCommand::Generate {
                messages: vec![Message {
                    role: "user".to_string(),
                    content: "hi".to_string(),
                    meta: json!({}),
                    attachments: vec![],
                }],
                config: json!({"temperature": 0.6}),
            },
        };
        let line = serde_json::to_string(&request).unwrap();
        let parsed: WorkerRequest = serde_json::from_str(&line).unwrap();
        match parsed.command {
            WorkerCommand::Generate { messages, config } => {
                assert_eq!(messages.len(), 1);
                assert_eq!(config["temperature"], 0.6);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}

// Request/response structures for the control-plane API. All bodies are
// snake_case JSON.

use serde::Deserialize;
use serde_json::Value;

use crate::session::Attachment;

fn default_source() -> String {
    "local".to_string()
}

fn default_device() -> String {
    "AUTO".to_string()
}

fn default_max_prompt_len() -> u32 {
    16384
}

#[derive(Deserialize, Debug, Default)]
pub struct SessionCreateRequest {
    pub title: Option<String>,
    #[serde(default)]
    pub is_temporary: bool,
}

#[derive(Deserialize, Debug)]
pub struct SessionRenameRequest {
    pub title: String,
}

#[derive(Deserialize, Debug)]
pub struct ModelLoadRequest {
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub model_id: String,
    pub path: String,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_max_prompt_len")]
    pub max_prompt_len: u32,
    #[serde(default)]
    pub image_max_sequence_length: Option<u32>,
}

#[derive(Deserialize, Debug)]
pub struct ModelDeleteRequest {
    pub path: String,
}

#[derive(Deserialize, Debug)]
pub struct ChatStreamRequest {
    pub session_id: String,
    pub text: String,
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default)]
    pub attachments: Option<Vec<Attachment>>,
}

#[derive(Deserialize, Debug)]
pub struct ChatRegenerateRequest {
    pub session_id: String,
    #[serde(default)]
    pub config: Option<Value>,
}

#[derive(Deserialize, Debug)]
pub struct MessageEditRequest {
    pub index: usize,
    pub content: String,
}

#[derive(Deserialize, Debug)]
pub struct MessageRetryRequest {
    pub index: usize,
}

#[derive(Deserialize, Debug)]
pub struct DownloadRequest {
    pub repo_id: String,
}

#[derive(Deserialize, Debug)]
pub struct LangPreferenceRequest {
    pub lang: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_load_defaults() {
        let req: ModelLoadRequest =
            serde_json::from_str(r#"{"path": "/models/qwen3"}"#).unwrap();
        assert_eq!(req.source, "local");
        assert_eq!(req.device, "AUTO");
        assert_eq!(req.max_prompt_len, 16384);
        assert!(req.model_id.is_empty());
    }

    #[test]
    fn test_chat_request_with_attachments() {
        let req: ChatStreamRequest = serde_json::from_str(
            r#"{
                "session_id": "s1",
                "text": "summarize",
                "attachments": [{"name": "notes.txt", "content": "body"}]
            }"#,
        )
        .unwrap();
        let attachments = req.attachments.unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].name, "notes.txt");
        assert!(!attachments[0].truncated);
    }
}

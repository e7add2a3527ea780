// Chat-template rendering for text pipelines.
//
// Model directories ship a Jinja2 chat template inside
// tokenizer_config.json. Rendering goes through minijinja after a small
// compatibility pass; any failure falls back to the ChatML-style format
// so generation never dies on an exotic template.

use std::path::Path;

use minijinja::{context, Environment, Error, ErrorKind};
use serde_json::Value;

use crate::session::Message;

/// Tokenizer-side template metadata pulled from tokenizer_config.json.
#[derive(Debug, Clone, Default)]
pub struct TemplateInfo {
    pub chat_template: Option<String>,
    pub bos_token: String,
    pub eos_token: String,
}

/// Read template + special tokens from a model directory.
pub fn load_template_info(model_dir: &Path) -> TemplateInfo {
    let mut info = TemplateInfo::default();
    let Ok(raw) = std::fs::read_to_string(model_dir.join("tokenizer_config.json")) else {
        return info;
    };
    let Ok(config) = serde_json::from_str::<Value>(&raw) else {
        return info;
    };

    info.chat_template = config
        .get("chat_template")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    info.bos_token = special_token(&config, "bos_token");
    info.eos_token = special_token(&config, "eos_token");
    info
}

/// Special tokens appear either as plain strings or as AddedToken objects.
fn special_token(config: &Value, key: &str) -> String {
    match config.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(obj)) => obj
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

/// Python-isms that minijinja does not understand.
fn preprocess_template(template: &str) -> String {
    template
        .replace("tojson(ensure_ascii=False)", "tojson")
        .replace("tojson(ensure_ascii=True)", "tojson")
        .replace(".strip()", " | trim")
        .replace(".items()", " | items")
}

/// Render the conversation through the model's own chat template.
pub fn apply_chat_template(
    info: &TemplateInfo,
    messages: &[Message],
    add_generation_prompt: bool,
    enable_thinking: bool,
) -> Result<String, String> {
    let Some(template_string) = &info.chat_template else {
        return Err("Model has no chat template".to_string());
    };

    let processed = preprocess_template(template_string);

    let mut env = Environment::new();
    // raise_exception(msg) shows up in validation-heavy templates
    env.add_function("raise_exception", |msg: String| -> Result<String, Error> {
        Err(Error::new(ErrorKind::InvalidOperation, msg))
    });
    env.add_template("chat_template", &processed)
        .map_err(|e| format!("Failed to parse chat template: {e}"))?;

    let simplified: Vec<Value> = messages
        .iter()
        .map(|m| serde_json::json!({"role": m.role, "content": m.content}))
        .collect();

    let template = env
        .get_template("chat_template")
        .map_err(|e| format!("Failed to get template: {e}"))?;
    template
        .render(context! {
            messages => simplified,
            add_generation_prompt => add_generation_prompt,
            bos_token => info.bos_token,
            eos_token => info.eos_token,
            enable_thinking => enable_thinking,
        })
        .map_err(|e| format!("Failed to render template: {e}"))
}

/// ChatML-style fallback used whenever the native template fails.
pub fn fallback_prompt(messages: &[Message], add_generation_prompt: bool) -> String {
    let mut prompt = String::new();
    for message in messages {
        prompt.push_str(&format!(
            "<|im_start|>{}\n{}<|im_end|>\n",
            message.role, message.content
        ));
    }
    if add_generation_prompt {
        prompt.push_str("<|im_start|>assistant\n");
    }
    prompt
}

/// Render with the model template, falling back to ChatML on any error.
pub fn render_prompt(
    info: &TemplateInfo,
    messages: &[Message],
    add_generation_prompt: bool,
    enable_thinking: bool,
) -> String {
    match apply_chat_template(info, messages, add_generation_prompt, enable_thinking) {
        Ok(prompt) => prompt,
        Err(e) => {
            crate::runtime_warn!("Chat template failed, using fallback: {}", e);
            fallback_prompt(messages, add_generation_prompt)
        }
    }
}

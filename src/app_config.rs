// Static application configuration: generation defaults, the settings
// panel schema, preset model lists, and file-size caps.

use std::collections::BTreeSet;

use serde_json::{json, Value};

/// Text attachments larger than this are truncated at the byte boundary.
pub const MAX_FILE_BYTES: usize = 512 * 1024;

/// PNG payloads produced by the image pipeline above this size are dropped.
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

/// Generation keys consumed by the host itself and never passed through
/// to the pipeline.
pub const APP_ONLY_KEYS: &[&str] = &[
    "system_prompt",
    "max_history_turns",
    "skip_special_tokens",
    "add_generation_prompt",
    "enable_thinking",
];

/// Default generation parameters, merged under whatever the client sends.
pub fn default_config() -> Value {
    json!({
        "max_new_tokens": 1024,
        "temperature": 0.7,
        "top_p": 0.9,
        "top_k": 40,
        "repetition_penalty": 1.1,
        "do_sample": true,
        "system_prompt": "You are a helpful AI assistant.",
        "max_history_turns": 10,
        "add_generation_prompt": true,
        "enable_thinking": true,
        "skip_special_tokens": true
    })
}

/// Settings-panel schema consumed by the frontend. Grouped options with
/// widget hints; option keys double as the universe of known generation
/// keys for the settings resolver.
pub fn config_groups() -> Value {
    json!([
        {
            "title_key": "grp_generation",
            "options": {
                "max_new_tokens": {
                    "type": "int", "min": 128, "max": 8192, "step": 128, "default": 1024,
                    "label_key": "conf_max_tokens", "widget": "slider"
                },
                "temperature": {
                    "type": "float", "min": 0.0, "max": 2.0, "step": 0.1, "default": 0.7,
                    "label_key": "conf_temp", "widget": "slider"
                },
                "top_p": {
                    "type": "float", "min": 0.0, "max": 1.0, "step": 0.05, "default": 0.9,
                    "label_key": "conf_top_p", "widget": "slider"
                },
                "top_k": {
                    "type": "int", "min": 1, "max": 100, "step": 1, "default": 40,
                    "label_key": "conf_top_k", "widget": "spin"
                },
                "repetition_penalty": {
                    "type": "float", "min": 1.0, "max": 2.0, "step": 0.1, "default": 1.1,
                    "label_key": "conf_rep_penalty", "widget": "spin"
                },
                "do_sample": {
                    "type": "bool", "default": true,
                    "label_key": "conf_do_sample", "widget": "checkbox"
                }
            }
        },
        {
            "title_key": "grp_context",
            "options": {
                "max_history_turns": {
                    "type": "int", "min": 0, "max": 50, "step": 1, "default": 10,
                    "label_key": "conf_history_turns", "widget": "slider"
                },
                "system_prompt": {
                    "type": "str", "default": "You are a helpful AI assistant.",
                    "label_key": "conf_sys_prompt", "widget": "textarea"
                }
            }
        },
        {
            "title_key": "grp_advanced",
            "options": {
                "enable_thinking": {
                    "type": "bool", "default": true,
                    "label_key": "conf_enable_thinking", "widget": "checkbox"
                },
                "add_generation_prompt": {
                    "type": "bool", "default": true,
                    "label_key": "conf_add_gen_prompt", "widget": "checkbox"
                },
                "skip_special_tokens": {
                    "type": "bool", "default": true,
                    "label_key": "conf_skip_special", "widget": "checkbox"
                }
            }
        }
    ])
}

/// Every generation key the settings panel knows about.
pub fn all_setting_keys() -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    if let Value::Array(groups) = config_groups() {
        for group in groups {
            if let Some(Value::Object(options)) = group.get("options") {
                for key in options.keys() {
                    keys.insert(key.clone());
                }
            }
        }
    }
    keys
}

/// Curated OpenVINO model repos offered in the load panel.
pub const PRESET_MODELS: &[&str] = &[
    "OpenVINO/Qwen3-8B-int4-cw-ov",
    "OpenVINO/DeepSeek-R1-Distill-Qwen-1.5B-int4-cw-ov",
    "OpenVINO/DeepSeek-R1-Distill-Qwen-7B-int4-cw-ov",
    "OpenVINO/Phi-3.5-mini-instruct-int4-cw-ov",
    "OpenVINO/Mistral-7B-Instruct-v0.2-int4-cw-ov",
    "OpenVINO/Phi-3-mini-4k-instruct-int4-cw-ov",
    "OpenVINO/Mistral-7B-Instruct-v0.3-int4-cw-ov",
    "OpenVINO/gpt-j-6b-int4-cw-ov",
    "OpenVINO/falcon-7b-instruct-int4-cw-ov",
];

/// NPU-optimized collection surfaced in the download panel.
pub const NPU_COLLECTION_MODELS: &[&str] = &[
    "OpenVINO/Qwen3-8B-int4-cw-ov",
    "OpenVINO/Phi-3.5-mini-instruct-int4-cw-ov",
    "OpenVINO/Mistral-7B-Instruct-v0.3-int4-cw-ov",
    "OpenVINO/DeepSeek-R1-Distill-Qwen-7B-int4-cw-ov",
];

pub const NPU_COLLECTION_URL: &str =
    "https://huggingface.co/collections/OpenVINO/npu-optimized-llms";

/// Per-repo configuration presets applied by the frontend on model select.
pub fn model_specific_configs() -> Value {
    json!({
        "OpenVINO/Qwen3-8B-int4-cw-ov": {
            "grp_generation": {
                "max_new_tokens": 2048,
                "temperature": 0.7,
                "top_p": 0.8,
                "repetition_penalty": 1.05
            },
            "grp_context": {
                "system_prompt": "You are Qwen, created by Alibaba Cloud. You are a helpful assistant."
            },
            "grp_advanced": {
                "add_generation_prompt": true,
                "enable_thinking": false
            }
        },
        "OpenVINO/DeepSeek-R1-Distill-Qwen-1.5B-int4-cw-ov": {
            "grp_generation": {
                "max_new_tokens": 2048,
                "temperature": 0.6,
                "top_p": 0.95
            },
            "grp_context": {
                "system_prompt": "You are a helpful assistant. You should think before you answer."
            },
            "grp_advanced": {
                "add_generation_prompt": true,
                "enable_thinking": true
            }
        },
        "OpenVINO/DeepSeek-R1-Distill-Qwen-7B-int4-cw-ov": {
            "grp_generation": {
                "max_new_tokens": 2048,
                "temperature": 0.6,
                "top_p": 0.95
            },
            "grp_context": {
                "system_prompt": "You are a helpful assistant. You should think before you answer."
            },
            "grp_advanced": {
                "add_generation_prompt": true,
                "enable_thinking": true
            }
        }
    })
}

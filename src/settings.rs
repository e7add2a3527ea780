// Settings resolver: maps (model name, model path) to the subset of
// generation parameters the runtime will pass through to the pipeline.
//
// Image models bypass the schema entirely; their parameter surface is
// introspected from the image pipeline's generation config.

use std::collections::BTreeSet;
use std::path::Path;

use serde_json::{json, Map, Value};

use crate::scanner::{detect_model_kind, ModelKind};
use crate::worker::pipeline::image::image_parameter_surface;

/// Merge `config.json` and `generation_config.json` from a model dir into
/// the flat config object served to the settings panel.
pub fn load_model_json_configs(model_path: &Path) -> Value {
    let mut merged = Map::new();

    if let Some(data) = read_json(&model_path.join("config.json")) {
        let max_len = data
            .get("max_position_embeddings")
            .or_else(|| data.get("seq_length"))
            .cloned()
            .unwrap_or(json!(8192));
        merged.insert("model_max_length".to_string(), max_len);
        merged.insert(
            "vocab_size".to_string(),
            data.get("vocab_size").cloned().unwrap_or(json!(0)),
        );
    }

    if let Some(data) = read_json(&model_path.join("generation_config.json")) {
        for key in [
            "temperature",
            "top_p",
            "top_k",
            "repetition_penalty",
            "max_new_tokens",
            "do_sample",
            "no_repeat_ngram_size",
        ] {
            if let Some(v) = data.get(key) {
                merged.insert(key.to_string(), v.clone());
            }
        }
        if let Some(v) = data.get("eos_token_id") {
            merged.insert("eos_token_id".to_string(), v.clone());
        }
    }

    Value::Object(merged)
}

/// Keys present in the model's `generation_config.json`, for `mode=auto`.
fn scan_generation_config_keys(model_path: Option<&Path>) -> BTreeSet<String> {
    let Some(path) = model_path else {
        return BTreeSet::new();
    };
    match read_json(&path.join("generation_config.json")) {
        Some(Value::Object(map)) => map.keys().cloned().collect(),
        _ => BTreeSet::new(),
    }
}

fn read_json(path: &Path) -> Option<Value> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn load_schema(schema_path: &Path) -> Value {
    read_json(schema_path).unwrap_or_else(|| json!({}))
}

fn str_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// A rule matches when the model name, the path basename, or any alias
/// equals the rule key or contains it (and vice versa), case-insensitively.
fn match_model_rule(
    rule_id: &str,
    rule: &Value,
    model_name: Option<&str>,
    model_path: Option<&Path>,
) -> bool {
    if rule_id.is_empty() {
        return false;
    }

    let mut candidates: Vec<String> = Vec::new();
    if let Some(name) = model_name {
        candidates.push(name.to_string());
    }
    if let Some(path) = model_path {
        if let Some(base) = path.file_name().and_then(|n| n.to_str()) {
            candidates.push(base.to_string());
        }
    }
    candidates.extend(str_list(rule.get("aliases")));

    let rule_norm = rule_id.to_lowercase();
    let rule_base = Path::new(rule_id)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(rule_id)
        .to_lowercase();

    for cand in candidates {
        if cand.is_empty() {
            continue;
        }
        let cand_norm = cand.to_lowercase();
        if cand_norm == rule_norm || cand_norm == rule_base {
            return true;
        }
        if cand_norm.contains(&rule_norm) || rule_norm.contains(&cand_norm) {
            return true;
        }
    }
    false
}

/// Resolve the set of generation keys the runtime accepts for a model.
///
/// `all_known_keys` is the full key universe of the settings panel; the
/// result is always a subset of it (fail-open to the whole universe when
/// resolution produces nothing).
pub fn resolve_supported_keys(
    schema_path: &Path,
    model_name: Option<&str>,
    model_path: Option<&Path>,
    all_known_keys: &BTreeSet<String>,
) -> BTreeSet<String> {
    if let Some(path) = model_path {
        if detect_model_kind(path) == ModelKind::Image {
            // Introspected surface; the schema file cannot add image keys
            return image_parameter_surface()
                .intersection(all_known_keys)
                .cloned()
                .collect();
        }
    }

    let schema = load_schema(schema_path);
    let empty = json!({});
    let defaults = schema.get("defaults").unwrap_or(&empty);
    let rules = schema.get("models").and_then(|v| v.as_object());

    let matched: Option<&Value> = rules.and_then(|map| {
        map.iter()
            .find(|(rule_id, rule)| match_model_rule(rule_id, rule, model_name, model_path))
            .map(|(_, rule)| rule)
    });

    let mode = matched
        .and_then(|r| r.get("mode"))
        .or_else(|| defaults.get("mode"))
        .and_then(|v| v.as_str())
        .unwrap_or("all");

    let mut supported: BTreeSet<String> = match mode {
        "auto" => {
            let scanned = scan_generation_config_keys(model_path);
            if scanned.is_empty() {
                all_known_keys.clone()
            } else {
                scanned
            }
        }
        "list" => {
            let from_rule = matched.and_then(|r| r.get("supported_keys"));
            let keys = if from_rule.is_some() {
                str_list(from_rule)
            } else {
                str_list(defaults.get("supported_keys"))
            };
            keys.into_iter().collect()
        }
        "none" => BTreeSet::new(),
        _ => all_known_keys.clone(),
    };

    // app_keys are always exposed regardless of pipeline support
    let app_keys = match matched.and_then(|r| r.get("app_keys")) {
        Some(v) => str_list(Some(v)),
        None => str_list(defaults.get("app_keys")),
    };
    supported.extend(app_keys);

    if let Some(rule) = matched {
        supported.extend(str_list(rule.get("include")));
        for key in str_list(rule.get("exclude")) {
            supported.remove(&key);
        }
    }

    if !all_known_keys.is_empty() {
        supported = supported.intersection(all_known_keys).cloned().collect();
    }

    if supported.is_empty() && !all_known_keys.is_empty() {
        return all_known_keys.clone();
    }

    supported
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn keys(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn write_schema(dir: &Path, schema: &Value) -> PathBuf {
        let path = dir.join("model_settings.json");
        fs::write(&path, serde_json::to_string_pretty(schema).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_missing_schema_falls_back_to_all() {
        let dir = tempfile::tempdir().unwrap();
        let all = keys(&["temperature", "top_p"]);
        let supported = resolve_supported_keys(
            &dir.path().join("model_settings.json"),
            Some("qwen3-8b"),
            None,
            &all,
        );
        assert_eq!(supported, all);
    }

    #[test]
    fn test_mode_list_limits_keys() {
        let dir = tempfile::tempdir().unwrap();
        let schema = json!({
            "defaults": {"mode": "all"},
            "models": {
                "qwen3": {"mode": "list", "supported_keys": ["temperature", "top_k"]}
            }
        });
        let path = write_schema(dir.path(), &schema);

        let all = keys(&["temperature", "top_p", "top_k", "max_new_tokens"]);
        let supported = resolve_supported_keys(&path, Some("Qwen3-8B-int4-cw-ov"), None, &all);
        assert_eq!(supported, keys(&["temperature", "top_k"]));
    }

    #[test]
    fn test_mode_none_fails_open_without_app_keys() {
        let dir = tempfile::tempdir().unwrap();
        let schema = json!({"models": {"phi": {"mode": "none"}}});
        let path = write_schema(dir.path(), &schema);

        let all = keys(&["temperature", "top_p"]);
        let supported = resolve_supported_keys(&path, Some("phi-3-mini"), None, &all);
        // Empty resolution fails open to the full universe
        assert_eq!(supported, all);
    }

    #[test]
    fn test_mode_none_keeps_app_keys() {
        let dir = tempfile::tempdir().unwrap();
        let schema = json!({
            "defaults": {"app_keys": ["system_prompt"]},
            "models": {"phi": {"mode": "none"}}
        });
        let path = write_schema(dir.path(), &schema);

        let all = keys(&["temperature", "system_prompt"]);
        let supported = resolve_supported_keys(&path, Some("phi-3-mini"), None, &all);
        assert_eq!(supported, keys(&["system_prompt"]));
    }

    #[test]
    fn test_mode_auto_reads_generation_config() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("deepseek-r1-distill");
        fs::create_dir_all(&model_dir).unwrap();
        fs::write(
            model_dir.join("generation_config.json"),
            r#"{"temperature": 0.6, "top_p": 0.95, "eos_token_id": 2}"#,
        )
        .unwrap();

        let schema = json!({"models": {"deepseek": {"mode": "auto"}}});
        let path = write_schema(dir.path(), &schema);

        let all = keys(&["temperature", "top_p", "top_k", "eos_token_id"]);
        let supported =
            resolve_supported_keys(&path, Some("deepseek-r1-distill"), Some(&model_dir), &all);
        assert_eq!(supported, keys(&["temperature", "top_p", "eos_token_id"]));
    }

    #[test]
    fn test_include_exclude_applied() {
        let dir = tempfile::tempdir().unwrap();
        let schema = json!({
            "models": {
                "mistral": {
                    "mode": "list",
                    "supported_keys": ["temperature", "top_p"],
                    "include": ["top_k"],
                    "exclude": ["top_p"]
                }
            }
        });
        let path = write_schema(dir.path(), &schema);

        let all = keys(&["temperature", "top_p", "top_k"]);
        let supported = resolve_supported_keys(&path, Some("mistral-7b"), None, &all);
        assert_eq!(supported, keys(&["temperature", "top_k"]));
    }

    #[test]
    fn test_alias_and_substring_matching() {
        let rule = json!({"aliases": ["my-fav-model"]});
        assert!(match_model_rule("qwen3", &rule, Some("Qwen3-8B-ov"), None));
        assert!(match_model_rule("qwen3", &rule, Some("my-fav-model"), None));
        assert!(!match_model_rule("qwen3", &rule, Some("phi-3"), None));
        assert!(match_model_rule(
            "OpenVINO/Qwen3-8B-int4-cw-ov",
            &json!({}),
            Some("Qwen3-8B-int4-cw-ov"),
            None
        ));
    }

    #[test]
    fn test_image_model_uses_introspected_surface() {
        // Image models ignore the schema file entirely; the surface is
        // introspected and intersected with the known keys
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("flux-ov");
        fs::create_dir_all(&model_dir).unwrap();
        fs::write(model_dir.join("model_index.json"), "{}").unwrap();

        let schema = json!({
            "models": {"flux": {"mode": "list", "supported_keys": ["temperature"]}}
        });
        let path = write_schema(dir.path(), &schema);

        let mut all = keys(&["temperature", "negative_prompt", "width", "height"]);
        all.insert("rng_seed".to_string());

        let supported = resolve_supported_keys(&path, Some("flux-ov"), Some(&model_dir), &all);
        let expected: BTreeSet<String> = image_parameter_surface()
            .intersection(&all)
            .cloned()
            .collect();
        assert_eq!(supported, expected);
        assert!(!supported.contains("temperature"));
    }

    #[test]
    fn test_load_model_json_configs_merges_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("config.json"),
            r#"{"max_position_embeddings": 32768, "vocab_size": 151936}"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("generation_config.json"),
            r#"{"temperature": 0.7, "do_sample": true, "pad_token_id": 0}"#,
        )
        .unwrap();

        let merged = load_model_json_configs(dir.path());
        assert_eq!(merged["model_max_length"], 32768);
        assert_eq!(merged["vocab_size"], 151936);
        assert_eq!(merged["temperature"], 0.7);
        assert_eq!(merged["do_sample"], true);
        // Unlisted generation keys are not forwarded
        assert!(merged.get("pad_token_id").is_none());
    }
}

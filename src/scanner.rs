// Model directory scanner and kind detector.
//
// Kind detection is a closed, ordered heuristic over file markers. New
// packagings are supported by extending the marker/task lists, never by
// re-ordering the precedence (asr, image, vlm, llm).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use walkdir::WalkDir;

pub const DEFAULT_SCAN_DEPTH: usize = 4;

const TOKENIZER_PATTERNS: &[&str] = &[
    "tokenizer*.json",
    "vocab.json",
    "merges.txt",
    "*.model",
    "special_tokens_map.json",
];
const IR_PATTERNS: &[&str] = &["*.xml"];

const VLM_MARKERS: &[&str] = &[
    "openvino_vision_embeddings_model.xml",
    "openvino_vision_model.xml",
    "openvino_image_embeddings_model.xml",
];
const LANGUAGE_MARKER: &str = "openvino_language_model.xml";

const ASR_ENCODER_MARKER: &str = "openvino_encoder_model.xml";
const ASR_DECODER_MARKERS: &[&str] = &[
    "openvino_decoder_model.xml",
    "openvino_decoder_with_past_model.xml",
];

const IMAGE_DIR_MARKERS: &[&str] = &[
    "scheduler",
    "text_encoder",
    "text_encoder_2",
    "tokenizer",
    "tokenizer_2",
    "transformer",
    "vae_decoder",
    "vae_encoder",
];

const IMAGE_TASKS: &[&str] = &[
    "text-to-image",
    "text_to_image",
    "text2image",
    "image-generation",
    "image_generation",
    "txt2img",
];

const ASR_TASKS: &[&str] = &[
    "automatic-speech-recognition",
    "automatic_speech_recognition",
    "speech-recognition",
    "speech-to-text",
    "asr",
];

/// Model kind as classified by the marker heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Llm,
    Vlm,
    Image,
    Asr,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Llm => "llm",
            ModelKind::Vlm => "vlm",
            ModelKind::Image => "image",
            ModelKind::Asr => "asr",
        }
    }

    pub fn parse(s: &str) -> ModelKind {
        match s {
            "vlm" => ModelKind::Vlm,
            "image" => ModelKind::Image,
            "asr" => ModelKind::Asr,
            _ => ModelKind::Llm,
        }
    }
}

/// One discovered model directory.
#[derive(Debug, Clone, Serialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub path: String,
    pub kind: ModelKind,
}

/// Match a file name against a marker pattern with at most one `*`.
fn name_matches(name: &str, pattern: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        }
        None => name == pattern,
    }
}

/// Whether `dir` directly contains a file matching any pattern.
fn has_any(dir: &Path, patterns: &[&str]) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    for entry in entries.flatten() {
        if !entry.path().is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if patterns.iter().any(|p| name_matches(name, p)) {
            return true;
        }
    }
    false
}

/// Whether the subtree under `root` contains a file matching any pattern.
fn has_any_recursive(root: &Path, patterns: &[&str]) -> bool {
    find_recursive(root, patterns).is_some()
}

fn find_recursive(root: &Path, patterns: &[&str]) -> Option<PathBuf> {
    for entry in WalkDir::new(root).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if patterns.iter().any(|p| name_matches(name, p)) {
            return Some(entry.into_path());
        }
    }
    None
}

fn json_field(path: &Path, field: &str) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let value: serde_json::Value = serde_json::from_str(&raw).ok()?;
    value.get(field).map(|v| match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn is_asr_model(root: &Path) -> bool {
    if let Some(task) = json_field(&root.join("configuration.json"), "task") {
        if ASR_TASKS.contains(&task.trim().to_lowercase().as_str()) {
            return true;
        }
    }

    if let Some(class_name) = json_field(&root.join("model_index.json"), "_class_name") {
        let lower = class_name.to_lowercase();
        if lower.contains("whisper") || lower.contains("speech") {
            return true;
        }
    }

    if let Some(model_type) = json_field(&root.join("config.json"), "model_type") {
        if model_type.to_lowercase().contains("whisper") {
            return true;
        }
    }

    if let Some(name) = root.file_name().and_then(|n| n.to_str()) {
        if name.to_lowercase().contains("whisper") {
            return true;
        }
    }

    // Encoder + decoder IR pair is the whisper export layout
    has_any_recursive(root, &[ASR_ENCODER_MARKER])
        && has_any_recursive(root, ASR_DECODER_MARKERS)
}

fn is_image_model(root: &Path) -> bool {
    if let Some(task) = json_field(&root.join("configuration.json"), "task") {
        if IMAGE_TASKS.contains(&task.trim().to_lowercase().as_str()) {
            return true;
        }
    }

    // A model_index.json marks a diffusion pipeline regardless of content
    if root.join("model_index.json").exists() {
        return true;
    }

    IMAGE_DIR_MARKERS.iter().any(|name| root.join(name).is_dir())
}

/// Classify a model directory. First match wins; unknown layouts default
/// to `llm` and the caller may exclude them.
pub fn detect_model_kind(root: &Path) -> ModelKind {
    if !root.exists() {
        return ModelKind::Llm;
    }
    if is_asr_model(root) {
        return ModelKind::Asr;
    }
    if is_image_model(root) {
        return ModelKind::Image;
    }
    let has_language = has_any_recursive(root, &[LANGUAGE_MARKER]);
    let has_vision = has_any_recursive(root, VLM_MARKERS);
    if has_language && has_vision {
        return ModelKind::Vlm;
    }
    ModelKind::Llm
}

/// Walk up from the IR-holding directory to the nearest ancestor that
/// also carries tokenizer artifacts. The IR is sometimes exported into a
/// precision subfolder (FP16/) while the tokenizer sits one level up.
fn nearest_model_root(xml_dir: &Path) -> PathBuf {
    let mut cur = xml_dir.to_path_buf();
    for _ in 0..3 {
        if has_any(&cur, TOKENIZER_PATTERNS) {
            return cur;
        }
        match cur.parent() {
            Some(parent) => cur = parent.to_path_buf(),
            None => break,
        }
    }
    xml_dir.to_path_buf()
}

/// Scan the given roots for OpenVINO model directories, up to `max_depth`
/// levels deep. Descriptors are deduplicated by canonical path and sorted
/// by name, case-insensitively.
pub fn scan_dirs(roots: &[PathBuf], max_depth: usize) -> Vec<ModelDescriptor> {
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut found: Vec<ModelDescriptor> = Vec::new();

    for root in roots {
        walk(root, 0, max_depth, &mut seen, &mut found);
    }

    found.sort_by_key(|m| m.name.to_lowercase());
    found
}

/// Scan with the default depth cap.
pub fn scan_models(models_dir: &Path) -> Vec<ModelDescriptor> {
    scan_dirs(&[models_dir.to_path_buf()], DEFAULT_SCAN_DEPTH)
}

fn walk(
    root: &Path,
    depth: usize,
    max_depth: usize,
    seen: &mut HashSet<PathBuf>,
    found: &mut Vec<ModelDescriptor>,
) {
    if depth > max_depth || !root.exists() {
        return;
    }
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };

    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }

        let has_ir_here = has_any(&dir, IR_PATTERNS);
        let ir_hit = if has_ir_here {
            Some(dir.clone())
        } else {
            find_recursive(&dir, IR_PATTERNS).map(|hit| {
                hit.parent().map(Path::to_path_buf).unwrap_or_else(|| dir.clone())
            })
        };

        if let Some(xml_dir) = ir_hit {
            let kind = detect_model_kind(&dir);

            // Image pipelines are addressed at the directory holding the
            // pipeline subfolders; everything else at the tokenizer root.
            let model_root = if kind == ModelKind::Image {
                dir.clone()
            } else {
                nearest_model_root(&xml_dir)
            };

            let valid = kind == ModelKind::Image || has_any(&model_root, TOKENIZER_PATTERNS);
            let key = model_root.canonicalize().unwrap_or_else(|_| model_root.clone());

            if valid && !seen.contains(&key) {
                seen.insert(key.clone());
                let kind = detect_model_kind(&model_root);
                found.push(ModelDescriptor {
                    name: model_root
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or_default()
                        .to_string(),
                    path: key.to_string_lossy().to_string(),
                    kind,
                });
            }
        }

        walk(&dir, depth + 1, max_depth, seen, found);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_name_matches_wildcard() {
        assert!(name_matches("tokenizer.json", "tokenizer*.json"));
        assert!(name_matches("tokenizer_config.json", "tokenizer*.json"));
        assert!(name_matches("sentencepiece.model", "*.model"));
        assert!(!name_matches("config.json", "tokenizer*.json"));
        assert!(name_matches("merges.txt", "merges.txt"));
    }

    #[test]
    fn test_detect_llm() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("openvino_model.xml"));
        touch(&dir.path().join("tokenizer.json"));
        assert_eq!(detect_model_kind(dir.path()), ModelKind::Llm);
    }

    #[test]
    fn test_detect_vlm_needs_both_markers() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("openvino_language_model.xml"));
        assert_eq!(detect_model_kind(dir.path()), ModelKind::Llm);

        touch(&dir.path().join("openvino_vision_embeddings_model.xml"));
        assert_eq!(detect_model_kind(dir.path()), ModelKind::Vlm);
    }

    #[test]
    fn test_detect_image_by_model_index() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("model_index.json"),
            r#"{"_class_name": "FluxPipeline"}"#,
        )
        .unwrap();
        assert_eq!(detect_model_kind(dir.path()), ModelKind::Image);
    }

    #[test]
    fn test_detect_image_by_subdirs() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("vae_decoder")).unwrap();
        assert_eq!(detect_model_kind(dir.path()), ModelKind::Image);
    }

    #[test]
    fn test_detect_asr_by_name() {
        let base = tempfile::tempdir().unwrap();
        let dir = base.path().join("whisper-base-ov");
        fs::create_dir_all(&dir).unwrap();
        assert_eq!(detect_model_kind(&dir), ModelKind::Asr);
    }

    #[test]
    fn test_detect_asr_by_encoder_decoder_pair() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("openvino_encoder_model.xml"));
        touch(&dir.path().join("openvino_decoder_model.xml"));
        assert_eq!(detect_model_kind(dir.path()), ModelKind::Asr);
    }

    #[test]
    fn test_asr_wins_over_image() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("model_index.json"),
            r#"{"_class_name": "WhisperSpeechPipeline"}"#,
        )
        .unwrap();
        assert_eq!(detect_model_kind(dir.path()), ModelKind::Asr);
    }

    #[test]
    fn test_scan_finds_tokenizer_ancestor() {
        let root = tempfile::tempdir().unwrap();
        let model = root.path().join("qwen3-8b-int4-ov");
        touch(&model.join("FP16/openvino_model.xml"));
        touch(&model.join("tokenizer.json"));

        let models = scan_dirs(&[root.path().to_path_buf()], DEFAULT_SCAN_DEPTH);
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].name, "qwen3-8b-int4-ov");
        assert_eq!(models[0].kind, ModelKind::Llm);
        assert!(models[0].path.ends_with("qwen3-8b-int4-ov"));
    }

    #[test]
    fn test_scan_skips_dirs_without_tokenizer() {
        let root = tempfile::tempdir().unwrap();
        touch(&root.path().join("broken-export/openvino_model.xml"));

        let models = scan_dirs(&[root.path().to_path_buf()], DEFAULT_SCAN_DEPTH);
        assert!(models.is_empty());
    }

    #[test]
    fn test_scan_image_model_at_pipeline_root() {
        let root = tempfile::tempdir().unwrap();
        let model = root.path().join("flux-schnell-ov");
        touch(&model.join("transformer/openvino_model.xml"));
        touch(&model.join("vae_decoder/openvino_model.xml"));
        fs::write(model.join("model_index.json"), "{}").unwrap();

        let models = scan_dirs(&[root.path().to_path_buf()], DEFAULT_SCAN_DEPTH);
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].kind, ModelKind::Image);
        assert_eq!(models[0].name, "flux-schnell-ov");
    }

    #[test]
    fn test_scan_sorted_case_insensitive_and_deduped() {
        let root = tempfile::tempdir().unwrap();
        for name in ["Zeta-model", "alpha-model"] {
            let m = root.path().join(name);
            touch(&m.join("openvino_model.xml"));
            touch(&m.join("tokenizer.json"));
        }

        let models = scan_dirs(
            &[root.path().to_path_buf(), root.path().to_path_buf()],
            DEFAULT_SCAN_DEPTH,
        );
        let names: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["alpha-model", "Zeta-model"]);
    }

    #[test]
    fn test_scan_nested_model_found_once() {
        // The recursive IR probe reaches past the walk cap; the canonical
        // path dedupe keeps the model from appearing once per ancestor.
        let root = tempfile::tempdir().unwrap();
        let deep = root.path().join("hub/org/model");
        touch(&deep.join("openvino_model.xml"));
        touch(&deep.join("tokenizer.json"));

        let models = scan_dirs(&[root.path().to_path_buf()], DEFAULT_SCAN_DEPTH);
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].name, "model");
    }
}

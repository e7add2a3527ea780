// Pipeline construction and lifecycle inside the worker process.
//
// One RuntimeState owns at most one loaded pipeline. Reloads tear the
// old pipeline down completely before the new one is built; native
// handles must be released before the next compile targets the same
// device.

pub mod image;
pub mod native;
pub mod sampler;
pub mod template;
pub mod text;

use std::path::{Path, PathBuf};

use tokenizers::Tokenizer;

use crate::paths::{env_bool, AppPaths};
use crate::runtime_info;
use crate::scanner::{detect_model_kind, ModelKind};
use crate::worker::ipc::LoadSpec;
use image::ImagePipeline;
use text::TextPipeline;

const LANGUAGE_IR_NAMES: &[&str] = &["openvino_model.xml", "openvino_language_model.xml"];
const VISION_IR_NAMES: &[&str] = &[
    "openvino_vision_embeddings_model.xml",
    "openvino_vision_model.xml",
    "openvino_image_embeddings_model.xml",
];

pub enum LoadedPipeline {
    Text(TextPipeline),
    Image(ImagePipeline),
    Asr(AsrPipeline),
}

/// Whisper-style pipeline: encoder + decoder IR pair. Loadable so ASR
/// models can be compiled and warmed; chat generation does not route
/// audio to it.
pub struct AsrPipeline {
    pub model_dir: PathBuf,
    _encoder: native::Component,
    _decoder: native::Component,
}

/// Identity of the currently loaded pipeline, for reload suppression.
#[derive(Debug, Clone, PartialEq, Default)]
struct LoadedIdentity {
    source: String,
    path: String,
    device: String,
    image_max_sequence_length: Option<u32>,
}

pub struct RuntimeState {
    paths: AppPaths,
    identity: Option<LoadedIdentity>,
    pub device: String,
    pub kind: ModelKind,
    pub model_dir: Option<PathBuf>,
    pub pipeline: Option<LoadedPipeline>,
}

impl RuntimeState {
    pub fn new(paths: AppPaths) -> Self {
        RuntimeState {
            paths,
            identity: None,
            device: "AUTO".to_string(),
            kind: ModelKind::Llm,
            model_dir: None,
            pipeline: None,
        }
    }

    /// Drop the loaded pipeline. The brief sleep lets the native runtime
    /// finalize device memory before a follow-up compile.
    pub fn unload(&mut self) {
        if self.pipeline.is_some() {
            runtime_info!("Unloading pipeline");
            self.pipeline = None;
            self.identity = None;
            std::thread::sleep(std::time::Duration::from_millis(500));
            runtime_info!("Pipeline unloaded");
        }
    }

    /// Load the requested model, reusing the existing pipeline when the
    /// identity (source, path, device, image seq len) is unchanged and no
    /// cache bust was requested.
    pub fn ensure_loaded(
        &mut self,
        spec: &LoadSpec,
        progress: &mut dyn FnMut(&str, &str),
    ) -> Result<(String, String, ModelKind), String> {
        let target_msl = match spec.image_max_sequence_length {
            Some(msl) => Some(msl),
            None => image::default_t5_sequence_length(Path::new(&spec.path)),
        };

        let wanted = LoadedIdentity {
            source: spec.source.clone(),
            path: spec.path.clone(),
            device: spec.device.clone(),
            image_max_sequence_length: target_msl,
        };

        if !spec.cache_bust && self.pipeline.is_some() && self.identity.as_ref() == Some(&wanted)
        {
            runtime_info!("Pipeline reusing existing instance");
            return Ok((spec.path.clone(), self.device.clone(), self.kind));
        }

        self.unload();

        if spec.source != "local" {
            return Err(format!("Unsupported model source: {}", spec.source));
        }
        let model_dir = PathBuf::from(&spec.path);
        if !model_dir.exists() {
            return Err(format!("Local model directory does not exist: {}", spec.path));
        }

        let kind = detect_model_kind(&model_dir);
        runtime_info!("Load request path={} device={} kind={}", spec.path, spec.device, kind.as_str());

        let template_info;
        let tokenizer;
        if kind == ModelKind::Image {
            template_info = None;
            tokenizer = None;
        } else {
            progress("tokenizer", "Loading tokenizer");
            template_info = Some(template::load_template_info(&model_dir));
            tokenizer = Some(load_tokenizer(&model_dir)?);
        }

        let device = pick_device(&spec.device);
        let mut core = native::Core::new()?;
        configure_device(&mut core, &self.paths, &model_dir, &device, kind, target_msl);

        progress("pipeline", &format!("Compiling pipeline on {device}"));
        let build = |core: &mut native::Core, device: &str| -> Result<LoadedPipeline, String> {
            build_pipeline(
                core,
                kind,
                &model_dir,
                device,
                spec.max_prompt_len,
                target_msl,
                tokenizer.clone(),
                template_info.clone(),
            )
        };

        let (pipeline, final_device) = match build(&mut core, &device) {
            Ok(pipeline) => (pipeline, device),
            Err(e) if device != "CPU" => {
                progress("fallback", &format!("{device} failed, retrying on CPU"));
                runtime_info!("Pipeline init failed on {}: {}. Falling back to CPU", device, e);
                let pipeline = build(&mut core, "CPU")?;
                (pipeline, "CPU".to_string())
            }
            Err(e) => return Err(e),
        };

        self.identity = Some(wanted);
        self.device = final_device.clone();
        self.kind = kind;
        self.model_dir = Some(model_dir);
        self.pipeline = Some(pipeline);

        Ok((spec.path.clone(), final_device, kind))
    }
}

/// The requested device must be advertised by the runtime; anything else
/// resolves to AUTO.
fn pick_device(requested: &str) -> String {
    let devices = native::available_devices();
    if devices.iter().any(|d| d == requested) {
        requested.to_string()
    } else {
        "AUTO".to_string()
    }
}

/// Per-(model, device[, tag]) compile cache plus the NPU env bridges.
fn configure_device(
    core: &mut native::Core,
    paths: &AppPaths,
    model_dir: &Path,
    device: &str,
    kind: ModelKind,
    image_msl: Option<u32>,
) {
    let flux = kind == ModelKind::Image && image::is_flux_pipeline(model_dir);

    if flux {
        // The compiled-model cache corrupts FLUX component blobs
        core.disable_cache(device);
    } else if device != "AUTO" {
        let model_name = model_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("model");
        let mut cache_name = format!("{}_{device}", sanitize(model_name));
        if let Some(msl) = image_msl {
            if kind == ModelKind::Image {
                cache_name.push_str(&format!("_msl{msl}"));
            }
        }
        let cache_dir = paths.ov_cache_dir.join(cache_name);
        let _ = std::fs::create_dir_all(&cache_dir);
        core.set_cache_dir(device, &cache_dir);
    }

    if device == "NPU" || device == "AUTO" {
        if std::env::var("IDLE_NPU_DEFER_WEIGHTS_LOAD").is_ok() {
            let value = if env_bool("IDLE_NPU_DEFER_WEIGHTS_LOAD", false) {
                "YES"
            } else {
                "NO"
            };
            core.set_device_property("NPU", "NPU_DEFER_WEIGHTS_LOAD", value);
        }
        if let Ok(threads) = std::env::var("IDLE_NPU_COMPILATION_NUM_THREADS") {
            if threads.trim().parse::<u32>().is_ok() {
                core.set_device_property("NPU", "COMPILATION_NUM_THREADS", threads.trim());
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_pipeline(
    core: &mut native::Core,
    kind: ModelKind,
    model_dir: &Path,
    device: &str,
    max_prompt_len: u32,
    image_msl: Option<u32>,
    tokenizer: Option<Tokenizer>,
    template_info: Option<template::TemplateInfo>,
) -> Result<LoadedPipeline, String> {
    match kind {
        ModelKind::Llm | ModelKind::Vlm => {
            if device == "NPU" {
                // Best-effort hint; silently unsupported elsewhere
                core.set_device_property("NPU", "MAX_PROMPT_LEN", &max_prompt_len.to_string());
            }

            let language_ir = find_ir(model_dir, LANGUAGE_IR_NAMES)
                .ok_or_else(|| format!("No language IR found under {}", model_dir.display()))?;
            let model = core.compile_text_model(&language_ir, device)?;

            let vision = if kind == ModelKind::Vlm {
                let vision_ir = find_ir(model_dir, VISION_IR_NAMES).ok_or_else(|| {
                    format!("No vision-embeddings IR found under {}", model_dir.display())
                })?;
                Some(core.compile_component(&vision_ir, device)?)
            } else {
                None
            };

            Ok(LoadedPipeline::Text(TextPipeline::new(
                kind,
                model_dir.to_path_buf(),
                tokenizer.ok_or("Tokenizer missing for text pipeline")?,
                template_info.unwrap_or_default(),
                model,
                vision,
                max_prompt_len,
            )))
        }

        ModelKind::Image => {
            let is_flux = image::is_flux_pipeline(model_dir);

            let tokenizer = load_tokenizer(&model_dir.join("tokenizer"))?;
            let tokenizer_2 = load_tokenizer(&model_dir.join("tokenizer_2")).ok();

            let text_encoder =
                core.compile_component(&component_ir(model_dir, "text_encoder")?, device)?;
            let text_encoder_2 = match component_ir(model_dir, "text_encoder_2") {
                Ok(ir) => Some(core.compile_component(&ir, device)?),
                Err(_) => None,
            };
            let transformer_ir = component_ir(model_dir, "transformer")
                .or_else(|_| component_ir(model_dir, "unet"))?;
            let transformer = core.compile_component(&transformer_ir, device)?;
            let vae_decoder =
                core.compile_component(&component_ir(model_dir, "vae_decoder")?, device)?;

            if is_flux && (tokenizer_2.is_none() || text_encoder_2.is_none()) {
                return Err("FLUX pipeline requires tokenizer_2 and text_encoder_2".to_string());
            }

            Ok(LoadedPipeline::Image(ImagePipeline::new(
                model_dir.to_path_buf(),
                is_flux,
                image_msl,
                tokenizer,
                tokenizer_2,
                text_encoder,
                text_encoder_2,
                transformer,
                vae_decoder,
            )))
        }

        ModelKind::Asr => {
            let encoder_ir = find_ir(model_dir, &["openvino_encoder_model.xml"])
                .ok_or_else(|| format!("No encoder IR found under {}", model_dir.display()))?;
            let decoder_ir = find_ir(
                model_dir,
                &[
                    "openvino_decoder_model.xml",
                    "openvino_decoder_with_past_model.xml",
                ],
            )
            .ok_or_else(|| format!("No decoder IR found under {}", model_dir.display()))?;

            Ok(LoadedPipeline::Asr(AsrPipeline {
                model_dir: model_dir.to_path_buf(),
                _encoder: core.compile_component(&encoder_ir, device)?,
                _decoder: core.compile_component(&decoder_ir, device)?,
            }))
        }
    }
}

fn load_tokenizer(dir: &Path) -> Result<Tokenizer, String> {
    let path = dir.join("tokenizer.json");
    Tokenizer::from_file(&path)
        .map_err(|e| format!("Failed to load tokenizer {}: {e}", path.display()))
}

/// Locate a named IR file anywhere under the model dir (precision
/// subfolders included).
fn find_ir(model_dir: &Path, names: &[&str]) -> Option<PathBuf> {
    for entry in walkdir::WalkDir::new(model_dir).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if names.contains(&name) {
            return Some(entry.into_path());
        }
    }
    None
}

/// Pipeline component subdir IR: `<model>/<component>/openvino_model.xml`.
fn component_ir(model_dir: &Path, component: &str) -> Result<PathBuf, String> {
    let path = model_dir.join(component).join("openvino_model.xml");
    if path.exists() {
        Ok(path)
    } else {
        Err(format!("Missing pipeline component: {component}"))
    }
}

fn sanitize(name: &str) -> String {
    lazy_static::lazy_static! {
        static ref UNSAFE: regex::Regex = regex::Regex::new(r"[^\w\-.]+").unwrap();
    }
    UNSAFE.replace_all(name, "_").to_string()
}

/// Decode a base64 payload, with or without the data-URL prefix.
pub fn decode_data_url(content: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    let payload = match content.split_once(',') {
        Some((prefix, payload)) if prefix.starts_with("data:") => payload,
        _ => content,
    };
    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_cache_names() {
        assert_eq!(sanitize("Qwen3-8B int4/cw:ov"), "Qwen3-8B_int4_cw_ov");
        assert_eq!(sanitize("model.v1"), "model.v1");
    }

    #[test]
    fn test_decode_data_url_variants() {
        use base64::Engine;
        let payload = base64::engine::general_purpose::STANDARD.encode(b"abc");
        assert_eq!(
            decode_data_url(&format!("data:image/png;base64,{payload}")),
            Some(b"abc".to_vec())
        );
        assert_eq!(decode_data_url(&payload), Some(b"abc".to_vec()));
        assert_eq!(decode_data_url("data:image/png;base64,!!!"), None);
    }

    #[test]
    fn test_find_ir_in_subfolder() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("FP16");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("openvino_model.xml"), "x").unwrap();

        let found = find_ir(dir.path(), LANGUAGE_IR_NAMES).unwrap();
        assert!(found.ends_with("FP16/openvino_model.xml"));
    }

    #[test]
    fn test_pick_device_falls_back_to_auto() {
        // The fallback inventory always lists CPU; bogus names map to AUTO
        assert_eq!(pick_device("CPU"), "CPU");
        assert_eq!(pick_device("TPU9"), "AUTO");
    }
}

// Text-to-image pipeline: prompt encoders, flow/diffusion transformer,
// and VAE decode, emitting PNG data-URL attachments.

use std::collections::BTreeSet;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use base64::Engine;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokenizers::Tokenizer;

use super::native;
use crate::app_config::MAX_IMAGE_BYTES;
use crate::runtime_warn;
use crate::session::Attachment;

/// Generation knobs exposed by the image pipeline. The settings resolver
/// enumerates this struct's fields as the pipeline's parameter surface,
/// so every knob must serialize unconditionally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageGenerationConfig {
    pub negative_prompt: Option<String>,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
    pub width: u32,
    pub height: u32,
    pub num_images_per_prompt: u32,
    pub rng_seed: Option<i64>,
    pub max_sequence_length: Option<u32>,
}

impl Default for ImageGenerationConfig {
    fn default() -> Self {
        ImageGenerationConfig {
            negative_prompt: None,
            num_inference_steps: 4,
            guidance_scale: 0.0,
            width: 512,
            height: 512,
            num_images_per_prompt: 1,
            rng_seed: None,
            max_sequence_length: None,
        }
    }
}

impl ImageGenerationConfig {
    /// Build from a merged client config. Empty negative prompts and
    /// non-positive seeds are dropped rather than forwarded.
    pub fn from_config(config: &Value) -> Self {
        let mut cfg = ImageGenerationConfig::default();
        cfg.negative_prompt = config
            .get("negative_prompt")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string);
        if let Some(v) = config.get("num_inference_steps").and_then(Value::as_u64) {
            cfg.num_inference_steps = v.max(1) as u32;
        }
        if let Some(v) = config.get("guidance_scale").and_then(Value::as_f64) {
            cfg.guidance_scale = v as f32;
        }
        if let Some(v) = config.get("width").and_then(Value::as_u64) {
            cfg.width = v as u32;
        }
        if let Some(v) = config.get("height").and_then(Value::as_u64) {
            cfg.height = v as u32;
        }
        if let Some(v) = config.get("num_images_per_prompt").and_then(Value::as_u64) {
            cfg.num_images_per_prompt = v.max(1) as u32;
        }
        cfg.rng_seed = config
            .get("rng_seed")
            .and_then(Value::as_i64)
            .filter(|&seed| seed > 0);
        cfg.max_sequence_length = config
            .get("max_sequence_length")
            .and_then(Value::as_u64)
            .map(|v| v as u32);
        cfg
    }
}

/// The parameter surface the settings resolver intersects against. This
/// is introspected from the config object, never hard-coded.
pub fn image_parameter_surface() -> BTreeSet<String> {
    match serde_json::to_value(ImageGenerationConfig::default()) {
        Ok(Value::Object(map)) => map.keys().cloned().collect(),
        _ => BTreeSet::new(),
    }
}

/// Is this pipeline the FLUX dialect (explicit component assembly, no
/// compiled-model cache)?
pub fn is_flux_pipeline(model_dir: &Path) -> bool {
    let Ok(raw) = std::fs::read_to_string(model_dir.join("model_index.json")) else {
        return false;
    };
    serde_json::from_str::<Value>(&raw)
        .ok()
        .and_then(|v| {
            v.get("_class_name")
                .and_then(|c| c.as_str())
                .map(|c| c.to_lowercase().contains("flux"))
        })
        .unwrap_or(false)
}

/// T5 sequence length inferred from tokenizer_2 when the request does not
/// carry one.
pub fn default_t5_sequence_length(model_dir: &Path) -> Option<u32> {
    let raw =
        std::fs::read_to_string(model_dir.join("tokenizer_2/tokenizer_config.json")).ok()?;
    let config: Value = serde_json::from_str(&raw).ok()?;
    config
        .get("model_max_length")
        .and_then(Value::as_u64)
        // Some exports store a sentinel "very large" value; ignore it
        .filter(|&v| v <= 4096)
        .map(|v| v as u32)
}

pub struct ImagePipeline {
    pub model_dir: PathBuf,
    pub is_flux: bool,
    pub max_sequence_length: Option<u32>,
    tokenizer: Tokenizer,
    tokenizer_2: Option<Tokenizer>,
    text_encoder: native::Component,
    text_encoder_2: Option<native::Component>,
    transformer: native::Component,
    vae_decoder: native::Component,
}

impl ImagePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model_dir: PathBuf,
        is_flux: bool,
        max_sequence_length: Option<u32>,
        tokenizer: Tokenizer,
        tokenizer_2: Option<Tokenizer>,
        text_encoder: native::Component,
        text_encoder_2: Option<native::Component>,
        transformer: native::Component,
        vae_decoder: native::Component,
    ) -> Self {
        ImagePipeline {
            model_dir,
            is_flux,
            max_sequence_length,
            tokenizer,
            tokenizer_2,
            text_encoder,
            text_encoder_2,
            transformer,
            vae_decoder,
        }
    }

    /// Generate images for one prompt, emitting each as an attachment.
    /// Returns the number of emitted images.
    pub fn generate(
        &mut self,
        prompt: &str,
        cfg: &ImageGenerationConfig,
        emit: &mut dyn FnMut(Attachment),
    ) -> Result<u64, String> {
        if let (Some(requested), Some(compiled)) = (cfg.max_sequence_length, self.max_sequence_length)
        {
            if requested != compiled {
                return Err(format!(
                    "Image encoder reshape mismatch: requested max_sequence_length {requested}, compiled for {compiled}"
                ));
            }
        }

        let pooled = self.encode_clip(prompt)?;
        let embeds = self.encode_t5(prompt)?;

        let mut rng = match cfg.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed as u64),
            None => StdRng::from_entropy(),
        };

        let mut emitted = 0u64;
        for index in 0..cfg.num_images_per_prompt {
            let rgb = self.run_denoise(cfg, &pooled, &embeds, &mut rng)?;
            match encode_image_attachment(&rgb, index, MAX_IMAGE_BYTES) {
                Some(attachment) => {
                    emit(attachment);
                    emitted += 1;
                }
                None => {
                    runtime_warn!("Dropping oversized generated image {}", index);
                }
            }
        }
        Ok(emitted)
    }

    /// CLIP encoder: pooled prompt projection.
    fn encode_clip(&mut self, prompt: &str) -> Result<Vec<f32>, String> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| format!("Prompt tokenize failed: {e}"))?;
        let ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        self.text_encoder.infer_ids(&ids, "pooler_output")
    }

    /// T5 encoder (FLUX): fixed-length prompt embeddings. Falls back to
    /// the CLIP hidden states for single-encoder pipelines.
    fn encode_t5(&mut self, prompt: &str) -> Result<Vec<f32>, String> {
        let (Some(tokenizer), Some(encoder)) =
            (self.tokenizer_2.as_ref(), self.text_encoder_2.as_mut())
        else {
            let encoding = self
                .tokenizer
                .encode(prompt, true)
                .map_err(|e| format!("Prompt tokenize failed: {e}"))?;
            let ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
            return self.text_encoder.infer_ids(&ids, "last_hidden_state");
        };

        let encoding = tokenizer
            .encode(prompt, true)
            .map_err(|e| format!("T5 tokenize failed: {e}"))?;
        let mut ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();

        // The T5 encoder is compiled for a fixed sequence length
        if let Some(seq_len) = self.max_sequence_length {
            let seq_len = seq_len as usize;
            if ids.len() > seq_len {
                ids.truncate(seq_len);
            } else {
                ids.resize(seq_len, 0);
            }
        }
        encoder.infer_ids(&ids, "last_hidden_state")
    }

    /// Euler flow-matching loop over the transformer, then VAE decode.
    fn run_denoise(
        &mut self,
        cfg: &ImageGenerationConfig,
        pooled: &[f32],
        embeds: &[f32],
        rng: &mut StdRng,
    ) -> Result<image::RgbImage, String> {
        let channels: i64 = if self.is_flux { 16 } else { 4 };
        let latent_h = (cfg.height / 8).max(1) as i64;
        let latent_w = (cfg.width / 8).max(1) as i64;
        let latent_shape = [1, channels, latent_h, latent_w];
        let latent_len = (channels * latent_h * latent_w) as usize;

        let mut latents: Vec<f32> = (0..latent_len).map(|_| normal_sample(rng)).collect();

        let steps = cfg.num_inference_steps.max(1);
        let dt = 1.0f32 / steps as f32;
        let seq_len = self.max_sequence_length.unwrap_or(0).max(1) as usize;
        let hidden = (embeds.len() / seq_len).max(1) as i64;
        let embeds_shape = [1, (embeds.len() as i64 / hidden).max(1), hidden];
        let pooled_shape = [1, pooled.len() as i64];

        for step in 0..steps {
            let t = 1.0 - step as f32 * dt;
            let timestep = [t];
            let velocity = self.transformer.infer_f32(
                &[
                    ("hidden_states", &latents, &latent_shape),
                    ("encoder_hidden_states", embeds, &embeds_shape),
                    ("pooled_projections", pooled, &pooled_shape),
                    ("timestep", &timestep, &[1]),
                ],
                "out_sample",
            )?;
            if velocity.len() != latents.len() {
                return Err(format!(
                    "Transformer output shape mismatch: {} vs {}",
                    velocity.len(),
                    latents.len()
                ));
            }
            for (latent, v) in latents.iter_mut().zip(velocity.iter()) {
                *latent -= v * dt;
            }
        }

        let decoded = self.vae_decoder.infer_f32(
            &[("latent_sample", &latents, &latent_shape)],
            "sample",
        )?;
        pixels_to_image(&decoded, cfg.width, cfg.height)
    }
}

/// Map VAE output in [-1, 1], layout [1, 3, H, W], to an RGB image.
fn pixels_to_image(data: &[f32], width: u32, height: u32) -> Result<image::RgbImage, String> {
    let plane = (width * height) as usize;
    if data.len() < plane * 3 {
        return Err(format!(
            "VAE output too small: {} values for {}x{}",
            data.len(),
            width,
            height
        ));
    }
    let mut img = image::RgbImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let idx = (y * width + x) as usize;
            let to_u8 =
                |v: f32| -> u8 { (((v + 1.0) / 2.0).clamp(0.0, 1.0) * 255.0).round() as u8 };
            img.put_pixel(
                x,
                y,
                image::Rgb([
                    to_u8(data[idx]),
                    to_u8(data[plane + idx]),
                    to_u8(data[2 * plane + idx]),
                ]),
            );
        }
    }
    Ok(img)
}

/// PNG-encode one image as a data-URL attachment; oversized payloads are
/// dropped (None) instead of emitted.
pub fn encode_image_attachment(
    rgb: &image::RgbImage,
    index: u32,
    max_bytes: usize,
) -> Option<Attachment> {
    let mut png = Vec::new();
    image::DynamicImage::ImageRgb8(rgb.clone())
        .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .ok()?;

    if png.len() > max_bytes {
        return None;
    }

    let size = png.len() as i64;
    let payload = base64::engine::general_purpose::STANDARD.encode(&png);
    Some(Attachment {
        name: format!("image_{index}.png"),
        kind: "image".to_string(),
        mime: Some("image/png".to_string()),
        content: format!("data:image/png;base64,{payload}"),
        truncated: false,
        size,
    })
}

/// Box-Muller standard normal.
fn normal_sample(rng: &mut StdRng) -> f32 {
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}

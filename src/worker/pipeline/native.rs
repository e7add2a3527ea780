// Thin seam over the OpenVINO runtime. Everything the worker needs from
// the native library goes through here: device inventory, compile-cache
// properties, IR compilation, and raw infer calls. The GenAI-level logic
// (templates, sampling, decode loops) lives in the sibling modules.

use std::borrow::Cow;
use std::path::Path;
use std::sync::Mutex;

use openvino::{DeviceType, ElementType, RwPropertyKey, Shape, Tensor};

use crate::runtime_warn;

/// Devices advertised by the runtime, AUTO first. Falls back to the
/// conventional list when the native library is not resolvable, so the
/// host process can still serve configuration endpoints.
pub fn available_devices() -> Vec<String> {
    lazy_static::lazy_static! {
        static ref DEVICES: Mutex<Option<Vec<String>>> = Mutex::new(None);
    }

    let mut cached = DEVICES.lock().unwrap();
    if let Some(devices) = cached.as_ref() {
        return devices.clone();
    }

    let devices = probe_devices().unwrap_or_else(|e| {
        runtime_warn!("OpenVINO core init failed, using fallback device list: {}", e);
        vec![
            "AUTO".to_string(),
            "CPU".to_string(),
            "GPU".to_string(),
            "NPU".to_string(),
        ]
    });
    *cached = Some(devices.clone());
    devices
}

fn probe_devices() -> Result<Vec<String>, String> {
    let core = openvino::Core::new().map_err(|e| e.to_string())?;
    let mut devices = vec!["AUTO".to_string()];
    for device in core.available_devices().map_err(|e| e.to_string())? {
        devices.push(device.to_string());
    }
    Ok(devices)
}

fn device_type(name: &str) -> DeviceType<'static> {
    match name {
        "CPU" => DeviceType::CPU,
        "GPU" => DeviceType::GPU,
        "NPU" => DeviceType::NPU,
        other => DeviceType::Other(Cow::Owned(other.to_string())),
    }
}

/// One runtime core owned by the worker process.
pub struct Core {
    core: openvino::Core,
}

impl Core {
    pub fn new() -> Result<Self, String> {
        Ok(Core {
            core: openvino::Core::new().map_err(|e| format!("OpenVINO init failed: {e}"))?,
        })
    }

    /// Route compiled blobs for `device` into `dir`.
    pub fn set_cache_dir(&mut self, device: &str, dir: &Path) {
        let value = dir.to_string_lossy().to_string();
        if let Err(e) =
            self.core
                .set_property(&device_type(device), &RwPropertyKey::CacheDir, &value)
        {
            runtime_warn!("CACHE_DIR not accepted on {}: {}", device, e);
        }
    }

    /// Disable the compiled-model cache (FLUX pipelines reject it).
    pub fn disable_cache(&mut self, device: &str) {
        let _ = self
            .core
            .set_property(&device_type(device), &RwPropertyKey::CacheDir, "");
    }

    /// Best-effort device property; unsupported keys are logged and ignored.
    pub fn set_device_property(&mut self, device: &str, key: &str, value: &str) {
        if let Err(e) = self.core.set_property(
            &device_type(device),
            &RwPropertyKey::Other(Cow::Owned(key.to_string())),
            value,
        ) {
            runtime_warn!("Property {}={} not accepted on {}: {}", key, value, device, e);
        }
    }

    fn compile(&mut self, xml: &Path, device: &str) -> Result<openvino::CompiledModel, String> {
        let weights = xml.with_extension("bin");
        let model = self
            .core
            .read_model_from_file(
                &xml.to_string_lossy(),
                &weights.to_string_lossy(),
            )
            .map_err(|e| format!("Failed to read IR {}: {e}", xml.display()))?;
        self.core
            .compile_model(&model, device_type(device))
            .map_err(|e| format!("Failed to compile {} on {device}: {e}", xml.display()))
    }

    /// Compile a causal language model IR.
    pub fn compile_text_model(&mut self, xml: &Path, device: &str) -> Result<TextModel, String> {
        Ok(TextModel {
            compiled: self.compile(xml, device)?,
        })
    }

    /// Compile a generic pipeline component (encoders, transformer, VAE).
    pub fn compile_component(&mut self, xml: &Path, device: &str) -> Result<Component, String> {
        Ok(Component {
            compiled: self.compile(xml, device)?,
        })
    }
}

/// Compiled stateful language model. Each generation gets a fresh infer
/// request, which is what resets the internal KV-cache state.
pub struct TextModel {
    compiled: openvino::CompiledModel,
}

impl TextModel {
    pub fn start_session(&mut self) -> Result<TextSession, String> {
        let request = self
            .compiled
            .create_infer_request()
            .map_err(|e| format!("Failed to create infer request: {e}"))?;
        Ok(TextSession { request })
    }
}

/// One decode session over a stateful model: the first call feeds the
/// whole prompt, later calls feed a single token each.
pub struct TextSession {
    request: openvino::InferRequest,
}

impl TextSession {
    /// Run one step and return the raw logits tensor (n * vocab values;
    /// the caller slices the last row).
    pub fn infer_logits(
        &mut self,
        new_tokens: &[i64],
        total_len: usize,
    ) -> Result<Vec<f32>, String> {
        let n = new_tokens.len();

        let input_ids = i64_tensor(&[1, n as i64], new_tokens)?;
        self.request
            .set_tensor("input_ids", &input_ids)
            .map_err(|e| format!("set input_ids: {e}"))?;

        let mask = vec![1i64; total_len];
        let attention_mask = i64_tensor(&[1, total_len as i64], &mask)?;
        self.request
            .set_tensor("attention_mask", &attention_mask)
            .map_err(|e| format!("set attention_mask: {e}"))?;

        // Optional inputs on stateful exports; absent on some models
        let start = total_len - n;
        let positions: Vec<i64> = (start as i64..total_len as i64).collect();
        if let Ok(position_ids) = i64_tensor(&[1, n as i64], &positions) {
            let _ = self.request.set_tensor("position_ids", &position_ids);
        }
        if let Ok(beam_idx) = i32_tensor(&[1], &[0]) {
            let _ = self.request.set_tensor("beam_idx", &beam_idx);
        }

        self.request
            .infer()
            .map_err(|e| format!("infer: {e}"))?;

        let logits = self
            .request
            .get_tensor("logits")
            .map_err(|e| format!("get logits: {e}"))?;
        logits
            .get_data::<f32>()
            .map(|data| data.to_vec())
            .map_err(|e| format!("read logits: {e}"))
    }
}

/// Compiled non-autoregressive component with named inputs/outputs.
pub struct Component {
    compiled: openvino::CompiledModel,
}

impl Component {
    /// Feed token ids into `input_ids` and read one named f32 output.
    pub fn infer_ids(&mut self, ids: &[i64], output: &str) -> Result<Vec<f32>, String> {
        let mut request = self
            .compiled
            .create_infer_request()
            .map_err(|e| format!("Failed to create infer request: {e}"))?;

        let input_ids = i64_tensor(&[1, ids.len() as i64], ids)?;
        request
            .set_tensor("input_ids", &input_ids)
            .map_err(|e| format!("set input_ids: {e}"))?;

        let mask = vec![1i64; ids.len()];
        if let Ok(attention_mask) = i64_tensor(&[1, ids.len() as i64], &mask) {
            let _ = request.set_tensor("attention_mask", &attention_mask);
        }

        request.infer().map_err(|e| format!("infer: {e}"))?;
        let out = request
            .get_tensor(output)
            .map_err(|e| format!("get {output}: {e}"))?;
        out.get_data::<f32>()
            .map(|data| data.to_vec())
            .map_err(|e| format!("read {output}: {e}"))
    }

    /// Feed named f32 tensors and read one named f32 output.
    pub fn infer_f32(
        &mut self,
        inputs: &[(&str, &[f32], &[i64])],
        output: &str,
    ) -> Result<Vec<f32>, String> {
        let mut request = self
            .compiled
            .create_infer_request()
            .map_err(|e| format!("Failed to create infer request: {e}"))?;

        for (name, data, shape) in inputs {
            let tensor = f32_tensor(shape, data)?;
            request
                .set_tensor(name, &tensor)
                .map_err(|e| format!("set {name}: {e}"))?;
        }

        request.infer().map_err(|e| format!("infer: {e}"))?;
        let out = request
            .get_tensor(output)
            .map_err(|e| format!("get {output}: {e}"))?;
        out.get_data::<f32>()
            .map(|data| data.to_vec())
            .map_err(|e| format!("read {output}: {e}"))
    }
}

fn i64_tensor(shape: &[i64], data: &[i64]) -> Result<Tensor, String> {
    let shape = Shape::new(shape).map_err(|e| format!("shape: {e}"))?;
    let mut tensor =
        Tensor::new(ElementType::I64, &shape).map_err(|e| format!("tensor: {e}"))?;
    tensor
        .get_data_mut::<i64>()
        .map_err(|e| format!("tensor data: {e}"))?
        .copy_from_slice(data);
    Ok(tensor)
}

fn i32_tensor(shape: &[i64], data: &[i32]) -> Result<Tensor, String> {
    let shape = Shape::new(shape).map_err(|e| format!("shape: {e}"))?;
    let mut tensor =
        Tensor::new(ElementType::I32, &shape).map_err(|e| format!("tensor: {e}"))?;
    tensor
        .get_data_mut::<i32>()
        .map_err(|e| format!("tensor data: {e}"))?
        .copy_from_slice(data);
    Ok(tensor)
}

fn f32_tensor(shape: &[i64], data: &[f32]) -> Result<Tensor, String> {
    let shape = Shape::new(shape).map_err(|e| format!("shape: {e}"))?;
    let mut tensor =
        Tensor::new(ElementType::F32, &shape).map_err(|e| format!("tensor: {e}"))?;
    tensor
        .get_data_mut::<f32>()
        .map_err(|e| format!("tensor data: {e}"))?
        .copy_from_slice(data);
    Ok(tensor)
}

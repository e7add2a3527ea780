// Token sampling over raw logits: repetition penalty, temperature,
// top-k, top-p nucleus. Greedy argmax when sampling is disabled.

use rand::rngs::StdRng;
use rand::Rng;
use serde_json::Value;

/// Generation parameters after merging defaults with the client config
/// and stripping app-only keys.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSettings {
    pub max_new_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: usize,
    pub repetition_penalty: f32,
    pub do_sample: bool,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        GenerationSettings {
            max_new_tokens: 1024,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            repetition_penalty: 1.1,
            do_sample: true,
        }
    }
}

impl GenerationSettings {
    /// Pull the known numeric knobs out of a merged config object,
    /// keeping defaults for anything absent or mistyped.
    pub fn from_config(config: &Value) -> Self {
        let mut settings = GenerationSettings::default();
        if let Some(v) = config.get("max_new_tokens").and_then(Value::as_u64) {
            settings.max_new_tokens = v as usize;
        }
        if let Some(v) = config.get("temperature").and_then(Value::as_f64) {
            settings.temperature = v as f32;
        }
        if let Some(v) = config.get("top_p").and_then(Value::as_f64) {
            settings.top_p = v as f32;
        }
        if let Some(v) = config.get("top_k").and_then(Value::as_u64) {
            settings.top_k = v as usize;
        }
        if let Some(v) = config.get("repetition_penalty").and_then(Value::as_f64) {
            settings.repetition_penalty = v as f32;
        }
        if let Some(v) = config.get("do_sample").and_then(Value::as_bool) {
            settings.do_sample = v;
        }
        settings
    }
}

/// Pick the next token id from one vocab-sized logits row.
pub fn sample_token(
    logits: &mut [f32],
    history: &[i64],
    settings: &GenerationSettings,
    rng: &mut StdRng,
) -> i64 {
    apply_repetition_penalty(logits, history, settings.repetition_penalty);

    if !settings.do_sample || settings.temperature <= 0.0 {
        return argmax(logits);
    }

    for logit in logits.iter_mut() {
        *logit /= settings.temperature;
    }

    // Candidate set: top-k, then top-p over the sorted tail
    let mut candidates: Vec<(usize, f32)> =
        logits.iter().copied().enumerate().collect();
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    if settings.top_k > 0 && candidates.len() > settings.top_k {
        candidates.truncate(settings.top_k);
    }

    let max_logit = candidates.first().map(|(_, l)| *l).unwrap_or(0.0);
    let mut probs: Vec<f32> = candidates
        .iter()
        .map(|(_, l)| (l - max_logit).exp())
        .collect();
    let sum: f32 = probs.iter().sum();
    for p in probs.iter_mut() {
        *p /= sum;
    }

    if settings.top_p < 1.0 {
        let mut cumulative = 0.0;
        let mut keep = probs.len();
        for (i, p) in probs.iter().enumerate() {
            cumulative += p;
            if cumulative >= settings.top_p {
                keep = i + 1;
                break;
            }
        }
        candidates.truncate(keep);
        probs.truncate(keep);
        let sum: f32 = probs.iter().sum();
        for p in probs.iter_mut() {
            *p /= sum;
        }
    }

    let draw: f32 = rng.gen();
    let mut cumulative = 0.0;
    for (i, p) in probs.iter().enumerate() {
        cumulative += p;
        if draw <= cumulative {
            return candidates[i].0 as i64;
        }
    }
    candidates.last().map(|(id, _)| *id as i64).unwrap_or(0)
}

fn apply_repetition_penalty(logits: &mut [f32], history: &[i64], penalty: f32) {
    if penalty <= 1.0 {
        return;
    }
    for &token in history {
        let Some(logit) = logits.get_mut(token as usize) else {
            continue;
        };
        if *logit > 0.0 {
            *logit /= penalty;
        } else {
            *logit *= penalty;
        }
    }
}

fn argmax(logits: &[f32]) -> i64 {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i as i64)
        .unwrap_or(0)
}

// Model downloads: isolated child process, hub access, monotonic
// progress aggregation, and the host-side supervisor.

pub mod child;
pub mod hub;
pub mod progress;
pub mod supervisor;

lazy_static::lazy_static! {
    static ref ANSI_ESCAPES: regex::Regex =
        regex::Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").unwrap();
}

/// Strip ANSI escapes and drop progress-bar noise. Returns None for
/// lines that should not be forwarded as log events.
pub fn clean_log_line(raw: &str) -> Option<String> {
    let clean = ANSI_ESCAPES.replace_all(raw, "");
    let clean = clean.trim();
    if clean.is_empty() || clean.starts_with('%') || clean.contains("Downloading") {
        return None;
    }
    Some(clean.to_string())
}

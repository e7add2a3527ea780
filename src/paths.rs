// Path/config resolution for the host process.
//
// All directories are resolved exactly once at startup and are immutable
// afterwards. An optional `paths.json` inside the data dir overrides
// individual locations; a missing or malformed file is silently ignored.

use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Environment variable that relocates the whole data directory.
pub const ENV_DATA_DIR: &str = "IDLE_NPU_DATA_DIR";
/// Environment variable that relocates the compiled-model cache root.
pub const ENV_OV_CACHE_DIR: &str = "IDLE_NPU_OV_CACHE_DIR";

/// Resolved filesystem layout for one host process.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub models_dir: PathBuf,
    pub download_cache_dir: PathBuf,
    pub ov_cache_dir: PathBuf,
    pub sessions_db: PathBuf,
    pub frontend_dir: PathBuf,
}

/// Optional overrides loaded from `paths.json`.
#[derive(Debug, Default, Deserialize)]
struct PathOverrides {
    config_dir: Option<String>,
    logs_dir: Option<String>,
    models_dir: Option<String>,
    download_cache_dir: Option<String>,
    ov_cache_dir: Option<String>,
    sessions_db: Option<String>,
}

impl AppPaths {
    /// Resolve the full layout: env override, defaults beside the
    /// executable, then `paths.json` overrides on top.
    pub fn resolve() -> Self {
        let data_dir = data_dir_from_env().unwrap_or_else(default_data_dir);
        Self::resolve_from(&data_dir)
    }

    /// Resolve against an explicit data dir (used by worker/download
    /// child processes and by tests).
    pub fn resolve_from(data_dir: &Path) -> Self {
        let overrides = load_overrides(&data_dir.join("paths.json"));

        let pick = |o: &Option<String>, default: PathBuf| -> PathBuf {
            match o {
                Some(raw) => expand_path(raw),
                None => default,
            }
        };

        let ov_cache_default = match env::var(ENV_OV_CACHE_DIR) {
            Ok(v) if !v.trim().is_empty() => expand_path(&v),
            _ => data_dir.join(".ov_cache"),
        };

        AppPaths {
            data_dir: data_dir.to_path_buf(),
            config_dir: pick(&overrides.config_dir, data_dir.to_path_buf()),
            logs_dir: pick(&overrides.logs_dir, data_dir.to_path_buf()),
            models_dir: pick(&overrides.models_dir, data_dir.join("models")),
            download_cache_dir: pick(
                &overrides.download_cache_dir,
                data_dir.join(".download_temp"),
            ),
            ov_cache_dir: pick(&overrides.ov_cache_dir, ov_cache_default),
            sessions_db: pick(&overrides.sessions_db, data_dir.join("sessions.db")),
            frontend_dir: exe_dir().join("frontend"),
        }
    }

    /// Create the directories the host writes into. Called once at startup;
    /// individual consumers still create their own subdirectories lazily.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            &self.data_dir,
            &self.logs_dir,
            &self.models_dir,
            &self.download_cache_dir,
            &self.ov_cache_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Path of the settings-schema file consulted by the resolver.
    pub fn settings_schema(&self) -> PathBuf {
        self.config_dir.join("model_settings.json")
    }

    /// Path of the persisted language preference.
    pub fn lang_file(&self) -> PathBuf {
        self.data_dir.join("lang.json")
    }

    /// Path of the legacy JSON session file imported on first run.
    pub fn legacy_sessions_file(&self) -> PathBuf {
        self.data_dir.join("sessions.json")
    }
}

/// Host/port the API server binds. Loopback by default; the desktop
/// shell embeds the endpoint and nothing else should reach it.
pub fn server_addr() -> (String, u16) {
    let host = env::var("IDLE_NPU_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = env::var("IDLE_NPU_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    (host, port)
}

/// Knobs for the optional NPU performance-counter monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub counter_path: Option<PathBuf>,
    pub fast_timeout: f64,
    pub deep_scan: bool,
    pub retry_interval: f64,
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        MonitorConfig {
            counter_path: env::var("IDLE_NPU_COUNTER_PATH")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(|v| expand_path(&v)),
            fast_timeout: env_f64("IDLE_NPU_MONITOR_FAST_TIMEOUT", 2.0),
            deep_scan: env_bool("IDLE_NPU_MONITOR_DEEP_SCAN", false),
            retry_interval: env_f64("IDLE_NPU_MONITOR_RETRY_INTERVAL", 30.0),
        }
    }
}

/// Parse a boolean-ish env var: 1/true/yes/on (case-insensitive).
pub fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn data_dir_from_env() -> Option<PathBuf> {
    env::var(ENV_DATA_DIR)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(|v| expand_path(&v))
}

fn default_data_dir() -> PathBuf {
    exe_dir().join("data")
}

fn exe_dir() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn load_overrides(path: &Path) -> PathOverrides {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return PathOverrides::default();
    };
    serde_json::from_str(&raw).unwrap_or_default()
}

/// Expand `~` and `$VAR` / `${VAR}` references in a user-supplied path.
/// Unknown variables expand to the empty string.
pub fn expand_path(raw: &str) -> PathBuf {
    let mut s = raw.trim().to_string();

    if s == "~" || s.starts_with("~/") || s.starts_with("~\\") {
        if let Some(home) = home_dir() {
            s = format!("{}{}", home, &s[1..]);
        }
    }

    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }
        let mut name = String::new();
        while let Some(&n) = chars.peek() {
            if n.is_alphanumeric() || n == '_' {
                name.push(n);
                chars.next();
            } else {
                break;
            }
        }
        if braced && chars.peek() == Some(&'}') {
            chars.next();
        }
        if name.is_empty() {
            out.push('$');
        } else if let Ok(value) = env::var(&name) {
            out.push_str(&value);
        }
    }

    PathBuf::from(out)
}

fn home_dir() -> Option<String> {
    env::var("HOME").ok().or_else(|| env::var("USERPROFILE").ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::resolve_from(dir.path());

        assert_eq!(paths.models_dir, dir.path().join("models"));
        assert_eq!(paths.download_cache_dir, dir.path().join(".download_temp"));
        assert_eq!(paths.sessions_db, dir.path().join("sessions.db"));
        assert_eq!(paths.logs_dir, dir.path());
    }

    #[test]
    fn test_overrides_applied() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("paths.json"),
            r#"{"models_dir": "/opt/ov-models", "sessions_db": "/var/lib/host/s.db"}"#,
        )
        .unwrap();

        let paths = AppPaths::resolve_from(dir.path());
        assert_eq!(paths.models_dir, PathBuf::from("/opt/ov-models"));
        assert_eq!(paths.sessions_db, PathBuf::from("/var/lib/host/s.db"));
        // Untouched entries keep their defaults
        assert_eq!(paths.download_cache_dir, dir.path().join(".download_temp"));
    }

    #[test]
    fn test_malformed_overrides_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("paths.json"), "{not json").unwrap();

        let paths = AppPaths::resolve_from(dir.path());
        assert_eq!(paths.models_dir, dir.path().join("models"));
    }

    #[test]
    fn test_expand_env_var() {
        std::env::set_var("IDLE_NPU_TEST_ROOT", "/srv/idle");
        assert_eq!(
            expand_path("$IDLE_NPU_TEST_ROOT/models"),
            PathBuf::from("/srv/idle/models")
        );
        assert_eq!(
            expand_path("${IDLE_NPU_TEST_ROOT}/cache"),
            PathBuf::from("/srv/idle/cache")
        );
    }

    #[test]
    fn test_expand_tilde() {
        if let Some(home) = home_dir() {
            let expanded = expand_path("~/models");
            assert_eq!(expanded, PathBuf::from(format!("{home}/models")));
        }
    }

    #[test]
    fn test_unknown_var_expands_empty() {
        assert_eq!(
            expand_path("$IDLE_NPU_DOES_NOT_EXIST_123/x"),
            PathBuf::from("/x")
        );
    }
}

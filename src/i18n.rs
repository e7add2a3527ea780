// Language preference and embedded translation dictionaries.

use std::path::Path;

use serde_json::json;

pub const DEFAULT_LANG: &str = "en_US";
pub const AVAILABLE_LANGS: &[&str] = &["en_US", "zh_CN"];

const EN_US: &str = include_str!("../assets/lang/en_US.json");
const ZH_CN: &str = include_str!("../assets/lang/zh_CN.json");

/// Raw dictionary JSON for a supported language.
pub fn dictionary(lang: &str) -> Option<&'static str> {
    match lang {
        "en_US" => Some(EN_US),
        "zh_CN" => Some(ZH_CN),
        _ => None,
    }
}

pub fn is_supported(lang: &str) -> bool {
    AVAILABLE_LANGS.contains(&lang)
}

/// Load the persisted preference; unknown or unreadable values fall back
/// to the default.
pub fn load_saved_lang(lang_file: &Path) -> String {
    let Ok(raw) = std::fs::read_to_string(lang_file) else {
        return DEFAULT_LANG.to_string();
    };
    let lang = serde_json::from_str::<serde_json::Value>(&raw)
        .ok()
        .and_then(|v| v.get("lang").and_then(|l| l.as_str()).map(str::to_string));
    match lang {
        Some(lang) if is_supported(&lang) => lang,
        _ => DEFAULT_LANG.to_string(),
    }
}

/// Persist the preference; write failures are non-fatal.
pub fn save_lang(lang_file: &Path, lang: &str) {
    if let Some(parent) = lang_file.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::fs::write(lang_file, json!({ "lang": lang }).to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dictionaries_parse() {
        for lang in AVAILABLE_LANGS {
            let raw = dictionary(lang).unwrap();
            let parsed: serde_json::Value = serde_json::from_str(raw).unwrap();
            assert!(parsed.get("grp_generation").is_some(), "{lang} incomplete");
        }
    }

    #[test]
    fn test_dictionaries_share_keys() {
        let en: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(EN_US).unwrap();
        let zh: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(ZH_CN).unwrap();
        for key in en.keys() {
            assert!(zh.contains_key(key), "zh_CN missing {key}");
        }
        assert_eq!(en.len(), zh.len());
    }

    #[test]
    fn test_lang_roundtrip_and_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("lang.json");

        assert_eq!(load_saved_lang(&file), DEFAULT_LANG);

        save_lang(&file, "zh_CN");
        assert_eq!(load_saved_lang(&file), "zh_CN");

        std::fs::write(&file, r#"{"lang": "fr_FR"}"#).unwrap();
        assert_eq!(load_saved_lang(&file), DEFAULT_LANG);

        std::fs::write(&file, "{garbage").unwrap();
        assert_eq!(load_saved_lang(&file), DEFAULT_LANG);
    }
}

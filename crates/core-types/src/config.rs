//! Persistent configuration: the system-volume scan allowlist plus
//! per-session tunables, stored as a single JSON document under the
//! user's local application data directory.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const HISTORY_CAP: usize = 20;

/// Root configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub c_scan_paths: CScanPaths,
    /// When set, keywords match against the full path in addition to the
    /// file name.
    #[serde(default = "default_everything_mode")]
    pub everything_mode: bool,
    #[serde(default = "default_page_size")]
    pub results_page_size: usize,
    #[serde(default)]
    pub search_history: Vec<String>,
    #[serde(default)]
    pub saved_searches: Vec<SavedSearch>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            c_scan_paths: CScanPaths::default(),
            everything_mode: default_everything_mode(),
            results_page_size: default_page_size(),
            search_history: Vec::new(),
            saved_searches: Vec::new(),
        }
    }
}

fn default_everything_mode() -> bool {
    true
}

fn default_page_size() -> usize {
    200
}

/// Allowlist of system-volume roots eligible for indexing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CScanPaths {
    #[serde(default)]
    pub initialized: bool,
    #[serde(default)]
    pub paths: Vec<AllowEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowEntry {
    pub path: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedSearch {
    pub name: String,
    pub query: String,
}

impl AppConfig {
    /// Enabled allowlist roots, environment-expanded.
    ///
    /// Until the user has curated the list (`initialized == false`), the
    /// built-in defaults apply instead of the stored entries.
    pub fn enabled_scan_roots(&self) -> Vec<String> {
        let entries = if self.c_scan_paths.initialized {
            self.c_scan_paths.paths.clone()
        } else {
            default_c_paths()
        };
        entries
            .into_iter()
            .filter(|e| e.enabled)
            .map(|e| expand_env_vars(&e.path))
            .collect()
    }

    /// Record a query in the history: most recent first, deduplicated,
    /// capped.
    pub fn add_history(&mut self, query: &str) {
        if query.is_empty() {
            return;
        }
        self.search_history.retain(|h| h != query);
        self.search_history.insert(0, query.to_string());
        self.search_history.truncate(HISTORY_CAP);
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("write config {}", path.display()))
    }
}

/// Built-in allowlist defaults for a fresh install. Only directories that
/// actually exist survive.
pub fn default_c_paths() -> Vec<AllowEntry> {
    let candidates = [
        "%TEMP%",
        "%APPDATA%\\Microsoft\\Windows\\Recent",
        "%USERPROFILE%\\Desktop",
        "%USERPROFILE%\\Documents",
        "%USERPROFILE%\\Downloads",
    ];
    let mut out = Vec::new();
    for raw in candidates {
        let expanded = expand_env_vars(raw);
        if expanded.contains('%') {
            continue; // unresolved token; not this platform
        }
        if Path::new(&expanded).is_dir() && !out.iter().any(|e: &AllowEntry| e.path == expanded) {
            out.push(AllowEntry {
                path: expanded,
                enabled: true,
            });
        }
    }
    out
}

/// Load the config file, writing a default one if none exists yet.
pub fn load_or_create(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        let cfg = AppConfig::default();
        cfg.save(path)?;
        return Ok(cfg);
    }
    load_config(path)
}

pub fn load_config(path: &Path) -> Result<AppConfig> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let cfg: AppConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config {}", path.display()))?;
    Ok(cfg)
}

/// Expand `$VAR` and `%VAR%` environment tokens. `%VAR%` lookup is
/// case-insensitive; unknown tokens are preserved verbatim.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = input.to_string();

    if result.contains('$') {
        for (key, value) in std::env::vars() {
            let token = format!("${key}");
            if result.contains(&token) {
                result = result.replace(&token, &value);
            }
        }
    }

    if result.contains('%') {
        use std::collections::HashMap;
        let mut env_map: HashMap<String, String> = HashMap::new();
        for (k, v) in std::env::vars() {
            env_map.insert(k.to_ascii_uppercase(), v);
        }

        let mut out = String::with_capacity(result.len());
        let mut chars = result.chars().peekable();
        while let Some(ch) = chars.next() {
            if ch == '%' {
                let mut name = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '%' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if name.is_empty() || !closed {
                    out.push('%');
                    out.push_str(&name);
                    continue;
                }
                match env_map.get(&name.to_ascii_uppercase()) {
                    Some(val) => out.push_str(val),
                    None => {
                        out.push('%');
                        out.push_str(&name);
                        out.push('%');
                    }
                }
            } else {
                out.push(ch);
            }
        }
        result = out;
    }

    result
}

/// Per-install data directory, resolved once at startup and injected.
pub fn data_dir() -> PathBuf {
    if let Ok(local) = std::env::var("LOCALAPPDATA") {
        return PathBuf::from(local).join("FlashFind");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/share/flashfind");
    }
    PathBuf::from("flashfind-data")
}

pub fn default_config_path() -> PathBuf {
    data_dir().join("config.json")
}

/// Directory holding the persisted per-volume index files.
pub fn index_dir() -> PathBuf {
    data_dir().join("index")
}

/// Persisted index file for one volume: `index/<drive>.bin`.
pub fn index_file_path(dir: &Path, drive: char) -> PathBuf {
    dir.join(format!("{}.bin", drive.to_ascii_uppercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_product_contract() {
        let cfg = AppConfig::default();
        assert!(cfg.everything_mode);
        assert_eq!(cfg.results_page_size, 200);
        assert!(!cfg.c_scan_paths.initialized);
    }

    #[test]
    fn history_dedupes_and_caps() {
        let mut cfg = AppConfig::default();
        for i in 0..30 {
            cfg.add_history(&format!("query {i}"));
        }
        cfg.add_history("query 25");
        assert_eq!(cfg.search_history.len(), HISTORY_CAP);
        assert_eq!(cfg.search_history[0], "query 25");
        assert_eq!(cfg.search_history.iter().filter(|h| *h == "query 25").count(), 1);
    }

    #[test]
    fn env_expansion_both_styles() {
        std::env::set_var("FLASHFIND_TEST_DIR", "/tmp/ff");
        assert_eq!(expand_env_vars("$FLASHFIND_TEST_DIR/x"), "/tmp/ff/x");
        assert_eq!(expand_env_vars("%FLASHFIND_TEST_DIR%\\x"), "/tmp/ff\\x");
        assert_eq!(expand_env_vars("%flashfind_test_dir%"), "/tmp/ff");
        assert_eq!(expand_env_vars("%NO_SUCH_TOKEN_HERE%"), "%NO_SUCH_TOKEN_HERE%");
        assert_eq!(expand_env_vars("50%"), "50%");
    }

    #[test]
    fn allowlist_parses_spec_document() {
        let raw = r#"{ "c_scan_paths": { "initialized": true,
                        "paths": [ {"path": "C:\\Users\\me\\Documents", "enabled": true},
                                   {"path": "C:\\Temp", "enabled": false} ] } }"#;
        let cfg: AppConfig = serde_json::from_str(raw).unwrap();
        let roots = cfg.enabled_scan_roots();
        assert_eq!(roots, vec!["C:\\Users\\me\\Documents".to_string()]);
    }

    #[test]
    fn uninitialized_allowlist_falls_back_to_defaults() {
        let cfg = AppConfig::default();
        // Defaults are filtered by existence; on any platform the call
        // simply must not read the (empty) stored list.
        let _ = cfg.enabled_scan_roots();
        assert!(!cfg.c_scan_paths.initialized);
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut cfg = AppConfig::default();
        cfg.everything_mode = false;
        cfg.add_history("readme !old");
        cfg.save(&path).unwrap();

        let back = load_config(&path).unwrap();
        assert!(!back.everything_mode);
        assert_eq!(back.search_history, vec!["readme !old".to_string()]);
    }

    #[test]
    fn load_or_create_writes_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let cfg = load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(cfg.results_page_size, 200);
    }

    #[test]
    fn index_file_path_uses_drive_letter() {
        let p = index_file_path(Path::new("idx"), 'd');
        assert!(p.to_string_lossy().ends_with("D.bin"));
    }
}

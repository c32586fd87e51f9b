//! Oracle provider configuration.
//!
//! Stored per-repository at `.operon/llm_config.json` and re-read on every
//! oracle call so edits take effect without restarting a run.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::util::write_atomic;

const CONFIG_FILE: &str = "llm_config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_s: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            model: "qwen2.5-coder-7b".to_string(),
            api_key: None,
            base_url: "http://127.0.0.1:8080/v1/chat/completions".to_string(),
            temperature: 0.1,
            max_tokens: 3072,
            timeout_s: 180,
        }
    }
}

impl LlmConfig {
    pub fn path(repo_root: &Path) -> PathBuf {
        repo_root.join(".operon").join(CONFIG_FILE)
    }

    /// Load config from the repo, or return defaults.
    ///
    /// A config that fails to parse is preserved aside (`.json.corrupt`) so
    /// the user can recover it; defaults are used for the run.
    pub fn load(repo_root: &Path) -> Self {
        let path = Self::path(repo_root);
        if let Ok(content) = fs::read_to_string(&path) {
            match serde_json::from_str(&content) {
                Ok(config) => return config,
                Err(err) => {
                    preserve_corrupt_config(&path, &content);
                    tracing::warn!(
                        "llm_config.json was corrupted ({}); backup saved, defaults loaded",
                        err
                    );
                }
            }
        }
        Self::default()
    }

    pub fn save(&self, repo_root: &Path) -> anyhow::Result<()> {
        let path = Self::path(repo_root);
        let content = serde_json::to_string_pretty(self)?;
        write_atomic(&path, &content)?;
        Ok(())
    }

    /// Whether the API key / endpoint looks usable at all.
    pub fn is_configured(&self) -> bool {
        !self.base_url.trim().is_empty()
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

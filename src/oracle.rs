//! The language-model oracle.
//!
//! The core treats the model as an opaque `prompt -> text` contract. The
//! single trait here is the seam: the phase machine, planner and reviewer
//! only ever see `&dyn Oracle`, so tests inject scripted oracles and the
//! HTTP transport stays at the edge.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::LlmConfig;

/// Retry configuration for transport-level failures.
const MAX_RETRIES: u32 = 2;
const INITIAL_BACKOFF_MS: u64 = 1500;

/// How many times a `require_json` caller may re-ask after a parse failure.
pub const JSON_RETRIES: u32 = 2;

pub const SYSTEM_PROMPT: &str = "You are Operon, an autonomous software engineering agent. \
Think step-by-step. Never claim a file was patched unless a write tool ran. \
Always output valid JSON when asked, with no markdown fences.";

/// The `prompt -> text` contract. Input must never be truncated.
pub trait Oracle {
    fn call(&self, prompt: &str, require_json: bool) -> anyhow::Result<String>;
}

// ── HTTP transport ───────────────────────────────────────────────────────────

/// OpenAI-compatible chat-completions client (llama.cpp, Ollama, gateways).
///
/// Reloads `.operon/llm_config.json` on every call.
pub struct HttpOracle {
    repo_root: PathBuf,
}

impl HttpOracle {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: String,
}

impl Oracle for HttpOracle {
    fn call(&self, prompt: &str, require_json: bool) -> anyhow::Result<String> {
        let config = LlmConfig::load(&self.repo_root);

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_s))
            .build()
            .context("Failed to build HTTP client")?;

        let response_format = if require_json {
            Some(ResponseFormat {
                format_type: "json_object".to_string(),
            })
        } else {
            None
        };

        let request = ChatRequest {
            model: config.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            response_format,
        };

        let mut last_error = String::new();
        for attempt in 0..=MAX_RETRIES {
            let mut builder = client.post(&config.base_url).json(&request);
            if let Some(key) = &config.api_key {
                builder = builder.header("Authorization", format!("Bearer {}", key));
            }

            let response = match builder.send() {
                Ok(r) => r,
                Err(err) => {
                    last_error = err.to_string();
                    tracing::warn!(
                        "oracle transport error (attempt {}/{}): {}",
                        attempt + 1,
                        MAX_RETRIES + 1,
                        last_error
                    );
                    backoff(attempt);
                    continue;
                }
            };

            let status = response.status();
            let text = response.text().unwrap_or_default();

            if status.is_success() {
                let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
                    anyhow::anyhow!("Failed to parse oracle response: {}\n{}", e, text)
                })?;
                let content = parsed
                    .choices
                    .first()
                    .map(|c| c.message.content.trim().to_string())
                    .unwrap_or_default();
                if content.is_empty() {
                    return Err(anyhow::anyhow!("Oracle returned an empty response"));
                }
                return Ok(content);
            }

            last_error = format!("HTTP {}: {}", status, crate::util::truncate(&text, 200));

            // Rate limits and server hiccups are retryable; client errors not.
            if (status.as_u16() == 429 || status.is_server_error()) && attempt < MAX_RETRIES {
                tracing::warn!(
                    "oracle unavailable (attempt {}/{}): {}",
                    attempt + 1,
                    MAX_RETRIES + 1,
                    last_error
                );
                backoff(attempt);
                continue;
            }
            break;
        }

        Err(anyhow::anyhow!("oracle_unavailable: {}", last_error))
    }
}

fn backoff(attempt: u32) {
    let delay = INITIAL_BACKOFF_MS * (attempt as u64 + 1);
    std::thread::sleep(Duration::from_millis(delay));
}

// ── JSON extraction ──────────────────────────────────────────────────────────

/// Strip markdown code fences from a response.
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = if trimmed.starts_with("```json") {
        trimmed.strip_prefix("```json").unwrap_or(trimmed)
    } else if trimmed.starts_with("```") {
        trimmed.strip_prefix("```").unwrap_or(trimmed)
    } else {
        trimmed
    };
    let clean = if clean.ends_with("```") {
        clean.strip_suffix("```").unwrap_or(clean)
    } else {
        clean
    };
    clean.trim()
}

fn extract_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if start <= end {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Extract the first JSON object or array from oracle output.
///
/// Tolerant of fenced code blocks and surrounding prose. Returns the raw
/// fragment; callers deserialize it.
pub fn extract_json(text: &str) -> Option<String> {
    let clean = strip_markdown_fences(text);

    let obj = extract_fragment(clean, '{', '}');
    let arr = extract_fragment(clean, '[', ']');

    // Prefer whichever fragment starts first; a top-level array response
    // must not be swallowed by a brace inside it, and vice versa.
    let fragment = match (obj, arr) {
        (Some(o), Some(a)) => {
            let o_at = clean.find('{').unwrap_or(usize::MAX);
            let a_at = clean.find('[').unwrap_or(usize::MAX);
            if a_at < o_at {
                a
            } else {
                o
            }
        }
        (Some(o), None) => o,
        (None, Some(a)) => a,
        (None, None) => return None,
    };

    Some(fragment.to_string())
}

/// Ask the oracle for JSON and deserialize it, re-prompting on parse failure.
pub fn query_json<T: serde::de::DeserializeOwned>(
    oracle: &dyn Oracle,
    prompt: &str,
) -> anyhow::Result<T> {
    let mut last_error = String::new();
    for attempt in 0..=JSON_RETRIES {
        let response = oracle.call(prompt, true)?;
        let Some(fragment) = extract_json(&response) else {
            last_error = "no JSON object or array in response".to_string();
            tracing::debug!("oracle JSON miss (attempt {}): {}", attempt + 1, last_error);
            continue;
        };
        match serde_json::from_str::<T>(&fragment) {
            Ok(value) => return Ok(value),
            Err(err) => {
                last_error = err.to_string();
                tracing::debug!("oracle JSON parse failure (attempt {}): {}", attempt + 1, err);
            }
        }
    }
    Err(anyhow::anyhow!(
        "Oracle did not produce parseable JSON after {} attempts: {}",
        JSON_RETRIES + 1,
        last_error
    ))
}

#[cfg(test)]
pub mod testing {
    use super::Oracle;
    use std::cell::RefCell;

    /// Scripted oracle: returns canned responses in order, repeating the
    /// last one when exhausted.
    pub struct ScriptedOracle {
        responses: RefCell<Vec<String>>,
        pub calls: RefCell<Vec<String>>,
    }

    impl ScriptedOracle {
        pub fn new(responses: Vec<&str>) -> Self {
            let mut rs: Vec<String> = responses.into_iter().map(String::from).collect();
            rs.reverse();
            Self {
                responses: RefCell::new(rs),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl Oracle for ScriptedOracle {
        fn call(&self, prompt: &str, _require_json: bool) -> anyhow::Result<String> {
            self.calls.borrow_mut().push(prompt.to_string());
            let mut responses = self.responses.borrow_mut();
            if responses.len() > 1 {
                Ok(responses.pop().unwrap())
            } else {
                responses
                    .last()
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("oracle_unavailable: script exhausted"))
            }
        }
    }
}

// Engine configuration
// Defaults match the production bounds; JSON file and env vars override them.

use crate::types::Language;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

/// When pre-supplied stdin is handed to a running process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    /// Prompt detection with a timed fallback
    #[default]
    Heuristic,
    /// Only explicit input prompts trigger delivery
    Strict,
    /// Deliver as soon as the process starts
    Immediate,
}

impl FromStr for InputMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "heuristic" => Ok(InputMode::Heuristic),
            "strict" => Ok(InputMode::Strict),
            "immediate" => Ok(InputMode::Immediate),
            other => bail!("Unknown input mode: {}", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scratch_root: PathBuf,
    pub compile_timeout_ms: u64,
    pub run_timeout_ms: u64,
    pub container_timeout_ms: u64,
    pub input_mode: InputMode,
    pub input_fallback_ms: u64,
    pub prompt_settle_ms: u64,
    pub memory_limit_mb: u32,
    pub memory_swap_mb: u32,
    pub docker_host: Option<String>,
    pub image_overrides: HashMap<Language, String>,
    pub max_source_bytes: usize,
    pub max_stdin_bytes: usize,
    /// Per-stream capture cap; the rest of the stream is read and discarded
    pub max_output_bytes: usize,
    pub redis_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scratch_root: std::env::temp_dir().join("codeverse"),
            compile_timeout_ms: 10_000,
            run_timeout_ms: 15_000,
            container_timeout_ms: 10_000,
            input_mode: InputMode::Heuristic,
            input_fallback_ms: 1_500,
            prompt_settle_ms: 100,
            memory_limit_mb: 256,
            memory_swap_mb: 512,
            docker_host: None,
            image_overrides: HashMap::new(),
            max_source_bytes: 1024 * 1024,
            max_stdin_bytes: 10 * 1024 * 1024,
            max_output_bytes: 1024 * 1024,
            redis_url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Engine config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    /// Defaults with `CODEVERSE_*` environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply environment overrides on top of the current values
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(root) = lookup("CODEVERSE_SCRATCH_ROOT") {
            self.scratch_root = PathBuf::from(root);
        }
        override_ms(&lookup, "CODEVERSE_COMPILE_TIMEOUT_MS", &mut self.compile_timeout_ms);
        override_ms(&lookup, "CODEVERSE_RUN_TIMEOUT_MS", &mut self.run_timeout_ms);
        override_ms(&lookup, "CODEVERSE_CONTAINER_TIMEOUT_MS", &mut self.container_timeout_ms);
        override_ms(&lookup, "CODEVERSE_INPUT_FALLBACK_MS", &mut self.input_fallback_ms);

        if let Some(raw) = lookup("CODEVERSE_MAX_OUTPUT_BYTES") {
            match raw.trim().parse::<usize>() {
                Ok(value) => self.max_output_bytes = value,
                Err(_) => warn!(key = "CODEVERSE_MAX_OUTPUT_BYTES", value = %raw, "Ignoring non-numeric override"),
            }
        }

        if let Some(mode) = lookup("CODEVERSE_INPUT_MODE") {
            match mode.parse() {
                Ok(mode) => self.input_mode = mode,
                Err(e) => warn!(error = %e, "Ignoring CODEVERSE_INPUT_MODE"),
            }
        }
        if let Some(host) = lookup("DOCKER_HOST") {
            self.docker_host = Some(host);
        }
        if let Some(url) = lookup("REDIS_URL") {
            self.redis_url = url;
        }
    }

    /// Container image for a language, if overridden
    pub fn image_override(&self, language: Language) -> Option<&str> {
        self.image_overrides.get(&language).map(String::as_str)
    }
}

fn override_ms(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut u64) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<u64>() {
            Ok(value) => *target = value,
            Err(_) => warn!(key = key, value = %raw, "Ignoring non-numeric override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_bounds() {
        let config = EngineConfig::default();
        assert_eq!(config.compile_timeout_ms, 10_000);
        assert_eq!(config.run_timeout_ms, 15_000);
        assert_eq!(config.container_timeout_ms, 10_000);
        assert_eq!(config.input_fallback_ms, 1_500);
        assert_eq!(config.memory_limit_mb, 256);
        assert_eq!(config.memory_swap_mb, 512);
        assert_eq!(config.input_mode, InputMode::Heuristic);
        assert_eq!(config.max_output_bytes, 1024 * 1024);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"run_timeout_ms": 2000, "input_mode": "strict", "image_overrides": {"python": "python:3.12-alpine"}}"#,
        )
        .unwrap();
        assert_eq!(config.run_timeout_ms, 2000);
        assert_eq!(config.compile_timeout_ms, 10_000);
        assert_eq!(config.input_mode, InputMode::Strict);
        assert_eq!(config.image_override(Language::Python), Some("python:3.12-alpine"));
        assert_eq!(config.image_override(Language::Java), None);
    }

    #[test]
    fn test_overrides_ignore_garbage() {
        let mut config = EngineConfig::default();
        config.apply_overrides(|key| match key {
            "CODEVERSE_RUN_TIMEOUT_MS" => Some("500".to_string()),
            "CODEVERSE_COMPILE_TIMEOUT_MS" => Some("soon".to_string()),
            "CODEVERSE_INPUT_MODE" => Some("Immediate".to_string()),
            "DOCKER_HOST" => Some("localhost:2375".to_string()),
            "CODEVERSE_MAX_OUTPUT_BYTES" => Some("4096".to_string()),
            _ => None,
        });
        assert_eq!(config.max_output_bytes, 4096);
        assert_eq!(config.run_timeout_ms, 500);
        assert_eq!(config.compile_timeout_ms, 10_000);
        assert_eq!(config.input_mode, InputMode::Immediate);
        assert_eq!(config.docker_host.as_deref(), Some("localhost:2375"));
    }

    #[test]
    fn test_load_missing_file() {
        let result = EngineConfig::load(Path::new("does/not/exist.json"));
        assert!(result.is_err());
    }
}

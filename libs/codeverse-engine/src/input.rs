// Input timing policies
// Decide when pre-supplied stdin is handed to a process that never sees a keyboard.

use codeverse_common::config::{EngineConfig, InputMode};
use std::sync::Arc;
use std::time::Duration;

/// Phrases that mark a program as waiting for input
pub const PROMPT_VOCABULARY: &[&str] = &[
    "enter your name",
    "enter name",
    "input",
    "please enter",
    "enter value",
    "provide input",
    "enter data",
];

/// Policy consulted by the process runner while it streams stdout.
///
/// Delivery happens at most once: either `settle_delay` after the first
/// chunk for which `is_prompt` holds, or when `fallback_delay` elapses from
/// process start, whichever comes first.
pub trait InputTiming: Send + Sync {
    fn is_prompt(&self, chunk: &str) -> bool;

    fn settle_delay(&self) -> Duration;

    /// `None` waits for a prompt forever
    fn fallback_delay(&self) -> Option<Duration>;
}

fn mentions_vocabulary(lower: &str) -> bool {
    PROMPT_VOCABULARY.iter().any(|phrase| lower.contains(phrase))
}

/// Vocabulary or prompt punctuation, with a timed fallback.
///
/// Ordinary output that happens to contain `:` `>` or `?` (a URL, a
/// comparison) also counts as a prompt and triggers an early send.
#[derive(Debug, Clone)]
pub struct PromptHeuristic {
    pub settle: Duration,
    pub fallback: Duration,
}

impl Default for PromptHeuristic {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(100),
            fallback: Duration::from_millis(1500),
        }
    }
}

impl InputTiming for PromptHeuristic {
    fn is_prompt(&self, chunk: &str) -> bool {
        let lower = chunk.to_lowercase();
        mentions_vocabulary(&lower)
            || chunk.contains(':')
            || chunk.contains('>')
            || chunk.contains('?')
            || lower.contains("enter")
    }

    fn settle_delay(&self) -> Duration {
        self.settle
    }

    fn fallback_delay(&self) -> Option<Duration> {
        Some(self.fallback)
    }
}

/// Only explicit prompt phrases count; no fallback
#[derive(Debug, Clone)]
pub struct StrictPrompt {
    pub settle: Duration,
}

impl Default for StrictPrompt {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(100),
        }
    }
}

impl InputTiming for StrictPrompt {
    fn is_prompt(&self, chunk: &str) -> bool {
        mentions_vocabulary(&chunk.to_lowercase())
    }

    fn settle_delay(&self) -> Duration {
        self.settle
    }

    fn fallback_delay(&self) -> Option<Duration> {
        None
    }
}

/// Hand stdin over as soon as the process starts
#[derive(Debug, Clone, Default)]
pub struct ImmediateInput;

impl InputTiming for ImmediateInput {
    fn is_prompt(&self, _chunk: &str) -> bool {
        false
    }

    fn settle_delay(&self) -> Duration {
        Duration::ZERO
    }

    fn fallback_delay(&self) -> Option<Duration> {
        Some(Duration::ZERO)
    }
}

/// Policy selected by `input_mode`
pub fn input_timing(config: &EngineConfig) -> Arc<dyn InputTiming> {
    let settle = Duration::from_millis(config.prompt_settle_ms);
    match config.input_mode {
        InputMode::Heuristic => Arc::new(PromptHeuristic {
            settle,
            fallback: Duration::from_millis(config.input_fallback_ms),
        }),
        InputMode::Strict => Arc::new(StrictPrompt { settle }),
        InputMode::Immediate => Arc::new(ImmediateInput),
    }
}

/// Bytes actually written to the child: the text plus a terminating newline
pub fn stdin_payload(stdin: &str) -> Option<Vec<u8>> {
    if stdin.is_empty() {
        return None;
    }
    let mut payload = stdin.as_bytes().to_vec();
    if !stdin.ends_with('\n') {
        payload.push(b'\n');
    }
    Some(payload)
}

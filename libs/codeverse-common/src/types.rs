use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type RunId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Java,
    C,
    Cpp,
    Javascript,
}

impl Language {
    pub const ALL: [Language; 5] = [
        Language::Python,
        Language::Java,
        Language::C,
        Language::Cpp,
        Language::Javascript,
    ];

    /// Lenient lookup used by the engine surface.
    /// Anything unrecognised runs as python; callers that need strict
    /// validation parse with `FromStr` first.
    pub fn resolve(name: &str) -> Language {
        name.parse().unwrap_or(Language::Python)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Java => "java",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Javascript => "javascript",
        }
    }

    /// Whether the language has a compile phase before running
    pub fn is_compiled(&self) -> bool {
        matches!(self, Language::Java | Language::C | Language::Cpp)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLanguage(pub String);

impl fmt::Display for UnknownLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported language: {}", self.0)
    }
}

impl std::error::Error for UnknownLanguage {}

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" | "py" => Ok(Language::Python),
            "java" => Ok(Language::Java),
            "c" => Ok(Language::C),
            "cpp" | "c++" => Ok(Language::Cpp),
            "javascript" | "js" | "node" => Ok(Language::Javascript),
            _ => Err(UnknownLanguage(s.to_string())),
        }
    }
}

/// One code submission. Immutable once handed to a runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub language: Language,
    pub source_code: String,
    #[serde(default)]
    pub stdin: String,
}

impl ExecutionRequest {
    pub fn new(language: Language, source_code: impl Into<String>, stdin: impl Into<String>) -> Self {
        Self {
            language,
            source_code: source_code.into(),
            stdin: stdin.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Done,
    Error,
}

/// Which failure branch produced an `Error` status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Compile,
    Runtime,
    Timeout,
}

/// Terminal outcome of one execution. Produced exactly once per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub status: ExecutionStatus,
    pub exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn done(stdout: String, stderr: String, exit_code: Option<i64>) -> Self {
        Self {
            stdout,
            stderr,
            status: ExecutionStatus::Done,
            exit_code,
            failure: None,
            duration_ms: 0,
        }
    }

    pub fn compile_error(diagnostic: String) -> Self {
        Self {
            stdout: String::new(),
            stderr: diagnostic,
            status: ExecutionStatus::Error,
            exit_code: None,
            failure: Some(FailureKind::Compile),
            duration_ms: 0,
        }
    }

    pub fn runtime_error(stdout: String, stderr: String, exit_code: Option<i64>) -> Self {
        Self {
            stdout,
            stderr,
            status: ExecutionStatus::Error,
            exit_code,
            failure: Some(FailureKind::Runtime),
            duration_ms: 0,
        }
    }

    pub fn timed_out(stdout: String, stderr: String, exit_code: Option<i64>) -> Self {
        Self {
            stdout,
            stderr,
            status: ExecutionStatus::Error,
            exit_code,
            failure: Some(FailureKind::Timeout),
            duration_ms: 0,
        }
    }

    /// Fold a raw exit code into the done/error shape.
    ///
    /// Backends that only know how the program exited (the container runner)
    /// go through here so every caller sees the same result type.
    pub fn from_exit_code(language: Language, stdout: String, stderr: String, exit_code: i64) -> Self {
        if exit_code == 0 {
            return Self::done(stdout, stderr, Some(0));
        }
        let stderr = if stderr.trim().is_empty() {
            exited_with_code(language, exit_code)
        } else {
            stderr
        };
        Self::runtime_error(stdout, stderr, Some(exit_code))
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Done
    }
}

/// Message used when a failed program wrote nothing to stderr
pub fn exited_with_code(language: Language, exit_code: i64) -> String {
    format!("{} execution failed: exited with code {}", language, exit_code)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Done,
    Error,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Error)
    }
}

impl From<ExecutionStatus> for RunStatus {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Done => RunStatus::Done,
            ExecutionStatus::Error => RunStatus::Error,
        }
    }
}

/// Persisted view of a queued execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub owner_id: String,
    pub language: Language,
    pub stdin: String,
    pub status: RunStatus,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn queued(run_id: RunId, owner_id: &str, language: Language, stdin: &str) -> Self {
        Self {
            run_id,
            owner_id: owner_id.to_string(),
            language,
            stdin: stdin.to_string(),
            status: RunStatus::Queued,
            stdout: None,
            stderr: None,
            exit_code: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Apply a status transition, stamping start/completion times
    pub fn apply(&mut self, update: RunUpdate) {
        let now = Utc::now();
        match update.status {
            RunStatus::Running => self.started_at = Some(now),
            status if status.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }
        self.status = update.status;
        if update.stdout.is_some() {
            self.stdout = update.stdout;
        }
        if update.stderr.is_some() {
            self.stderr = update.stderr;
        }
        if update.exit_code.is_some() {
            self.exit_code = update.exit_code;
        }
    }
}

/// Narrow write contract into a `RunRecord`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunUpdate {
    pub status: RunStatus,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i64>,
}

impl RunUpdate {
    pub fn running() -> Self {
        Self {
            status: RunStatus::Running,
            stdout: None,
            stderr: None,
            exit_code: None,
        }
    }

    pub fn finished(result: &ExecutionResult) -> Self {
        Self {
            status: result.status.into(),
            stdout: Some(result.stdout.clone()),
            stderr: Some(result.stderr.clone()),
            exit_code: result.exit_code,
        }
    }

    pub fn failed(message: String) -> Self {
        Self {
            status: RunStatus::Error,
            stdout: None,
            stderr: Some(message),
            exit_code: None,
        }
    }
}

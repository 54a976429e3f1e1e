// Runner capability shared by both execution backends

use crate::error::EngineError;
use async_trait::async_trait;
use codeverse_common::types::{ExecutionRequest, ExecutionResult, Language};

/// Anything that can compile (if needed) and run one submission.
///
/// Implementations fold compile errors, runtime errors and timeouts into the
/// returned `ExecutionResult`. `Err` is reserved for failures where nothing
/// could be executed at all (missing toolchain, unreachable container engine).
#[async_trait]
pub trait Runner: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, EngineError>;

    /// String-typed entry point; unknown languages run as python
    async fn run(&self, language: &str, source_code: &str, stdin: &str) -> Result<ExecutionResult, EngineError> {
        let request = ExecutionRequest::new(Language::resolve(language), source_code, stdin);
        self.execute(&request).await
    }
}

/// Reject pathological inputs before they reach a toolchain or container
pub(crate) fn check_limits(
    request: &ExecutionRequest,
    max_source_bytes: usize,
    max_stdin_bytes: usize,
) -> Result<(), EngineError> {
    if request.source_code.len() > max_source_bytes {
        return Err(EngineError::InvalidRequest(format!(
            "source code exceeds maximum size of {} bytes",
            max_source_bytes
        )));
    }
    if request.stdin.len() > max_stdin_bytes {
        return Err(EngineError::InvalidRequest(format!(
            "stdin exceeds maximum size of {} bytes",
            max_stdin_bytes
        )));
    }
    Ok(())
}

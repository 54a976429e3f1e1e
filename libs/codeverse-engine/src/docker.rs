/// Container-Backed Runner
///
/// **Execution Rules:**
/// 1. Pulls the language image if it is not cached locally
/// 2. Creates one container per execution:
///    - Network disabled (`network_mode = none`)
///    - Fixed memory ceiling with a larger swap ceiling
///    - No TTY; the source and stdin are uploaded as a tar archive before start,
///      so request size is never bounded by the exec argument limit
/// 3. Attaches to stdout/stderr before start so no output is lost
/// 4. Races the run against a wall-clock bound; on expiry the container is stopped
/// 5. Removes the container on every path, including cancellation
///
/// The raw container outcome is an exit code. `Runner::execute` folds it into
/// the shared done/error `ExecutionResult` so callers never see the difference.

use crate::error::EngineError;
use crate::input::stdin_payload;
use crate::output::CappedOutput;
use crate::registry::{self, LanguageSpec};
use crate::runner::{check_limits, Runner};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, UploadToContainerOptions,
    WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use codeverse_common::config::EngineConfig;
use codeverse_common::types::{ExecutionRequest, ExecutionResult};
use futures_util::stream::StreamExt;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Working directory inside every execution container
const CONTAINER_WORKDIR: &str = "/code";

/// Staged next to the source; the run step reads it as stdin
const STDIN_FILENAME: &str = ".stdin";

/// Exit code reported for a container stopped at the deadline
pub const TIMEOUT_EXIT_CODE: i64 = -1;

const DEFAULT_DOCKER_PORT: u16 = 2375;

const DOCKER_CLIENT_TIMEOUT_SECS: u64 = 120;

/// Raw outcome of one container run
#[derive(Debug, Clone)]
pub struct ContainerOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub timed_out: bool,
    pub execution_time_ms: u64,
}

impl ContainerOutput {
    /// Fold into the shared result shape
    pub fn into_result(self, request: &ExecutionRequest) -> ExecutionResult {
        let stdout = self.stdout.trim().to_string();
        let stderr = self.stderr.trim().to_string();
        let result = if self.timed_out {
            ExecutionResult::timed_out(stdout, stderr, Some(self.exit_code))
        } else {
            ExecutionResult::from_exit_code(request.language, stdout, stderr, self.exit_code)
        };
        result.with_duration(self.execution_time_ms)
    }
}

/// Container cleanup guard - guarantees container removal on drop
/// Covers panics and dropped futures; the normal path calls `release`.
struct ContainerGuard {
    docker: Docker,
    container_id: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(docker: &Docker, container_id: String) -> Self {
        Self {
            docker: docker.clone(),
            container_id,
            armed: true,
        }
    }

    /// Remove the container now and disarm the guard
    async fn release(mut self) {
        self.armed = false;
        remove_container(&self.docker, &self.container_id).await;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Cannot await in Drop; hand removal to the runtime if one is around
        let docker = self.docker.clone();
        let container_id = self.container_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    remove_container(&docker, &container_id).await;
                });
            }
            Err(_) => warn!(container_id = %container_id, "No runtime to remove container, leaking it"),
        }
    }
}

async fn remove_container(docker: &Docker, container_id: &str) {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };
    match docker.remove_container(container_id, Some(options)).await {
        Ok(()) => debug!(container_id = %container_id, "Container removed"),
        Err(e) => warn!(container_id = %container_id, error = %e, "Cleanup warning: failed to remove container"),
    }
}

/// Shell command run in the container: compile if needed, then run on the staged stdin
pub fn pipeline(spec: &LanguageSpec) -> String {
    let run = format!("{} < {}", spec.run.shell(), STDIN_FILENAME);
    match spec.compile {
        Some(compile) => format!("{} && {}", compile.shell(), run),
        None => run,
    }
}

/// Tar archive, rooted at `/`, holding the work directory, the source file and the stdin file
pub fn stage_archive(spec: &LanguageSpec, source_code: &str, stdin: &str) -> Result<Vec<u8>, EngineError> {
    let workdir = CONTAINER_WORKDIR.trim_start_matches('/');
    let mut builder = tar::Builder::new(Vec::new());

    // world-writable so images running as non-root can still write compile output
    let mut dir = tar::Header::new_gnu();
    dir.set_entry_type(tar::EntryType::Directory);
    dir.set_size(0);
    dir.set_mode(0o777);
    builder
        .append_data(&mut dir, format!("{}/", workdir), std::io::empty())
        .map_err(EngineError::Scratch)?;

    let stdin = stdin_payload(stdin).unwrap_or_default();
    let files: [(&str, &[u8]); 2] = [
        (spec.source_filename, source_code.as_bytes()),
        (STDIN_FILENAME, stdin.as_slice()),
    ];
    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, format!("{}/{}", workdir, name), contents)
            .map_err(EngineError::Scratch)?;
    }

    builder.into_inner().map_err(EngineError::Scratch)
}

/// Note appended to stderr when the container hits its bound
fn timeout_note(timeout_ms: u64) -> String {
    format!("Execution timeout ({} seconds)", timeout_ms as f64 / 1000.0)
}

/// `host`, `host:port` or a full URL → address bollard accepts
fn daemon_address(host: &str) -> String {
    let host = host.trim();
    if host.contains("://") {
        return host.to_string();
    }
    if host.contains(':') {
        format!("tcp://{}", host)
    } else {
        format!("tcp://{}:{}", host, DEFAULT_DOCKER_PORT)
    }
}

/// Runs submissions inside throwaway, network-isolated containers
pub struct DockerRunner {
    docker: Docker,
    config: EngineConfig,
}

impl DockerRunner {
    /// Connect to the daemon named by `docker_host`, or the local socket
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let docker = match config.docker_host.as_deref() {
            #[cfg(unix)]
            Some(socket) if socket.starts_with("unix://") => {
                Docker::connect_with_unix(socket, DOCKER_CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
            }
            Some(host) => Docker::connect_with_http(
                &daemon_address(host),
                DOCKER_CLIENT_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            )?,
            None => Docker::connect_with_local_defaults()?,
        };
        Ok(Self { docker, config })
    }

    /// Check the daemon is reachable
    pub async fn ping(&self) -> Result<(), EngineError> {
        self.docker.ping().await?;
        Ok(())
    }

    /// Docker image for a language, honouring configured overrides
    pub fn image_for(&self, spec: &LanguageSpec) -> String {
        self.config
            .image_override(spec.language)
            .unwrap_or(spec.container_image)
            .to_string()
    }

    fn container_config(&self, spec: &LanguageSpec) -> Config<String> {
        let memory = i64::from(self.config.memory_limit_mb) * 1024 * 1024;
        let memory_swap = i64::from(self.config.memory_swap_mb) * 1024 * 1024;

        Config {
            image: Some(self.image_for(spec)),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), pipeline(spec)]),
            working_dir: Some(CONTAINER_WORKDIR.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            open_stdin: Some(false),
            network_disabled: Some(true), // SECURITY: No network access
            host_config: Some(HostConfig {
                memory: Some(memory),
                memory_swap: Some(memory_swap),
                network_mode: Some("none".to_string()),
                // removal is owned by ContainerGuard so the exit code can still be read
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Ensure Docker image is available (pull if needed)
    async fn ensure_image(&self, image: &str) -> Result<(), EngineError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!("Image cache hit: {}", image);
            return Ok(());
        }

        warn!("Image cache miss: {} (pulling now)", image);
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result?;
        }

        info!("Image pulled successfully: {}", image);
        Ok(())
    }

    async fn upload_files(&self, container_id: &str, archive: Vec<u8>) -> Result<(), EngineError> {
        let options = UploadToContainerOptions {
            path: "/",
            ..Default::default()
        };
        self.docker
            .upload_to_container(container_id, Some(options), archive.into())
            .await?;
        debug!(container_id = %container_id, "Source and stdin staged");
        Ok(())
    }

    async fn wait_exit_code(&self, container_id: &str) -> Result<i64, EngineError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait_stream = self.docker.wait_container(container_id, Some(options));

        match wait_stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => {
                warn!(container_id = %container_id, "No wait response from container");
                Ok(TIMEOUT_EXIT_CODE)
            }
        }
    }

    /// Run one submission in a fresh container and report the raw outcome
    #[instrument(skip(self, request), fields(language = %request.language))]
    pub async fn execute_in_container(&self, request: &ExecutionRequest) -> Result<ContainerOutput, EngineError> {
        check_limits(request, self.config.max_source_bytes, self.config.max_stdin_bytes)?;

        let spec = registry::spec(request.language);
        let archive = stage_archive(spec, &request.source_code, &request.stdin)?;
        let image = self.image_for(spec);
        self.ensure_image(&image).await?;

        let container_name = format!("codeverse-{}", uuid::Uuid::new_v4());
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };
        let container = self
            .docker
            .create_container(Some(create_options), self.container_config(spec))
            .await?;
        let container_id = container.id.clone();

        // CRITICAL: guard first, so every later failure still removes the container
        let guard = ContainerGuard::new(&self.docker, container_id.clone());
        let outcome = async {
            self.upload_files(&container_id, archive).await?;
            self.attach_and_run(&container_id).await
        }
        .await;
        guard.release().await;

        let output = outcome?;
        info!(
            container = %container_name,
            exit_code = output.exit_code,
            timed_out = output.timed_out,
            execution_ms = output.execution_time_ms,
            "Container execution completed"
        );
        Ok(output)
    }

    async fn attach_and_run(&self, container_id: &str) -> Result<ContainerOutput, EngineError> {
        let attach_options = AttachContainerOptions::<String> {
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            ..Default::default()
        };
        let AttachContainerResults { mut output, .. } = self
            .docker
            .attach_container(container_id, Some(attach_options))
            .await?;

        let start_time = Instant::now();
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;

        let bound = Duration::from_millis(self.config.container_timeout_ms);
        let mut stdout = CappedOutput::new(self.config.max_output_bytes);
        let mut stderr = CappedOutput::new(self.config.max_output_bytes);

        let execution = async {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => stdout.push(&message),
                    Ok(LogOutput::StdErr { message }) => stderr.push(&message),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Error reading container output");
                        break;
                    }
                }
            }
            self.wait_exit_code(container_id).await
        };

        let (exit_code, timed_out, note) = match tokio::time::timeout(bound, execution).await {
            Ok(code) => {
                let code = code?;
                let note = match code {
                    137 => Some("[Container killed: likely OOM or exceeded memory limit]".to_string()),
                    139 => Some("[Container killed: segmentation fault]".to_string()),
                    _ => None,
                };
                (code, false, note)
            }
            Err(_) => {
                warn!(
                    container_id = %container_id,
                    timeout_ms = self.config.container_timeout_ms,
                    "Execution timed out - stopping container"
                );
                // the timeout result stands even if stop fails
                if let Err(e) = self
                    .docker
                    .stop_container(container_id, Some(StopContainerOptions { t: 1 }))
                    .await
                {
                    warn!(container_id = %container_id, error = %e, "Failed to stop timed-out container");
                }
                (TIMEOUT_EXIT_CODE, true, Some(timeout_note(self.config.container_timeout_ms)))
            }
        };

        if stdout.is_truncated() || stderr.is_truncated() {
            warn!(
                container_id = %container_id,
                stdout_omitted = stdout.omitted(),
                stderr_omitted = stderr.omitted(),
                "Container output exceeded capture limit"
            );
        }
        let mut stderr = stderr.to_text();
        if let Some(note) = note {
            stderr.push('\n');
            stderr.push_str(&note);
        }

        Ok(ContainerOutput {
            stdout: stdout.to_text(),
            stderr,
            exit_code,
            timed_out,
            execution_time_ms: start_time.elapsed().as_millis() as u64,
        })
    }
}

#[async_trait]
impl Runner for DockerRunner {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, EngineError> {
        let output = self.execute_in_container(request).await?;
        Ok(output.into_result(request))
    }
}

// CLI commands driving the execution engine
use crate::{Backend, StoreKind};
use anyhow::{bail, Context, Result};
use codeverse_common::config::EngineConfig;
use codeverse_common::redis::RedisRunStore;
use codeverse_common::store::{InMemoryRunStore, RunStore};
use codeverse_common::types::{ExecutionResult, RunId, RunRecord};
use codeverse_engine::{registry, DockerRunner, JobQueue, ProcessRunner, Runner};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => {
            let mut config = EngineConfig::load(path)?;
            config.apply_env();
            Ok(config)
        }
        None => Ok(EngineConfig::from_env()),
    }
}

async fn build_runner(config: &EngineConfig, backend: Backend) -> Result<Arc<dyn Runner>> {
    match backend {
        Backend::Process => Ok(Arc::new(ProcessRunner::new(config.clone()))),
        Backend::Docker => {
            let runner = DockerRunner::new(config.clone()).context("Failed to create Docker client")?;
            runner
                .ping()
                .await
                .context("Docker daemon is not reachable")?;
            info!("Connected to Docker daemon");
            Ok(Arc::new(runner))
        }
    }
}

async fn read_source(file: &Path) -> Result<String> {
    tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read source file: {}", file.display()))
}

/// Execute one program directly, bypassing the queue
pub async fn run(
    config: &EngineConfig,
    language: &str,
    file: &Path,
    stdin: &str,
    backend: Backend,
    json: bool,
) -> Result<()> {
    let runner = build_runner(config, backend).await?;
    let source = read_source(file).await?;

    let result = runner.run(language, &source, stdin).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }

    if !result.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_result(result: &ExecutionResult) {
    if !result.stdout.is_empty() {
        println!("{}", result.stdout);
    }
    if !result.stderr.is_empty() {
        eprintln!("{}", result.stderr);
    }
    eprintln!(
        "status: {:?}  exit code: {}  time: {}ms",
        result.status,
        result
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string()),
        result.duration_ms
    );
}

/// Queue every file, then wait for each record in submission order.
/// Ctrl-C stops waiting; queued runs are abandoned.
pub async fn submit(
    config: &EngineConfig,
    owner: &str,
    language: &str,
    files: &[PathBuf],
    stdin: &str,
    backend: Backend,
    store_kind: StoreKind,
) -> Result<()> {
    let runner = build_runner(config, backend).await?;
    let store: Arc<dyn RunStore> = match store_kind {
        StoreKind::Memory => Arc::new(InMemoryRunStore::new()),
        StoreKind::Redis => Arc::new(
            RedisRunStore::connect(&config.redis_url)
                .await
                .with_context(|| format!("Failed to connect to Redis: {}", config.redis_url))?,
        ),
    };

    let queue = JobQueue::start(runner, store);

    let mut run_ids: Vec<RunId> = Vec::with_capacity(files.len());
    for file in files {
        let source = read_source(file).await?;
        let run_id = queue.submit(owner, language, &source, stdin).await?;
        println!("queued {} {}", run_id, file.display());
        run_ids.push(run_id);
    }

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    for run_id in run_ids {
        let finished = tokio::select! {
            record = queue.wait(run_id, POLL_INTERVAL) => Some(record),
            _ = &mut interrupt => None,
        };
        match finished {
            Some(record) => print_record(&record?)?,
            None => {
                let abandoned = queue.abort().await;
                let ids: Vec<String> = abandoned.iter().map(|id| id.to_string()).collect();
                warn!(count = abandoned.len(), run_ids = %ids.join(","), "Interrupted, remaining runs cancelled");
                return Ok(());
            }
        }
    }

    queue.shutdown().await;
    Ok(())
}

fn print_record(record: &RunRecord) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(record)?);
    Ok(())
}

/// Read a run record persisted by a Redis-backed `submit`
pub async fn status(config: &EngineConfig, run_id: RunId) -> Result<()> {
    let store = RedisRunStore::connect(&config.redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis: {}", config.redis_url))?;

    match store.get(run_id).await? {
        Some(record) => print_record(&record),
        None => bail!("Run not found: {}", run_id),
    }
}

pub fn languages(config: &EngineConfig) {
    println!("{:<12} {:<10} {:<22} {:<20} {}", "LANGUAGE", "SOURCE", "COMPILE", "RUN", "IMAGE");
    for spec in registry::all() {
        let compile = spec
            .compile
            .map(|c| c.shell())
            .unwrap_or_else(|| "-".to_string());
        let image = config
            .image_override(spec.language)
            .unwrap_or(spec.container_image);
        println!(
            "{:<12} {:<10} {:<22} {:<20} {}",
            spec.language.as_str(),
            spec.source_filename,
            compile,
            spec.run.shell(),
            image
        );
    }
}

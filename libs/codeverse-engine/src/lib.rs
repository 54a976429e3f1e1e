//! Code execution engine.
//!
//! Two interchangeable backends implement [`Runner`]: [`ProcessRunner`]
//! drives local compilers and interpreters, [`DockerRunner`] runs the same
//! pipeline in a throwaway container. [`JobQueue`] wraps either one and
//! serializes submissions through a single worker.

pub mod docker;
pub mod error;
pub mod input;
pub mod output;
pub mod process;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod scratch;


pub use docker::DockerRunner;
pub use error::EngineError;
pub use process::ProcessRunner;
pub use queue::JobQueue;
pub use runner::Runner;

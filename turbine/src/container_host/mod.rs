//! The container host interface consumed by the Builder pipeline: create/stream-in/run/attach/
//! stop/destroy. `docker.rs` carries the actual `bollard` usage: image pull-if-absent, container
//! config assembly, and `LogOutput` demultiplexing.

pub mod docker;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// Failure modes a `ContainerHost` implementation can report. Every variant maps to a Builder
/// phase failure, never to a panic.
#[derive(thiserror::Error, Debug)]
pub enum ContainerHostError {
    #[error("could not connect to container host; {0}")]
    Connection(String),

    #[error("image not found; {0}")]
    NoSuchImage(String),

    #[error("container not found; {0}")]
    NoSuchContainer(String),

    #[error("process not found; {0}")]
    NoSuchProcess(String),

    #[error("failed to stream data into container; {0}")]
    StreamIn(String),

    #[error("unexpected container host error occurred; {0}")]
    Unknown(String),
}

/// Root filesystem and identifying metadata for a container to be created.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// A unique name/identifier the host should use to track this container.
    pub name: String,
    /// The image repository (and optional tag) the container's root filesystem is based on.
    pub rootfs: String,
}

/// An opaque handle identifying a created container. Stable across process restarts, which is
/// what allows [`ContainerHost::attach`] to reconnect after the service itself restarts.
pub type ContainerHandle = String;

/// The script and environment a [`ContainerHost::run`] call spawns inside a container.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub script: String,
    pub env: Vec<(String, String)>,
    /// Working directory inside the container the script should run from.
    pub path: String,
}

/// One frame of a running process's combined output stream. Exactly one of `data` or
/// `exit_status` is populated per the container host's wire contract; an empty `data` with no
/// `exit_status` never occurs.
#[derive(Debug, Clone)]
pub enum ProcessFrame {
    Stdout(Bytes),
    Stderr(Bytes),
    /// The process has exited; no further frames follow.
    Exit(u32),
}

pub type ProcessStream = Pin<Box<dyn Stream<Item = Result<ProcessFrame, ContainerHostError>> + Send>>;

/// The external process-isolation service the Builder pipeline drives.
///
/// Implementations are expected to keep a created container alive (but idle) between `create`
/// and the eventual `run`, since `stream_in` needs somewhere to write the fetched source to
/// before the script starts.
#[async_trait]
pub trait ContainerHost: Send + Sync + std::fmt::Debug {
    async fn create(&self, spec: ContainerSpec) -> Result<ContainerHandle, ContainerHostError>;

    /// Writes a tar archive's bytes into the container at `dest`, extracting as it goes.
    async fn stream_in(
        &self,
        handle: &ContainerHandle,
        dest: &str,
        archive: Bytes,
    ) -> Result<(), ContainerHostError>;

    /// Spawns `spec.script` inside the container, returning a process identifier and a stream
    /// of its combined output, terminated by an [`ProcessFrame::Exit`] frame.
    async fn run(
        &self,
        handle: &ContainerHandle,
        spec: RunSpec,
    ) -> Result<(String, ProcessStream), ContainerHostError>;

    /// Reopens the output stream of an already-running process, for resuming after a restart.
    async fn attach(
        &self,
        handle: &ContainerHandle,
        process_id: &str,
    ) -> Result<ProcessStream, ContainerHostError>;

    /// Requests a graceful stop of the running process/container, waiting up to the host's
    /// configured grace period before forcing termination.
    async fn stop(&self, handle: &ContainerHandle) -> Result<(), ContainerHostError>;

    /// Tears the container down entirely, releasing any host-side resources.
    async fn destroy(&self, handle: &ContainerHandle) -> Result<(), ContainerHostError>;
}

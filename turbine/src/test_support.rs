//! Fakes shared by the builder, scheduler and snapshotter test suites: a container host that
//! records what it was asked to do and plays back a scripted output stream, and a source
//! fetcher that hands back a pre-seeded directory or a configured error.

use crate::container_host::{ContainerHandle, ContainerHost, ContainerHostError, ContainerSpec, ProcessFrame, ProcessStream, RunSpec};
use crate::model::Source;
use crate::source::{SourceFetchError, SourceFetcher};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::sync::Notify as AsyncNotify;
use std::sync::Arc;

#[derive(Default)]
pub struct FakeContainerHost {
    pub created: Mutex<Vec<ContainerSpec>>,
    pub streamed_in: Mutex<Vec<(String, String)>>,
    pub run_specs: Mutex<Vec<(String, RunSpec)>>,
    pub destroyed: Mutex<Vec<String>>,
    pub stopped: Mutex<Vec<String>>,
    pub attached: Mutex<Vec<(String, String)>>,
    pub create_err: Mutex<Option<String>>,
    pub stream_in_err: Mutex<Option<String>>,
    pub frames: Mutex<Vec<ProcessFrame>>,
    /// When set, `run`/`attach` return a stream that blocks until `stop` is called, then yields
    /// a single `Exit` frame, for exercising the abort path.
    pub hang_until_stop: Mutex<Option<Arc<AsyncNotify>>>,
}

impl std::fmt::Debug for FakeContainerHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeContainerHost").finish_non_exhaustive()
    }
}

impl FakeContainerHost {
    fn output_stream(&self) -> ProcessStream {
        if let Some(signal) = self.hang_until_stop.lock().unwrap().clone() {
            return Box::pin(stream::unfold(Some(signal), |state| async move {
                let signal = state?;
                signal.notified().await;
                Some((Ok(ProcessFrame::Exit(137)), None))
            }));
        }

        let frames = self.frames.lock().unwrap().clone();
        Box::pin(stream::iter(frames.into_iter().map(Ok)))
    }
}

#[async_trait]
impl ContainerHost for FakeContainerHost {
    async fn create(&self, spec: ContainerSpec) -> Result<ContainerHandle, ContainerHostError> {
        if let Some(msg) = self.create_err.lock().unwrap().clone() {
            return Err(ContainerHostError::Unknown(msg));
        }
        self.created.lock().unwrap().push(spec);
        Ok("fake-handle".to_string())
    }

    async fn stream_in(
        &self,
        handle: &ContainerHandle,
        dest: &str,
        _archive: Bytes,
    ) -> Result<(), ContainerHostError> {
        if let Some(msg) = self.stream_in_err.lock().unwrap().clone() {
            return Err(ContainerHostError::StreamIn(msg));
        }
        self.streamed_in.lock().unwrap().push((handle.clone(), dest.to_string()));
        Ok(())
    }

    async fn run(&self, handle: &ContainerHandle, spec: RunSpec) -> Result<(String, ProcessStream), ContainerHostError> {
        self.run_specs.lock().unwrap().push((handle.clone(), spec));
        Ok(("42".to_string(), self.output_stream()))
    }

    async fn attach(&self, handle: &ContainerHandle, process_id: &str) -> Result<ProcessStream, ContainerHostError> {
        self.attached.lock().unwrap().push((handle.clone(), process_id.to_string()));
        Ok(self.output_stream())
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<(), ContainerHostError> {
        self.stopped.lock().unwrap().push(handle.clone());
        if let Some(signal) = self.hang_until_stop.lock().unwrap().clone() {
            signal.notify_one();
        }
        Ok(())
    }

    async fn destroy(&self, handle: &ContainerHandle) -> Result<(), ContainerHostError> {
        self.destroyed.lock().unwrap().push(handle.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeSourceFetcher {
    pub dir: Mutex<Option<PathBuf>>,
    pub err: Mutex<Option<String>>,
    pub fetched: Mutex<Vec<Source>>,
    /// When true, `fetch` never resolves on its own, for exercising the drain-cancels-pending
    /// path, where the scheduler's drain token (not the fetcher) is what ends the wait.
    pub hang: Mutex<bool>,
}

#[async_trait]
impl SourceFetcher for FakeSourceFetcher {
    async fn fetch(&self, source: &Source) -> Result<PathBuf, SourceFetchError> {
        self.fetched.lock().unwrap().push(source.clone());

        if *self.hang.lock().unwrap() {
            std::future::pending::<()>().await;
        }

        if let Some(msg) = self.err.lock().unwrap().clone() {
            return Err(SourceFetchError::Fetch(msg));
        }

        Ok(self.dir.lock().unwrap().clone().expect("fetch dir not configured"))
    }
}

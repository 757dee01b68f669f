//! A `bollard`-backed [`ContainerHost`]: pull-if-absent image logic, container config assembly,
//! `LogOutput` demultiplexing, and a "create an idle container, then `docker exec` the script
//! into it" shape: an idle container gives `stream_in` somewhere to land a source tree before
//! the script ever runs.

use super::{ContainerHandle, ContainerHost, ContainerHostError, ContainerSpec, ProcessFrame, ProcessStream, RunSpec};
use async_trait::async_trait;
use bollard::container::{Config, RemoveContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct Docker {
    client: Arc<bollard::Docker>,
    /// Seconds to wait for a graceful stop before the host forces termination.
    stop_timeout: i64,
}

impl Docker {
    pub async fn new(stop_timeout: i64) -> Result<Self, ContainerHostError> {
        let client = bollard::Docker::connect_with_socket_defaults().map_err(|e| {
            ContainerHostError::Connection(format!(
                "{e}; make sure the Docker daemon is installed and running"
            ))
        })?;

        let version = client.version().await.map_err(|e| {
            ContainerHostError::Connection(format!(
                "{e}; make sure the Docker daemon is installed and running"
            ))
        })?;

        debug!(version = %version.version.unwrap_or_default(), "connected to container host");

        Ok(Self {
            client: Arc::new(client),
            stop_timeout,
        })
    }

    async fn ensure_image(&self, image: &str) -> Result<(), ContainerHostError> {
        let mut filters = std::collections::HashMap::new();
        filters.insert("reference".to_string(), vec![image.to_string()]);

        let images = self
            .client
            .list_images(Some(bollard::image::ListImagesOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| ContainerHostError::Unknown(e.to_string()))?;

        if !images.is_empty() {
            return Ok(());
        }

        self.client
            .create_image(
                Some(CreateImageOptions {
                    from_image: image.to_string(),
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| ContainerHostError::NoSuchImage(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl ContainerHost for Docker {
    async fn create(&self, spec: ContainerSpec) -> Result<ContainerHandle, ContainerHostError> {
        self.ensure_image(&spec.rootfs).await?;

        if let Err(e) = self
            .client
            .remove_container(
                &spec.name,
                Some(RemoveContainerOptions {
                    v: true,
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            debug!(name = %spec.name, error = %e, "no previous container to remove");
        }

        let container_config = Config {
            image: Some(spec.rootfs.clone()),
            // The container's own process never exits on its own; the build's script instead
            // runs as a separate exec, which lets `stream_in` land files before the script
            // starts and lets the script finish without killing the container out from under
            // a still-streaming log reader.
            entrypoint: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            host_config: Some(HostConfig {
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .client
            .create_container(
                Some(bollard::container::CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| ContainerHostError::Unknown(e.to_string()))?;

        self.client
            .start_container::<String>(&spec.name, None)
            .await
            .map_err(|e| ContainerHostError::Unknown(e.to_string()))?;

        Ok(created.id)
    }

    async fn stream_in(
        &self,
        handle: &ContainerHandle,
        dest: &str,
        archive: Bytes,
    ) -> Result<(), ContainerHostError> {
        self.client
            .upload_to_container(
                handle,
                Some(bollard::container::UploadToContainerOptions {
                    path: dest.to_string(),
                    no_overwrite_dir_non_dir: String::new(),
                }),
                archive,
            )
            .await
            .map_err(|e| ContainerHostError::StreamIn(e.to_string()))
    }

    async fn run(
        &self,
        handle: &ContainerHandle,
        spec: RunSpec,
    ) -> Result<(String, ProcessStream), ContainerHostError> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let exec = self
            .client
            .create_exec(
                handle,
                CreateExecOptions {
                    cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), spec.script.clone()]),
                    env: Some(env),
                    working_dir: Some(spec.path.clone()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ContainerHostError::Unknown(e.to_string()))?;

        let stream = self.open_exec_stream(exec.id.clone()).await?;

        Ok((exec.id, stream))
    }

    async fn attach(
        &self,
        handle: &ContainerHandle,
        process_id: &str,
    ) -> Result<ProcessStream, ContainerHostError> {
        let _ = handle;

        let inspect = self
            .client
            .inspect_exec(process_id)
            .await
            .map_err(|e| ContainerHostError::NoSuchProcess(e.to_string()))?;

        // Docker's exec API only streams output to the caller that started it; there is no
        // primitive to reattach to a still-running exec's stdout/stderr after the original
        // connection is gone. The best we can do on restore is poll for completion and
        // synthesize the exit frame the Builder's drain phase expects.
        if let Some(code) = inspect.exit_code {
            return Ok(Box::pin(stream::once(async move {
                Ok(ProcessFrame::Exit(code as u32))
            })));
        }

        warn!(
            process_id,
            "reattached to a running exec without a live output stream; polling for completion"
        );

        let client = self.client.clone();
        let process_id = process_id.to_string();

        let poll = stream::unfold(Some(process_id), move |state| {
            let client = client.clone();
            async move {
                let process_id = state?;

                loop {
                    let inspect = client.inspect_exec(&process_id).await.ok()?;
                    if let Some(code) = inspect.exit_code {
                        return Some((Ok(ProcessFrame::Exit(code as u32)), None));
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                }
            }
        });

        Ok(Box::pin(poll))
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<(), ContainerHostError> {
        self.client
            .stop_container(
                handle,
                Some(bollard::container::StopContainerOptions {
                    t: self.stop_timeout,
                }),
            )
            .await
            .map_err(|e| ContainerHostError::NoSuchContainer(e.to_string()))?;

        Ok(())
    }

    async fn destroy(&self, handle: &ContainerHandle) -> Result<(), ContainerHostError> {
        self.client
            .remove_container(
                handle,
                Some(RemoveContainerOptions {
                    v: true,
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| ContainerHostError::NoSuchContainer(e.to_string()))?;

        Ok(())
    }
}

impl Docker {
    async fn open_exec_stream(&self, exec_id: String) -> Result<ProcessStream, ContainerHostError> {
        let results = self
            .client
            .start_exec(&exec_id, None)
            .await
            .map_err(|e| ContainerHostError::Unknown(e.to_string()))?;

        let output = match results {
            StartExecResults::Attached { output, .. } => output,
            StartExecResults::Detached => {
                return Err(ContainerHostError::Unknown(
                    "exec started detached; expected an attached output stream".to_string(),
                ))
            }
        };

        let client = self.client.clone();

        let frames = output
            .map(|item| item.map_err(|e| ContainerHostError::Unknown(e.to_string())))
            .map_ok(|log| match log {
                bollard::container::LogOutput::StdOut { message } => ProcessFrame::Stdout(message),
                bollard::container::LogOutput::StdErr { message } => ProcessFrame::Stderr(message),
                _ => ProcessFrame::Stdout(Bytes::new()),
            });

        let exit = stream::once(async move {
            loop {
                match client.inspect_exec(&exec_id).await {
                    Ok(inspect) if inspect.running == Some(false) => {
                        let code = inspect.exit_code.unwrap_or(0) as u32;
                        return Ok(ProcessFrame::Exit(code));
                    }
                    Ok(_) => tokio::time::sleep(std::time::Duration::from_millis(50)).await,
                    Err(e) => return Err(ContainerHostError::Unknown(e.to_string())),
                }
            }
        });

        Ok(Box::pin(frames.chain(exit)))
    }
}

//! The phase pipeline that takes a build from submission to a terminal status.
//!
//! Split into `start`/`attach`/`drain`: `start` runs phases 1-5 and returns once a container and
//! process exist, `attach` skips straight to an already-running process (the Restore path), and
//! both hand off to the same `drain` for phases 6-7. The split lets the Scheduler observe the
//! *started* transition, and record the container handle and process id, independently of
//! waiting for the script itself to finish.

pub mod log_writer;

use crate::container_host::{ContainerHost, ContainerSpec, ProcessFrame, RunSpec};
use crate::events::EventHub;
use crate::model::{Build, BuildConfig, EffectiveConfig, Event, LogOrigin, LogSource, Status};
use crate::model::epoch_millis;
use crate::source::SourceRegistry;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log_writer::LogWriter;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(thiserror::Error, Debug)]
pub enum BuilderError {
    #[error("configuration error; {0}")]
    Configuration(String),
}

/// Collaborators every build's pipeline task needs; owned by the Scheduler and shared across
/// every build it launches.
#[derive(Clone)]
pub struct BuildContext {
    pub container_host: Arc<dyn ContainerHost>,
    pub sources: Arc<SourceRegistry>,
}

/// A container and process that already exist, to resume into (the Attach / Restore path).
pub struct Resume {
    pub container_handle: String,
    pub process_id: String,
}

/// The two independent cancellation signals a build reacts to: a user-initiated `Abort`, which
/// always lands on `aborted`, and the Scheduler's drain signal, which only ever reaches a
/// not-yet-started build and lands on `errored` instead.
#[derive(Clone)]
pub struct CancelSignals {
    pub abort: CancellationToken,
    pub drain: CancellationToken,
}

/// The terminal outcome of a full pipeline run: everything the Scheduler needs to close out its
/// `ScheduledBuild` record.
pub struct Outcome {
    pub status: Status,
    pub container_handle: String,
    pub process_id: String,
}

/// Drives `build` through to a terminal status, emitting events into `hub` as it goes.
///
/// `resume` skips phases 1-5 and reattaches to an already-running process instead. `on_started`
/// is invoked exactly once, immediately after a container and process exist (and before any
/// further `.await` point), so the caller can record the handle and pid under its own lock,
/// preserving the invariant that a *started* build always has a non-empty handle and pid.
pub async fn drive(
    ctx: &BuildContext,
    build: &Build,
    hub: &Arc<EventHub>,
    signals: CancelSignals,
    resume: Option<Resume>,
    on_started: impl FnOnce(String, String) + Send,
) -> Outcome {
    let logs_sink = connect_logs_sink(build, hub).await;

    let (container_handle, process_id, stream) = match resume {
        Some(resume) => match attach(ctx, hub, resume).await {
            Ok(attached) => attached,
            Err(outcome) => return outcome,
        },
        None => match start(ctx, build, hub, &signals).await {
            StartResult::Started { container_handle, process_id, stream } => {
                (container_handle, process_id, stream)
            }
            StartResult::Terminal(outcome) => return outcome,
        },
    };

    on_started(container_handle.clone(), process_id.clone());

    drain(ctx, hub, &container_handle, &process_id, stream, signals.abort, logs_sink).await
}

enum StartResult {
    Started {
        container_handle: String,
        process_id: String,
        stream: crate::container_host::ProcessStream,
    },
    Terminal(Outcome),
}

enum CancelOutcome<T> {
    Value(T),
    Aborted,
    DrainCancelled,
}

async fn run_cancellable<T>(signals: &CancelSignals, fut: impl Future<Output = T>) -> CancelOutcome<T> {
    tokio::select! {
        biased;
        _ = signals.abort.cancelled() => CancelOutcome::Aborted,
        _ = signals.drain.cancelled() => CancelOutcome::DrainCancelled,
        out = fut => CancelOutcome::Value(out),
    }
}

/// Phases 1-5: fetch source, resolve configuration, create the container, stream the source in,
/// and spawn the script.
async fn start(ctx: &BuildContext, build: &Build, hub: &Arc<EventHub>, signals: &CancelSignals) -> StartResult {
    // Phase 2 happens first: resolving a config file (phase 1) needs the fetched source tree to
    // read it from, so both phases share a single fetch rather than fetching the source twice.
    let fetched_dir = match run_cancellable(signals, ctx.sources.fetch(&build.source)).await {
        CancelOutcome::Aborted => return StartResult::Terminal(terminal_before_container(hub, Status::Aborted, None).await),
        CancelOutcome::DrainCancelled => {
            return StartResult::Terminal(
                terminal_before_container(
                    hub,
                    Status::Errored,
                    Some("scheduler began draining before source fetch completed".into()),
                )
                .await,
            )
        }
        CancelOutcome::Value(Err(e)) => {
            return StartResult::Terminal(
                terminal_before_container(hub, Status::Errored, Some(format!("could not fetch source; {e}"))).await,
            )
        }
        CancelOutcome::Value(Ok(dir)) => dir,
    };

    // `fetched_dir` is a scratch directory materialized just for this build (see
    // `source::raw::RawFetcher::fetch`); nothing below needs it once this call returns, win or
    // lose, so it is removed unconditionally rather than on only the phases' happy paths.
    let result = start_with_fetched_source(ctx, build, hub, signals, &fetched_dir).await;
    if let Err(e) = tokio::fs::remove_dir_all(&fetched_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %fetched_dir.display(), error = %e, "could not remove fetched source scratch directory");
        }
    }
    result
}

async fn start_with_fetched_source(
    ctx: &BuildContext,
    build: &Build,
    hub: &Arc<EventHub>,
    signals: &CancelSignals,
    fetched_dir: &Path,
) -> StartResult {
    let effective = match resolve_config(build, fetched_dir).await {
        Ok(effective) => effective,
        Err(e) => {
            return StartResult::Terminal(terminal_before_container(hub, Status::Errored, Some(e.to_string())).await)
        }
    };

    hub.emit_event(Event::Initialize { image: effective.image.clone() }).await;

    let container_name = format!("turbine-{}", build.id);
    // `create` is not cancellation-safe: it is several sequential awaited host calls, and a
    // cancellation landing after the host has actually created the container (but before
    // `create` returns a handle to us) would otherwise orphan it under this deterministic name
    // with no handle anywhere to destroy it by. Best-effort destroy by name covers that window
    // on every cancelled/errored exit from this match, not just the ones that got a handle back.
    let container_handle = match run_cancellable(
        signals,
        ctx.container_host.create(ContainerSpec {
            name: container_name.clone(),
            rootfs: effective.image.clone(),
        }),
    )
    .await
    {
        CancelOutcome::Aborted => {
            let _ = ctx.container_host.destroy(&container_name).await;
            return StartResult::Terminal(terminal_before_container(hub, Status::Aborted, None).await);
        }
        CancelOutcome::DrainCancelled => {
            let _ = ctx.container_host.destroy(&container_name).await;
            return StartResult::Terminal(
                terminal_before_container(
                    hub,
                    Status::Errored,
                    Some("scheduler began draining before the container was created".into()),
                )
                .await,
            );
        }
        CancelOutcome::Value(Err(e)) => {
            let _ = ctx.container_host.destroy(&container_name).await;
            return StartResult::Terminal(
                terminal_before_container(hub, Status::Errored, Some(format!("could not create container; {e}"))).await,
            );
        }
        CancelOutcome::Value(Ok(handle)) => handle,
    };

    let archive = match tar_directory(&fetched_dir).await {
        Ok(archive) => archive,
        Err(e) => {
            return StartResult::Terminal(
                terminal_with_container(ctx, hub, &container_handle, Status::Errored, Some(e.to_string())).await,
            )
        }
    };

    match run_cancellable(signals, ctx.container_host.stream_in(&container_handle, &effective.path, archive)).await {
        CancelOutcome::Aborted => {
            return StartResult::Terminal(terminal_with_container(ctx, hub, &container_handle, Status::Aborted, None).await)
        }
        CancelOutcome::DrainCancelled => {
            return StartResult::Terminal(
                terminal_with_container(
                    ctx,
                    hub,
                    &container_handle,
                    Status::Errored,
                    Some("scheduler began draining before the source was streamed in".into()),
                )
                .await,
            )
        }
        CancelOutcome::Value(Err(e)) => {
            return StartResult::Terminal(
                terminal_with_container(
                    ctx,
                    hub,
                    &container_handle,
                    Status::Errored,
                    Some(format!("could not stream source in; {e}")),
                )
                .await,
            )
        }
        CancelOutcome::Value(Ok(())) => {}
    }

    let run_spec = RunSpec {
        script: effective.script.clone(),
        env: effective.env.clone(),
        path: effective.path.clone(),
    };

    let (process_id, stream) = match run_cancellable(signals, ctx.container_host.run(&container_handle, run_spec)).await {
        CancelOutcome::Aborted => {
            return StartResult::Terminal(terminal_with_container(ctx, hub, &container_handle, Status::Aborted, None).await)
        }
        CancelOutcome::DrainCancelled => {
            return StartResult::Terminal(
                terminal_with_container(
                    ctx,
                    hub,
                    &container_handle,
                    Status::Errored,
                    Some("scheduler began draining before the script was spawned".into()),
                )
                .await,
            )
        }
        CancelOutcome::Value(Err(e)) => {
            return StartResult::Terminal(
                terminal_with_container(ctx, hub, &container_handle, Status::Errored, Some(format!("could not spawn script; {e}")))
                    .await,
            )
        }
        CancelOutcome::Value(Ok(pair)) => pair,
    };

    hub.emit_event(Event::Start { time: epoch_millis() }).await;

    StartResult::Started { container_handle, process_id, stream }
}

/// Reopens an already-running process's output stream. A process the host no longer
/// recognizes, with no exit status to report, is errored rather than retried: there is nothing
/// left to reattach to.
async fn attach(
    ctx: &BuildContext,
    hub: &Arc<EventHub>,
    resume: Resume,
) -> Result<(String, String, crate::container_host::ProcessStream), Outcome> {
    match ctx.container_host.attach(&resume.container_handle, &resume.process_id).await {
        Ok(stream) => Ok((resume.container_handle, resume.process_id, stream)),
        Err(e) => {
            hub.emit_event(Event::Error {
                message: format!("could not reattach to running process; {e}"),
            })
            .await;
            let _ = ctx.container_host.destroy(&resume.container_handle).await;
            hub.emit_event(Event::Status { new_status: Status::Errored }).await;
            hub.close().await;
            Err(Outcome {
                status: Status::Errored,
                container_handle: resume.container_handle,
                process_id: resume.process_id,
            })
        }
    }
}

/// Phases 6-7: drain the process's combined output stream through a `LogWriter` per origin,
/// then finalize on the observed exit status (or on `abort`, which signals the container to stop
/// and waits for whatever exit status eventually arrives before overriding it with `aborted`).
async fn drain(
    ctx: &BuildContext,
    hub: &Arc<EventHub>,
    container_handle: &str,
    process_id: &str,
    mut stream: crate::container_host::ProcessStream,
    abort: CancellationToken,
    logs_sink: Option<mpsc::UnboundedSender<String>>,
) -> Outcome {
    let mut stdout = LogWriter::new(hub.clone(), LogOrigin { source: LogSource::Stdout, id: "0".into() }, logs_sink.clone());
    let mut stderr = LogWriter::new(hub.clone(), LogOrigin { source: LogSource::Stderr, id: "0".into() }, logs_sink);

    let mut exit_status: Option<u32> = None;
    let mut aborting = false;
    let mut stream_error: Option<String> = None;

    loop {
        let frame = tokio::select! {
            biased;
            _ = abort.cancelled(), if !aborting => {
                aborting = true;
                let _ = ctx.container_host.stop(container_handle).await;
                continue;
            }
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(ProcessFrame::Stdout(bytes))) => stdout.write(&bytes).await,
            Some(Ok(ProcessFrame::Stderr(bytes))) => stderr.write(&bytes).await,
            Some(Ok(ProcessFrame::Exit(code))) => {
                exit_status = Some(code);
                break;
            }
            Some(Err(e)) => {
                stream_error = Some(e.to_string());
                break;
            }
            None => break,
        }
    }

    stdout.finish().await;
    stderr.finish().await;

    let status = if aborting {
        Status::Aborted
    } else if let Some(message) = stream_error {
        hub.emit_event(Event::Error { message }).await;
        Status::Errored
    } else {
        match exit_status {
            Some(0) => Status::Succeeded,
            Some(_) => Status::Failed,
            None => {
                hub.emit_event(Event::Error {
                    message: "process stream closed without reporting an exit status".into(),
                })
                .await;
                Status::Errored
            }
        }
    };

    if let Some(code) = exit_status {
        hub.emit_event(Event::Finish { exit_status: code, time: epoch_millis() }).await;
    }

    let _ = ctx.container_host.destroy(container_handle).await;

    hub.emit_event(Event::Status { new_status: status }).await;
    hub.close().await;

    Outcome {
        status,
        container_handle: container_handle.to_string(),
        process_id: process_id.to_string(),
    }
}

async fn terminal_before_container(hub: &Arc<EventHub>, status: Status, message: Option<String>) -> Outcome {
    if let Some(message) = message {
        hub.emit_event(Event::Error { message }).await;
    }
    hub.emit_event(Event::Status { new_status: status }).await;
    hub.close().await;
    Outcome { status, container_handle: String::new(), process_id: String::new() }
}

async fn terminal_with_container(
    ctx: &BuildContext,
    hub: &Arc<EventHub>,
    container_handle: &str,
    status: Status,
    message: Option<String>,
) -> Outcome {
    if let Some(message) = message {
        hub.emit_event(Event::Error { message }).await;
    }
    let _ = ctx.container_host.destroy(container_handle).await;
    hub.emit_event(Event::Status { new_status: status }).await;
    hub.close().await;
    Outcome { status, container_handle: container_handle.to_string(), process_id: String::new() }
}

/// Phase 1: reads `build.config_path` out of the already-fetched source tree, if set, and merges
/// it over the build's inline fields. A field present in the loaded config always wins; an
/// absent `path` defaults to `.`.
async fn resolve_config(build: &Build, source_dir: &Path) -> Result<EffectiveConfig, BuilderError> {
    let loaded = match &build.config_path {
        Some(path) => Some(load_config_file(source_dir, path).await?),
        None => None,
    };

    let image = loaded.as_ref().and_then(|c| c.image.clone()).unwrap_or_else(|| build.image.clone());
    let path = loaded.as_ref().and_then(|c| c.path.clone()).unwrap_or_else(|| ".".to_string());
    let script = loaded.as_ref().and_then(|c| c.script.clone()).unwrap_or_else(|| build.script.clone());

    let env = match loaded.as_ref().and_then(|c| c.env.as_ref()) {
        Some(raw) => parse_env_entries(raw)?,
        None => build.env.clone(),
    };

    Ok(EffectiveConfig { image, path, script, env })
}

async fn load_config_file(source_dir: &Path, config_path: &str) -> Result<BuildConfig, BuilderError> {
    let full_path = source_dir.join(config_path);

    let contents = tokio::fs::read_to_string(&full_path)
        .await
        .map_err(|e| BuilderError::Configuration(format!("could not read config file '{config_path}'; {e}")))?;

    serde_yaml::from_str(&contents)
        .map_err(|e| BuilderError::Configuration(format!("could not parse config file '{config_path}'; {e}")))
}

fn parse_env_entries(entries: &[String]) -> Result<Vec<(String, String)>, BuilderError> {
    entries
        .iter()
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| BuilderError::Configuration(format!("malformed env entry '{entry}'; expected NAME=VALUE")))
        })
        .collect()
}

/// Tars `dir` into memory for [`ContainerHost::stream_in`]. Building through an in-memory duplex
/// pipe lets `async_tar::Builder` (which only writes to an `AsyncWrite`) hand off to a plain
/// `Vec<u8>` without a temp file.
async fn tar_directory(dir: &Path) -> Result<Bytes, BuilderError> {
    let (writer, mut reader) = tokio::io::duplex(64 * 1024);
    let dir = dir.to_path_buf();

    let write_task = tokio::spawn(async move {
        let mut builder = async_tar::Builder::new(writer);
        builder.append_dir_all(".", &dir).await?;
        builder.finish().await
    });

    let mut buf = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buf)
        .await
        .map_err(|e| BuilderError::Configuration(format!("failed to read tar stream; {e}")))?;

    write_task
        .await
        .map_err(|e| BuilderError::Configuration(format!("tar writer task panicked; {e}")))?
        .map_err(|e| BuilderError::Configuration(format!("failed to tar source directory; {e}")))?;

    Ok(Bytes::from(buf))
}

/// Connects the build's optional logs sink websocket, a single attempt made before phase 3: a
/// failed connection is logged as an `Error` event but never fails the build.
async fn connect_logs_sink(build: &Build, hub: &Arc<EventHub>) -> Option<mpsc::UnboundedSender<String>> {
    let url = build.logs_url.as_ref()?;

    let (ws_stream, _) = match tokio_tungstenite::connect_async(url).await {
        Ok(connected) => connected,
        Err(e) => {
            hub.emit_event(Event::Error { message: format!("could not connect logs sink; {e}") }).await;
            return None;
        }
    };

    let (mut sink, _) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if sink.send(tungstenite::Message::text(payload)).await.is_err() {
                warn!("logs sink connection dropped; further log lines will not be mirrored");
                break;
            }
        }
        let _ = sink.close().await;
    });

    Some(tx)
}

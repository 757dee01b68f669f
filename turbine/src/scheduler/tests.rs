//! Exercises the registry/state-machine contract against the fakes in `crate::test_support`,
//! including a drain-and-restore scenario: a pending build is cancelled into *errored* by
//! drain, a started build is returned running, and a restored snapshot resumes correctly
//! whether its status is present or missing.

use super::*;
use crate::container_host::ProcessFrame;
use crate::model::{Build, Event, Source};
use crate::source::SourceFetcher;
use crate::test_support::{FakeContainerHost, FakeSourceFetcher};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Notify as AsyncNotify;

fn sample_build(id: &str) -> Build {
    Build {
        id: id.to_string(),
        image: "alpine".to_string(),
        config_path: None,
        env: Vec::new(),
        script: "exit 0".to_string(),
        source: Source { kind: "raw".to_string(), uri: "file:///tmp/empty.tgz".to_string(), options: HashMap::new() },
        logs_url: None,
    }
}

fn make_scheduler(host: Arc<FakeContainerHost>, fetcher: Arc<FakeSourceFetcher>) -> Arc<Scheduler> {
    let sources = SourceRegistry::new();
    sources.register("raw", fetcher as Arc<dyn SourceFetcher>);
    Scheduler::new(host as Arc<dyn ContainerHost>, Arc::new(sources), 16, Duration::from_secs(3600))
}

async fn wait_until(scheduler: &Scheduler, id: &str, status: Status) {
    for _ in 0..200 {
        if scheduler.lookup(id).map(|b| b.status()) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("build '{id}' never reached status {status}");
}

#[tokio::test]
async fn schedule_is_idempotent_on_an_existing_id() {
    let tmp = tempfile::tempdir().unwrap();
    let host = Arc::new(FakeContainerHost { frames: Mutex::new(vec![ProcessFrame::Exit(0)]), ..Default::default() });
    let fetcher = Arc::new(FakeSourceFetcher { dir: Mutex::new(Some(tmp.path().to_path_buf())), ..Default::default() });
    let scheduler = make_scheduler(host.clone(), fetcher);

    let build = sample_build("dup");
    let first = scheduler.schedule(build.clone()).unwrap();
    let second = scheduler.schedule(build).unwrap();

    assert_eq!(first, second);
    wait_until(&scheduler, "dup", Status::Succeeded).await;
    // Only one pipeline ever ran, so the fake container host only ever saw one container.
    assert_eq!(host.created.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn lookup_abort_and_subscribe_on_an_unknown_id_report_not_found() {
    let host = Arc::new(FakeContainerHost::default());
    let fetcher = Arc::new(FakeSourceFetcher::default());
    let scheduler = make_scheduler(host, fetcher);

    assert!(scheduler.lookup("missing").is_none());
    assert!(matches!(scheduler.abort("missing"), Err(SchedulerError::NotFound(_))));
    assert!(matches!(scheduler.subscribe("missing").await, Err(SchedulerError::NotFound(_))));
}

#[tokio::test]
async fn abort_cancels_a_running_build_and_marks_it_aborted() {
    let tmp = tempfile::tempdir().unwrap();
    let host = Arc::new(FakeContainerHost {
        hang_until_stop: Mutex::new(Some(Arc::new(AsyncNotify::new()))),
        ..Default::default()
    });
    let fetcher = Arc::new(FakeSourceFetcher { dir: Mutex::new(Some(tmp.path().to_path_buf())), ..Default::default() });
    let scheduler = make_scheduler(host.clone(), fetcher);

    scheduler.schedule(sample_build("ab1")).unwrap();
    wait_until(&scheduler, "ab1", Status::Started).await;

    scheduler.abort("ab1").unwrap();
    wait_until(&scheduler, "ab1", Status::Aborted).await;

    assert_eq!(host.stopped.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn drain_cancels_pending_builds_into_errored_and_excludes_them() {
    let host = Arc::new(FakeContainerHost::default());
    let fetcher = Arc::new(FakeSourceFetcher { hang: Mutex::new(true), ..Default::default() });
    let scheduler = make_scheduler(host.clone(), fetcher);

    scheduler.schedule(sample_build("pending1")).unwrap();

    let running = scheduler.drain().await;

    assert!(running.is_empty());
    assert_eq!(scheduler.lookup("pending1").unwrap().status(), Status::Errored);
    assert!(host.created.lock().unwrap().is_empty());
}

#[tokio::test]
async fn drain_returns_started_builds_still_running() {
    let tmp = tempfile::tempdir().unwrap();
    let host = Arc::new(FakeContainerHost {
        hang_until_stop: Mutex::new(Some(Arc::new(AsyncNotify::new()))),
        ..Default::default()
    });
    let fetcher = Arc::new(FakeSourceFetcher { dir: Mutex::new(Some(tmp.path().to_path_buf())), ..Default::default() });
    let scheduler = make_scheduler(host.clone(), fetcher);

    scheduler.schedule(sample_build("started1")).unwrap();
    wait_until(&scheduler, "started1", Status::Started).await;

    let running = scheduler.drain().await;

    assert_eq!(running.len(), 1);
    assert_eq!(running[0].build.id, "started1");
    assert_eq!(running[0].status(), Status::Started);

    // Draining also closes the gate: further schedule calls are refused.
    assert!(matches!(scheduler.schedule(sample_build("late")), Err(SchedulerError::Draining)));
}

#[tokio::test]
async fn restore_defaults_a_missing_status_to_started_and_resumes() {
    let host = Arc::new(FakeContainerHost { frames: Mutex::new(vec![ProcessFrame::Exit(0)]), ..Default::default() });
    let fetcher = Arc::new(FakeSourceFetcher::default());
    let scheduler = make_scheduler(host.clone(), fetcher);

    let snapshot = BuildSnapshot {
        build: sample_build("restored1"),
        status: String::new(),
        container_handle: "handle-1".to_string(),
        process_id: "pid-1".to_string(),
        events: vec![Event::Initialize { image: "alpine".to_string() }],
    };

    scheduler.restore(snapshot).await;

    wait_until(&scheduler, "restored1", Status::Succeeded).await;
    assert_eq!(host.attached.lock().unwrap()[0], ("handle-1".to_string(), "pid-1".to_string()));
    // The config fetch/container create phases are skipped entirely on resume.
    assert!(host.created.lock().unwrap().is_empty());
}

#[tokio::test]
async fn restore_of_a_terminal_snapshot_does_not_relaunch_a_pipeline() {
    let host = Arc::new(FakeContainerHost::default());
    let fetcher = Arc::new(FakeSourceFetcher::default());
    let scheduler = make_scheduler(host.clone(), fetcher);

    let snapshot = BuildSnapshot {
        build: sample_build("done1"),
        status: "succeeded".to_string(),
        container_handle: "handle-2".to_string(),
        process_id: "pid-2".to_string(),
        events: vec![Event::Status { new_status: Status::Succeeded }],
    };

    scheduler.restore(snapshot).await;

    let scheduled = scheduler.lookup("done1").unwrap();
    assert_eq!(scheduled.status(), Status::Succeeded);
    assert!(scheduled.hub.is_closed().await);
    assert!(host.attached.lock().unwrap().is_empty());
}

//! Core data types shared by the Scheduler, Builder, Event Hub and Snapshotter.
//!
//! Nothing here is specific to any one component; these are the shapes that flow between all
//! of them and across the wire.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{Display, EnumString};

/// An immutable description of a build submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, schemars::JsonSchema)]
pub struct Build {
    /// Client-assigned identifier; resubmitting the same id returns the existing build
    /// (idempotency).
    pub id: String,

    /// Docker image repository and tag the script runs in, absent an overriding config file.
    pub image: String,

    /// Path, relative to the fetched source root, of a YAML file that overrides this build's
    /// inline fields. `None` means the inline fields are used verbatim.
    #[serde(default)]
    pub config_path: Option<String>,

    /// Inline environment pairs, in submission order. Duplicates are tolerated; later entries
    /// win when applied, matching how a shell would apply repeated `-e NAME=VALUE` flags.
    #[serde(default)]
    pub env: Vec<(String, String)>,

    /// The script to execute inside the container.
    pub script: String,

    /// Where to fetch this build's source from.
    pub source: Source,

    /// Optional WebSocket endpoint that receives a byte-identical copy of every log payload.
    #[serde(default)]
    pub logs_url: Option<String>,
}

/// A source descriptor: a fetcher `kind` tag plus fetcher-specific options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, schemars::JsonSchema)]
pub struct Source {
    /// Selects which registered source fetcher handles this build's source.
    pub kind: String,

    /// The fetcher-specific locator (e.g. a `file://` or `http(s)://` tarball URI for `raw`).
    pub uri: String,

    /// Additional fetcher-specific options.
    #[serde(default)]
    pub options: HashMap<String, String>,
}

/// A build configuration, either the inline fields of a [`Build`] or a YAML file found inside
/// the fetched source tree. Loaded fields override inline ones wherever they are present.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildConfig {
    pub image: Option<String>,
    pub path: Option<String>,
    pub script: Option<String>,
    /// Raw `NAME=VALUE` entries as they appear in the YAML file. An entry with no `=` is a
    /// fatal configuration error.
    pub env: Option<Vec<String>>,
}

/// The fully resolved configuration a Builder actually runs with, after merging an optional
/// loaded [`BuildConfig`] over a build's inline fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveConfig {
    pub image: String,
    pub path: String,
    pub script: String,
    pub env: Vec<(String, String)>,
}

/// Lifecycle status of a [`crate::scheduler::ScheduledBuild`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Status {
    Pending,
    Started,
    Succeeded,
    Failed,
    Errored,
    Aborted,
}

impl Status {
    /// Once a build reaches a terminal status it never changes.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Succeeded | Status::Failed | Status::Errored | Status::Aborted
        )
    }
}

impl Default for Status {
    fn default() -> Self {
        // Missing-status compatibility: an absent/empty Status in a persisted snapshot is
        // treated as `started`, for backward compatibility with older snapshot writers.
        Status::Started
    }
}

/// Which stream a [`Log`] event's bytes came from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogSource {
    Stdout,
    Stderr,
}

/// Identifies which writer produced a [`Log`] event: the stream it came from, plus an opaque
/// id distinguishing concurrent writers against the same stream (unused today since a build has
/// exactly one stdout and one stderr writer, but part of the stable wire shape).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, schemars::JsonSchema)]
pub struct LogOrigin {
    pub source: LogSource,
    pub id: String,
}

/// A single event in a build's timeline. Carries no timestamps except where noted; ordering
/// within a build, not wall-clock time, is the guarantee.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, schemars::JsonSchema)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Event {
    Initialize { image: String },
    Start { time: i64 },
    Log { payload: String, origin: LogOrigin },
    Error { message: String },
    Finish { exit_status: u32, time: i64 },
    Status { new_status: Status },
}

/// Everything needed to resume event replay and reattach to a running container, persisted by
/// the Snapshotter and restored by the Scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildSnapshot {
    pub build: Build,

    /// Empty string is accepted on read as the missing-status compatibility case, treated as
    /// `started`.
    #[serde(default)]
    pub status: String,

    pub container_handle: String,

    /// Identifies the spawned script process within its container. The container host this
    /// crate targets (Docker, via `bollard`) names an exec with an opaque hex string rather
    /// than an integer, so this stands in for the "uint32 ProcessID" of the abstract design:
    /// an empty string is the "not yet spawned" sentinel.
    #[serde(default)]
    pub process_id: String,

    pub events: Vec<Event>,
}

/// Parses the given epoch-milliseconds timestamp helper used across the Builder and Scheduler.
pub fn epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

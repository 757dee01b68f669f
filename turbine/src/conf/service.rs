use crate::conf::ConfigType;
use serde::Deserialize;
use std::path::PathBuf;

const DEFAULT_SERVICE_CONFIG: &str = include_str!("./default_service_config.toml");

#[derive(Deserialize, Default, Debug, Clone)]
pub struct ServiceConfig {
    pub server: Server,
    pub scheduler: Scheduler,
    pub snapshotter: Snapshotter,
    pub container_host: ContainerHost,
    pub development: Development,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Server {
    /// The bind address the HTTP façade listens on. Ex: `0.0.0.0:8080`.
    pub bind_address: String,

    /// The public URL clients use to reach this instance; substituted into event payloads that
    /// need to reference the service (e.g. a build's logs sink retry hints).
    pub url: String,

    /// The service's own log level.
    pub log_level: String,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Scheduler {
    /// How many events a single slow subscriber is allowed to lag behind before it is
    /// disconnected by the Event Hub.
    pub subscriber_buffer_size: usize,

    /// How long the registry keeps a terminal build around after its status becomes terminal,
    /// so that a subscriber racing the terminal event still finds it.
    pub grace_period_secs: u64,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Snapshotter {
    /// Path to the file the running-builds snapshot is persisted to on shutdown and restored
    /// from on startup.
    pub snapshot_path: String,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct ContainerHost {
    /// Time in seconds the container host will wait for a container to stop gracefully before
    /// forcefully terminating it.
    pub stop_timeout: i64,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Development {
    /// Tells the logging package to use human readable output instead of JSON.
    pub pretty_logging: bool,
}

impl ConfigType for ServiceConfig {
    fn default_config() -> &'static str {
        DEFAULT_SERVICE_CONFIG
    }

    fn config_paths() -> Vec<PathBuf> {
        vec![PathBuf::from("/etc/turbine/turbine.toml")]
    }

    fn env_prefix() -> &'static str {
        "TURBINE_"
    }
}

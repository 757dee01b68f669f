//! The HTTP façade: the boundary between external clients and the Scheduler.
//!
//! `ApiDescription` + `ServerBuilder` wire up the `builds` resource behind a request-logging
//! `Middleware` and `init_logger`'s env-filtered `tracing-subscriber` setup, with a signal-driven
//! shutdown sequence. The middleware inspects `X-Forwarded-For` for a reverse-proxied remote
//! address; authentication itself is left to the fronting proxy rather than enforced here.

pub mod builds;
mod validate;

use crate::conf::service::ServiceConfig;
use crate::container_host::ContainerHost;
use crate::scheduler::Scheduler;
use crate::snapshotter::Snapshotter;
use crate::source::SourceRegistry;
use anyhow::{anyhow, Context, Result};
use dropshot::{
    ApiDescription, Body, ConfigDropshot, DropshotState, EndpointTagPolicy, HandlerError,
    HandlerTaskMode, ServerBuilder, ServerContext, TagConfig, TagDetails,
};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

/// Holds everything a request handler needs for the lifetime of the service.
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
    /// Substituted into payloads that need to reference this instance, e.g. a future retry hint
    /// on a build's logs sink connection failure.
    pub public_url: String,
}

/// Boots the Scheduler, restores any builds persisted by a previous run's Snapshotter, serves the
/// HTTP façade until a termination signal arrives, then drains and persists before returning.
pub async fn run(conf: ServiceConfig) -> Result<()> {
    init_logger(&conf.server.log_level, conf.development.pretty_logging)?;

    let container_host: Arc<dyn ContainerHost> =
        Arc::new(crate::container_host::docker::Docker::new(conf.container_host.stop_timeout).await?);
    let sources = Arc::new(crate::source::default_registry());

    let scheduler = Scheduler::new(
        container_host,
        sources,
        conf.scheduler.subscriber_buffer_size,
        Duration::from_secs(conf.scheduler.grace_period_secs),
    );

    let snapshotter = Arc::new(Snapshotter::new(conf.snapshotter.snapshot_path.clone(), scheduler.clone()));
    let ready = snapshotter.ready_signal();
    let terminate = snapshotter.terminate_token();

    let snapshotter_task = tokio::spawn({
        let snapshotter = snapshotter.clone();
        async move { snapshotter.run().await }
    });

    ready.notified().await;

    let api_state = Arc::new(ApiState {
        scheduler,
        public_url: conf.server.url.clone(),
    });

    let bind_address = SocketAddr::from_str(&conf.server.bind_address).with_context(|| {
        format!(
            "could not parse bind address '{}'; expected '<ip>:<port>', not a hostname",
            conf.server.bind_address
        )
    })?;

    let dropshot_conf = ConfigDropshot {
        bind_address,
        default_request_body_max_bytes: 10 * 1024 * 1024,
        default_handler_task_mode: HandlerTaskMode::Detached,
    };

    let api = init_api_description()?;

    let server = ServerBuilder::new(api, api_state, Some(Arc::new(RequestLogger)))
        .config(dropshot_conf)
        .start()
        .map_err(|e| anyhow!("failed to create HTTP server: {e}"))?;

    let mut shutdown = Box::pin(server.wait_for_shutdown());

    info!(address = %bind_address, "turbine service listening");

    tokio::select! {
        biased;
        _ = listen_for_terminate_signal() => {
            info!("shutdown signal received; draining in-flight builds before exit");
        }
        result = &mut shutdown => {
            return result.map_err(|e| anyhow!("server encountered errors while running: {e:?}"));
        }
    }

    terminate.cancel();

    match snapshotter_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e).context("failed to persist snapshot during shutdown"),
        Err(e) => return Err(anyhow!("snapshotter task panicked: {e}")),
    }

    let _ = server.close().await;

    Ok(())
}

fn init_api_description() -> Result<ApiDescription<Arc<ApiState>>> {
    let mut api = ApiDescription::new();
    api = api.tag_config(TagConfig {
        allow_other_tags: false,
        policy: EndpointTagPolicy::ExactlyOne,
        tags: [(
            "Builds".to_string(),
            TagDetails {
                description: Some("Submit, abort, and observe builds.".into()),
                ..Default::default()
            },
        )]
        .into_iter()
        .collect(),
    });

    api.register(builds::create_build)
        .map_err(|e| anyhow!("failed to register create_build route: {e}"))?;
    api.register(builds::abort_build)
        .map_err(|e| anyhow!("failed to register abort_build route: {e}"))?;
    api.register(builds::build_events)
        .map_err(|e| anyhow!("failed to register build_events route: {e}"))?;

    Ok(api)
}

fn init_logger(log_level: &str, pretty: bool) -> Result<()> {
    let level = LevelFilter::from_str(log_level).context("could not parse 'server.log_level' configuration")?;

    let filter = EnvFilter::from_default_env()
        .add_directive("hyper=off".parse().expect("invalid directive"))
        .add_directive("h2=off".parse().expect("invalid directive"))
        .add_directive("rustls=off".parse().expect("invalid directive"))
        .add_directive("bollard=off".parse().expect("invalid directive"))
        .add_directive("reqwest=off".parse().expect("invalid directive"))
        .add_directive("tungstenite=off".parse().expect("invalid directive"))
        .add_directive("dropshot=off".parse().expect("invalid directive"))
        .add_directive(level.into());

    if pretty {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
        warn!("pretty logging activated due to config value 'development.pretty_logging'");
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).json().init();
    }

    Ok(())
}

async fn listen_for_terminate_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let millis = duration.as_millis();
    let micros = duration.as_micros();

    if secs > 0 {
        format!("{secs}s")
    } else if millis > 0 {
        format!("{millis}ms")
    } else if micros > 0 {
        format!("{micros}\u{3bc}s")
    } else {
        format!("{}ns", duration.as_nanos())
    }
}

/// Logs method, path, status and latency for every completed request, reading the caller's real
/// address off `X-Forwarded-For` when present (the service is expected to sit behind a proxy).
#[derive(Debug)]
struct RequestLogger;

#[async_trait::async_trait]
impl<C: ServerContext> dropshot::Middleware<C> for RequestLogger {
    async fn handle(
        &self,
        server: Arc<DropshotState<C>>,
        request: hyper::Request<hyper::body::Incoming>,
        request_id: String,
        remote_addr: SocketAddr,
        next: fn(
            Arc<DropshotState<C>>,
            hyper::Request<hyper::body::Incoming>,
            String,
            SocketAddr,
        ) -> Pin<Box<dyn Future<Output = Result<hyper::Response<Body>, HandlerError>> + Send>>,
    ) -> Result<hyper::Response<Body>, HandlerError> {
        let start = std::time::Instant::now();
        let method = request.method().as_str().to_string();
        let uri = request.uri().to_string();

        let remote_ip = match request.headers().get("X-Forwarded-For") {
            Some(value) => value.to_str().map(|s| s.to_string()).unwrap_or_else(|_| remote_addr.to_string()),
            None => remote_addr.to_string(),
        };

        let response = next(server, request, request_id.clone(), remote_addr).await;

        if let Ok(response) = &response {
            info!(
                remote_addr = remote_ip,
                req_id = request_id,
                method,
                uri,
                response_code = response.status().as_str(),
                latency = format_duration(start.elapsed()),
                "request completed"
            );
        } else if let Err(e) = &response {
            error!(remote_addr = remote_ip, req_id = request_id, method, uri, error = %e, "request handler failed");
        }

        response
    }
}

//! Request handlers for the `builds` resource: create, abort, and a websocket subscription that
//! replays a build's full event history and then streams its live tail.
//!
//! The websocket handler accepts the raw connection, wraps it in a `tokio_tungstenite::WebSocketStream`,
//! then pushes text frames until the source dries up or the client disconnects. Frames are
//! `{type, payload}`; [`crate::model::Event`]'s own serde tagging already produces exactly that
//! shape, so the handler only adds a final `{"type":"end"}` marker before the close frame.

use super::ApiState;
use crate::model::Build;
use crate::scheduler::SchedulerError;
use dropshot::{
    channel, endpoint, HttpError, HttpResponseCreated, HttpResponseUpdatedNoContent, Path,
    RequestContext, TypedBody, WebsocketChannelResult, WebsocketConnection,
};
use futures::SinkExt;
use http::StatusCode;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::{protocol::Role, Message};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BuildPathArgs {
    /// The client-assigned identifier of a previously submitted build.
    pub build_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CreateBuildResponse {
    pub id: String,
}

/// Submits a new build. Resubmitting a build whose `id` is already registered returns the
/// existing build rather than scheduling a second one (idempotency).
#[endpoint(
    method = POST,
    path = "/builds",
    tags = ["Builds"],
)]
pub async fn create_build(
    rqctx: RequestContext<Arc<ApiState>>,
    body: TypedBody<Build>,
) -> Result<HttpResponseCreated<CreateBuildResponse>, HttpError> {
    let api_state = rqctx.context();
    let build = body.into_inner();

    validate_build(&build)?;

    let id = api_state
        .scheduler
        .schedule(build)
        .map_err(|e| match e {
            SchedulerError::Draining => HttpError::for_client_error(
                None,
                StatusCode::SERVICE_UNAVAILABLE,
                "service is shutting down; no new builds are accepted".into(),
            ),
            SchedulerError::NotFound(_) => unreachable!("schedule never returns NotFound"),
        })?;

    Ok(HttpResponseCreated(CreateBuildResponse { id }))
}

/// Requests cancellation of a running or not-yet-started build. Aborting a build already in a
/// terminal state is a no-op.
#[endpoint(
    method = POST,
    path = "/builds/{build_id}/abort",
    tags = ["Builds"],
)]
pub async fn abort_build(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<BuildPathArgs>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let api_state = rqctx.context();
    let path = path_params.into_inner();

    api_state.scheduler.abort(&path.build_id).map_err(|e| match e {
        SchedulerError::NotFound(id) => HttpError::for_not_found(None, format!("no build with id '{id}'")),
        SchedulerError::Draining => unreachable!("abort never returns Draining"),
    })?;

    Ok(HttpResponseUpdatedNoContent())
}

/// Streams a build's events: the full history so far, then live events, then an explicit
/// end-of-stream marker. A subscription started at any point, including after the build has
/// already finished, observes the complete log, never a partial one.
#[channel(
    protocol = WEBSOCKETS,
    path = "/builds/{build_id}/events",
    tags = ["Builds"],
)]
pub async fn build_events(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<BuildPathArgs>,
    conn: WebsocketConnection,
) -> WebsocketChannelResult {
    let api_state = rqctx.context();
    let path = path_params.into_inner();

    let mut ws = tokio_tungstenite::WebSocketStream::from_raw_socket(conn.into_inner(), Role::Server, None).await;

    let mut subscription = match api_state.scheduler.subscribe(&path.build_id).await {
        Ok(subscription) => subscription,
        Err(SchedulerError::NotFound(id)) => {
            let _ = ws
                .close(Some(tokio_tungstenite::tungstenite::protocol::CloseFrame {
                    code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Away,
                    reason: format!("no build with id '{id}'").into(),
                }))
                .await;
            return Ok(());
        }
        Err(SchedulerError::Draining) => unreachable!("subscribe never returns Draining"),
    };

    while let Some(event) = subscription.next().await {
        let frame = match serde_json::to_string(&event) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, build_id = %path.build_id, "failed to encode event frame");
                continue;
            }
        };

        if ws.send(Message::text(frame)).await.is_err() {
            // Client disconnected; stop pushing but don't treat it as a channel error.
            return Ok(());
        }
    }

    let _ = ws.send(Message::text("{\"type\":\"end\"}")).await;
    let _ = ws.close(None).await;

    Ok(())
}

fn validate_build(build: &Build) -> Result<(), HttpError> {
    super::validate::identifier(&build.id)?;
    if build.image.trim().is_empty() {
        return Err(HttpError::for_bad_request(None, "'image' must not be empty".into()));
    }
    if build.script.trim().is_empty() {
        return Err(HttpError::for_bad_request(None, "'script' must not be empty".into()));
    }
    if build.source.kind.trim().is_empty() {
        return Err(HttpError::for_bad_request(None, "'source.kind' must not be empty".into()));
    }
    if build.source.uri.trim().is_empty() {
        return Err(HttpError::for_bad_request(None, "'source.uri' must not be empty".into()));
    }

    Ok(())
}

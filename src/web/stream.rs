use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tracing::info;

use super::response::{parse_id, success, ApiError, ApiResult, CORS};
use crate::proxy::StreamReply;
use crate::signing::{is_segment_name, SignedRequest, StreamParams};
use crate::state::SharedState;

const PLAYLIST_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_TYPE: &str = "video/MP2T";
const CACHE_STATUS: HeaderName = HeaderName::from_static("x-cache-status");

/// Issues a signed playback URL for a channel.
pub async fn play(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    let channel_id = parse_id(&id)?;
    let ticket = state.proxy.issue_play_url(channel_id).await?;
    success(ticket)
}

/// Playlist, segment or direct stream, selected by the signed query.
pub async fn stream(
    State(state): State<SharedState>,
    Query(params): Query<StreamParams>,
) -> Result<Response, ApiError> {
    let request = SignedRequest::from_params(params)?;
    let reply = state.proxy.handle(&request).await?;
    Ok(into_response(reply))
}

/// Segment alias: `/api/segment/{name}?channel_id=..&timestamp=..&signature=..`
pub async fn segment(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Query(params): Query<StreamParams>,
) -> Result<Response, ApiError> {
    if !is_segment_name(&name) {
        return Err(ApiError::bad_request(format!("invalid segment name: {name}")));
    }
    let request = SignedRequest::from_params(StreamParams {
        segment: None,
        ..params
    })?;
    let reply = state.proxy.handle_segment(&request, &name).await?;
    Ok(into_response(reply))
}

/// CORS preflight.
pub async fn preflight() -> impl IntoResponse {
    (StatusCode::NO_CONTENT, CORS)
}

fn into_response(reply: StreamReply) -> Response {
    match reply {
        StreamReply::Playlist { body, cache } => (
            CORS,
            [
                (header::CONTENT_TYPE, PLAYLIST_TYPE),
                (header::CACHE_CONTROL, "max-age=3, must-revalidate"),
                (CACHE_STATUS, cache.as_str()),
            ],
            body,
        )
            .into_response(),
        StreamReply::Segment { body, cache } => (
            CORS,
            [
                (header::CONTENT_TYPE, SEGMENT_TYPE),
                (header::CACHE_CONTROL, "public, max-age=60"),
                (CACHE_STATUS, cache.as_str()),
            ],
            body,
        )
            .into_response(),
        StreamReply::Redirect(url) => {
            (StatusCode::FOUND, CORS, [(header::LOCATION, url)]).into_response()
        }
        StreamReply::Live { content_type, chunks } => {
            info!(content_type = %content_type, "streaming local transcoder output");
            let stream = futures::stream::unfold(chunks, |mut rx| async move {
                rx.recv()
                    .await
                    .map(|chunk| (Ok::<Bytes, std::io::Error>(chunk), rx))
            });
            (
                CORS,
                [
                    (header::CONTENT_TYPE, content_type),
                    (header::CACHE_CONTROL, "no-cache".to_string()),
                ],
                Body::from_stream(stream),
            )
                .into_response()
        }
    }
}

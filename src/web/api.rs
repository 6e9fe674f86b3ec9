//! HTTP endpoints: live channel streams, RTP relays and the playlist.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header::CONTENT_TYPE, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::stream;
use log::{info, warn};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use tokio::net::UdpSocket;

use crate::catalog::ChannelMap;
use crate::channel::{ChannelEngine, ChannelRegistry};
use crate::web::state::AppState;

/// Characters escaped when a channel name becomes a URL path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'%');

/// Releases the registry subscription when the response body is dropped,
/// whether the stream ended or the client went away mid-stream.
struct SubscriptionGuard {
    registry: Arc<ChannelRegistry>,
    endpoint: String,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let registry = Arc::clone(&self.registry);
        let endpoint = std::mem::take(&mut self.endpoint);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                registry.release(&endpoint).await;
            });
        }
    }
}

/// `GET /ch/:name` — stream a channel as cleartext TS until the client
/// disconnects or the engine dies.
pub async fn stream_channel(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    let Some(channel) = state.catalog.get(&name).await else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let reader = state.registry.acquire(&channel.addr, channel.master_key).await;
    info!("start serving channel {name} @ {}", channel.addr);

    let guard = SubscriptionGuard {
        registry: Arc::clone(&state.registry),
        endpoint: channel.addr,
    };
    let body = Body::from_stream(stream::unfold(
        (reader, guard),
        |(mut reader, guard)| async move {
            let pkt = reader.next().await?;
            Some((Ok::<Bytes, Infallible>(pkt), (reader, guard)))
        },
    ));

    ([(CONTENT_TYPE, "video/mp2t")], body).into_response()
}

/// `GET /rtp/:name/:dest` — descramble a channel and forward its RTP
/// datagrams to `dest` (`host:port`). Fire-and-forget: the relay runs
/// until its multicast stream fails.
pub async fn relay_rtp(
    State(state): State<Arc<AppState>>,
    Path((name, dest)): Path<(String, String)>,
) -> StatusCode {
    let Some(channel) = state.catalog.get(&name).await else {
        return StatusCode::BAD_REQUEST;
    };

    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("cannot bind relay socket: {e}");
            return StatusCode::BAD_REQUEST;
        }
    };
    if let Err(e) = socket.connect(dest.as_str()).await {
        warn!("bad relay destination {dest}: {e}");
        return StatusCode::BAD_REQUEST;
    }

    info!("relaying channel {name} @ {} to {dest}", channel.addr);
    let source = state.registry.open_socket(&channel.addr);
    let engine = ChannelEngine::new(channel.addr, channel.master_key, None);
    tokio::spawn(engine.run(source, Some(socket)));
    StatusCode::OK
}

/// `GET /channels.m3u` — playlist of every cataloged channel.
pub async fn playlist(State(state): State<Arc<AppState>>) -> Response {
    let channels = state.catalog.snapshot().await;
    let body = build_playlist(&channels, &state.http_addr);
    ([(CONTENT_TYPE, "audio/x-mpegurl")], body).into_response()
}

fn build_playlist(channels: &ChannelMap, http_addr: &str) -> String {
    let mut entries: Vec<(String, &str)> = channels
        .keys()
        .map(|name| {
            (
                utf8_percent_encode(name, PATH_SEGMENT).to_string(),
                name.as_str(),
            )
        })
        .collect();
    entries.sort();

    let mut out = String::from("#EXTM3U\n");
    for (escaped, name) in entries {
        out.push_str(&format!("#EXTINF:-1, {name}\n"));
        out.push_str(&format!("http://{http_addr}/ch/{escaped}\n"));
    }
    out
}

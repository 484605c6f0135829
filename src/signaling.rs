//! `POST /sdp`: decode an offer, negotiate a peer connection, and stream
//! back the answer followed by trickled ICE candidates (spec.md §4.3).
//!
//! Grounded on `crates/server/src/web.rs` for the axum `Router`/`State`
//! conventions and on
//! `examples/webrtc-rs-webrtc/examples/examples/broadcast/broadcast.rs` for
//! the offer/answer/`gathering_complete_promise` shape, generalized here
//! from "block until gathering finishes, then answer once" to "answer
//! first, then trickle candidates as they arrive".

use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures_util::future::select;
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::broadcast::LoopEvent;
use crate::config;
use crate::metrics::Metrics;
use crate::peer::Peer;
use crate::webrtc_peer;

/// Shared application state reachable from every signaling request.
pub struct AppState {
    /// Rendezvous channel to the broadcast loop (spec.md §4.5/§9: the
    /// broadcast loop is the sole mutator of the registry).
    pub handoff_tx: std::sync::mpsc::Sender<LoopEvent>,
    pub metrics: Arc<Metrics>,
}

#[derive(Deserialize)]
struct SdpOfferBody {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    kind: String,
    sdp: String,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    // `.fallback` on the method router (not the top-level one) catches a
    // non-POST request to a path that does exist, turning axum's default
    // 405 into the flat 404 scenario S6-adjacent behavior calls for.
    Router::new()
        .route("/sdp", post(handle_sdp).fallback(not_found))
        .route("/metrics", get(handle_metrics))
        .fallback(not_found)
        .layer(RequestBodyLimitLayer::new(config::MAX_OFFER_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn handle_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.metrics.render_prometheus(),
    )
}

async fn handle_sdp(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let offer: SdpOfferBody = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid JSON: {e}")).into_response();
        }
    };

    match negotiate(&state, offer.sdp).await {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .expect("response with a streamed body is well-formed"),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response(),
    }
}

/// Build a peer connection for this listener, answer its offer, and return
/// a streamed body: the answer object first, then trickled ICE candidates
/// until gathering completes (or a candidate fails to encode, in which case
/// an in-band `{error}` object ends the stream early — spec.md §7).
async fn negotiate(state: &AppState, offer_sdp: String) -> anyhow::Result<Body> {
    let built = webrtc_peer::build_peer_connection().await?;
    let peer_connection = built.peer_connection;
    let audio_track = built.audio_track;
    let rtp_sender = built.rtp_sender;

    let (ice_tx, ice_rx) = mpsc::channel::<Value>(32);
    let (abort_tx, abort_rx) = oneshot::channel::<()>();
    let abort_slot = Arc::new(Mutex::new(Some(abort_tx)));

    {
        let ice_tx = ice_tx.clone();
        let abort_slot = Arc::clone(&abort_slot);
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let ice_tx = ice_tx.clone();
            let abort_slot = Arc::clone(&abort_slot);
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let value = serde_json::to_value(&init).unwrap_or_else(|_| json!({}));
                        let _ = ice_tx.send(value).await;
                    }
                    Err(e) => {
                        warn!("failed to encode ICE candidate: {e}");
                        let _ = ice_tx
                            .send(json!({ "error": format!("failed to encode candidate: {e}") }))
                            .await;
                        if let Some(tx) = abort_slot.lock().unwrap().take() {
                            let _ = tx.send(());
                        }
                    }
                }
            })
        }));
    }

    let (frame_tx, frame_rx) = mpsc::channel::<Bytes>(config::QUEUE_CAPACITY);
    let peer = Arc::new(Peer::new(frame_tx));

    webrtc_peer::wire_lifecycle(
        &peer_connection,
        Arc::clone(&peer),
        state.handoff_tx.clone(),
        Arc::clone(&state.metrics),
    );

    tokio::spawn(webrtc_peer::run_peer_sender(frame_rx, audio_track));
    tokio::spawn(webrtc_peer::run_rtcp_drain(
        rtp_sender,
        Arc::clone(&peer_connection),
    ));

    let offer = RTCSessionDescription::offer(offer_sdp)?;
    peer_connection.set_remote_description(offer).await?;
    let answer = peer_connection.create_answer(None).await?;
    peer_connection.set_local_description(answer.clone()).await?;

    let mut gather_complete = peer_connection.gathering_complete_promise().await;
    let gather_complete_fut = async move {
        let _ = gather_complete.recv().await;
    };
    let abort_fut = async move {
        let _ = abort_rx.await;
    };
    let end_signal = select(Box::pin(gather_complete_fut), Box::pin(abort_fut));

    let answer_value = json!({ "type": "answer", "sdp": answer.sdp });
    let answer_stream = stream::once(async move { Bytes::from(answer_value.to_string()) });
    let ice_stream = ReceiverStream::new(ice_rx)
        .map(|v| Bytes::from(v.to_string()))
        .take_until(end_signal);

    let body_stream = answer_stream
        .chain(ice_stream)
        .map(Ok::<Bytes, std::io::Error>);

    Ok(Body::from_stream(body_stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let (tx, _rx) = std::sync::mpsc::channel();
        Arc::new(AppState {
            handoff_tx: tx,
            metrics: Arc::new(Metrics::new()),
        })
    }

    #[tokio::test]
    async fn malformed_offer_returns_400_with_prefix() {
        let app = build_router(test_state());

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/sdp")
            .body(Body::from("not json"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.starts_with("invalid JSON:"));
    }

    #[tokio::test]
    async fn non_post_on_sdp_is_404() {
        let app = build_router(test_state());

        let request = axum::http::Request::builder()
            .method("GET")
            .uri("/sdp")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_prometheus_text() {
        let state = test_state();
        state.metrics.total_clients.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let app = build_router(state);

        let request = axum::http::Request::builder()
            .method("GET")
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("streama_total_clients 1"));
    }
}

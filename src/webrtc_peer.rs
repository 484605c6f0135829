//! WebRTC plumbing: peer connection construction, the per-peer sender, and
//! the RTCP drain.
//!
//! Grounded on `crates/agent/src/peer.rs` (`MediaEngine`/`TrackLocalStaticSample`
//! construction, `on_peer_connection_state_change`, `start_rtcp_reader`),
//! narrowed to audio-only and generalized from a single long-lived peer to
//! one built fresh per listener.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config;
use crate::metrics::Metrics;
use crate::peer::{Peer, PeerState};

/// A freshly built peer connection plus the pieces the signaling handler and
/// lifecycle glue need to drive it.
pub struct NewWebRtcPeer {
    pub peer_connection: Arc<RTCPeerConnection>,
    pub audio_track: Arc<TrackLocalStaticSample>,
    pub rtp_sender: Arc<RTCRtpSender>,
}

/// Build a new `RTCPeerConnection` with a single Opus audio track and the
/// configured STUN server. One call per listener (spec.md §4.3 step 2/4/5).
pub async fn build_peer_connection() -> anyhow::Result<NewWebRtcPeer> {
    let mut media_engine = MediaEngine::default();

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: config::SAMPLE_RATE,
                channels: config::CHANNELS,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: Vec::<RTCPFeedback>::new(),
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let rtc_config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![config::STUN_SERVER.to_string()],
            ..Default::default()
        }],
        ..Default::default()
    };

    let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await?);

    let audio_track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: config::SAMPLE_RATE,
            channels: config::CHANNELS,
            ..Default::default()
        },
        "audio".to_string(),
        "opuscaster".to_string(),
    ));

    let rtp_sender = peer_connection
        .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
        .await?;

    Ok(NewWebRtcPeer {
        peer_connection,
        audio_track,
        rtp_sender,
    })
}

/// Wire peer-connection state transitions onto `peer`'s atomic state, and
/// hand the peer off to the broadcast loop on the first CONNECTED
/// transition (spec.md §4.6).
pub fn wire_lifecycle(
    peer_connection: &Arc<RTCPeerConnection>,
    peer: Arc<Peer>,
    handoff_tx: std::sync::mpsc::Sender<crate::broadcast::LoopEvent>,
    metrics: Arc<Metrics>,
) {
    let handed_off = Arc::new(AtomicI64::new(0));

    peer_connection.on_peer_connection_state_change(Box::new(move |state| {
        let peer = Arc::clone(&peer);
        let handoff_tx = handoff_tx.clone();
        let metrics = Arc::clone(&metrics);
        let handed_off = Arc::clone(&handed_off);

        match state {
            RTCPeerConnectionState::Connected => {
                peer.set_state(PeerState::Connected);
                if handed_off.swap(1, Ordering::SeqCst) == 0 {
                    metrics.current_clients.fetch_add(1, Ordering::Relaxed);
                    metrics.total_clients.fetch_add(1, Ordering::Relaxed);
                    if handoff_tx
                        .send(crate::broadcast::LoopEvent::NewPeer(peer))
                        .is_err()
                    {
                        warn!("broadcast loop is gone, dropping new peer hand-off");
                    }
                } else {
                    // Reconnected after a transient DISCONNECTED; already registered.
                    metrics.current_clients.fetch_add(1, Ordering::Relaxed);
                }
                info!(?state, "peer connection state changed");
            }
            RTCPeerConnectionState::Disconnected => {
                peer.set_state(PeerState::Disconnected);
                metrics.current_clients.fetch_sub(1, Ordering::Relaxed);
                info!(?state, "peer connection state changed");
            }
            RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed => {
                let was_connected = peer.state() != PeerState::Closed;
                peer.set_state(PeerState::Closed);
                if was_connected {
                    metrics.current_clients.fetch_sub(1, Ordering::Relaxed);
                }
                info!(?state, "peer connection state changed");
            }
            _ => {
                info!(?state, "peer connection state changed");
            }
        }
        Box::pin(async {})
    }));
}

/// Drain `rx` into `track`, one `write_sample` per dequeued frame
/// (spec.md §4.4). Exits when the channel closes (the broadcast loop closes
/// it once it observes CLOSED, I3).
pub async fn run_peer_sender(mut rx: mpsc::Receiver<Bytes>, track: Arc<TrackLocalStaticSample>) {
    while let Some(frame) = rx.recv().await {
        let sample = webrtc::media::Sample {
            data: frame,
            duration: config::FRAME_DURATION,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            warn!("track write failed: {e}");
        }
    }
    debug!("peer sender exiting, queue closed");
}

/// Drain RTCP off the sender so the WebRTC stack's interceptors (NACK) keep
/// running; the packets themselves are discarded (spec.md §4.4, §9).
///
/// Also the sole long-lived owner of `_peer_connection`: nothing else holds
/// an `Arc` to it past `negotiate()` returning, so keeping it here for the
/// duration of this task is what keeps the connection (and its ICE agent)
/// alive until `read_rtcp` starts erroring out at close.
pub async fn run_rtcp_drain(sender: Arc<RTCRtpSender>, _peer_connection: Arc<RTCPeerConnection>) {
    loop {
        match sender.read_rtcp().await {
            Ok(_) => {}
            Err(e) => {
                debug!("rtcp drain exiting: {e}");
                break;
            }
        }
    }
}

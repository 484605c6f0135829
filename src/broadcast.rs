//! The broadcast loop: single producer for capture, encode, and fan-out
//! (spec.md §4.5).
//!
//! Runs on a dedicated OS thread rather than a tokio task. Capture `read`
//! and Opus `encode` are blocking calls with no async equivalent, and this
//! loop's 10ms cadence must not be at the mercy of the async executor's
//! scheduling (spec.md §9's "producer ticking" note: the device itself is
//! the clock). Cross-thread handoff mirrors
//! `crates/agent/src/main.rs`'s `CaptureCommand` channel, generalized from
//! "tokio tasks talk to a capture thread" to "tokio tasks and the shutdown
//! watcher talk to the broadcast thread".

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;
use std::time::Instant;

use tracing::{error, info};

use crate::capture::PcmSource;
use crate::config;
use crate::opus_codec::OpusEncoder;
use crate::peer::{Peer, PeerRegistry, PeerState};

/// Events the broadcast loop reacts to from the rest of the process.
pub enum LoopEvent {
    /// A peer just reached CONNECTED for the first time.
    NewPeer(Arc<Peer>),
    /// Graceful shutdown requested.
    Shutdown,
}

/// Run the broadcast loop until `LoopEvent::Shutdown`, logging final
/// per-peer stats before returning (spec.md §7's fatal-exit protocol also
/// routes through here on a capture/encode error — see `fatal_exit`).
pub fn run(mut capture: Box<dyn PcmSource>, events: Receiver<LoopEvent>) {
    let mut registry = PeerRegistry::new();
    let mut pcm_buf = vec![0i16; config::FRAME_SIZE];
    let mut encoder = match OpusEncoder::new() {
        Ok(e) => e,
        Err(e) => fatal_exit(&registry, &format!("failed to initialize Opus encoder: {e:#}")),
    };
    let mut last_stats = Instant::now();

    loop {
        if registry.is_empty() {
            capture.abort();
            match events.recv() {
                Ok(LoopEvent::NewPeer(peer)) => {
                    register_peer(&mut registry, peer);
                }
                Ok(LoopEvent::Shutdown) | Err(_) => {
                    info!("broadcast loop shutting down (idle)");
                    log_final_stats(&registry);
                    return;
                }
            }
            continue;
        }

        // Opportunistically drain any further pending hand-offs without blocking.
        loop {
            match events.try_recv() {
                Ok(LoopEvent::NewPeer(peer)) => register_peer(&mut registry, peer),
                Ok(LoopEvent::Shutdown) => {
                    info!("broadcast loop shutting down");
                    log_final_stats(&registry);
                    return;
                }
                Err(_) => break,
            }
        }

        if !capture.is_running()
            && let Err(e) = capture.start()
        {
            fatal_exit(&registry, &format!("failed to start capture: {e:#}"));
        }

        if let Err(e) = capture.read(&mut pcm_buf) {
            fatal_exit(&registry, &format!("capture read failed: {e:#}"));
        }

        let frame = match encoder.encode(&pcm_buf) {
            Ok(f) => f,
            Err(e) => fatal_exit(&registry, &format!("Opus encode failed: {e:#}")),
        };

        let mut closed = Vec::new();
        for (id, peer) in registry.iter() {
            match peer.state() {
                PeerState::Closed => closed.push(*id),
                PeerState::Disconnected => {}
                PeerState::Connected => {
                    peer.try_enqueue(frame.clone());
                }
            }
        }
        for id in closed {
            // Removing (rather than just dropping the Arc) closes the
            // queue's sending half once every clone is gone, which ends
            // the per-peer sender task (I3).
            if let Some(peer) = registry.remove(id) {
                info!(
                    peer_id = id,
                    sent = peer.sent(),
                    dropped = peer.dropped(),
                    "peer closed, removed from registry"
                );
            }
        }

        if last_stats.elapsed() >= config::STATS_INTERVAL {
            for (id, peer) in registry.iter() {
                info!(
                    peer_id = *id,
                    sent = peer.sent(),
                    dropped = peer.dropped(),
                    "peer stats"
                );
            }
            last_stats = Instant::now();
        }
    }
}

fn register_peer(registry: &mut PeerRegistry, peer: Arc<Peer>) {
    let id = registry.insert(peer);
    info!(peer_id = id, "peer registered with broadcast loop");
}

fn log_final_stats(registry: &PeerRegistry) {
    for (id, peer) in registry.iter() {
        info!(
            peer_id = *id,
            sent = peer.sent(),
            dropped = peer.dropped(),
            "final peer stats"
        );
    }
}

/// Single fatal-exit protocol for capture/encode failures (spec.md §7/§9):
/// log final stats, then terminate the process. These failures are treated
/// as non-recoverable audio hardware faults; an external supervisor handles
/// restart.
fn fatal_exit(registry: &PeerRegistry, message: &str) -> ! {
    error!("{message}");
    log_final_stats(registry);
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::test_support::FakeCapture;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use tokio::sync::mpsc as tokio_mpsc;

    #[test]
    fn idle_with_no_peers_never_starts_capture() {
        // Regression for P4: with zero peers, capture must never be started.
        let capture = Box::new(FakeCapture::new());
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || run(capture, rx));
        tx.send(LoopEvent::Shutdown).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn connecting_a_peer_starts_capture_and_delivers_frames() {
        let capture = Box::new(FakeCapture::new());
        let (tx, rx) = mpsc::channel();
        let (frame_tx, mut frame_rx) = tokio_mpsc::channel(config::QUEUE_CAPACITY);
        let peer = Arc::new(Peer::new(frame_tx));
        peer.set_state(PeerState::Connected);

        let handle = thread::spawn(move || run(capture, rx));
        tx.send(LoopEvent::NewPeer(Arc::clone(&peer))).unwrap();

        // Block (with a generous bound) until at least one frame arrives.
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let got = tokio::time::timeout(Duration::from_secs(2), frame_rx.recv())
                .await
                .expect("timed out waiting for a frame")
                .expect("channel closed unexpectedly");
            assert!(!got.is_empty());
        });

        peer.set_state(PeerState::Closed);
        tx.send(LoopEvent::Shutdown).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn slow_consumer_drops_without_blocking_others() {
        let capture = Box::new(FakeCapture::new());
        let (tx, rx) = mpsc::channel();

        let (slow_tx, _slow_rx_kept_unread) = tokio_mpsc::channel(config::QUEUE_CAPACITY);
        let slow_peer = Arc::new(Peer::new(slow_tx));
        slow_peer.set_state(PeerState::Connected);

        let (fast_tx, mut fast_rx) = tokio_mpsc::channel(config::QUEUE_CAPACITY);
        let fast_peer = Arc::new(Peer::new(fast_tx));
        fast_peer.set_state(PeerState::Connected);

        let handle = thread::spawn(move || run(capture, rx));
        tx.send(LoopEvent::NewPeer(Arc::clone(&slow_peer))).unwrap();
        tx.send(LoopEvent::NewPeer(Arc::clone(&fast_peer))).unwrap();

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            for _ in 0..(config::QUEUE_CAPACITY + 5) {
                let _ = tokio::time::timeout(Duration::from_secs(2), fast_rx.recv())
                    .await
                    .expect("fast peer stalled");
            }
        });

        assert!(slow_peer.dropped() > 0, "slow peer should have dropped frames");
        assert!(fast_peer.sent() >= config::QUEUE_CAPACITY as u64 + 5);

        slow_peer.set_state(PeerState::Closed);
        fast_peer.set_state(PeerState::Closed);
        tx.send(LoopEvent::Shutdown).unwrap();
        handle.join().unwrap();
    }
}

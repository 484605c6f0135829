//! PCM capture source.
//!
//! Grounded on `crates/agent/src/audio.rs`'s use of `libpulse-simple-binding`,
//! whose `Simple::read` blocks until the requested buffer is full — exactly
//! the contract spec.md §4.1 wants. That file folds "open" and "start" into
//! one constructor because the screen-share agent never idles its capture
//! device; this broadcaster does (I1, P4), so capture is split into an
//! explicit open/start/abort/read lifecycle.

use anyhow::Context;
use libpulse_binding as pulse;
use libpulse_simple_binding::Simple;
use tracing::info;

use crate::config;

/// A blocking PCM source. One call to `read` fills `buf` with exactly
/// `config::FRAME_SIZE` interleaved samples and blocks for one frame
/// duration of wall clock.
pub trait PcmSource: Send {
    /// Open the device, if not already open. Idempotent.
    fn start(&mut self) -> anyhow::Result<()>;
    /// Release the device. Idempotent; a subsequent `start` reopens it.
    fn abort(&mut self);
    /// Block until `buf` is filled. `buf.len()` must equal `config::FRAME_SIZE`.
    fn read(&mut self, buf: &mut [i16]) -> anyhow::Result<()>;
    /// Whether the device is currently open (test/diagnostic hook).
    fn is_running(&self) -> bool;
}

/// PulseAudio-backed capture source, opened against a named device or the
/// default input.
pub struct PulseCapture {
    device: Option<String>,
    conn: Option<Simple>,
    /// Scratch buffer for the raw s16le bytes read from PulseAudio, reused
    /// across ticks to avoid a per-frame allocation.
    pcm_bytes: Vec<u8>,
}

impl PulseCapture {
    /// Open a capture handle for `device` (exact name) or the default input
    /// if `None`. Does not connect yet — connection happens in `start`.
    pub fn open(device: Option<String>) -> Self {
        Self {
            device,
            conn: None,
            pcm_bytes: vec![0u8; config::FRAME_SIZE * 2],
        }
    }
}

impl PcmSource for PulseCapture {
    fn start(&mut self) -> anyhow::Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }

        let spec = pulse::sample::Spec {
            format: pulse::sample::Format::S16le,
            channels: config::CHANNELS as u8,
            rate: config::SAMPLE_RATE,
        };

        // This is also where a device that can't deliver the requested
        // stereo format at 48kHz surfaces as a fatal error — the simple
        // blocking API has no separate channel-count introspection call,
        // so "request and fail fast" is the honest mapping of the spec's
        // "must offer at least 2 input channels" contract onto this crate.
        let simple = Simple::new(
            None,
            "opuscaster",
            pulse::stream::Direction::Record,
            self.device.as_deref(),
            "audio-capture",
            &spec,
            None,
            None,
        )
        .map_err(|e| anyhow::anyhow!("PulseAudio capture open failed: {e}"))?;

        info!(
            device = self.device.as_deref().unwrap_or("default"),
            sample_rate = config::SAMPLE_RATE,
            channels = config::CHANNELS,
            "capture started"
        );
        self.conn = Some(simple);
        Ok(())
    }

    fn abort(&mut self) {
        if self.conn.take().is_some() {
            info!("capture aborted");
        }
    }

    fn read(&mut self, buf: &mut [i16]) -> anyhow::Result<()> {
        debug_assert_eq!(buf.len(), config::FRAME_SIZE);
        let conn = self
            .conn
            .as_ref()
            .context("read called before capture was started")?;

        conn.read(&mut self.pcm_bytes)
            .map_err(|e| anyhow::anyhow!("PulseAudio read failed: {e}"))?;

        for (i, chunk) in self.pcm_bytes.chunks_exact(2).enumerate() {
            buf[i] = i16::from_le_bytes([chunk[0], chunk[1]]);
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.conn.is_some()
    }
}

#[cfg(test)]
pub mod test_support {
    use super::PcmSource;
    use crate::config;

    /// A deterministic capture source for tests: emits a fixed sample value
    /// per tick and tracks start/abort calls so the broadcast loop's idle
    /// suspend/resume behavior (P4) can be asserted without real audio
    /// hardware.
    pub struct FakeCapture {
        pub running: bool,
        pub start_count: u32,
        pub abort_count: u32,
        pub ticks_read: u64,
    }

    impl FakeCapture {
        pub fn new() -> Self {
            Self {
                running: false,
                start_count: 0,
                abort_count: 0,
                ticks_read: 0,
            }
        }
    }

    impl PcmSource for FakeCapture {
        fn start(&mut self) -> anyhow::Result<()> {
            if !self.running {
                self.start_count += 1;
            }
            self.running = true;
            Ok(())
        }

        fn abort(&mut self) {
            if self.running {
                self.abort_count += 1;
            }
            self.running = false;
        }

        fn read(&mut self, buf: &mut [i16]) -> anyhow::Result<()> {
            assert!(self.running, "read called while not running");
            assert_eq!(buf.len(), config::FRAME_SIZE);
            buf.fill(0);
            self.ticks_read += 1;
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running
        }
    }
}

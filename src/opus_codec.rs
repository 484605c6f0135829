//! Opus encoding. One call per captured frame, deterministic output size.
//!
//! Grounded on `crates/agent/src/audio.rs`'s `audiopus` usage, generalized
//! from `Application::LowDelay` (screen-share audio, prioritizes latency
//! over quality) to `Application::Voip` per spec.md §1's "VoIP profile",
//! and from a 256kbps music bitrate down to a voice-appropriate one.

use audiopus::coder::Encoder as AudiopusEncoder;
use audiopus::{Application, Bitrate, Channels, SampleRate};
use bytes::Bytes;

use crate::config;

pub struct OpusEncoder {
    inner: AudiopusEncoder,
    scratch: Vec<u8>,
}

impl OpusEncoder {
    pub fn new() -> anyhow::Result<Self> {
        let mut inner = AudiopusEncoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Voip)
            .map_err(|e| anyhow::anyhow!("failed to create Opus encoder: {e:?}"))?;

        inner
            .set_bitrate(Bitrate::BitsPerSecond(config::OPUS_BITRATE_BPS))
            .map_err(|e| anyhow::anyhow!("failed to set Opus bitrate: {e:?}"))?;

        Ok(Self {
            inner,
            scratch: vec![0u8; config::MAX_OPUS_FRAME_BYTES],
        })
    }

    /// Encode one tick's worth of interleaved PCM (`config::FRAME_SIZE`
    /// samples) into a single Opus packet.
    pub fn encode(&mut self, pcm: &[i16]) -> anyhow::Result<Bytes> {
        debug_assert_eq!(pcm.len(), config::FRAME_SIZE);
        let n = self
            .inner
            .encode(pcm, &mut self.scratch)
            .map_err(|e| anyhow::anyhow!("Opus encode failed: {e:?}"))?;
        Ok(Bytes::copy_from_slice(&self.scratch[..n]))
    }
}

use std::time::Duration;

/// Audio parameters, fixed for the process lifetime (spec.md §3 `AudioConfig`).
pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u16 = 2;
pub const FRAME_DURATION: Duration = Duration::from_millis(10);

/// PCM samples per channel in one 10ms tick, derived from the sample rate.
pub const SAMPLES_PER_CHANNEL: usize = SAMPLE_RATE as usize / 100;

/// Interleaved PCM sample count per tick (per channel samples × channel count).
pub const FRAME_SIZE: usize = SAMPLES_PER_CHANNEL * CHANNELS as usize;

/// Opus bitrate for the VoIP profile. Voice, not music, so this sits well below
/// the music-streaming bitrates a screen-share agent would pick.
pub const OPUS_BITRATE_BPS: i32 = 32_000;

/// Maximum bytes a single Opus frame can occupy at these parameters.
pub const MAX_OPUS_FRAME_BYTES: usize = 1024;

/// Per-peer pending-frame queue capacity (~100ms of audio).
pub const QUEUE_CAPACITY: usize = 10;

/// Wall-clock interval between per-peer stats log lines.
pub const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Single STUN server used for ICE (spec.md §6).
pub const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Grace period given to in-flight requests and the broadcast loop on shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;

/// Cap on the signaling request body — an SDP offer is a few KB at most.
pub const MAX_OFFER_BODY_BYTES: usize = 64 * 1024;

/// Runtime configuration, built once at startup from environment and argv.
///
/// Unlike the teacher's `BeamConfig` (TOML file, many subsystems), this
/// process has nothing worth putting in a config file: every tunable here
/// maps 1:1 to a compile-time constant in spec.md §6. A TOML loader would
/// just be indirection over the same three knobs.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    /// Exact capture device name; `None` selects the default input device.
    pub capture_device: Option<String>,
}

impl Config {
    /// Build configuration from environment variables and the first positional
    /// CLI argument (the optional capture device name, per spec.md §6).
    pub fn from_env_and_args() -> Self {
        let bind = std::env::var("OPUSCASTER_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
        let port = std::env::var("OPUSCASTER_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let capture_device = std::env::args().nth(1);

        Self {
            bind,
            port,
            capture_device,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_matches_spec() {
        assert_eq!(SAMPLES_PER_CHANNEL, 480);
        assert_eq!(FRAME_SIZE, 960);
    }
}

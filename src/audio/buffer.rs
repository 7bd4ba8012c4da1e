use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Sample rate / channel layout of interleaved f32 PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// The one format every decoded clip is converted to and every bus mixes in:
/// 48 kHz, stereo, f32 interleaved.
pub const CANONICAL_FORMAT: AudioFormat = AudioFormat {
    sample_rate: 48_000,
    channels: 2,
};

impl AudioFormat {
    /// Interleaved samples per second (`sample_rate * channels`).
    pub fn samples_per_second(&self) -> u32 {
        self.sample_rate * self.channels as u32
    }
}

/// Decoded, immutable PCM held in memory for low-latency playback.
///
/// Shared read-only (`Arc<DecodedAudio>`) between the cache and every voice
/// playing it.
#[derive(Debug)]
pub struct DecodedAudio {
    samples: Vec<f32>,
    format: AudioFormat,
}

impl DecodedAudio {
    /// Wrap interleaved samples. A trailing partial frame is dropped so that
    /// `len() % channels == 0` always holds.
    pub fn new(mut samples: Vec<f32>, format: AudioFormat) -> Self {
        let channels = format.channels.max(1) as usize;
        let whole = samples.len() - samples.len() % channels;
        samples.truncate(whole);
        Self { samples, format }
    }

    /// Canonical-format buffer (48 kHz stereo).
    pub fn canonical(samples: Vec<f32>) -> Self {
        Self::new(samples, CANONICAL_FORMAT)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Interleaved sample count.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.format.channels.max(1) as usize
    }

    pub fn duration(&self) -> Duration {
        if self.format.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.format.sample_rate as f64)
    }

    /// Estimated heap footprint of the sample data.
    pub fn memory_bytes(&self) -> usize {
        self.samples.len() * std::mem::size_of::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_from_frames() {
        let buf = DecodedAudio::canonical(vec![0.0; 48_000 * 2]);
        assert_eq!(buf.frames(), 48_000);
        assert!((buf.duration().as_secs_f64() - 1.0).abs() < 1e-9);
        assert_eq!(buf.memory_bytes(), 48_000 * 2 * 4);
    }

    #[test]
    fn partial_frame_is_dropped() {
        let buf = DecodedAudio::canonical(vec![0.1, 0.2, 0.3]);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.len() % CANONICAL_FORMAT.channels as usize, 0);
    }

    #[test]
    fn empty_buffer_has_zero_duration() {
        let buf = DecodedAudio::canonical(Vec::new());
        assert!(buf.is_empty());
        assert_eq!(buf.duration(), Duration::ZERO);
    }
}

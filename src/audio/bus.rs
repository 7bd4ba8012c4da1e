use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use cpal::{
    traits::{DeviceTrait, StreamTrait},
    BufferSize, Device, SampleFormat, SampleRate, Stream, StreamConfig, SupportedBufferSize,
};

use super::{buffer::CANONICAL_FORMAT, mixer::Mixer, voice::Voice};
use crate::error::EngineError;

/// Stereo scratch preallocated per stream: one second of canonical audio.
/// Device callbacks larger than this are rendered in chunks.
const SCRATCH_SAMPLES: usize = CANONICAL_FORMAT.sample_rate as usize * 2;

struct Binding {
    device_id: String,
    mixer: Arc<Mixer>,
    /// `None` for offline (headless) bindings.
    stream: Option<Stream>,
    stream_failed: Arc<AtomicBool>,
    render_scratch: Vec<f32>,
}

/// One logical output channel (monitor or inject) bound to at most one
/// device, with its own mixer.
///
/// Mutations are serialised by the bus mutex. The device callback only holds
/// the mixer, never that mutex.
pub struct OutputBus {
    label: &'static str,
    latency_ms: u32,
    inner: Mutex<Option<Binding>>,
}

// SAFETY: cpal::Stream is !Send on some platforms. The stream is only created,
// dropped and inspected while holding `inner`, and never handed out.
unsafe impl Send for OutputBus {}
unsafe impl Sync for OutputBus {}

impl OutputBus {
    pub fn new(label: &'static str, latency_ms: u32) -> Self {
        Self {
            label,
            latency_ms,
            inner: Mutex::new(None),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Binding>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind `device` and start streaming. Any previous binding is torn down
    /// first; on failure the bus stays disabled.
    pub fn initialize(&self, device_id: &str, device: &Device) -> Result<(), EngineError> {
        let mut inner = self.lock();
        Self::teardown(&mut inner);

        let bind_err = |reason: String| EngineError::DeviceBind {
            bus: self.label,
            device: device_id.to_string(),
            reason,
        };

        let config = negotiate_config(device, self.latency_ms).map_err(bind_err)?;
        let mixer = Arc::new(Mixer::new());
        let stream_failed = Arc::new(AtomicBool::new(false));

        let stream = build_stream(device, &config, Arc::clone(&mixer), Arc::clone(&stream_failed), self.label)
            .map_err(bind_err)?;
        stream
            .play()
            .map_err(|e| bind_err(format!("stream play error: {e}")))?;

        log::info!(
            "{} bus bound to '{}' | {} Hz | {} ch | buffer {:?}",
            self.label,
            device_id,
            config.sample_rate.0,
            config.channels,
            config.buffer_size
        );

        *inner = Some(Binding {
            device_id: device_id.to_string(),
            mixer,
            stream: Some(stream),
            stream_failed,
            render_scratch: Vec::new(),
        });
        Ok(())
    }

    /// Bind a mixer with no device behind it. The caller pulls audio with
    /// [`render`](Self::render); used for headless rendering and tests.
    pub fn bind_offline(&self, id: &str) {
        let mut inner = self.lock();
        Self::teardown(&mut inner);
        *inner = Some(Binding {
            device_id: id.to_string(),
            mixer: Arc::new(Mixer::new()),
            stream: None,
            stream_failed: Arc::new(AtomicBool::new(false)),
            render_scratch: Vec::new(),
        });
        log::debug!("{} bus bound offline as '{id}'", self.label);
    }

    /// Pull interleaved canonical samples from an offline binding. Returns
    /// `false` (and writes silence) when the bus is disabled or bound to a
    /// live device, whose callback owns the pull side.
    pub fn render(&self, out: &mut [f32]) -> bool {
        let mut inner = self.lock();
        match inner.as_mut() {
            Some(binding) if binding.stream.is_none() => {
                if binding.render_scratch.len() < out.len() {
                    binding.render_scratch.resize(out.len(), 0.0);
                }
                binding.mixer.mix_into(out, &mut binding.render_scratch);
                true
            }
            _ => {
                out.fill(0.0);
                false
            }
        }
    }

    pub fn add_voice(&self, voice: Arc<Voice>) {
        if let Some(binding) = self.lock().as_ref() {
            binding.mixer.add(voice);
        }
    }

    pub fn remove_voice(&self, voice: &Arc<Voice>) {
        if let Some(binding) = self.lock().as_ref() {
            binding.mixer.remove(voice);
        }
    }

    /// Free mixer snapshots the device callback has let go of.
    pub fn reclaim(&self) -> usize {
        self.lock().as_ref().map(|b| b.mixer.reclaim()).unwrap_or(0)
    }

    /// Tear down the binding. Safe to call repeatedly.
    pub fn disable(&self) {
        let mut inner = self.lock();
        if inner.is_some() {
            log::info!("{} bus disabled", self.label);
        }
        Self::teardown(&mut inner);
    }

    /// Bound and not reported broken by the device.
    pub fn is_active(&self) -> bool {
        self.lock()
            .as_ref()
            .map(|b| !b.stream_failed.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    pub fn device_id(&self) -> Option<String> {
        self.lock().as_ref().map(|b| b.device_id.clone())
    }

    pub fn voice_count(&self) -> usize {
        self.lock().as_ref().map(|b| b.mixer.len()).unwrap_or(0)
    }

    fn teardown(inner: &mut Option<Binding>) {
        if let Some(binding) = inner.take() {
            if let Some(stream) = binding.stream {
                if let Err(e) = stream.pause() {
                    log::debug!("pause on teardown failed: {e}");
                }
                drop(stream);
            }
        }
    }
}

impl Drop for OutputBus {
    fn drop(&mut self) {
        Self::teardown(&mut self.lock());
    }
}

// ── Stream setup ──────────────────────────────────────────────────────────────

/// Lower is better: stereo first, then wider layouts, mono last.
pub(crate) fn channel_rank(channels: u16) -> u32 {
    match channels {
        2 => 0,
        0 => u32::MAX,
        1 => 1000,
        n => n as u32,
    }
}

/// Frames of buffering for the requested latency at the canonical rate,
/// clamped to the device's supported range.
pub(crate) fn buffer_frames(latency_ms: u32, supported: &SupportedBufferSize) -> BufferSize {
    let wanted = CANONICAL_FORMAT.sample_rate * latency_ms / 1000;
    match supported {
        SupportedBufferSize::Range { min, max } if wanted > 0 => {
            BufferSize::Fixed(wanted.clamp(*min, *max))
        }
        _ => BufferSize::Default,
    }
}

/// Find an f32 output config at the canonical 48 kHz.
fn negotiate_config(device: &Device, latency_ms: u32) -> Result<StreamConfig, String> {
    let rate = CANONICAL_FORMAT.sample_rate;
    let range = device
        .supported_output_configs()
        .map_err(|e| format!("cannot query output configs: {e}"))?
        .filter(|r| r.sample_format() == SampleFormat::F32)
        .filter(|r| r.min_sample_rate().0 <= rate && r.max_sample_rate().0 >= rate)
        .min_by_key(|r| channel_rank(r.channels()))
        .ok_or_else(|| format!("device has no f32 output config at {rate} Hz"))?;

    let buffer_size = buffer_frames(latency_ms, range.buffer_size());
    let mut config = range.with_sample_rate(SampleRate(rate)).config();
    config.buffer_size = buffer_size;
    Ok(config)
}

fn build_stream(
    device: &Device,
    config: &StreamConfig,
    mixer: Arc<Mixer>,
    stream_failed: Arc<AtomicBool>,
    label: &'static str,
) -> Result<Stream, String> {
    let channels = config.channels as usize;
    let mut stereo = vec![0.0_f32; SCRATCH_SAMPLES];
    let mut scratch = vec![0.0_f32; SCRATCH_SAMPLES];

    let err_fn = move |e| {
        log::error!("{label} stream error: {e}");
        stream_failed.store(true, Ordering::Relaxed);
    };

    device
        .build_output_stream(
            config,
            move |output: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                device_callback(output, channels, &mixer, &mut stereo, &mut scratch);
            },
            err_fn,
            None,
        )
        .map_err(|e| format!("build stream error: {e}"))
}

// ── Real-time audio callback ─────────────────────────────────────────────────
//
// Runs on the CPAL real-time thread and never allocates or blocks.
fn device_callback(
    output: &mut [f32],
    channels: usize,
    mixer: &Mixer,
    stereo: &mut [f32],
    scratch: &mut [f32],
) {
    if channels == 0 {
        return;
    }
    let chunk_frames = stereo.len() / 2;
    for chunk in output.chunks_mut(chunk_frames * channels) {
        let frames = chunk.len() / channels;
        let st = &mut stereo[..frames * 2];
        mixer.mix_into(st, scratch);
        spread_stereo(st, chunk, channels);
    }
}

/// Write interleaved stereo into a device buffer of any channel count:
/// mono gets the L/R mean, wider layouts get L/R on the first two channels
/// and silence elsewhere.
pub(crate) fn spread_stereo(stereo: &[f32], out: &mut [f32], channels: usize) {
    match channels {
        2 => {
            let n = out.len().min(stereo.len());
            out[..n].copy_from_slice(&stereo[..n]);
        }
        1 => {
            for (o, lr) in out.iter_mut().zip(stereo.chunks_exact(2)) {
                *o = 0.5 * (lr[0] + lr[1]);
            }
        }
        n => {
            for (frame, lr) in out.chunks_mut(n).zip(stereo.chunks_exact(2)) {
                frame[0] = lr[0];
                frame[1] = lr[1];
                frame[2..].fill(0.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::audio::{buffer::DecodedAudio, voice::FadeTimes};

    fn voice(value: f32) -> Arc<Voice> {
        let clip = Arc::new(DecodedAudio::canonical(vec![value; 200]));
        let fades = FadeTimes {
            fade_in: Duration::ZERO,
            fade_out: Duration::ZERO,
        };
        Arc::new(Voice::new(0, clip, 1.0, 1.0, fades))
    }

    #[test]
    fn uninitialised_bus_ignores_voices() {
        let bus = OutputBus::new("monitor", 50);
        assert!(!bus.is_active());
        bus.add_voice(voice(0.5));
        assert_eq!(bus.voice_count(), 0);

        let mut out = vec![1.0; 8];
        assert!(!bus.render(&mut out));
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn offline_binding_mixes_registered_voices() {
        let bus = OutputBus::new("inject", 50);
        bus.bind_offline("headless");
        assert!(bus.is_active());
        assert_eq!(bus.device_id().as_deref(), Some("headless"));

        let v = voice(0.5);
        bus.add_voice(Arc::clone(&v));
        assert_eq!(bus.voice_count(), 1);

        let mut out = vec![0.0; 16];
        assert!(bus.render(&mut out));
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));

        bus.remove_voice(&v);
        assert_eq!(bus.voice_count(), 0);
    }

    #[test]
    fn re_registering_a_voice_keeps_one_entry() {
        let bus = OutputBus::new("monitor", 50);
        bus.bind_offline("a");
        let v = voice(0.5);
        bus.add_voice(Arc::clone(&v));
        bus.add_voice(Arc::clone(&v));
        assert_eq!(bus.voice_count(), 1);

        let mut out = vec![0.0; 16];
        bus.render(&mut out);
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));

        bus.remove_voice(&v);
        assert_eq!(bus.voice_count(), 0);
        bus.reclaim();
        assert_eq!(Arc::strong_count(&v), 1);
    }

    #[test]
    fn rebinding_drops_previous_mixer() {
        let bus = OutputBus::new("monitor", 50);
        bus.bind_offline("a");
        bus.add_voice(voice(0.1));
        bus.bind_offline("b");
        assert_eq!(bus.device_id().as_deref(), Some("b"));
        assert_eq!(bus.voice_count(), 0);
    }

    #[test]
    fn disable_is_idempotent() {
        let bus = OutputBus::new("monitor", 50);
        bus.bind_offline("a");
        bus.disable();
        bus.disable();
        assert!(!bus.is_active());
        assert_eq!(bus.device_id(), None);
    }

    #[test]
    fn stereo_is_preferred_then_wide_then_mono() {
        assert!(channel_rank(2) < channel_rank(6));
        assert!(channel_rank(6) < channel_rank(8));
        assert!(channel_rank(8) < channel_rank(1));
    }

    #[test]
    fn buffer_size_clamps_to_supported_range() {
        let range = SupportedBufferSize::Range { min: 64, max: 1024 };
        assert_eq!(buffer_frames(50, &range), BufferSize::Fixed(1024));
        assert_eq!(buffer_frames(10, &range), BufferSize::Fixed(480));
        assert_eq!(buffer_frames(50, &SupportedBufferSize::Unknown), BufferSize::Default);
    }

    #[test]
    fn spread_to_mono_averages() {
        let mut out = vec![0.0; 2];
        spread_stereo(&[1.0, 0.0, 0.5, 0.5], &mut out, 1);
        assert_eq!(out, vec![0.5, 0.5]);
    }

    #[test]
    fn spread_to_surround_fills_front_pair() {
        let mut out = vec![9.0; 8];
        spread_stereo(&[0.1, 0.2, 0.3, 0.4], &mut out, 4);
        assert_eq!(out, vec![0.1, 0.2, 0.0, 0.0, 0.3, 0.4, 0.0, 0.0]);
    }

    #[test]
    fn device_callback_renders_in_chunks() {
        let mixer = Mixer::new();
        mixer.add(voice(0.25));
        let mut stereo = vec![0.0; 8];
        let mut scratch = vec![0.0; 8];
        let mut output = vec![0.0; 20];
        device_callback(&mut output, 2, &mixer, &mut stereo, &mut scratch);
        assert!(output.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }
}

use std::{
    sync::{
        atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering},
        Arc, Mutex, TryLockError,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};

use super::{buffer::DecodedAudio, fade::FadeEnvelope, TileId};
use crate::config::EngineConfig;

/// Voice playback states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceState {
    Playing,
    FadingOut,
    /// Terminal: produces no samples, never leaves this state.
    Stopped,
}

impl VoiceState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => VoiceState::Playing,
            1 => VoiceState::FadingOut,
            _ => VoiceState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            VoiceState::Playing => 0,
            VoiceState::FadingOut => 1,
            VoiceState::Stopped => 2,
        }
    }
}

/// Fade-in applied at start and fade-out applied on stop requests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FadeTimes {
    pub fade_in: Duration,
    pub fade_out: Duration,
}

impl Default for FadeTimes {
    fn default() -> Self {
        Self {
            fade_in: Duration::from_millis(3),
            fade_out: Duration::from_millis(15),
        }
    }
}

impl FadeTimes {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            fade_in: Duration::from_millis(config.fade_in_ms as u64),
            fade_out: Duration::from_millis(config.fade_out_ms as u64),
        }
    }
}

/// An f32 gain readable from the audio thread and writable from the control
/// plane without locking.
#[derive(Debug)]
pub(crate) struct AtomicGain(AtomicU32);

impl AtomicGain {
    pub(crate) fn new(v: f32) -> Self {
        Self(AtomicU32::new(v.to_bits()))
    }

    #[inline]
    pub(crate) fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub(crate) fn set(&self, v: f32) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }
}

/// Pull-path-only state. The control plane never touches it; fade-out
/// requests arrive through the atomic `state` and are applied here on the
/// next `read`.
#[derive(Debug)]
struct Playhead {
    envelope: FadeEnvelope,
    ramping_out: bool,
}

/// One playing instance of a decoded clip.
///
/// The voice does not own an output. A bus mixer calls `read()` from the
/// device callback; the engine calls `begin_fade_out()` / `stop()` from the
/// control plane. Every trigger creates a fresh voice, so a voice is never
/// reused for another sound.
#[derive(Debug)]
pub struct Voice {
    tile_id: TileId,
    buffer: Arc<DecodedAudio>,
    state: AtomicU8,
    position: AtomicUsize,
    tile_volume: AtomicGain,
    master_volume: AtomicGain,
    fade_out: Duration,
    playhead: Mutex<Playhead>,
}

impl Voice {
    /// A new voice starts Playing at position 0 with a fade-in already armed.
    pub fn new(
        tile_id: TileId,
        buffer: Arc<DecodedAudio>,
        tile_volume: f32,
        master_volume: f32,
        fades: FadeTimes,
    ) -> Self {
        // Stepped once per interleaved sample, so clock it at samples/sec to
        // keep fade durations in wall-clock time.
        let mut envelope = FadeEnvelope::new(buffer.format().samples_per_second());
        envelope.start_fade_in(fades.fade_in);

        Self {
            tile_id,
            buffer,
            state: AtomicU8::new(VoiceState::Playing.as_u8()),
            position: AtomicUsize::new(0),
            tile_volume: AtomicGain::new(tile_volume),
            master_volume: AtomicGain::new(master_volume),
            fade_out: fades.fade_out,
            playhead: Mutex::new(Playhead {
                envelope,
                ramping_out: false,
            }),
        }
    }

    pub fn tile_id(&self) -> TileId {
        self.tile_id
    }

    pub fn buffer(&self) -> &Arc<DecodedAudio> {
        &self.buffer
    }

    pub fn state(&self) -> VoiceState {
        VoiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == VoiceState::Stopped
    }

    /// Read cursor in interleaved samples.
    pub fn position(&self) -> usize {
        self.position.load(Ordering::Relaxed)
    }

    /// Playhead as a fraction of the clip (0.0 for empty clips).
    pub fn progress(&self) -> f64 {
        let len = self.buffer.len();
        if len == 0 {
            return 0.0;
        }
        self.position() as f64 / len as f64
    }

    pub fn tile_volume(&self) -> f32 {
        self.tile_volume.get()
    }

    pub fn master_volume(&self) -> f32 {
        self.master_volume.get()
    }

    pub fn set_master_volume(&self, volume: f32) {
        self.master_volume.set(volume);
    }

    // ── Control plane ─────────────────────────────────────────────────────

    /// Request a fade-out. Only a Playing voice transitions; a voice already
    /// fading or stopped is left alone. Returns whether the request took.
    pub fn begin_fade_out(&self) -> bool {
        self.state
            .compare_exchange(
                VoiceState::Playing.as_u8(),
                VoiceState::FadingOut.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Hard cut: the next `read` returns nothing. Reserved for cap eviction.
    pub fn stop(&self) {
        self.state.store(VoiceState::Stopped.as_u8(), Ordering::Release);
    }

    // ── Pull path ─────────────────────────────────────────────────────────

    /// Fill `out` with gain-adjusted samples. Returns the number written,
    /// which is short of `out.len()` once the voice ends or stops.
    ///
    /// **Called on the real-time audio thread: no allocations.**
    pub fn read(&self, out: &mut [f32]) -> usize {
        if self.is_stopped() {
            return 0;
        }

        let mut playhead = match self.playhead.try_lock() {
            Ok(p) => p,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            // Only one mixer pulls a voice; contention means a misuse, so
            // yield silence rather than wait.
            Err(TryLockError::WouldBlock) => return 0,
        };

        let samples = self.buffer.samples();
        let mut pos = self.position.load(Ordering::Relaxed);
        let gain = self.tile_volume.get() * self.master_volume.get();
        let mut written = 0;

        while written < out.len() && pos < samples.len() {
            match self.state() {
                VoiceState::Stopped => break,
                VoiceState::FadingOut if !playhead.ramping_out => {
                    playhead.envelope.start_fade_out(self.fade_out);
                    playhead.ramping_out = true;
                }
                _ => {}
            }

            let fade = playhead.envelope.next_sample();
            out[written] = samples[pos] * gain * fade;
            pos += 1;
            written += 1;

            if playhead.ramping_out && playhead.envelope.is_complete() {
                self.stop();
                break;
            }
        }

        self.position.store(pos, Ordering::Relaxed);

        if pos >= samples.len() {
            self.stop();
        }

        written
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;

use super::voice::Voice;

/// Sums every registered voice into an interleaved stereo buffer.
///
/// The input set is an immutable snapshot swapped atomically on every
/// add/remove (copy-on-write). The device callback loads the current snapshot
/// without locking, so registering a voice from the control plane never
/// blocks the audio thread.
///
/// A voice is registered at most once; adding it again is a no-op.
pub struct Mixer {
    inputs: ArcSwap<Vec<Arc<Voice>>>,
    /// Snapshots replaced by `add`/`remove`. The callback may still hold one,
    /// so they are freed by [`reclaim`](Self::reclaim) on the control plane
    /// and never by the callback dropping its guard.
    retired: Mutex<Vec<Snapshot>>,
}

type Snapshot = Arc<Vec<Arc<Voice>>>;

impl Default for Mixer {
    fn default() -> Self {
        Self {
            inputs: ArcSwap::from_pointee(Vec::new()),
            retired: Mutex::new(Vec::new()),
        }
    }
}

impl Mixer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, voice: Arc<Voice>) {
        let previous = self.inputs.rcu(|current| {
            if current.iter().any(|v| Arc::ptr_eq(v, &voice)) {
                return Arc::clone(current);
            }
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&voice));
            Arc::new(next)
        });
        self.retire(previous);
    }

    pub fn remove(&self, voice: &Arc<Voice>) {
        let previous = self.inputs.rcu(|current| {
            if !current.iter().any(|v| Arc::ptr_eq(v, voice)) {
                return Arc::clone(current);
            }
            Arc::new(
                current
                    .iter()
                    .filter(|v| !Arc::ptr_eq(v, voice))
                    .cloned()
                    .collect::<Vec<_>>(),
            )
        });
        self.retire(previous);
    }

    fn lock_retired(&self) -> MutexGuard<'_, Vec<Snapshot>> {
        self.retired.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn retire(&self, previous: Snapshot) {
        let mut retired = self.lock_retired();
        // Unchanged by a no-op add/remove, or already queued by a racing one.
        if Arc::ptr_eq(&previous, &self.inputs.load_full())
            || retired.iter().any(|s| Arc::ptr_eq(s, &previous))
        {
            return;
        }
        retired.push(previous);
        retired.retain(|s| Arc::strong_count(s) > 1);
    }

    /// Free retired snapshots no reader holds any more. Returns how many were
    /// released.
    pub fn reclaim(&self) -> usize {
        let mut retired = self.lock_retired();
        let before = retired.len();
        retired.retain(|s| Arc::strong_count(s) > 1);
        before - retired.len()
    }

    #[cfg(test)]
    fn retired_len(&self) -> usize {
        self.lock_retired().len()
    }

    pub fn contains(&self, voice: &Arc<Voice>) -> bool {
        self.inputs.load().iter().any(|v| Arc::ptr_eq(v, voice))
    }

    pub fn len(&self) -> usize {
        self.inputs.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite `out` with the sum of all inputs. `scratch` must be at least
    /// as long as `out`; a voice that returns fewer samples than requested
    /// contributes silence for the remainder.
    ///
    /// **Called on the real-time audio thread: no allocations.**
    pub fn mix_into(&self, out: &mut [f32], scratch: &mut [f32]) {
        debug_assert!(scratch.len() >= out.len());

        out.fill(0.0);
        let inputs = self.inputs.load();
        let scratch = &mut scratch[..out.len()];

        for voice in inputs.iter() {
            let n = voice.read(scratch);
            for (d, &s) in out.iter_mut().zip(scratch[..n].iter()) {
                *d += s;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::audio::{buffer::DecodedAudio, voice::FadeTimes};

    fn voice(value: f32, frames: usize) -> Arc<Voice> {
        let clip = Arc::new(DecodedAudio::canonical(vec![value; frames * 2]));
        let fades = FadeTimes {
            fade_in: Duration::ZERO,
            fade_out: Duration::ZERO,
        };
        Arc::new(Voice::new(0, clip, 1.0, 1.0, fades))
    }

    #[test]
    fn sums_all_inputs() {
        let mixer = Mixer::new();
        mixer.add(voice(0.25, 100));
        mixer.add(voice(0.5, 100));

        let mut out = vec![1.0; 16];
        let mut scratch = vec![0.0; 16];
        mixer.mix_into(&mut out, &mut scratch);
        for s in &out {
            assert!((s - 0.75).abs() < 1e-6, "expected 0.75, got {s}");
        }
    }

    #[test]
    fn short_input_contributes_silence_for_remainder() {
        let mixer = Mixer::new();
        mixer.add(voice(0.5, 2)); // 4 samples
        let mut out = vec![0.0; 8];
        let mut scratch = vec![9.0; 8];
        mixer.mix_into(&mut out, &mut scratch);
        assert_eq!(&out[..4], &[0.5; 4]);
        assert_eq!(&out[4..], &[0.0; 4]);
    }

    #[test]
    fn remove_matches_by_identity() {
        let mixer = Mixer::new();
        let a = voice(0.1, 10);
        let b = voice(0.1, 10);
        mixer.add(Arc::clone(&a));
        mixer.add(Arc::clone(&b));
        assert_eq!(mixer.len(), 2);

        mixer.remove(&a);
        assert_eq!(mixer.len(), 1);
        assert!(!mixer.contains(&a));
        assert!(mixer.contains(&b));

        mixer.remove(&a);
        assert_eq!(mixer.len(), 1, "removing an absent voice is a no-op");
    }

    #[test]
    fn empty_mixer_outputs_silence() {
        let mixer = Mixer::new();
        assert!(mixer.is_empty());
        let mut out = vec![0.3; 8];
        let mut scratch = vec![0.0; 8];
        mixer.mix_into(&mut out, &mut scratch);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn concurrent_registration_while_mixing() {
        let mixer = Arc::new(Mixer::new());
        let reader = {
            let mixer = Arc::clone(&mixer);
            std::thread::spawn(move || {
                let mut out = vec![0.0; 256];
                let mut scratch = vec![0.0; 256];
                for _ in 0..2000 {
                    mixer.mix_into(&mut out, &mut scratch);
                }
            })
        };
        for _ in 0..200 {
            let v = voice(0.01, 64);
            mixer.add(Arc::clone(&v));
            mixer.remove(&v);
        }
        reader.join().expect("mixer thread panicked");
        assert!(mixer.is_empty());
    }

    #[test]
    fn adding_a_voice_twice_registers_it_once() {
        let mixer = Mixer::new();
        let v = voice(0.25, 100);
        mixer.add(Arc::clone(&v));
        mixer.add(Arc::clone(&v));
        assert_eq!(mixer.len(), 1);

        // Read once per pull: the playhead advances by exactly one buffer.
        let mut out = vec![0.0; 20];
        let mut scratch = vec![0.0; 20];
        mixer.mix_into(&mut out, &mut scratch);
        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
        assert!((v.progress() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn snapshot_held_by_reader_is_released_on_reclaim() {
        let mixer = Mixer::new();
        let v = voice(0.1, 10);
        let weak = Arc::downgrade(&v);
        mixer.add(Arc::clone(&v));
        mixer.reclaim();

        // Stands in for the device callback mid-mix.
        let reader = mixer.inputs.load();
        mixer.remove(&v);
        drop(v);
        drop(reader);

        assert!(weak.upgrade().is_some(), "reader guard must not free the voice");
        assert_eq!(mixer.reclaim(), 1);
        assert!(weak.upgrade().is_none());
        assert_eq!(mixer.retired_len(), 0);
    }
}

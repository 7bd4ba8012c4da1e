use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::interval,
};

use super::{
    buffer::DecodedAudio,
    bus::OutputBus,
    cache::AudioCache,
    devices::{find_virtual_cable, DeviceEnumerator, DEFAULT_DEVICE_ID},
    voice::{AtomicGain, FadeTimes, Voice, VoiceState},
    TileId,
};
use crate::{
    config::{CapOverflow, EngineConfig},
    error::EngineError,
};

// ── Events ───────────────────────────────────────────────────────────────────

/// Notifications sent to the host. Never emitted from the audio thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    TileStarted(TileId),
    TileStopped(TileId),
    Error(String),
}

pub type EventReceiver = UnboundedReceiver<EngineEvent>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayOptions {
    /// Fade out every other active sound first ("cut" tiles).
    pub stop_others: bool,
    /// Exempt from cap eviction while playing.
    pub protected: bool,
}

/// Point-in-time view of one active trigger, for UIs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairStatus {
    pub tile_id: TileId,
    pub state: VoiceState,
    pub protected: bool,
    pub progress: f64,
}

// ── VoicePair ────────────────────────────────────────────────────────────────

/// The monitor and inject voices created by one trigger. A half is absent
/// when its bus was disabled at trigger time.
struct VoicePair {
    tile_id: TileId,
    protected: bool,
    monitor: Option<Arc<Voice>>,
    inject: Option<Arc<Voice>>,
}

impl VoicePair {
    fn halves(&self) -> impl Iterator<Item = &Arc<Voice>> {
        self.monitor.iter().chain(self.inject.iter())
    }

    /// Pair-level state: Playing while any half plays, Stopped once every
    /// half has stopped (or there are none).
    fn state(&self) -> VoiceState {
        let mut state = VoiceState::Stopped;
        for voice in self.halves() {
            match voice.state() {
                VoiceState::Playing => return VoiceState::Playing,
                VoiceState::FadingOut => state = VoiceState::FadingOut,
                VoiceState::Stopped => {}
            }
        }
        state
    }

    fn is_stopped(&self) -> bool {
        self.state() == VoiceState::Stopped
    }

    fn begin_fade_out(&self) {
        for voice in self.halves() {
            voice.begin_fade_out();
        }
    }

    fn stop(&self) {
        for voice in self.halves() {
            voice.stop();
        }
    }

    fn progress(&self) -> f64 {
        self.monitor
            .as_ref()
            .or(self.inject.as_ref())
            .map(|v| v.progress())
            .unwrap_or(0.0)
    }

    fn status(&self) -> PairStatus {
        PairStatus {
            tile_id: self.tile_id,
            state: self.state(),
            protected: self.protected,
            progress: self.progress(),
        }
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// Playback orchestrator: owns every voice pair, both output buses and the
/// clip cache.
///
/// Lock order is pairs → bus. Bus rebinding never takes the pairs lock while
/// holding a bus lock.
pub struct AudioEngine {
    config: EngineConfig,
    fades: FadeTimes,
    devices: Arc<dyn DeviceEnumerator>,
    cache: AudioCache,
    monitor: OutputBus,
    inject: OutputBus,
    monitor_volume: AtomicGain,
    inject_volume: AtomicGain,
    /// Trigger order, oldest first.
    pairs: Mutex<Vec<VoicePair>>,
    events: UnboundedSender<EngineEvent>,
}

impl AudioEngine {
    pub fn new(config: EngineConfig, devices: Arc<dyn DeviceEnumerator>) -> (Arc<Self>, EventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let engine = Self {
            fades: FadeTimes::from_config(&config),
            devices,
            cache: AudioCache::new(),
            monitor: OutputBus::new("monitor", config.bus_latency_ms),
            inject: OutputBus::new("inject", config.bus_latency_ms),
            monitor_volume: AtomicGain::new(config.monitor_volume.clamp(0.0, 1.0)),
            inject_volume: AtomicGain::new(config.inject_volume.clamp(0.0, 1.0)),
            pairs: Mutex::new(Vec::new()),
            events,
            config,
        };
        (Arc::new(engine), rx)
    }

    fn lock_pairs(&self) -> MutexGuard<'_, Vec<VoicePair>> {
        self.pairs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: EngineEvent) {
        // Receiver gone means nobody is listening; playback carries on.
        let _ = self.events.send(event);
    }

    fn report(&self, err: &EngineError) {
        log::warn!("{err}");
        self.emit(EngineEvent::Error(err.to_string()));
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &AudioCache {
        &self.cache
    }

    pub fn monitor_bus(&self) -> &OutputBus {
        &self.monitor
    }

    pub fn inject_bus(&self) -> &OutputBus {
        &self.inject
    }

    // ── Devices ──────────────────────────────────────────────────────────────

    /// Bind both buses. The monitor falls back to the host default; the
    /// inject bus falls back to a discovered virtual cable and otherwise
    /// stays disabled. Failures that leave a bus unbound are reported as
    /// events.
    pub fn initialize(&self, monitor_id: Option<&str>, inject_id: Option<&str>) {
        let monitor_id = monitor_id.unwrap_or(DEFAULT_DEVICE_ID);
        let monitor = match self.bind_monitor(monitor_id) {
            Err(e) if monitor_id != DEFAULT_DEVICE_ID => {
                log::info!("{e}; monitor falling back to the default output device");
                self.bind_monitor(DEFAULT_DEVICE_ID)
            }
            other => other,
        };
        if let Err(e) = monitor {
            self.report(&e);
        }

        let inject_id = inject_id.map(str::to_string).or_else(|| {
            let devices = self.devices.output_devices();
            find_virtual_cable(&devices, &self.config.virtual_cable_patterns).map(|d| {
                log::info!("Discovered virtual cable '{}'", d.name);
                d.id.clone()
            })
        });
        match inject_id {
            Some(id) => {
                let _ = self.set_inject_device(&id);
            }
            None => {
                log::info!("No inject device configured or discovered; inject bus disabled");
                self.inject.disable();
            }
        }
    }

    /// Move the monitor bus to device `id`. An unknown id leaves the current
    /// binding in place.
    pub fn set_monitor_device(&self, id: &str) -> Result<(), EngineError> {
        self.bind_monitor(id).map_err(|e| {
            self.report(&e);
            e
        })
    }

    /// Move the inject bus to device `id`. An unknown id leaves the current
    /// binding in place.
    pub fn set_inject_device(&self, id: &str) -> Result<(), EngineError> {
        self.bind_inject(id).map_err(|e| {
            self.report(&e);
            e
        })
    }

    fn bind_monitor(&self, id: &str) -> Result<(), EngineError> {
        self.bind(&self.monitor, id, |p| p.monitor.as_ref())
    }

    fn bind_inject(&self, id: &str) -> Result<(), EngineError> {
        self.bind(&self.inject, id, |p| p.inject.as_ref())
    }

    fn bind(
        &self,
        bus: &OutputBus,
        id: &str,
        half: fn(&VoicePair) -> Option<&Arc<Voice>>,
    ) -> Result<(), EngineError> {
        let device = self
            .devices
            .open(id)
            .ok_or_else(|| EngineError::DeviceNotFound(id.to_string()))?;

        // Pairs stay locked until live voices are on the fresh mixer, so a
        // concurrent trigger registers its voice exactly once.
        let pairs = self.lock_pairs();
        bus.initialize(id, &device)?;
        for voice in pairs.iter().filter_map(half).filter(|v| !v.is_stopped()) {
            bus.add_voice(Arc::clone(voice));
        }
        Ok(())
    }

    pub fn is_monitor_enabled(&self) -> bool {
        self.monitor.is_active()
    }

    pub fn is_inject_enabled(&self) -> bool {
        self.inject.is_active()
    }

    // ── Volume ───────────────────────────────────────────────────────────────

    pub fn set_monitor_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        self.monitor_volume.set(volume);
        for voice in self.lock_pairs().iter().filter_map(|p| p.monitor.as_ref()) {
            voice.set_master_volume(volume);
        }
    }

    pub fn set_inject_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        self.inject_volume.set(volume);
        for voice in self.lock_pairs().iter().filter_map(|p| p.inject.as_ref()) {
            voice.set_master_volume(volume);
        }
    }

    pub fn monitor_volume(&self) -> f32 {
        self.monitor_volume.get()
    }

    pub fn inject_volume(&self) -> f32 {
        self.inject_volume.get()
    }

    // ── Playback ─────────────────────────────────────────────────────────────

    /// Start `buffer` for `tile_id` on every enabled bus.
    pub fn play(
        &self,
        tile_id: TileId,
        buffer: Arc<DecodedAudio>,
        tile_volume: f32,
        options: PlayOptions,
    ) -> Result<(), EngineError> {
        match self.start_pair(tile_id, buffer, tile_volume, options) {
            Ok(()) => {
                self.emit(EngineEvent::TileStarted(tile_id));
                Ok(())
            }
            Err(e) => {
                self.report(&e);
                Err(e)
            }
        }
    }

    /// Resolve `path` through the cache, then [`play`](Self::play) it.
    pub fn play_file(
        &self,
        tile_id: TileId,
        path: &Path,
        tile_volume: f32,
        options: PlayOptions,
    ) -> Result<(), EngineError> {
        let buffer = self.cache.get_or_load(path).map_err(|e| {
            let err = EngineError::from(e);
            self.report(&err);
            err
        })?;
        self.play(tile_id, buffer, tile_volume, options)
    }

    fn start_pair(
        &self,
        tile_id: TileId,
        buffer: Arc<DecodedAudio>,
        tile_volume: f32,
        options: PlayOptions,
    ) -> Result<(), EngineError> {
        let tile_volume = tile_volume.clamp(0.0, 1.0);
        let mut pairs = self.lock_pairs();

        if options.stop_others {
            for pair in pairs.iter() {
                pair.begin_fade_out();
            }
        }
        // Retriggering a tile interrupts its previous instance.
        for pair in pairs.iter().filter(|p| p.tile_id == tile_id) {
            pair.begin_fade_out();
        }

        self.enforce_cap(&pairs)?;

        let make_voice = |master: &AtomicGain| {
            Arc::new(Voice::new(
                tile_id,
                Arc::clone(&buffer),
                tile_volume,
                master.get(),
                self.fades,
            ))
        };
        let monitor = self.monitor.is_active().then(|| make_voice(&self.monitor_volume));
        let inject = self.inject.is_active().then(|| make_voice(&self.inject_volume));

        if let Some(voice) = &monitor {
            self.monitor.add_voice(Arc::clone(voice));
        }
        if let Some(voice) = &inject {
            self.inject.add_voice(Arc::clone(voice));
        }
        if monitor.is_none() && inject.is_none() {
            log::warn!("Tile {tile_id} triggered with no output bus enabled");
        }

        pairs.push(VoicePair {
            tile_id,
            protected: options.protected,
            monitor,
            inject,
        });
        Ok(())
    }

    /// Make room for one more pair. While the live count is at the cap, the
    /// oldest pair already fading out is cut first, then the oldest playing
    /// unprotected one. With only protected pairs left the overflow policy
    /// decides.
    fn enforce_cap(&self, pairs: &[VoicePair]) -> Result<(), EngineError> {
        let cap = self.config.max_voices;
        loop {
            let live = pairs.iter().filter(|p| !p.is_stopped()).count();
            if live < cap {
                return Ok(());
            }

            let victim = pairs
                .iter()
                .find(|p| p.state() == VoiceState::FadingOut)
                .or_else(|| {
                    pairs
                        .iter()
                        .find(|p| !p.protected && p.state() == VoiceState::Playing)
                });

            match victim {
                Some(pair) => {
                    log::debug!("Voice cap {cap} reached, evicting tile {}", pair.tile_id);
                    pair.stop();
                }
                None => {
                    return match self.config.cap_overflow {
                        CapOverflow::OverrunByOne if live == cap => {
                            log::warn!("Voice cap {cap} reached with only protected voices; overrunning by one");
                            Ok(())
                        }
                        _ => Err(EngineError::CapExhausted { cap }),
                    };
                }
            }
        }
    }

    /// Fade out every pair of `tile_id`.
    pub fn stop_tile(&self, tile_id: TileId) {
        for pair in self.lock_pairs().iter().filter(|p| p.tile_id == tile_id) {
            pair.begin_fade_out();
        }
    }

    /// Fade out the most recently started pair that is still playing.
    pub fn stop_current(&self) {
        let pairs = self.lock_pairs();
        if let Some(pair) = pairs.iter().rev().find(|p| p.state() == VoiceState::Playing) {
            pair.begin_fade_out();
        }
    }

    pub fn stop_all(&self) {
        for pair in self.lock_pairs().iter() {
            pair.begin_fade_out();
        }
    }

    /// Playhead of the newest live trigger of `tile_id`.
    pub fn get_progress(&self, tile_id: TileId) -> Option<f64> {
        self.lock_pairs()
            .iter()
            .rev()
            .find(|p| p.tile_id == tile_id && !p.is_stopped())
            .map(|p| p.progress())
    }

    /// Pairs that have not stopped yet.
    pub fn active_voice_count(&self) -> usize {
        self.lock_pairs().iter().filter(|p| !p.is_stopped()).count()
    }

    /// Every tracked pair in trigger order, including stopped ones the next
    /// sweep will drop.
    pub fn snapshot(&self) -> Vec<PairStatus> {
        self.lock_pairs().iter().map(|p| p.status()).collect()
    }

    // ── Cleanup ──────────────────────────────────────────────────────────────

    /// Drop stopped pairs from the active set and both buses, then report
    /// each as `TileStopped` in trigger order. Returns how many were removed.
    ///
    /// Halves on a bus that is no longer active are never pulled again, so
    /// they are stopped here.
    pub fn sweep(&self) -> usize {
        let monitor_dead = !self.monitor.is_active();
        let inject_dead = !self.inject.is_active();

        let removed: Vec<TileId> = {
            let mut pairs = self.lock_pairs();
            for pair in pairs.iter() {
                if monitor_dead {
                    if let Some(v) = &pair.monitor {
                        v.stop();
                    }
                }
                if inject_dead {
                    if let Some(v) = &pair.inject {
                        v.stop();
                    }
                }
            }

            let mut removed = Vec::new();
            pairs.retain(|pair| {
                if !pair.is_stopped() {
                    return true;
                }
                self.unregister(pair);
                removed.push(pair.tile_id);
                false
            });
            removed
        };

        self.monitor.reclaim();
        self.inject.reclaim();

        if !removed.is_empty() {
            log::debug!("Swept {} stopped voice pair(s)", removed.len());
        }
        for &tile_id in &removed {
            self.emit(EngineEvent::TileStopped(tile_id));
        }
        removed.len()
    }

    fn unregister(&self, pair: &VoicePair) {
        if let Some(v) = &pair.monitor {
            self.monitor.remove_voice(v);
        }
        if let Some(v) = &pair.inject {
            self.inject.remove_voice(v);
        }
    }

    /// Run [`sweep`](Self::sweep) every `cleanup_interval_ms` on the tokio
    /// runtime. The task ends when the handle or the engine is dropped.
    pub fn spawn_cleanup(engine: &Arc<Self>) -> CleanupHandle {
        let weak: Weak<Self> = Arc::downgrade(engine);
        let period = Duration::from_millis(engine.config.cleanup_interval_ms.max(1));

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(engine) => {
                        engine.sweep();
                    }
                    None => break,
                }
            }
        });
        CleanupHandle { task }
    }

    /// Cut everything, report the cut tiles, and release both devices.
    pub fn shutdown(&self) {
        let drained: Vec<VoicePair> = std::mem::take(&mut *self.lock_pairs());
        for pair in &drained {
            pair.stop();
            self.unregister(pair);
        }
        for pair in &drained {
            self.emit(EngineEvent::TileStopped(pair.tile_id));
        }
        self.monitor.disable();
        self.inject.disable();
        log::info!("Audio engine shut down");
    }
}

/// Owns the periodic cleanup task; aborting on drop.
pub struct CleanupHandle {
    task: JoinHandle<()>,
}

impl CleanupHandle {
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for CleanupHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

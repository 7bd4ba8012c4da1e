use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    audio::{engine::AudioEngine, engine::PlayOptions, PreloadReport, TileId},
    error::EngineError,
};

// ── Tiles ─────────────────────────────────────────────────────────────────────

fn default_volume() -> f32 {
    1.0
}

/// What a tile plays and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileSpec {
    pub file_path: PathBuf,
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default)]
    pub stop_others: bool,
    #[serde(default)]
    pub protected: bool,
}

impl TileSpec {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            volume: default_volume(),
            stop_others: false,
            protected: false,
        }
    }

    pub fn options(&self) -> PlayOptions {
        PlayOptions {
            stop_others: self.stop_others,
            protected: self.protected,
        }
    }
}

/// Maps tile indices to their sounds. The engine does not care where the
/// board layout is stored.
pub trait TileSource: Send + Sync {
    fn tile(&self, index: TileId) -> Option<TileSpec>;

    /// Every assigned file, in a stable order, for preloading.
    fn paths(&self) -> Vec<PathBuf>;
}

impl TileSource for HashMap<TileId, TileSpec> {
    fn tile(&self, index: TileId) -> Option<TileSpec> {
        self.get(&index).cloned()
    }

    fn paths(&self) -> Vec<PathBuf> {
        let mut tiles: Vec<_> = self.iter().collect();
        tiles.sort_by_key(|(index, _)| **index);
        tiles
            .into_iter()
            .map(|(_, spec)| spec.file_path.clone())
            .collect()
    }
}

/// Read a JSON board (`{"<index>": {"file_path": ...}, ...}`).
pub fn load_board(path: &Path) -> Result<HashMap<TileId, TileSpec>, EngineError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| EngineError::Config(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&text).map_err(|e| EngineError::Config(format!("bad board file: {e}")))
}

// ── AppState ──────────────────────────────────────────────────────────────────

/// Host-facing facade: tile indices in, engine calls out.
pub struct AppState {
    pub engine: Arc<AudioEngine>,
    source: Box<dyn TileSource>,
}

impl AppState {
    pub fn new(engine: Arc<AudioEngine>, source: impl TileSource + 'static) -> Self {
        Self {
            engine,
            source: Box::new(source),
        }
    }

    pub fn with_source(mut self, source: impl TileSource + 'static) -> Self {
        self.source = Box::new(source);
        self
    }

    /// Play tile `index` with its configured volume and flags.
    pub fn trigger_tile(&self, index: TileId) -> Result<(), EngineError> {
        let spec = self
            .source
            .tile(index)
            .filter(|t| !t.file_path.as_os_str().is_empty())
            .ok_or(EngineError::UnknownTile(index))?;
        self.engine
            .play_file(index, &spec.file_path, spec.volume, spec.options())
    }

    /// Warm the clip cache with every tile's file.
    pub async fn preload_tiles(&self, limit: usize) -> PreloadReport {
        let paths = self.source.paths();
        self.engine.cache().preload(&paths, limit).await
    }
}

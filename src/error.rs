use std::path::PathBuf;

use thiserror::Error;

use crate::audio::TileId;

/// Failures while turning a file into canonical PCM.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("sound file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("cannot open {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("probe failed: {0}")]
    Probe(String),

    #[error("no audio track found")]
    NoTrack,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("file decoded to zero samples")]
    Empty,
}

/// Errors surfaced by the control plane. None of these ever cross the
/// real-time boundary; the engine also reports them as `EngineEvent::Error`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("output device not found: {0}")]
    DeviceNotFound(String),

    #[error("failed to bind {bus} output to '{device}': {reason}")]
    DeviceBind {
        bus: &'static str,
        device: String,
        reason: String,
    },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("voice cap of {cap} reached and every active voice is protected")]
    CapExhausted { cap: usize },

    #[error("tile {0} has no sound assigned")]
    UnknownTile(TileId),

    #[error("invalid configuration: {0}")]
    Config(String),
}

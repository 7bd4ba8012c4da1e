pub mod audio;
pub mod config;
pub mod error;
pub mod state;

pub use audio::{AudioEngine, EngineEvent, PlayOptions, TileId};
pub use config::{CapOverflow, EngineConfig};
pub use error::{DecodeError, EngineError};
pub use state::{AppState, TileSource, TileSpec};

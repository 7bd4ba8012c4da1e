pub mod buffer;
pub mod bus;
pub mod cache;
pub mod decoder;
pub mod devices;
pub mod engine;
pub mod fade;
pub mod mixer;
pub mod voice;

/// Host-assigned identifier of a soundboard tile.
pub type TileId = i32;

pub use buffer::{AudioFormat, DecodedAudio, CANONICAL_FORMAT};
pub use cache::{AudioCache, PreloadReport};
pub use devices::{CpalDevices, DeviceEnumerator, DeviceEvent, DeviceWatcher, OutputDevice};
pub use engine::{AudioEngine, CleanupHandle, EngineEvent, EventReceiver, PlayOptions};
pub use voice::{Voice, VoiceState};

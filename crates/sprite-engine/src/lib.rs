pub mod batch;
pub mod config;
pub mod generate;
pub mod media;
pub mod orchestrator;
pub mod process;
pub mod transcode;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::FalConfig;
pub use generate::{GenerationError, SpriteGeneration, SpritePipeline, SpriteRequest};
pub use orchestrator::JobOrchestrator;
pub use transcode::{transcode_sprite_sheet, TranscodeError, TranscodeOptions};
pub use transport::{Clock, FalHttpTransport, HttpReply, SystemClock, Transport};

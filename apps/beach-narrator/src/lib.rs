pub mod auth;
pub mod config;
pub mod narration;
pub mod polling;
pub mod session;
pub mod telemetry;

pub use config::NarratorConfig;
pub use narration::{BatchPolicy, ChangeAccumulator, FlushEvent, NarrationPipeline, NarrationSink};
pub use session::{ConnectionState, StreamEvent, StreamSession};

//! Snapshot stream to narration batches.

pub mod accumulator;
pub mod pipeline;

pub use accumulator::{BatchPolicy, ChangeAccumulator, FlushEvent, FlushTrigger};
pub use pipeline::{NarrationPipeline, NarrationSink};

// Neuraudio - realtime neural inference scheduling for audio callbacks
//
// An audio host delivers fixed-size blocks on a realtime thread; model
// evaluation may take longer than a block period and may run on any of
// several engines. This crate decouples the two with per-stream ring
// buffers, preallocated inference slots and a shared worker pool, while
// preserving sample order and a fixed reported latency. When inference
// falls behind, silence is emitted and later paid back by skipping an equal
// number of samples, so the stream never drifts against the host clock.

pub mod backend;
pub mod buffer;
pub mod config;
pub mod error;
pub mod processor;
pub mod scheduler;

#[cfg(test)]
pub mod testing;

// Re-exports for convenience
pub use backend::{Backend, InferenceBackend, PassthroughBackend};
pub use buffer::{AudioBuffer, RingBuffer};
pub use config::{HostAudioConfig, InferenceConfig, ModelDescriptor};
pub use error::ConfigError;
pub use processor::{DefaultPrePostProcessor, OverlapPrePostProcessor, PrePostProcessor};
pub use scheduler::{InferenceManager, InferencePool};

//! Scheduling core: sessions, the shared worker pool and the per-stream
//! manager façade.
//!
//! Data flow per audio callback:
//!
//! ```text
//! InferenceManager::process
//!   -> Session.send ring            (produce input samples)
//!   -> InferencePool worker          (claim slot, run backend)
//!   -> Session.receive ring          (completed output, in order)
//!   -> host output buffers           (consume, or silence + catch-up)
//! ```

pub mod manager;
pub mod pool;
mod semaphore;
pub mod session;

pub use manager::InferenceManager;
pub use pool::InferencePool;
pub use session::{InferenceSlot, Session, SlotState};

#[cfg(test)]
mod tests;

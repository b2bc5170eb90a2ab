// Error types for session configuration and backend loading
//
// Only configuration-time failures surface as errors: they are returned
// synchronously from constructors and `prepare`, before the realtime contract
// starts. Everything that can go wrong afterwards (scheduling overload,
// transient backend failures) is absorbed as silence plus counters so the
// audio thread never sees a fallible path.

use std::fmt;

use crate::backend::InferenceBackend;

/// Configuration errors surfaced from `InferenceManager::new` and `prepare`.
///
/// After receiving one of these the caller must not call `process`.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Model window sizes, batch size or tensor shapes are inconsistent
    InvalidShape { detail: String },

    /// Host callback parameters are unusable
    InvalidHostConfig {
        channels: usize,
        buffer_size: usize,
        sample_rate: f64,
    },

    /// The selected backend needs a model artifact but the config carries none
    MissingModel { backend: InferenceBackend },

    /// The selected backend was not compiled into this build
    BackendUnavailable { backend: InferenceBackend },

    /// The engine rejected or failed to load the model artifact
    BackendLoadFailed {
        backend: InferenceBackend,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidShape { detail } => {
                write!(f, "invalid model configuration: {}", detail)
            }
            ConfigError::InvalidHostConfig {
                channels,
                buffer_size,
                sample_rate,
            } => write!(
                f,
                "invalid host audio configuration: {} channels, {} samples per block at {} Hz",
                channels, buffer_size, sample_rate
            ),
            ConfigError::MissingModel { backend } => {
                write!(f, "no model artifact configured for backend {:?}", backend)
            }
            ConfigError::BackendUnavailable { backend } => write!(
                f,
                "backend {:?} is not compiled into this build (enable the matching cargo feature)",
                backend
            ),
            ConfigError::BackendLoadFailed { backend, reason } => {
                write!(f, "backend {:?} failed to load its model: {}", backend, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

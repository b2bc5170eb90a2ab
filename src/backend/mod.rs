//! Backend abstractions for the inference workers.
//!
//! Every inference engine is hidden behind the same two-method contract:
//! `prepare_to_play` once at session prepare, `process_block` synchronously
//! per slot from a worker thread. Adapters own their engine handles and must
//! be thread-safe across distinct instances; a shared instance is serialised
//! by the session (one mutex per adapter), so implementations may keep
//! per-call scratch state in `&mut self`.
//!
//! The engine adapters are feature-gated the same way the platform audio
//! backends of a cross-platform engine are cfg-gated: the selector enum
//! always knows all variants, construction fails cleanly when the matching
//! feature is absent.

use serde::{Deserialize, Serialize};

use crate::buffer::AudioBuffer;
use crate::config::InferenceConfig;
use crate::error::ConfigError;

/// Selector for the engine a session currently dispatches to.
///
/// Stored as an atomic u8 on the session; workers read it once per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum InferenceBackend {
    Libtorch = 0,
    Onnx = 1,
    Tflite = 2,
    /// Passthrough, used for measurements and as the silent fallback
    None = 3,
}

impl InferenceBackend {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => InferenceBackend::Libtorch,
            1 => InferenceBackend::Onnx,
            2 => InferenceBackend::Tflite,
            _ => InferenceBackend::None,
        }
    }
}

/// Uniform synchronous inference contract.
///
/// Input shape is `[1, new_model_input_size]`, output `[1, new_model_output_size]`,
/// flattened into mono buffers.
pub trait Backend: Send {
    /// Called once per session prepare, before any `process_block`.
    fn prepare_to_play(&mut self) {}

    /// Evaluate one slot. Must fill all of `output`; on internal failure the
    /// implementation should zero-fill and return, never panic by design.
    fn process_block(&mut self, input: &AudioBuffer, output: &mut AudioBuffer);
}

/// Passthrough backend: copies the tail of the input window to the output.
///
/// With equal window sizes this is the identity. When the input window
/// carries context (receptive field) in front of the fresh samples, the tail
/// is exactly the fresh part, so a passthrough run of an overlap-windowed
/// stream still reproduces the input signal.
#[derive(Debug, Default)]
pub struct PassthroughBackend;

impl PassthroughBackend {
    pub fn new(_config: &InferenceConfig) -> Self {
        Self
    }
}

impl Backend for PassthroughBackend {
    fn process_block(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) {
        let input = input.as_slice();
        let output = output.as_mut_slice();
        if input.len() >= output.len() {
            output.copy_from_slice(&input[input.len() - output.len()..]);
        } else {
            // Shorter input than output only happens with degenerate configs;
            // keep the signal right-aligned and lead with silence.
            let lead = output.len() - input.len();
            output[..lead].fill(0.0);
            output[lead..].copy_from_slice(input);
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "libtorch")] {
        mod libtorch;
        pub use libtorch::LibtorchBackend;
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "onnx")] {
        mod onnx;
        pub use onnx::OnnxBackend;
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "tflite")] {
        mod tflite;
        pub use tflite::TfliteBackend;
    }
}

/// Construct the adapter for `backend`, loading its model artifact.
///
/// Fails when the engine is not compiled in, when the config carries no
/// artifact for it, or when the engine rejects the artifact. `None` always
/// succeeds and never touches the filesystem.
pub fn load_backend(
    backend: InferenceBackend,
    config: &InferenceConfig,
) -> Result<Box<dyn Backend>, ConfigError> {
    match backend {
        InferenceBackend::None => Ok(Box::new(PassthroughBackend::new(config))),
        InferenceBackend::Libtorch => {
            let model = config
                .libtorch_model
                .as_ref()
                .ok_or(ConfigError::MissingModel { backend })?;
            load_libtorch(model, config)
        }
        InferenceBackend::Onnx => {
            let model = config
                .onnx_model
                .as_ref()
                .ok_or(ConfigError::MissingModel { backend })?;
            load_onnx(model, config)
        }
        InferenceBackend::Tflite => {
            let model = config
                .tflite_model
                .as_ref()
                .ok_or(ConfigError::MissingModel { backend })?;
            load_tflite(model, config)
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "libtorch")] {
        fn load_libtorch(
            model: &crate::config::ModelDescriptor,
            config: &InferenceConfig,
        ) -> Result<Box<dyn Backend>, ConfigError> {
            Ok(Box::new(LibtorchBackend::load(model, config)?))
        }
    } else {
        fn load_libtorch(
            _model: &crate::config::ModelDescriptor,
            _config: &InferenceConfig,
        ) -> Result<Box<dyn Backend>, ConfigError> {
            Err(ConfigError::BackendUnavailable {
                backend: InferenceBackend::Libtorch,
            })
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "onnx")] {
        fn load_onnx(
            model: &crate::config::ModelDescriptor,
            config: &InferenceConfig,
        ) -> Result<Box<dyn Backend>, ConfigError> {
            Ok(Box::new(OnnxBackend::load(model, config)?))
        }
    } else {
        fn load_onnx(
            _model: &crate::config::ModelDescriptor,
            _config: &InferenceConfig,
        ) -> Result<Box<dyn Backend>, ConfigError> {
            Err(ConfigError::BackendUnavailable {
                backend: InferenceBackend::Onnx,
            })
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "tflite")] {
        fn load_tflite(
            model: &crate::config::ModelDescriptor,
            config: &InferenceConfig,
        ) -> Result<Box<dyn Backend>, ConfigError> {
            Ok(Box::new(TfliteBackend::load(model, config)?))
        }
    } else {
        fn load_tflite(
            _model: &crate::config::ModelDescriptor,
            _config: &InferenceConfig,
        ) -> Result<Box<dyn Backend>, ConfigError> {
            Err(ConfigError::BackendUnavailable {
                backend: InferenceBackend::Tflite,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_round_trips_through_u8() {
        for backend in [
            InferenceBackend::Libtorch,
            InferenceBackend::Onnx,
            InferenceBackend::Tflite,
            InferenceBackend::None,
        ] {
            assert_eq!(InferenceBackend::from_u8(backend as u8), backend);
        }
    }

    #[test]
    fn passthrough_is_identity_for_equal_sizes() {
        let config = InferenceConfig::default();
        let mut backend = PassthroughBackend::new(&config);

        let mut input = AudioBuffer::new(8);
        for (i, sample) in input.as_mut_slice().iter_mut().enumerate() {
            *sample = i as f32;
        }
        let mut output = AudioBuffer::new(8);
        backend.process_block(&input, &mut output);
        assert_eq!(input.as_slice(), output.as_slice());
    }

    #[test]
    fn passthrough_copies_the_fresh_tail() {
        let config = InferenceConfig::default();
        let mut backend = PassthroughBackend::new(&config);

        // 4 context samples followed by 4 fresh ones
        let mut input = AudioBuffer::new(8);
        input.as_mut_slice().copy_from_slice(&[9.0, 9.0, 9.0, 9.0, 1.0, 2.0, 3.0, 4.0]);
        let mut output = AudioBuffer::new(4);
        backend.process_block(&input, &mut output);
        assert_eq!(output.as_slice(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn loading_none_never_fails() {
        let config = InferenceConfig::default();
        assert!(load_backend(InferenceBackend::None, &config).is_ok());
    }

    #[test]
    fn loading_without_artifact_reports_missing_model() {
        let config = InferenceConfig::default();
        match load_backend(InferenceBackend::Libtorch, &config) {
            Err(ConfigError::MissingModel { backend }) => {
                assert_eq!(backend, InferenceBackend::Libtorch);
            }
            Err(other) => panic!("expected MissingModel, got {:?}", other),
            Ok(_) => panic!("expected MissingModel, got a loaded backend"),
        }
    }

    #[cfg(not(feature = "onnx"))]
    #[test]
    fn loading_unbuilt_engine_reports_unavailable() {
        use crate::config::ModelDescriptor;

        let mut config = InferenceConfig::default();
        config.onnx_model = Some(ModelDescriptor::new(
            "model.onnx",
            vec![1, 1, 2048],
            vec![1, 1, 2048],
        ));
        match load_backend(InferenceBackend::Onnx, &config) {
            Err(ConfigError::BackendUnavailable { backend }) => {
                assert_eq!(backend, InferenceBackend::Onnx);
            }
            Err(other) => panic!("expected BackendUnavailable, got {:?}", other),
            Ok(_) => panic!("expected BackendUnavailable, got a loaded backend"),
        }
    }
}

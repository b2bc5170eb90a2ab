//! Configuration for inference sessions and the audio host
//!
//! Two inputs drive the scheduler: `InferenceConfig` describes the model
//! (window sizes, batching, worst-case inference time, per-engine artifacts)
//! and is immutable for the lifetime of a stream; `HostAudioConfig` describes
//! the callback contract (channels, block size, sample rate) and arrives at
//! `prepare`. Both are plain serde-serializable structs so hosts can load
//! them from their own settings plumbing.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Model artifact location and tensor layout for one inference engine.
///
/// Shapes are engine-native: LibTorch and ONNX models typically take
/// `[1, 1, n]` while TFLite transposes to `[1, n, 1]`. The flattened element
/// count of `input_shape` must equal `batch_size * model_input_size`, and
/// likewise for the output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Filesystem path the engine loads the artifact from
    pub path: String,
    /// Tensor layout expected on the input side
    pub input_shape: Vec<i64>,
    /// Tensor layout produced on the output side
    pub output_shape: Vec<i64>,
}

impl ModelDescriptor {
    pub fn new(path: impl Into<String>, input_shape: Vec<i64>, output_shape: Vec<i64>) -> Self {
        Self {
            path: path.into(),
            input_shape,
            output_shape,
        }
    }

    fn element_count(shape: &[i64]) -> usize {
        shape.iter().product::<i64>().max(0) as usize
    }

    pub fn input_elements(&self) -> usize {
        Self::element_count(&self.input_shape)
    }

    pub fn output_elements(&self) -> usize {
        Self::element_count(&self.output_shape)
    }
}

/// Immutable per-stream inference configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// TorchScript artifact, if the stream may run on LibTorch
    pub libtorch_model: Option<ModelDescriptor>,
    /// ONNX artifact, if the stream may run on ONNX Runtime
    pub onnx_model: Option<ModelDescriptor>,
    /// TFLite artifact, if the stream may run on TFLite
    pub tflite_model: Option<ModelDescriptor>,
    /// Samples per model window (per batch entry)
    pub model_input_size: usize,
    /// Samples produced per model window (per batch entry)
    pub model_output_size: usize,
    /// Batches evaluated per inference call
    pub batch_size: usize,
    /// Deterministic algorithmic delay of the model, in samples
    pub model_latency: usize,
    /// Worst-case wall time for one slot evaluation, in milliseconds.
    /// A design parameter for queue sizing, not an enforced deadline.
    pub max_inference_time_ms: f32,
    /// Fraction of the host block period the audio thread may spend waiting
    /// for a pending slot; doubles as the threshold below which the
    /// initialisation discard phase is skipped entirely
    pub wait_in_process_block: f32,
    /// Recurrent models keep hidden state across slots and must be evaluated
    /// strictly in submission order
    pub stateful: bool,
    /// Headroom multiplier on the computed slot count, covering shared-pool
    /// contention and underestimated `max_inference_time_ms`
    pub slot_overallocation_factor: usize,
}

impl InferenceConfig {
    /// Effective input window size per slot, accounting for batching.
    pub fn new_model_input_size(&self) -> usize {
        self.batch_size * self.model_input_size
    }

    /// Effective output size per slot, accounting for batching.
    pub fn new_model_output_size(&self) -> usize {
        self.batch_size * self.model_output_size
    }

    /// Worst-case inference time expressed in samples at `sample_rate`.
    pub fn max_inference_time_in_samples(&self, sample_rate: f64) -> usize {
        (f64::from(self.max_inference_time_ms) * sample_rate / 1000.0).ceil() as usize
    }

    /// Check shape and size consistency. Called by the manager before any
    /// buffers are allocated; a failure here means `process` must not be
    /// called.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model_input_size == 0 || self.model_output_size == 0 {
            return Err(ConfigError::InvalidShape {
                detail: "model input and output sizes must be greater than 0".to_string(),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidShape {
                detail: "batch size must be greater than 0".to_string(),
            });
        }
        if self.model_output_size > self.model_input_size {
            return Err(ConfigError::InvalidShape {
                detail: format!(
                    "model output size {} exceeds input size {}",
                    self.model_output_size, self.model_input_size
                ),
            });
        }
        if self.slot_overallocation_factor == 0 {
            return Err(ConfigError::InvalidShape {
                detail: "slot overallocation factor must be greater than 0".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.wait_in_process_block) {
            return Err(ConfigError::InvalidShape {
                detail: format!(
                    "wait_in_process_block {} outside [0, 1]",
                    self.wait_in_process_block
                ),
            });
        }

        for (name, descriptor) in [
            ("libtorch", &self.libtorch_model),
            ("onnx", &self.onnx_model),
            ("tflite", &self.tflite_model),
        ] {
            if let Some(model) = descriptor {
                if model.input_elements() != self.new_model_input_size()
                    || model.output_elements() != self.new_model_output_size()
                {
                    return Err(ConfigError::InvalidShape {
                        detail: format!(
                            "{} tensor shapes {:?} -> {:?} do not match window sizes {} -> {}",
                            name,
                            model.input_shape,
                            model.output_shape,
                            self.new_model_input_size(),
                            self.new_model_output_size()
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            libtorch_model: None,
            onnx_model: None,
            tflite_model: None,
            model_input_size: 2048,
            model_output_size: 2048,
            batch_size: 1,
            model_latency: 0,
            max_inference_time_ms: 0.0,
            wait_in_process_block: 0.5,
            stateful: false,
            slot_overallocation_factor: 4,
        }
    }
}

/// Audio host callback contract, fixed between `prepare` calls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HostAudioConfig {
    pub host_channels: usize,
    /// Samples per callback; `process` must be called with exactly this count
    pub host_buffer_size: usize,
    pub host_sample_rate: f64,
}

impl HostAudioConfig {
    pub fn new(host_channels: usize, host_buffer_size: usize, host_sample_rate: f64) -> Self {
        Self {
            host_channels,
            host_buffer_size,
            host_sample_rate,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host_channels == 0 || self.host_buffer_size == 0 || self.host_sample_rate <= 0.0 {
            return Err(ConfigError::InvalidHostConfig {
                channels: self.host_channels,
                buffer_size: self.host_buffer_size,
                sample_rate: self.host_sample_rate,
            });
        }
        Ok(())
    }

    /// Wall time of one host block, in seconds.
    pub fn block_period_secs(&self) -> f64 {
        self.host_buffer_size as f64 / self.host_sample_rate
    }
}

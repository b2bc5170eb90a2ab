// TorchScript adapter. Loads a scripted module once at construction and
// reuses a flat input staging vector across calls; the session serialises
// access, so the scratch state needs no synchronisation of its own.

use log::warn;
use tch::{CModule, Tensor};

use crate::backend::{Backend, InferenceBackend};
use crate::buffer::AudioBuffer;
use crate::config::{InferenceConfig, ModelDescriptor};
use crate::error::ConfigError;

pub struct LibtorchBackend {
    module: CModule,
    input_shape: Vec<i64>,
    staging: Vec<f32>,
}

impl LibtorchBackend {
    pub fn load(model: &ModelDescriptor, config: &InferenceConfig) -> Result<Self, ConfigError> {
        let module = CModule::load(&model.path).map_err(|e| ConfigError::BackendLoadFailed {
            backend: InferenceBackend::Libtorch,
            reason: e.to_string(),
        })?;
        Ok(Self {
            module,
            input_shape: model.input_shape.clone(),
            staging: vec![0.0; config.new_model_input_size()],
        })
    }
}

impl Backend for LibtorchBackend {
    fn prepare_to_play(&mut self) {
        // Warm-up pass so the first realtime slot does not pay for lazy
        // kernel initialisation inside the engine.
        let input = Tensor::zeros(&self.input_shape[..], (tch::Kind::Float, tch::Device::Cpu));
        if let Err(e) = self.module.forward_ts(&[input]) {
            warn!("libtorch warm-up inference failed: {}", e);
        }
    }

    fn process_block(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) {
        self.staging.copy_from_slice(input.as_slice());
        let input_tensor = Tensor::from_slice(&self.staging).reshape(&self.input_shape[..]);
        match self.module.forward_ts(&[input_tensor]) {
            Ok(result) => {
                let flat = result.flatten(0, -1);
                let mut values = vec![0.0f32; output.len()];
                flat.copy_data(&mut values, output.len());
                output.as_mut_slice().copy_from_slice(&values);
            }
            Err(e) => {
                warn!("libtorch inference failed, emitting silence: {}", e);
                output.clear();
            }
        }
    }
}

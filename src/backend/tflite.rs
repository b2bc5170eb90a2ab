// TFLite adapter. Note that TFLite model bundles carry transposed shapes
// ([1, n, 1] rather than [1, 1, n]); the flattened element counts are what
// the scheduler validates against, so the adapter only moves flat data.

use log::warn;
use tflitec::interpreter::{Interpreter, Options};

use crate::backend::{Backend, InferenceBackend};
use crate::buffer::AudioBuffer;
use crate::config::{InferenceConfig, ModelDescriptor};
use crate::error::ConfigError;

pub struct TfliteBackend {
    interpreter: Interpreter,
}

// SAFETY: the interpreter handle is only ever driven by one thread at a time;
// the owning session serialises all access behind a mutex.
unsafe impl Send for TfliteBackend {}

impl TfliteBackend {
    pub fn load(model: &ModelDescriptor, _config: &InferenceConfig) -> Result<Self, ConfigError> {
        let map_err = |e: tflitec::Error| ConfigError::BackendLoadFailed {
            backend: InferenceBackend::Tflite,
            reason: e.to_string(),
        };

        let options = Options {
            thread_count: 1,
            ..Options::default()
        };
        let interpreter =
            Interpreter::with_model_path(&model.path, Some(options)).map_err(map_err)?;
        interpreter.allocate_tensors().map_err(map_err)?;

        Ok(Self { interpreter })
    }

    fn run(&self, input: &AudioBuffer, output: &mut AudioBuffer) -> Result<(), tflitec::Error> {
        self.interpreter.copy(input.as_slice(), 0)?;
        self.interpreter.invoke()?;
        let tensor = self.interpreter.output(0)?;
        let data = tensor.data::<f32>();
        for (dst, src) in output.as_mut_slice().iter_mut().zip(data.iter()) {
            *dst = *src;
        }
        Ok(())
    }
}

impl Backend for TfliteBackend {
    fn process_block(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) {
        if let Err(e) = self.run(input, output) {
            warn!("tflite inference failed, emitting silence: {}", e);
            output.clear();
        }
    }
}

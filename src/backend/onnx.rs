// ONNX Runtime adapter. One Environment + Session per adapter instance;
// input tensors are rebuilt per call from a reusable staging array.

use std::sync::Arc;

use log::warn;
use ndarray::{ArrayD, CowArray, IxDyn};
use ort::{Environment, Session, SessionBuilder, Value};

use crate::backend::{Backend, InferenceBackend};
use crate::buffer::AudioBuffer;
use crate::config::{InferenceConfig, ModelDescriptor};
use crate::error::ConfigError;

pub struct OnnxBackend {
    _environment: Arc<Environment>,
    session: Session,
    input_shape: Vec<usize>,
}

impl OnnxBackend {
    pub fn load(model: &ModelDescriptor, _config: &InferenceConfig) -> Result<Self, ConfigError> {
        let map_err = |e: ort::OrtError| ConfigError::BackendLoadFailed {
            backend: InferenceBackend::Onnx,
            reason: e.to_string(),
        };

        let environment = Environment::builder()
            .with_name("neuraudio")
            .build()
            .map_err(map_err)?
            .into_arc();
        let session = SessionBuilder::new(&environment)
            .map_err(map_err)?
            .with_intra_threads(1)
            .map_err(map_err)?
            .with_model_from_file(&model.path)
            .map_err(map_err)?;

        Ok(Self {
            _environment: environment,
            session,
            input_shape: model.input_shape.iter().map(|&d| d.max(0) as usize).collect(),
        })
    }

    fn run(&self, input: &AudioBuffer, output: &mut AudioBuffer) -> Result<(), ort::OrtError> {
        let array = ArrayD::from_shape_vec(
            IxDyn(&self.input_shape),
            input.as_slice().to_vec(),
        )
        .expect("input buffer length matches the configured tensor shape");
        let cow = CowArray::from(array);
        let value = Value::from_array(self.session.allocator(), &cow)?;
        let outputs = self.session.run(vec![value])?;
        let extracted = outputs[0].try_extract::<f32>()?;
        let view = extracted.view();
        for (dst, src) in output.as_mut_slice().iter_mut().zip(view.iter()) {
            *dst = *src;
        }
        Ok(())
    }
}

impl Backend for OnnxBackend {
    fn process_block(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) {
        if let Err(e) = self.run(input, output) {
            warn!("onnxruntime inference failed, emitting silence: {}", e);
            output.clear();
        }
    }
}

//! Pre/post-processing strategies between ring buffers and slot windows.
//!
//! A strategy owns the copy policy only: how many fresh samples one slot
//! consumes (`hop_size`), how the model input window is assembled from the
//! send ring, and how the model output lands in the receive ring. The default
//! strategy moves samples 1:1; the overlap strategy rebuilds a receptive
//! field from already-consumed history so models can look back further than
//! they emit.
//!
//! Both directions run on the audio side of the scheduler, strictly in
//! submission order, which is what keeps the rings single-consumer.

use crate::backend::InferenceBackend;
use crate::buffer::{AudioBuffer, RingBuffer};
use crate::config::InferenceConfig;

/// Channel the inference stream runs on. Windows are mono; hosts with more
/// channels interleave block-wise into this channel.
const STREAM_CHANNEL: usize = 0;

/// Strategy moving samples between ring buffers and slot buffers.
pub trait PrePostProcessor: Send + Sync {
    /// Fresh samples one slot consumes from the send ring.
    fn hop_size(&self) -> usize;

    /// Assemble one model input window from the send ring. The ring is
    /// guaranteed to hold at least `hop_size` fresh samples.
    fn pre_process(
        &self,
        input: &mut RingBuffer,
        window: &mut AudioBuffer,
        backend: InferenceBackend,
    );

    /// Push one model output into the receive ring.
    fn post_process(
        &self,
        output: &AudioBuffer,
        receive: &mut RingBuffer,
        backend: InferenceBackend,
    );
}

/// Pop `num_new` fresh samples preceded by `num_old` context samples into
/// `window` starting at `offset`.
///
/// The context samples are the ones most recently consumed from the ring
/// (reread from its tail without consuming again); a freshly cleared ring
/// yields silence there, which is the correct warm-up context.
pub fn pop_samples_with_history(
    input: &mut RingBuffer,
    window: &mut AudioBuffer,
    num_new: usize,
    num_old: usize,
    offset: usize,
) {
    let samples = window.as_mut_slice();
    debug_assert!(offset + num_old + num_new <= samples.len());

    for i in 0..num_new {
        samples[offset + num_old + i] = input.pop_sample(STREAM_CHANNEL);
    }
    // After the pops above, the sample `j` places back from the read cursor
    // is `num_new + j` behind it.
    for j in 1..=num_old {
        samples[offset + num_old - j] = input.get_sample_from_tail(STREAM_CHANNEL, num_new + j);
    }
}

/// Push `count` samples from `window` starting at `offset` into the ring.
pub fn push_samples(output: &AudioBuffer, receive: &mut RingBuffer, offset: usize, count: usize) {
    let samples = output.as_slice();
    debug_assert!(offset + count <= samples.len());
    for &sample in &samples[offset..offset + count] {
        receive.push_sample(STREAM_CHANNEL, sample);
    }
}

/// 1:1 strategy: every input sample is consumed exactly once, no overlap.
#[derive(Debug, Clone)]
pub struct DefaultPrePostProcessor {
    config: InferenceConfig,
}

impl DefaultPrePostProcessor {
    pub fn new(config: InferenceConfig) -> Self {
        Self { config }
    }
}

impl PrePostProcessor for DefaultPrePostProcessor {
    fn hop_size(&self) -> usize {
        self.config.new_model_input_size()
    }

    fn pre_process(
        &self,
        input: &mut RingBuffer,
        window: &mut AudioBuffer,
        _backend: InferenceBackend,
    ) {
        pop_samples_with_history(input, window, self.config.new_model_input_size(), 0, 0);
    }

    fn post_process(
        &self,
        output: &AudioBuffer,
        receive: &mut RingBuffer,
        _backend: InferenceBackend,
    ) {
        push_samples(output, receive, 0, self.config.new_model_output_size());
    }
}

/// Overlap strategy for models whose input window exceeds their output.
///
/// Per batch entry, the window is `model_input_size - model_output_size`
/// carried context samples followed by `model_output_size` fresh ones, so a
/// slot advances the stream by `new_model_output_size` samples while the
/// model still sees its full receptive field.
#[derive(Debug, Clone)]
pub struct OverlapPrePostProcessor {
    config: InferenceConfig,
}

impl OverlapPrePostProcessor {
    pub fn new(config: InferenceConfig) -> Self {
        Self { config }
    }
}

impl PrePostProcessor for OverlapPrePostProcessor {
    fn hop_size(&self) -> usize {
        self.config.new_model_output_size()
    }

    fn pre_process(
        &self,
        input: &mut RingBuffer,
        window: &mut AudioBuffer,
        _backend: InferenceBackend,
    ) {
        let num_new = self.config.model_output_size;
        let num_old = self.config.model_input_size - self.config.model_output_size;
        for batch in 0..self.config.batch_size {
            let offset = batch * self.config.model_input_size;
            pop_samples_with_history(input, window, num_new, num_old, offset);
        }
    }

    fn post_process(
        &self,
        output: &AudioBuffer,
        receive: &mut RingBuffer,
        _backend: InferenceBackend,
    ) {
        for batch in 0..self.config.batch_size {
            let offset = batch * self.config.model_output_size;
            push_samples(output, receive, offset, self.config.model_output_size);
        }
    }
}

//! Per-stream façade driven from the audio callback.
//!
//! The manager owns the audio-thread view of one session: it feeds input
//! samples to the send ring, signals the pool, pulls completed output and
//! enforces the fixed-latency contract. When inference falls behind it
//! substitutes silence and remembers how many blocks it owes; once the
//! workers catch up it discards the same number of blocks from the receive
//! ring, so the stream's phase against the host clock never drifts.
//!
//! Startup works the same way in reverse: before real output may flow, an
//! initialisation debt of silent samples is swallowed so that steady-state
//! latency lands exactly on a multiple of the host block size.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{Backend, InferenceBackend};
use crate::config::{HostAudioConfig, InferenceConfig};
use crate::error::ConfigError;
use crate::processor::PrePostProcessor;
use crate::scheduler::pool::InferencePool;
use crate::scheduler::session::Session;

pub struct InferenceManager {
    pool: Arc<InferencePool>,
    session: Arc<Session>,
    host_config: Option<HostAudioConfig>,

    /// Samples of silence still owed before steady state
    init_samples: usize,
    /// True when the debt is small enough to hide inside the in-block wait
    init_skipped: bool,
    initializing: bool,
    swallowed_samples: usize,

    /// Blocks of silence emitted but not yet paid back by discarding
    inference_counter: AtomicUsize,
    /// Lifetime count of underrun blocks, for external sampling
    missed_blocks_total: AtomicU64,
    /// Lifetime count of blocks discarded to pay back emitted silence
    caught_up_blocks_total: AtomicU64,
}

impl InferenceManager {
    /// Create a manager bound to the process-wide pool.
    pub fn new(
        processor: Arc<dyn PrePostProcessor>,
        config: InferenceConfig,
        initial_backend: InferenceBackend,
    ) -> Result<Self, ConfigError> {
        Self::with_pool(processor, config, initial_backend, InferencePool::global())
    }

    /// Create a manager on an explicitly shared pool. Tests and multi-tenant
    /// hosts use this to keep pools isolated.
    pub fn with_pool(
        processor: Arc<dyn PrePostProcessor>,
        config: InferenceConfig,
        initial_backend: InferenceBackend,
        pool: Arc<InferencePool>,
    ) -> Result<Self, ConfigError> {
        Self::build(processor, config, initial_backend, None, pool)
    }

    /// Like `with_pool`, but replaces the passthrough adapter with a custom
    /// one. Benchmarks and overload tests use this to shape inference cost
    /// without loading a real model.
    pub fn with_passthrough_backend(
        processor: Arc<dyn PrePostProcessor>,
        config: InferenceConfig,
        passthrough: Box<dyn Backend>,
        pool: Arc<InferencePool>,
    ) -> Result<Self, ConfigError> {
        Self::build(
            processor,
            config,
            InferenceBackend::None,
            Some(passthrough),
            pool,
        )
    }

    fn build(
        processor: Arc<dyn PrePostProcessor>,
        config: InferenceConfig,
        initial_backend: InferenceBackend,
        passthrough_override: Option<Box<dyn Backend>>,
        pool: Arc<InferencePool>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let session =
            pool.create_session(config, processor, initial_backend, passthrough_override)?;
        Ok(Self {
            pool,
            session,
            host_config: None,
            init_samples: 0,
            init_skipped: false,
            initializing: false,
            swallowed_samples: 0,
            inference_counter: AtomicUsize::new(0),
            missed_blocks_total: AtomicU64::new(0),
            caught_up_blocks_total: AtomicU64::new(0),
        })
    }

    /// Configure for a host contract. Idempotent; repreparing clears all
    /// buffered audio and restarts the initialisation phase.
    pub fn prepare(&mut self, host_config: HostAudioConfig) -> Result<(), ConfigError> {
        host_config.validate()?;
        self.session.prepare(&host_config);

        let config = self.session.config();
        self.init_samples = compute_init_samples(config, &host_config);
        self.init_skipped = (self.init_samples as f64)
            < f64::from(config.wait_in_process_block) * host_config.host_buffer_size as f64;
        self.initializing = !self.init_skipped && self.init_samples > 0;
        self.swallowed_samples = 0;
        self.inference_counter.store(0, Ordering::Release);
        self.host_config = Some(host_config);
        Ok(())
    }

    /// Realtime callback entry point: consumes and overwrites the given
    /// channel buffers in place.
    ///
    /// Must be called with the channel count and block size passed to
    /// `prepare`; violations are programming errors checked in debug builds.
    pub fn process(&mut self, channels: &mut [&mut [f32]]) {
        let host_config = match self.host_config {
            Some(config) => config,
            None => {
                debug_assert!(false, "process called before prepare");
                return;
            }
        };
        let n_samples = host_config.host_buffer_size;
        debug_assert_eq!(channels.len(), host_config.host_channels);
        debug_assert!(channels.iter().all(|c| c.len() == n_samples));

        self.process_input(channels);
        self.pool.new_data_submitted(&self.session);

        let config = self.session.config();
        let max_wait = if config.wait_in_process_block > 0.0 {
            Duration::from_secs_f64(
                f64::from(config.wait_in_process_block) * n_samples as f64
                    / host_config.host_sample_rate,
            )
        } else {
            Duration::ZERO
        };
        self.pool.new_data_request(&self.session, max_wait);

        if self.initializing {
            self.swallowed_samples += n_samples;
            clear_channels(channels);
            if self.swallowed_samples >= self.init_samples {
                self.initializing = false;
            }
        } else {
            self.process_output(channels);
        }
    }

    fn process_input(&self, channels: &[&mut [f32]]) {
        let mut send = self
            .session
            .send_buffer
            .lock()
            .expect("send buffer mutex poisoned");
        // Channels interleave block-wise into the single inference stream;
        // the pop side mirrors the same order, so per-channel FIFO holds.
        for channel in channels {
            for &sample in channel.iter() {
                send.push_sample(0, sample);
            }
        }
    }

    fn process_output(&self, channels: &mut [&mut [f32]]) {
        let total: usize = channels.iter().map(|c| c.len()).sum();
        let mut receive = self
            .session
            .receive_buffer
            .lock()
            .expect("receive buffer mutex poisoned");

        // Pay back emitted silence first: every owed block is discarded as
        // soon as a full spare block is buffered on top of this callback's
        // demand, restoring phase alignment with the host clock.
        while self.inference_counter.load(Ordering::Acquire) > 0 {
            if receive.available_samples(0) < 2 * total {
                break;
            }
            for _ in 0..total {
                receive.pop_sample(0);
            }
            self.inference_counter.fetch_sub(1, Ordering::AcqRel);
            self.caught_up_blocks_total.fetch_add(1, Ordering::Relaxed);
        }

        if receive.available_samples(0) >= total {
            for channel in channels.iter_mut() {
                for sample in channel.iter_mut() {
                    *sample = receive.pop_sample(0);
                }
            }
        } else {
            drop(receive);
            clear_channels(channels);
            self.inference_counter.fetch_add(1, Ordering::AcqRel);
            self.missed_blocks_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Atomic swap of the engine the workers dispatch to.
    pub fn set_backend(&self, backend: InferenceBackend) {
        self.session.set_backend(backend);
    }

    pub fn backend(&self) -> InferenceBackend {
        self.session.backend()
    }

    /// Reported latency in samples: the initialisation debt rounded up to
    /// the next multiple of the host block size, or 0 when the debt is
    /// skipped because the in-block wait hides it.
    pub fn latency(&self) -> usize {
        let host_config = match self.host_config {
            Some(config) => config,
            None => return 0,
        };
        if self.init_skipped || self.init_samples == 0 {
            return 0;
        }
        self.init_samples.div_ceil(host_config.host_buffer_size) * host_config.host_buffer_size
    }

    /// Current catch-up counter: host blocks of silence emitted but not yet
    /// paid back.
    pub fn missing_blocks(&self) -> usize {
        self.inference_counter.load(Ordering::Acquire)
    }

    /// Lifetime underrun count, safe to sample from any thread.
    pub fn missed_blocks_total(&self) -> u64 {
        self.missed_blocks_total.load(Ordering::Relaxed)
    }

    /// Lifetime count of blocks discarded while catching up.
    pub fn caught_up_blocks_total(&self) -> u64 {
        self.caught_up_blocks_total.load(Ordering::Relaxed)
    }

    pub fn is_initializing(&self) -> bool {
        self.initializing
    }

    /// Completed samples currently buffered on the receive side, pulling any
    /// freshly finished slots first. Testing aid.
    pub fn num_received_samples(&self) -> usize {
        self.pool.new_data_request(&self.session, Duration::ZERO);
        self.session
            .receive_buffer
            .lock()
            .expect("receive buffer mutex poisoned")
            .available_samples(0)
    }

    pub fn session_id(&self) -> usize {
        self.session.id()
    }

    /// Submitted-but-unconsumed slot count. Testing aid.
    pub fn outstanding_slots(&self) -> usize {
        self.session.outstanding()
    }

    pub fn pool(&self) -> &Arc<InferencePool> {
        &self.pool
    }
}

impl Drop for InferenceManager {
    fn drop(&mut self) {
        self.pool.release_session(&self.session);
    }
}

fn clear_channels(channels: &mut [&mut [f32]]) {
    for channel in channels.iter_mut() {
        channel.fill(0.0);
    }
}

/// Initialisation debt: silent samples to swallow at startup so that
/// steady-state latency is a whole number of host blocks.
///
/// Alignment is computed against the batched model input size. When the host
/// block divides it evenly, every block maps to a whole number of inference
/// windows and the debt is the per-window round-trip cost scaled by that
/// ratio; a fractional remainder costs one extra host block of slack; a block
/// smaller than one window additionally waits for a full window of output to
/// accumulate.
fn compute_init_samples(config: &InferenceConfig, host_config: &HostAudioConfig) -> usize {
    let inference_samples = config.max_inference_time_in_samples(host_config.host_sample_rate);
    let window = config.new_model_input_size();
    let host_buffer = host_config.host_buffer_size;

    let windows_per_block = host_buffer / window;
    let remainder = host_buffer % window;

    if remainder == 0 {
        windows_per_block * (inference_samples + config.model_latency)
    } else if remainder == host_buffer {
        // Host block smaller than one model window
        inference_samples + config.new_model_output_size() + config.model_latency
    } else {
        (windows_per_block + 1) * (inference_samples + config.model_latency) + host_buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(input: usize, output: usize) -> InferenceConfig {
        InferenceConfig {
            model_input_size: input,
            model_output_size: output,
            ..InferenceConfig::default()
        }
    }

    fn host(buffer_size: usize, sample_rate: f64) -> HostAudioConfig {
        HostAudioConfig::new(1, buffer_size, sample_rate)
    }

    #[test]
    fn init_debt_even_division() {
        // Host block is four whole model windows.
        let mut cfg = config(256, 256);
        cfg.max_inference_time_ms = 10.0;
        cfg.model_latency = 100;
        let t_s = cfg.max_inference_time_in_samples(48000.0);
        assert_eq!(
            compute_init_samples(&cfg, &host(1024, 48000.0)),
            4 * (t_s + 100)
        );
    }

    #[test]
    fn init_debt_fractional_remainder_adds_a_block() {
        // 1024 % 768 != 0 and 1024 > 768
        let mut cfg = config(768, 768);
        cfg.max_inference_time_ms = 5.0;
        let t_s = cfg.max_inference_time_in_samples(48000.0);
        assert_eq!(
            compute_init_samples(&cfg, &host(1024, 48000.0)),
            2 * t_s + 1024
        );
    }

    #[test]
    fn init_debt_block_smaller_than_window() {
        // CNN-style receptive field: 1844-sample window, 512-sample hop.
        let mut cfg = config(1844, 512);
        cfg.max_inference_time_ms = 10.66;
        let t_s = cfg.max_inference_time_in_samples(44100.0);
        assert_eq!(t_s, 471);
        assert_eq!(
            compute_init_samples(&cfg, &host(512, 44100.0)),
            471 + 512
        );
    }

    #[test]
    fn init_debt_zero_when_inference_is_free() {
        let cfg = config(256, 256);
        assert_eq!(compute_init_samples(&cfg, &host(256, 48000.0)), 0);
    }

    #[test]
    fn init_debt_stateful_rnn_shape() {
        // 4096 window, 4096 hop, worst case one full window of wall time
        // plus one window of algorithmic latency.
        let mut cfg = config(4096, 4096);
        cfg.model_latency = 4096;
        // Just under 4096 samples at 44100 Hz; ceil lands on 4096 exactly
        cfg.max_inference_time_ms = 92.87;
        assert_eq!(
            compute_init_samples(&cfg, &host(4096, 44100.0)),
            8192
        );
    }
}

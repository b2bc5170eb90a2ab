//! End-to-end scheduler tests: full manager/pool/worker round trips on the
//! passthrough backend, covering fixed-latency startup, catch-up under
//! overload and multi-session pools.
//!
//! Every test builds its own isolated pool so parallel test execution never
//! shares worker threads, and waits on observable state (outstanding slots,
//! received samples) instead of sleeping for fixed durations.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::backend::{Backend, InferenceBackend, PassthroughBackend};
use crate::buffer::AudioBuffer;
use crate::config::{HostAudioConfig, InferenceConfig, ModelDescriptor};
use crate::error::ConfigError;
use crate::processor::{DefaultPrePostProcessor, OverlapPrePostProcessor};
use crate::scheduler::{InferenceManager, InferencePool};
use crate::testing::{ramp_block, wait_until};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn passthrough_config(size: usize) -> InferenceConfig {
    InferenceConfig {
        model_input_size: size,
        model_output_size: size,
        ..InferenceConfig::default()
    }
}

fn process_block(manager: &mut InferenceManager, block: &mut [f32]) {
    let mut channels: Vec<&mut [f32]> = vec![block];
    manager.process(&mut channels);
}

/// Pull any finished slots and wait until nothing is outstanding.
fn drain_workers(manager: &InferenceManager) {
    let drained = wait_until(DRAIN_TIMEOUT, || {
        let _ = manager.num_received_samples();
        manager.outstanding_slots() == 0
    });
    assert!(drained, "workers failed to drain outstanding slots in time");
}

/// S1: zero-cost passthrough has zero latency and reproduces every block
/// in the same callback.
#[test]
fn passthrough_stream_is_identity_with_zero_latency() {
    init_logging();
    let config = passthrough_config(256);
    let pool = InferencePool::new(2);
    let processor = Arc::new(DefaultPrePostProcessor::new(config.clone()));
    let mut manager =
        InferenceManager::with_pool(processor, config, InferenceBackend::None, pool)
            .expect("passthrough manager");
    // Low rate keeps the in-block wait comfortable for scheduling jitter.
    manager
        .prepare(HostAudioConfig::new(1, 256, 8000.0))
        .expect("prepare");

    assert_eq!(manager.latency(), 0);
    assert!(!manager.is_initializing());

    for k in 0..8 {
        let expected = ramp_block(k, 256);
        let mut block = expected.clone();
        process_block(&mut manager, &mut block);
        assert_eq!(block, expected, "block {} should pass through unchanged", k);
    }
    assert_eq!(manager.missing_blocks(), 0);
}

/// S2: a CNN-shaped stream (1844-sample receptive field, 512-sample hop,
/// 10.66 ms worst case at 44.1 kHz) reports two blocks of latency and then
/// reproduces the input delayed by exactly that.
#[test]
fn windowed_stream_has_two_blocks_of_latency() {
    init_logging();
    let config = InferenceConfig {
        model_input_size: 1844,
        model_output_size: 512,
        max_inference_time_ms: 10.66,
        wait_in_process_block: 0.0,
        ..InferenceConfig::default()
    };
    let pool = InferencePool::new(2);
    let processor = Arc::new(OverlapPrePostProcessor::new(config.clone()));
    let mut manager =
        InferenceManager::with_pool(processor, config, InferenceBackend::None, pool)
            .expect("manager");
    manager
        .prepare(HostAudioConfig::new(1, 512, 44100.0))
        .expect("prepare");

    assert_eq!(manager.latency(), 1024);

    for k in 0..10 {
        let mut block = ramp_block(k, 512);
        process_block(&mut manager, &mut block);
        if k < 2 {
            assert!(block.iter().all(|&s| s == 0.0), "startup block {} must be silent", k);
        } else {
            assert_eq!(
                block,
                ramp_block(k - 2, 512),
                "block {} should be the input delayed by the reported latency",
                k
            );
        }
        // The pull is non-blocking here, so give the workers room between
        // callbacks like a realtime host would.
        drain_workers(&manager);
    }
    assert_eq!(manager.missing_blocks(), 0);
}

/// S3: a stateful full-block model with one block of algorithmic latency and
/// one block of worst-case wall time reports 8192 samples of latency.
#[test]
fn stateful_stream_swallows_two_blocks_then_flows() {
    init_logging();
    let config = InferenceConfig {
        model_input_size: 4096,
        model_output_size: 4096,
        model_latency: 4096,
        // just under one 4096-sample block at 44.1 kHz
        max_inference_time_ms: 92.87,
        stateful: true,
        ..InferenceConfig::default()
    };
    let pool = InferencePool::new(2);
    let processor = Arc::new(DefaultPrePostProcessor::new(config.clone()));
    let mut manager =
        InferenceManager::with_pool(processor, config, InferenceBackend::None, pool)
            .expect("manager");
    manager
        .prepare(HostAudioConfig::new(1, 4096, 44100.0))
        .expect("prepare");

    assert_eq!(manager.latency(), 8192);
    assert!(manager.is_initializing());

    for k in 0..6 {
        let mut block = ramp_block(k, 4096);
        process_block(&mut manager, &mut block);
        if k < 2 {
            assert!(block.iter().all(|&s| s == 0.0), "startup block {} must be silent", k);
        } else {
            assert_eq!(block, ramp_block(k - 2, 4096), "block {} misaligned", k);
        }
        drain_workers(&manager);
    }
    assert!(!manager.is_initializing());
}

/// S4: an unloadable engine fails at construction; the passthrough engine
/// then carries the same stream.
#[test]
fn unavailable_engine_surfaces_config_error_and_passthrough_recovers() {
    init_logging();
    let mut config = passthrough_config(256);
    config.libtorch_model = Some(ModelDescriptor::new(
        "models/does-not-exist.pt",
        vec![1, 1, 256],
        vec![1, 1, 256],
    ));
    let pool = InferencePool::new(2);

    let processor: Arc<dyn crate::processor::PrePostProcessor> =
        Arc::new(DefaultPrePostProcessor::new(config.clone()));
    let failed = InferenceManager::with_pool(
        Arc::clone(&processor),
        config.clone(),
        InferenceBackend::Libtorch,
        Arc::clone(&pool),
    );
    match failed {
        Err(ConfigError::BackendUnavailable { .. }) | Err(ConfigError::BackendLoadFailed { .. }) => {}
        Err(other) => panic!("unexpected error kind: {:?}", other),
        Ok(_) => panic!("expected a configuration error"),
    }
    assert_eq!(pool.active_sessions(), 0, "failed creation must not leak a session");

    let mut manager =
        InferenceManager::with_pool(processor, config, InferenceBackend::None, pool)
            .expect("passthrough manager");
    manager
        .prepare(HostAudioConfig::new(1, 256, 8000.0))
        .expect("prepare");
    assert_eq!(manager.backend(), InferenceBackend::None);

    for k in 0..4 {
        let expected = ramp_block(k, 256);
        let mut block = expected.clone();
        process_block(&mut manager, &mut block);
        assert_eq!(block, expected);
    }
}

/// Passthrough that is slow for its first few calls and instant afterwards,
/// modelling a transient stall of the inference engine.
struct StallingBackend {
    slow_calls_remaining: usize,
    delay: Duration,
    inner: PassthroughBackend,
}

impl Backend for StallingBackend {
    fn process_block(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) {
        if self.slow_calls_remaining > 0 {
            self.slow_calls_remaining -= 1;
            thread::sleep(self.delay);
        }
        self.inner.process_block(input, output);
    }
}

/// S5: while the engine stalls the catch-up counter grows monotonically;
/// once the workers get wall time, the buffered surplus pays every owed
/// block back and the counter returns to zero.
#[test]
fn overloaded_stream_accumulates_and_repays_missing_blocks() {
    init_logging();
    let config = passthrough_config(256);
    let pool = InferencePool::new(2);
    let processor = Arc::new(DefaultPrePostProcessor::new(config.clone()));
    let mut manager = InferenceManager::with_passthrough_backend(
        processor,
        config,
        Box::new(StallingBackend {
            // Every slot submitted during the stall runs slow.
            slow_calls_remaining: 4,
            delay: Duration::from_millis(100),
            inner: PassthroughBackend,
        }),
        pool,
    )
    .expect("manager");
    manager
        .prepare(HostAudioConfig::new(1, 256, 48000.0))
        .expect("prepare");
    assert_eq!(manager.latency(), 0);

    // Feed much faster than the stalled backend can process: every block
    // underruns and the owed-block count only grows.
    let mut previous = 0;
    for k in 0..8 {
        let mut block = ramp_block(k, 256);
        process_block(&mut manager, &mut block);
        let missing = manager.missing_blocks();
        assert!(missing >= previous, "catch-up counter must grow monotonically");
        previous = missing;
    }
    assert!(previous >= 4, "starved stream should owe several blocks, owed {}", previous);
    assert_eq!(manager.missed_blocks_total(), previous as u64);

    // Pause the input until the workers have drained the stalled slots, then
    // keep the callback running: the accumulated surplus is discarded block
    // by block until phase alignment is restored.
    let mut extra_blocks = 8;
    while manager.missing_blocks() > 0 {
        drain_workers(&manager);
        let mut block = ramp_block(extra_blocks, 256);
        process_block(&mut manager, &mut block);
        extra_blocks += 1;
        assert!(extra_blocks < 200, "catch-up failed to converge");
    }
    assert_eq!(manager.missing_blocks(), 0);
    assert!(manager.caught_up_blocks_total() >= 4);
}

/// S6: two identically configured sessions on one pool stream independently.
#[test]
fn two_sessions_share_the_pool_independently() {
    init_logging();
    let pool = InferencePool::new(4);

    let mut handles = Vec::new();
    let mut session_ids = Vec::new();
    for _ in 0..2 {
        let config = passthrough_config(256);
        let processor = Arc::new(DefaultPrePostProcessor::new(config.clone()));
        let mut manager = InferenceManager::with_pool(
            processor,
            config,
            InferenceBackend::None,
            Arc::clone(&pool),
        )
        .expect("manager");
        manager
            .prepare(HostAudioConfig::new(1, 256, 8000.0))
            .expect("prepare");
        assert_eq!(manager.latency(), 0);
        session_ids.push(manager.session_id());

        handles.push(thread::spawn(move || {
            for k in 0..8 {
                let expected = ramp_block(k, 256);
                let mut block = expected.clone();
                process_block(&mut manager, &mut block);
                assert_eq!(block, expected, "session block {} corrupted", k);
            }
        }));
    }
    session_ids.sort_unstable();
    assert_eq!(session_ids, vec![0, 1]);

    for handle in handles {
        handle.join().expect("session thread panicked");
    }
    assert_eq!(pool.active_sessions(), 0);
}

/// Invariant 5: ids stay unique and dense under concurrent create/release.
#[test]
fn concurrent_sessions_get_unique_dense_ids() {
    init_logging();
    let pool = InferencePool::new(2);
    let max_alive = 8;
    let observed = Arc::new(Mutex::new(Vec::new()));

    let threads: Vec<_> = (0..max_alive)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let observed = Arc::clone(&observed);
            thread::spawn(move || {
                for _ in 0..5 {
                    let config = passthrough_config(64);
                    let processor = Arc::new(DefaultPrePostProcessor::new(config.clone()));
                    let manager = InferenceManager::with_pool(
                        processor,
                        config,
                        InferenceBackend::None,
                        Arc::clone(&pool),
                    )
                    .expect("manager");
                    observed.lock().unwrap().push(manager.session_id());
                }
            })
        })
        .collect();
    for t in threads {
        t.join().expect("creation thread panicked");
    }

    let ids = observed.lock().unwrap();
    assert_eq!(ids.len(), max_alive * 5);
    // Dense reuse: with at most `max_alive` sessions alive at once, no id
    // ever reaches that bound.
    assert!(ids.iter().all(|&id| id < max_alive));
    assert_eq!(pool.active_sessions(), 0);
}

/// Invariant 1 on reported latency: always a whole number of host blocks.
#[test]
fn reported_latency_is_a_multiple_of_the_block_size() {
    init_logging();
    let cases = [
        (256, 256, 0.0, 0, 256),
        (512, 512, 10.66, 0, 512),
        (1844, 512, 10.66, 0, 512),
        (4096, 4096, 92.87, 4096, 4096),
        (768, 768, 5.0, 100, 1024),
        (150, 64, 3.0, 0, 1024),
    ];
    let pool = InferencePool::new(1);

    for (input, output, ms, model_latency, host_buffer) in cases {
        let config = InferenceConfig {
            model_input_size: input,
            model_output_size: output,
            max_inference_time_ms: ms,
            model_latency,
            wait_in_process_block: 0.0,
            ..InferenceConfig::default()
        };
        let processor: Arc<dyn crate::processor::PrePostProcessor> = if output < input {
            Arc::new(OverlapPrePostProcessor::new(config.clone()))
        } else {
            Arc::new(DefaultPrePostProcessor::new(config.clone()))
        };
        let mut manager = InferenceManager::with_pool(
            processor,
            config,
            InferenceBackend::None,
            Arc::clone(&pool),
        )
        .expect("manager");
        manager
            .prepare(HostAudioConfig::new(1, host_buffer, 44100.0))
            .expect("prepare");
        assert_eq!(
            manager.latency() % host_buffer,
            0,
            "latency {} is not block-aligned for window {}/{} at block {}",
            manager.latency(),
            input,
            output,
            host_buffer
        );
    }
}

/// Invariant 3: steady-state output is a prefix of the input, delayed by the
/// reported latency, even when the input is noise.
#[test]
fn output_is_a_delayed_prefix_of_the_input() {
    use rand::{rngs::StdRng, SeedableRng};

    use crate::testing::random_block;

    init_logging();
    let config = InferenceConfig {
        model_input_size: 1844,
        model_output_size: 512,
        max_inference_time_ms: 10.66,
        wait_in_process_block: 0.0,
        ..InferenceConfig::default()
    };
    let pool = InferencePool::new(2);
    let processor = Arc::new(OverlapPrePostProcessor::new(config.clone()));
    let mut manager =
        InferenceManager::with_pool(processor, config, InferenceBackend::None, pool)
            .expect("manager");
    manager
        .prepare(HostAudioConfig::new(1, 512, 44100.0))
        .expect("prepare");

    let latency_blocks = manager.latency() / 512;
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let inputs: Vec<Vec<f32>> = (0..12).map(|_| random_block(512, &mut rng)).collect();

    for (k, input) in inputs.iter().enumerate() {
        let mut block = input.clone();
        process_block(&mut manager, &mut block);
        if k >= latency_blocks {
            assert_eq!(
                &block,
                &inputs[k - latency_blocks],
                "block {} is not the input delayed by {} blocks",
                k,
                latency_blocks
            );
        }
        drain_workers(&manager);
    }
}

/// Repreparing a manager clears stream state and restarts initialisation.
#[test]
fn prepare_is_idempotent_and_reconfigures() {
    init_logging();
    let config = InferenceConfig {
        model_input_size: 1844,
        model_output_size: 512,
        max_inference_time_ms: 10.66,
        wait_in_process_block: 0.0,
        ..InferenceConfig::default()
    };
    let pool = InferencePool::new(2);
    let processor = Arc::new(OverlapPrePostProcessor::new(config.clone()));
    let mut manager =
        InferenceManager::with_pool(processor, config, InferenceBackend::None, pool)
            .expect("manager");

    manager
        .prepare(HostAudioConfig::new(1, 512, 44100.0))
        .expect("first prepare");
    for k in 0..4 {
        let mut block = ramp_block(k, 512);
        process_block(&mut manager, &mut block);
        drain_workers(&manager);
    }

    // Reconfigure mid-life: everything starts over, including the debt.
    manager
        .prepare(HostAudioConfig::new(1, 512, 44100.0))
        .expect("second prepare");
    assert!(manager.is_initializing());
    assert_eq!(manager.num_received_samples(), 0);
    assert_eq!(manager.missing_blocks(), 0);

    for k in 0..6 {
        let mut block = ramp_block(k, 512);
        process_block(&mut manager, &mut block);
        if k >= 2 {
            assert_eq!(block, ramp_block(k - 2, 512), "block {} misaligned after reprepare", k);
        }
        drain_workers(&manager);
    }
}

//! Per-stream session state shared between the audio thread and the workers.
//!
//! A session owns the send/receive rings, the preallocated inference slots
//! and the backend adapters for one audio stream. The audio thread drives
//! submission and consumption; workers only ever touch a slot between its
//! Ready and Done transitions. All cross-thread handoff goes through each
//! slot's atomic state word:
//!
//! ```text
//! Free -> Ready     audio thread, after pre-processing into slot.input
//! Ready -> InFlight worker, by compare-and-swap (exactly one winner)
//! InFlight -> Done  worker, after the backend filled slot.output
//! Done -> Free      audio thread, after post-processing into the receive ring
//! ```
//!
//! The slot buffers sit behind mutexes, but the state machine guarantees the
//! lock is uncontended at every acquisition: the audio thread only locks Free
//! and Done slots, a worker only locks the slot it has claimed.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use log::debug;

use crate::backend::{self, Backend, InferenceBackend};
use crate::buffer::{AudioBuffer, RingBuffer};
use crate::config::{HostAudioConfig, InferenceConfig};
use crate::error::ConfigError;
use crate::processor::PrePostProcessor;

/// Ring capacity in seconds of audio. Generous on purpose: the send ring
/// absorbs the whole backlog while workers are behind.
const RING_CAPACITY_SECONDS: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    Free = 0,
    Ready = 1,
    InFlight = 2,
    Done = 3,
}

impl SlotState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SlotState::Ready,
            2 => SlotState::InFlight,
            3 => SlotState::Done,
            _ => SlotState::Free,
        }
    }
}

/// One reusable inference work item: an input/output buffer pair plus the
/// state word the threads rendezvous on.
pub struct InferenceSlot {
    state: AtomicU8,
    pub input: Mutex<AudioBuffer>,
    pub output: Mutex<AudioBuffer>,
    /// Completion time in nanoseconds since session creation
    completed_at_ns: AtomicU64,
}

impl InferenceSlot {
    fn new(input_size: usize, output_size: usize) -> Self {
        Self {
            state: AtomicU8::new(SlotState::Free as u8),
            input: Mutex::new(AudioBuffer::new(input_size)),
            output: Mutex::new(AudioBuffer::new(output_size)),
            completed_at_ns: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn mark_ready(&self) {
        self.state.store(SlotState::Ready as u8, Ordering::Release);
    }

    /// Worker-side claim; exactly one caller wins per Ready transition.
    pub(crate) fn try_claim(&self) -> bool {
        self.state
            .compare_exchange(
                SlotState::Ready as u8,
                SlotState::InFlight as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn mark_done(&self, elapsed_ns: u64) {
        self.completed_at_ns.store(elapsed_ns, Ordering::Relaxed);
        self.state.store(SlotState::Done as u8, Ordering::Release);
    }

    pub(crate) fn mark_free(&self) {
        self.state.store(SlotState::Free as u8, Ordering::Release);
    }

    /// Completion timestamp of the most recent run, nanoseconds since the
    /// owning session was created.
    pub fn completed_at_ns(&self) -> u64 {
        self.completed_at_ns.load(Ordering::Relaxed)
    }
}

/// Loaded backend adapters for one session. Each adapter sits behind its own
/// mutex because the contract does not require thread safety for a shared
/// instance; workers serialise on it per slot.
struct AdapterRack {
    none: Mutex<Box<dyn Backend>>,
    libtorch: Option<Mutex<Box<dyn Backend>>>,
    onnx: Option<Mutex<Box<dyn Backend>>>,
    tflite: Option<Mutex<Box<dyn Backend>>>,
}

impl AdapterRack {
    fn get(&self, backend: InferenceBackend) -> Option<&Mutex<Box<dyn Backend>>> {
        match backend {
            InferenceBackend::None => Some(&self.none),
            InferenceBackend::Libtorch => self.libtorch.as_ref(),
            InferenceBackend::Onnx => self.onnx.as_ref(),
            InferenceBackend::Tflite => self.tflite.as_ref(),
        }
    }
}

/// Per-stream scheduling state. Shared as `Arc<Session>` between the owning
/// manager (audio thread) and the pool workers.
pub struct Session {
    id: usize,
    config: InferenceConfig,
    processor: Arc<dyn PrePostProcessor>,
    adapters: AdapterRack,
    backend_selector: AtomicU8,

    pub(crate) send_buffer: Mutex<RingBuffer>,
    pub(crate) receive_buffer: Mutex<RingBuffer>,
    slots: RwLock<Vec<Arc<InferenceSlot>>>,

    /// Next slot index the audio thread fills (ring order)
    submit_pos: AtomicUsize,
    /// Next slot index the audio thread drains (ring order)
    consume_pos: AtomicUsize,
    /// Submitted-but-not-consumed slots
    outstanding: AtomicUsize,
    /// Single-slot-in-flight gate, consulted for stateful models only
    inflight_gate: AtomicBool,

    epoch: Instant,
}

impl Session {
    pub(crate) fn new(
        id: usize,
        config: InferenceConfig,
        processor: Arc<dyn PrePostProcessor>,
        initial_backend: InferenceBackend,
        passthrough_override: Option<Box<dyn Backend>>,
    ) -> Result<Self, ConfigError> {
        let none = passthrough_override
            .unwrap_or_else(|| Box::new(backend::PassthroughBackend::new(&config)));

        let mut rack = AdapterRack {
            none: Mutex::new(none),
            libtorch: None,
            onnx: None,
            tflite: None,
        };
        // Load the engine the stream starts on; a failure here fails session
        // creation, before any realtime contract exists.
        match initial_backend {
            InferenceBackend::None => {}
            InferenceBackend::Libtorch => {
                rack.libtorch = Some(Mutex::new(backend::load_backend(initial_backend, &config)?));
            }
            InferenceBackend::Onnx => {
                rack.onnx = Some(Mutex::new(backend::load_backend(initial_backend, &config)?));
            }
            InferenceBackend::Tflite => {
                rack.tflite = Some(Mutex::new(backend::load_backend(initial_backend, &config)?));
            }
        }

        Ok(Self {
            id,
            config,
            processor,
            adapters: rack,
            backend_selector: AtomicU8::new(initial_backend as u8),
            send_buffer: Mutex::new(RingBuffer::new()),
            receive_buffer: Mutex::new(RingBuffer::new()),
            slots: RwLock::new(Vec::new()),
            submit_pos: AtomicUsize::new(0),
            consume_pos: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            inflight_gate: AtomicBool::new(false),
            epoch: Instant::now(),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    pub(crate) fn processor(&self) -> &dyn PrePostProcessor {
        self.processor.as_ref()
    }

    pub fn backend(&self) -> InferenceBackend {
        InferenceBackend::from_u8(self.backend_selector.load(Ordering::Acquire))
    }

    pub fn set_backend(&self, backend: InferenceBackend) {
        self.backend_selector.store(backend as u8, Ordering::Release);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Size buffers and the slot array for the host contract. Idempotent:
    /// repreparing clears all stream state first.
    pub(crate) fn prepare(&self, host_config: &HostAudioConfig) {
        let ring_capacity = (host_config.host_sample_rate * RING_CAPACITY_SECONDS) as usize;
        self.send_buffer
            .lock()
            .expect("send buffer mutex poisoned")
            .initialize_with_positions(1, ring_capacity);
        self.receive_buffer
            .lock()
            .expect("receive buffer mutex poisoned")
            .initialize_with_positions(1, ring_capacity);

        let n_slots = self.compute_slot_count(host_config);
        let mut slots = self.slots.write().expect("slot list lock poisoned");
        slots.clear();
        for _ in 0..n_slots {
            slots.push(Arc::new(InferenceSlot::new(
                self.config.new_model_input_size(),
                self.config.new_model_output_size(),
            )));
        }
        drop(slots);

        self.submit_pos.store(0, Ordering::Release);
        self.consume_pos.store(0, Ordering::Release);
        self.outstanding.store(0, Ordering::Release);
        self.inflight_gate.store(false, Ordering::Release);

        for backend in [
            InferenceBackend::None,
            InferenceBackend::Libtorch,
            InferenceBackend::Onnx,
            InferenceBackend::Tflite,
        ] {
            if let Some(adapter) = self.adapters.get(backend) {
                adapter.lock().expect("adapter mutex poisoned").prepare_to_play();
            }
        }

        debug!(
            "session {} prepared: {} slots for {} samples/block at {} Hz",
            self.id, n_slots, host_config.host_buffer_size, host_config.host_sample_rate
        );
    }

    /// Number of queue slots for this host contract.
    ///
    /// The producer must always find a free slot even when the pool is shared
    /// across sessions and every claimed slot can sit on a worker for the
    /// whole worst-case inference time; the shared-pool multiplier must not
    /// be halved or a second session can starve the first.
    fn compute_slot_count(&self, host_config: &HostAudioConfig) -> usize {
        let ceil_div = |a: usize, b: usize| a.div_ceil(b);

        let host_buffer = host_config.host_buffer_size;
        let output_size = self.config.new_model_output_size();
        let inference_samples = self
            .config
            .max_inference_time_in_samples(host_config.host_sample_rate);

        let slots_per_buffer = ceil_div(host_buffer, output_size).max(1);
        let base = if inference_samples == 0 {
            slots_per_buffer
        } else {
            let slots_per_inference = ceil_div(inference_samples, output_size);
            let slots_per_inference =
                ceil_div(slots_per_inference, slots_per_buffer) * slots_per_buffer;
            let inferences_per_buffer = (host_buffer / inference_samples).max(1);
            slots_per_buffer
                + slots_per_inference * ceil_div(slots_per_buffer, inferences_per_buffer)
        };

        base * self.config.slot_overallocation_factor
    }

    /// Drop all buffered audio and forget in-progress accounting. Callers
    /// must ensure no slot is in flight.
    pub(crate) fn clear(&self) {
        self.send_buffer
            .lock()
            .expect("send buffer mutex poisoned")
            .clear_with_positions();
        self.receive_buffer
            .lock()
            .expect("receive buffer mutex poisoned")
            .clear_with_positions();
        for slot in self.slots.read().expect("slot list lock poisoned").iter() {
            slot.mark_free();
        }
        self.submit_pos.store(0, Ordering::Release);
        self.consume_pos.store(0, Ordering::Release);
        self.outstanding.store(0, Ordering::Release);
        self.inflight_gate.store(false, Ordering::Release);
    }

    pub(crate) fn num_slots(&self) -> usize {
        self.slots.read().expect("slot list lock poisoned").len()
    }

    pub(crate) fn slot(&self, index: usize) -> Arc<InferenceSlot> {
        Arc::clone(&self.slots.read().expect("slot list lock poisoned")[index])
    }

    pub(crate) fn submit_pos(&self) -> usize {
        self.submit_pos.load(Ordering::Acquire)
    }

    pub(crate) fn consume_pos(&self) -> usize {
        self.consume_pos.load(Ordering::Acquire)
    }

    pub(crate) fn advance_submit(&self) {
        let n = self.num_slots();
        let pos = self.submit_pos.load(Ordering::Acquire);
        self.submit_pos.store((pos + 1) % n, Ordering::Release);
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn advance_consume(&self) {
        let n = self.num_slots();
        let pos = self.consume_pos.load(Ordering::Acquire);
        self.consume_pos.store((pos + 1) % n, Ordering::Release);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    /// Worker-side: claim the oldest Ready slot, oldest first.
    ///
    /// Stateful sessions admit a single slot in flight so recurrent state
    /// advances strictly in submission order.
    pub(crate) fn claim_next(&self) -> Option<(usize, Arc<InferenceSlot>)> {
        if self.config.stateful
            && self
                .inflight_gate
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return None;
        }

        let slots = self.slots.read().expect("slot list lock poisoned");
        let n = slots.len();
        if n > 0 {
            let start = self.consume_pos.load(Ordering::Acquire);
            for k in 0..n {
                let index = (start + k) % n;
                if slots[index].try_claim() {
                    return Some((index, Arc::clone(&slots[index])));
                }
            }
        }

        if self.config.stateful {
            self.inflight_gate.store(false, Ordering::Release);
        }
        None
    }

    /// Worker-side: evaluate one claimed slot and complete it.
    ///
    /// A panicking backend counts as a transient failure: the slot's output
    /// is zeroed and it still transitions to Done so the stream only sees a
    /// span of silence.
    pub(crate) fn run_slot(&self, slot: &InferenceSlot) {
        let selected = self.backend();
        let adapter = match self.adapters.get(selected) {
            Some(adapter) => adapter,
            None => {
                // Selector points at an engine this session never loaded;
                // fall back to the passthrough so audio keeps flowing.
                log::warn!(
                    "session {}: backend {:?} not loaded, falling back to passthrough",
                    self.id,
                    selected
                );
                &self.adapters.none
            }
        };

        {
            let input = slot.input.lock().expect("slot input mutex poisoned");
            let mut output = slot.output.lock().expect("slot output mutex poisoned");
            let mut guard = adapter.lock().expect("adapter mutex poisoned");
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                guard.process_block(&input, &mut output);
            }));
            if result.is_err() {
                log::warn!("session {}: backend panicked, emitting silence", self.id);
                output.clear();
            }
        }

        slot.mark_done(self.epoch.elapsed().as_nanos() as u64);
        if self.config.stateful {
            self.inflight_gate.store(false, Ordering::Release);
        }
    }

    /// True while any slot is submitted but not yet claimed.
    pub(crate) fn has_ready_slot(&self) -> bool {
        self.slots
            .read()
            .expect("slot list lock poisoned")
            .iter()
            .any(|slot| slot.state() == SlotState::Ready)
    }

    /// True while any slot is claimed by a worker.
    pub(crate) fn has_slots_in_flight(&self) -> bool {
        self.slots
            .read()
            .expect("slot list lock poisoned")
            .iter()
            .any(|slot| slot.state() == SlotState::InFlight)
    }
}

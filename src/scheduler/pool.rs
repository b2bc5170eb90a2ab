//! Shared inference thread pool.
//!
//! One pool serves every session in the process: workers block on a single
//! counting semaphore whose count tracks outstanding slot submissions across
//! all sessions, wake on submission, claim the oldest ready slot of the
//! first session that has one, and run the selected backend on it.
//!
//! The process-wide handle follows first-session-creates /
//! last-session-destroys semantics (`InferencePool::global` hands out a
//! shared `Arc`, kept alive only by the managers holding it), but pools are
//! ordinary objects: tests and multi-tenant hosts can build isolated pools
//! with `InferencePool::new` and inject them by construction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{info, warn};
use once_cell::sync::Lazy;

use crate::backend::{Backend, InferenceBackend};
use crate::config::InferenceConfig;
use crate::error::ConfigError;
use crate::processor::PrePostProcessor;
use crate::scheduler::semaphore::Semaphore;
use crate::scheduler::session::{Session, SlotState};

/// Ceiling on outstanding submissions across all sessions. Far above any
/// realistic queue depth.
const SEMAPHORE_CEILING: usize = 1000;

static GLOBAL_POOL: Lazy<Mutex<Weak<InferencePool>>> = Lazy::new(|| Mutex::new(Weak::new()));

/// State shared between the pool handle and its worker threads.
struct PoolShared {
    semaphore: Semaphore,
    sessions: RwLock<Vec<Arc<Session>>>,
    shutdown: AtomicBool,
}

pub struct InferencePool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_workers: usize,
}

impl InferencePool {
    /// Spawn a pool with `num_workers` inference threads.
    pub fn new(num_workers: usize) -> Arc<Self> {
        let num_workers = num_workers.max(1);
        let shared = Arc::new(PoolShared {
            semaphore: Semaphore::new(SEMAPHORE_CEILING),
            sessions: RwLock::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        });

        let workers = (0..num_workers)
            .map(|index| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("inference-worker-{index}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn inference worker")
            })
            .collect();

        info!("inference pool started with {} workers", num_workers);
        Arc::new(Self {
            shared,
            workers: Mutex::new(workers),
            num_workers,
        })
    }

    /// Process-wide pool handle, created on first use and torn down when the
    /// last holder drops it. Worker count defaults to the logical core count.
    pub fn global() -> Arc<Self> {
        let mut slot = GLOBAL_POOL.lock().expect("global pool registry poisoned");
        if let Some(pool) = slot.upgrade() {
            return pool;
        }
        let workers = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        let pool = Self::new(workers);
        *slot = Arc::downgrade(&pool);
        pool
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn active_sessions(&self) -> usize {
        self.shared
            .sessions
            .read()
            .expect("session registry poisoned")
            .len()
    }

    /// Register a new session under the lowest free id (dense reuse).
    pub(crate) fn create_session(
        &self,
        config: InferenceConfig,
        processor: Arc<dyn PrePostProcessor>,
        initial_backend: InferenceBackend,
        passthrough_override: Option<Box<dyn Backend>>,
    ) -> Result<Arc<Session>, ConfigError> {
        let mut sessions = self
            .shared
            .sessions
            .write()
            .expect("session registry poisoned");
        let id = (0..)
            .find(|candidate| !sessions.iter().any(|s| s.id() == *candidate))
            .expect("usize id space exhausted");
        let session = Arc::new(Session::new(
            id,
            config,
            processor,
            initial_backend,
            passthrough_override,
        )?);
        sessions.push(Arc::clone(&session));
        info!("created inference session {} ({} active)", id, sessions.len());
        Ok(session)
    }

    /// Remove a session. Waits for the session's in-flight slots to complete
    /// before clearing its storage; queued-but-unclaimed work is discarded.
    pub(crate) fn release_session(&self, session: &Arc<Session>) {
        while session.has_slots_in_flight() {
            thread::yield_now();
        }
        session.clear();

        let mut sessions = self
            .shared
            .sessions
            .write()
            .expect("session registry poisoned");
        sessions.retain(|candidate| !Arc::ptr_eq(candidate, session));
        info!(
            "released inference session {} ({} active)",
            session.id(),
            sessions.len()
        );
    }

    /// Audio-thread side of submission: while the send ring holds a full
    /// pre-processor hop and a free slot exists, assemble the next model
    /// window in ring order and signal the workers once per reservation.
    pub fn new_data_submitted(&self, session: &Session) {
        let hop = session.processor().hop_size();
        let mut send = session
            .send_buffer
            .lock()
            .expect("send buffer mutex poisoned");

        while send.available_samples(0) >= hop {
            let slot = session.slot(session.submit_pos());
            if slot.state() != SlotState::Free {
                // Every slot is occupied: leave the samples queued in the
                // ring and let a later callback resubmit.
                break;
            }
            {
                let mut input = slot.input.lock().expect("slot input mutex poisoned");
                session
                    .processor()
                    .pre_process(&mut send, &mut input, session.backend());
            }
            slot.mark_ready();
            session.advance_submit();
            self.shared.semaphore.release();
        }
    }

    /// Audio-thread side of consumption: drain completed slots in submission
    /// order into the receive ring. `max_wait` is an advisory bound; while
    /// work is outstanding and the bound has not expired, the call yields and
    /// retries so fast backends can complete within the same host block.
    pub fn new_data_request(&self, session: &Session, max_wait: Duration) {
        let deadline = Instant::now() + max_wait;
        let mut receive = session
            .receive_buffer
            .lock()
            .expect("receive buffer mutex poisoned");

        loop {
            while session.outstanding() > 0 {
                let slot = session.slot(session.consume_pos());
                if slot.state() != SlotState::Done {
                    break;
                }
                {
                    let output = slot.output.lock().expect("slot output mutex poisoned");
                    session
                        .processor()
                        .post_process(&output, &mut receive, session.backend());
                }
                slot.mark_free();
                session.advance_consume();
            }

            if session.outstanding() == 0 || Instant::now() >= deadline {
                break;
            }
            thread::yield_now();
        }
    }
}

impl Drop for InferencePool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let workers = {
            let mut guard = self.workers.lock().expect("worker list poisoned");
            std::mem::take(&mut *guard)
        };
        // One wakeup per worker; each exits after finishing its current slot.
        for _ in 0..workers.len() {
            self.shared.semaphore.release();
        }
        for worker in workers {
            if worker.join().is_err() {
                warn!("inference worker exited with a panic");
            }
        }
        info!("inference pool shut down");
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        shared.semaphore.acquire();
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        // Snapshot the registry so no lock is held while inferring.
        let sessions: Vec<Arc<Session>> = shared
            .sessions
            .read()
            .expect("session registry poisoned")
            .clone();

        for session in sessions {
            if let Some((_, slot)) = session.claim_next() {
                session.run_slot(&slot);
                // A stateful session admits one slot at a time, so wakeups
                // for its queued slots may have been consumed without a
                // claim; re-signal if work is still visible.
                if session.config().stateful && session.has_ready_slot() {
                    shared.semaphore.release();
                }
                break;
            }
        }
        // Acquired count with nothing claimable anywhere: a spurious wakeup,
        // go back to sleep.
    }
}

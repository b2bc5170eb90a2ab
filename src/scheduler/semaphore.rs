// Counting semaphore for work-item signalling.
//
// std has no counting semaphore; this is the usual Mutex + Condvar pairing.
// The mutex guards only the counter, never work, so the audio thread's
// `release` is a short uncontended critical section plus a notify.

use std::sync::{Condvar, Mutex};

pub struct Semaphore {
    count: Mutex<usize>,
    max: usize,
    signal: Condvar,
}

impl Semaphore {
    /// Create with initial count 0 and the given ceiling.
    pub fn new(max: usize) -> Self {
        assert!(max > 0, "semaphore ceiling must be greater than 0");
        Self {
            count: Mutex::new(0),
            max,
            signal: Condvar::new(),
        }
    }

    /// Increment the counter and wake one waiter. Saturates at the ceiling;
    /// the ceiling is sized far above any realistic number of outstanding
    /// slots, so saturation indicates a submission-accounting bug upstream.
    pub fn release(&self) {
        let mut count = self.count.lock().expect("semaphore mutex poisoned");
        debug_assert!(*count < self.max, "semaphore ceiling reached");
        if *count < self.max {
            *count += 1;
        }
        drop(count);
        self.signal.notify_one();
    }

    /// Block until the counter is positive, then decrement it.
    pub fn acquire(&self) {
        let mut count = self.count.lock().expect("semaphore mutex poisoned");
        while *count == 0 {
            count = self.signal.wait(count).expect("semaphore mutex poisoned");
        }
        *count -= 1;
    }

    /// Decrement if positive; never blocks.
    #[cfg(test)]
    pub fn try_acquire(&self) -> bool {
        let mut count = self.count.lock().expect("semaphore mutex poisoned");
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn try_acquire_tracks_releases() {
        let sem = Semaphore::new(1000);
        assert!(!sem.try_acquire());
        sem.release();
        sem.release();
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
    }

    #[test]
    fn acquire_blocks_until_release() {
        let sem = Arc::new(Semaphore::new(1000));
        let worker_sem = Arc::clone(&sem);

        let worker = thread::spawn(move || {
            worker_sem.acquire();
        });

        // Give the worker a moment to park, then wake it.
        thread::sleep(Duration::from_millis(20));
        sem.release();
        worker.join().expect("worker should wake and exit");
    }

    #[test]
    fn every_release_wakes_exactly_one_acquire() {
        let sem = Arc::new(Semaphore::new(1000));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let sem = Arc::clone(&sem);
                thread::spawn(move || sem.acquire())
            })
            .collect();

        for _ in 0..4 {
            sem.release();
        }
        for worker in workers {
            worker.join().expect("all waiters should be woken");
        }
        assert!(!sem.try_acquire());
    }
}

//! Single-slot hand-off between a slow producer thread and the sampling
//! loop. The consumer arms the slot with [`BackgroundReading::restart`], the
//! producer runs its function once, parks the value, and waits to be armed
//! again. If the sampler outpaces the producer the value is simply absent;
//! nothing queues and nothing blocks the loop.

use std::sync::Arc;
use std::thread::JoinHandle;

use log::debug;
use parking_lot::{Condvar, Mutex};

struct State<T> {
    result: Option<T>,
    running: bool,
    ready: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

pub struct BackgroundReading<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    thread: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> BackgroundReading<T> {
    /// Start the producer thread. `produce` runs once per arm; a `None`
    /// leaves the slot empty for that cycle.
    pub fn spawn<F>(mut produce: F) -> Self
    where
        F: FnMut() -> Option<T> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                result: None,
                running: true,
                ready: false,
            }),
            cond: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let thread = std::thread::spawn(move || {
            let mut state = worker.state.lock();
            while state.running {
                while !state.ready && state.running {
                    worker.cond.wait(&mut state);
                }
                if !state.running {
                    break;
                }
                drop(state);
                let value = produce();
                state = worker.state.lock();
                if !state.running {
                    break;
                }
                state.result = value;
                state.ready = false;
            }
            debug!("background reader thread exiting");
        });
        BackgroundReading {
            shared,
            thread: Some(thread),
        }
    }

    /// Arm the slot for one more production.
    pub fn restart(&self) {
        let mut state = self.shared.state.lock();
        state.ready = true;
        drop(state);
        self.shared.cond.notify_one();
    }

    pub fn has_result(&self) -> bool {
        let state = self.shared.state.lock();
        state.running && state.result.is_some()
    }

    /// Take the parked value, leaving the slot empty.
    pub fn take(&self) -> Option<T> {
        self.shared.state.lock().result.take()
    }

    /// Cooperative shutdown: flip the run flag, wake the producer, join.
    pub fn stop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.running = false;
        }
        self.shared.cond.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl<T: Send + 'static> Drop for BackgroundReading<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_for(reading: &BackgroundReading<u64>) -> u64 {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if reading.has_result() {
                return reading.take().unwrap();
            }
            assert!(Instant::now() < deadline, "timed out waiting for producer");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn one_value_per_restart() {
        let mut counter = 0u64;
        let mut reading = BackgroundReading::spawn(move || {
            counter += 1;
            Some(counter)
        });

        // nothing is produced until the slot is armed
        std::thread::sleep(Duration::from_millis(20));
        assert!(!reading.has_result());

        reading.restart();
        assert_eq!(wait_for(&reading), 1);

        // consuming without re-arming produces nothing further
        std::thread::sleep(Duration::from_millis(20));
        assert!(!reading.has_result());

        reading.restart();
        assert_eq!(wait_for(&reading), 2);

        reading.stop();
    }

    #[test]
    fn a_failed_cycle_leaves_the_slot_empty() {
        let mut reading: BackgroundReading<u64> = BackgroundReading::spawn(|| None);
        reading.restart();
        std::thread::sleep(Duration::from_millis(50));
        assert!(!reading.has_result());
        assert!(reading.take().is_none());
        reading.stop();
    }

    #[test]
    fn stop_before_any_restart_joins_cleanly() {
        let mut reading = BackgroundReading::spawn(|| Some(1u64));
        reading.stop();
    }

    #[test]
    fn stop_is_idempotent_via_drop() {
        let mut reading = BackgroundReading::spawn(|| Some(7u64));
        reading.restart();
        let _ = wait_for(&reading);
        reading.stop();
        drop(reading);
    }
}

//! Reusable worker thread.
//!
//! The client runs two long-lived workers (receive pipeline, stream
//! dispatcher) and the loopback harness a third. All of them share the
//! same shape: an optional init hook, a body invoked until the stop flag
//! is raised, and an optional final hook.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
};

use tracing::{debug, warn};

/// A unit of work driven by a [`Worker`].
pub trait WorkerJob: Send + 'static {
    /// Runs once on the worker thread before the loop starts.
    fn init(&mut self) {}

    /// One loop iteration. Must return regularly (bounded-time waits only)
    /// so the stop flag is observed.
    fn run(&mut self);

    /// Runs once after the loop exits.
    fn finish(&mut self) {}
}

/// Handle to a start/stop/join worker thread.
///
/// `start` is a no-op while the previous run is still alive; `stop`
/// signals the flag, joins, and clears the handle so the worker can be
/// started again.
#[derive(Debug)]
pub struct Worker {
    name: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Create a stopped worker.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), stop: Arc::new(AtomicBool::new(false)), handle: None }
    }

    /// True while the worker thread is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Spawn the worker loop: `init; while !stop { run } finish`.
    ///
    /// Idempotent while already running.
    pub fn start<J: WorkerJob>(&mut self, mut job: J) {
        if self.is_running() {
            warn!(worker = %self.name, "start ignored: already running");
            return;
        }
        // reap a handle left over from a loop that exited on its own
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }

        self.stop.store(false, Ordering::SeqCst);
        let stop = Arc::clone(&self.stop);
        let spawned = std::thread::Builder::new().name(self.name.clone()).spawn(move || {
            job.init();
            while !stop.load(Ordering::SeqCst) {
                job.run();
            }
            job.finish();
        });

        match spawned {
            Ok(handle) => {
                debug!(worker = %self.name, "started");
                self.handle = Some(handle);
            }
            Err(err) => warn!(worker = %self.name, %err, "failed to spawn"),
        }
    }

    /// Signal the stop flag and join the thread.
    ///
    /// Join failures during shutdown (a worker that panicked) are
    /// swallowed; the handle is cleared either way so `start` works again.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            debug!(worker = %self.name, "stopped");
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use super::*;

    struct CountingJob {
        ticks: Arc<AtomicU32>,
        inits: Arc<AtomicU32>,
        finals: Arc<AtomicU32>,
    }

    impl WorkerJob for CountingJob {
        fn init(&mut self) {
            self.inits.fetch_add(1, Ordering::SeqCst);
        }

        fn run(&mut self) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1));
        }

        fn finish(&mut self) {
            self.finals.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counters() -> (Arc<AtomicU32>, Arc<AtomicU32>, Arc<AtomicU32>) {
        (Arc::new(AtomicU32::new(0)), Arc::new(AtomicU32::new(0)), Arc::new(AtomicU32::new(0)))
    }

    #[test]
    fn runs_hooks_and_body() {
        let (ticks, inits, finals) = counters();
        let mut worker = Worker::new("test");
        worker.start(CountingJob {
            ticks: Arc::clone(&ticks),
            inits: Arc::clone(&inits),
            finals: Arc::clone(&finals),
        });

        std::thread::sleep(Duration::from_millis(20));
        assert!(worker.is_running());
        worker.stop();

        assert!(!worker.is_running());
        assert!(ticks.load(Ordering::SeqCst) > 0);
        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert_eq!(finals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn start_is_idempotent_while_running() {
        let (ticks, inits, finals) = counters();
        let mut worker = Worker::new("test");
        for _ in 0..3 {
            worker.start(CountingJob {
                ticks: Arc::clone(&ticks),
                inits: Arc::clone(&inits),
                finals: Arc::clone(&finals),
            });
        }
        std::thread::sleep(Duration::from_millis(10));
        worker.stop();

        assert_eq!(inits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn restart_after_stop() {
        let (ticks, inits, finals) = counters();
        let mut worker = Worker::new("test");
        for _ in 0..2 {
            worker.start(CountingJob {
                ticks: Arc::clone(&ticks),
                inits: Arc::clone(&inits),
                finals: Arc::clone(&finals),
            });
            std::thread::sleep(Duration::from_millis(5));
            worker.stop();
        }

        assert_eq!(inits.load(Ordering::SeqCst), 2);
        assert_eq!(finals.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stop_without_start_is_a_noop() {
        let mut worker = Worker::new("test");
        worker.stop();
        assert!(!worker.is_running());
    }
}

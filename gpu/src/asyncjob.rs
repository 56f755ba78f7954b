// A single dedicated worker thread that runs one closure at a time on
// request, used to pipeline tile-conversion stages off the main
// submission thread.
//
// Austin Shafer - 2024
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Executing,
    Exiting,
}

struct Shared {
    state: Mutex<State>,
    work_ready: Condvar,
    work_done: Condvar,
    job: Mutex<Option<Job>>,
}

/// Mirrors the original's `m_cond_var1`/`m_cond_var2` pair: one signals
/// "a job is queued", the other "the worker finished it".
pub struct AsyncJob {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl AsyncJob {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::Idle),
            work_ready: Condvar::new(),
            work_done: Condvar::new(),
            job: Mutex::new(None),
        });

        let worker_shared = shared.clone();
        let handle = std::thread::spawn(move || Self::worker_loop(worker_shared));

        Self { shared, handle: Some(handle) }
    }

    fn worker_loop(shared: Arc<Shared>) {
        loop {
            let mut state = shared.state.lock().unwrap();
            while *state == State::Idle {
                state = shared.work_ready.wait(state).unwrap();
            }
            if *state == State::Exiting {
                return;
            }
            drop(state);

            let job = shared.job.lock().unwrap().take();
            if let Some(job) = job {
                job();
            }

            let mut state = shared.state.lock().unwrap();
            *state = State::Idle;
            shared.work_done.notify_all();
        }
    }

    /// `Execute(func)`: hands the worker a closure and returns
    /// immediately. Panics if a job is already in flight; callers must
    /// `Wait` before issuing another.
    pub fn execute<F: FnOnce() + Send + 'static>(&self, func: F) {
        let mut state = self.shared.state.lock().unwrap();
        assert_eq!(*state, State::Idle, "AsyncJob::execute called while a job is already running");

        *self.shared.job.lock().unwrap() = Some(Box::new(func));
        *state = State::Executing;
        self.shared.work_ready.notify_one();
    }

    /// `Wait()`: blocks until the in-flight job (if any) completes.
    pub fn wait(&self) {
        let mut state = self.shared.state.lock().unwrap();
        while *state == State::Executing {
            state = self.shared.work_done.wait(state).unwrap();
        }
    }
}

impl Drop for AsyncJob {
    fn drop(&mut self) {
        self.wait();
        *self.shared.state.lock().unwrap() = State::Exiting;
        self.shared.work_ready.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Default for AsyncJob {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn execute_then_wait_runs_the_job() {
        let job = AsyncJob::new();
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        job.execute(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        job.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn two_sequential_jobs_both_run() {
        let job = AsyncJob::new();
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..2 {
            let c = counter.clone();
            job.execute(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
            job.wait();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}

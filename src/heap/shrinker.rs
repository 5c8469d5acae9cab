//! Background shrinker: one long-lived thread woken by releases.
//!
//! Every kick re-arms a quiet period of `delay`; the shrink runs once no
//! further kick arrived within it.

use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Default)]
struct Flags {
    pending: bool,
    stop: bool,
}

#[derive(Debug, Default)]
struct Signal {
    flags: Mutex<Flags>,
    cv: Condvar,
}

#[derive(Debug)]
pub(super) struct Shrinker {
    signal: Arc<Signal>,
    worker: Option<JoinHandle<()>>,
}

impl Shrinker {
    /// Start the worker thread. `work` runs the shrink under the coordinator lock.
    pub fn spawn<F>(name: &str, delay: Duration, work: F) -> io::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let signal = Arc::new(Signal::default());
        let worker_signal = signal.clone();
        let worker = thread::Builder::new()
            .name(format!("{name}-shrink"))
            .spawn(move || run(&worker_signal, delay, &work))?;

        Ok(Self {
            signal,
            worker: Some(worker),
        })
    }

    /// Ask for a shrink once releases go quiet.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn kick(&self) {
        self.signal.flags.lock().unwrap().pending = true;
        self.signal.cv.notify_one();
    }

    /// Stop the worker and wait for it. No shrink starts after this returns.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn stop(&mut self) {
        self.signal.flags.lock().unwrap().stop = true;
        self.signal.cv.notify_one();

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("shrinker thread panicked");
            }
        }
    }
}

impl Drop for Shrinker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(signal: &Signal, delay: Duration, work: &dyn Fn()) {
    let mut flags = signal.flags.lock().unwrap();
    loop {
        while !flags.pending && !flags.stop {
            flags = signal.cv.wait(flags).unwrap();
        }
        if flags.stop {
            return;
        }

        // Debounce: keep waiting while kicks keep arriving.
        loop {
            flags.pending = false;
            let (guard, timeout) = signal.cv.wait_timeout(flags, delay).unwrap();
            flags = guard;
            if flags.stop {
                return;
            }
            if timeout.timed_out() && !flags.pending {
                break;
            }
        }

        drop(flags);
        work();
        flags = signal.flags.lock().unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn wait_for(count: &AtomicUsize, expected: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if count.load(Ordering::SeqCst) >= expected {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn kick_runs_work_after_delay() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let shrinker = Shrinker::spawn("test", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        shrinker.kick();
        assert!(wait_for(&runs, 1));
    }

    #[test]
    fn burst_of_kicks_is_debounced() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let shrinker = Shrinker::spawn("test", Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        for _ in 0..10 {
            shrinker.kick();
        }
        assert!(wait_for(&runs, 1));
        thread::sleep(Duration::from_millis(250));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_prevents_further_work() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let mut shrinker = Shrinker::spawn("test", Duration::from_millis(200), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        shrinker.kick();
        shrinker.stop();
        thread::sleep(Duration::from_millis(300));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}

//! Serial delivery of listener callbacks
//!
//! Listener callbacks must never run on the receiver thread, and each
//! listener must observe events in the order they were produced. A
//! single worker thread draining a FIFO channel gives both properties.

use crossbeam_channel::{unbounded, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Single-threaded FIFO executor for event callbacks.
///
/// The worker thread exits once every handle to the dispatcher has been
/// dropped and the queue has drained.
pub struct EventDispatcher {
    tx: Sender<Task>,
}

impl EventDispatcher {
    /// Create a dispatcher backed by its own worker thread
    pub fn new() -> std::io::Result<Self> {
        let (tx, rx) = unbounded::<Task>();

        thread::Builder::new()
            .name("event dispatch".to_string())
            .spawn(move || {
                for task in rx {
                    if catch_unwind(AssertUnwindSafe(task)).is_err() {
                        tracing::warn!("Problem delivering event to listener, continuing");
                    }
                }
            })?;

        Ok(Self { tx })
    }

    /// Queue a callback behind everything already submitted
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        // Send fails only if the worker is gone, at teardown
        let _ = self.tx.send(Box::new(task));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[test]
    fn test_tasks_run_in_submission_order() {
        let dispatcher = EventDispatcher::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let seen = seen.clone();
            dispatcher.submit(move || seen.lock().unwrap().push(i));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while seen.lock().unwrap().len() < 10 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_panicking_task_does_not_stop_the_worker() {
        let dispatcher = EventDispatcher::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        dispatcher.submit(|| panic!("listener failure"));
        let seen_clone = seen.clone();
        dispatcher.submit(move || seen_clone.lock().unwrap().push(1));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while seen.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }
}

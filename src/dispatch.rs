//! Main-thread dispatch queue
//!
//! Driver callbacks run on driver-owned threads. Anything they need to apply
//! to primary-thread state is enqueued here and run by the owning thread when
//! it calls [`MainThreadDispatcher::drain`] once per tick.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::error;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Extract a human-readable message from a panic payload
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        return (*msg).to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}

/// Mutex-protected FIFO of jobs for the primary thread
///
/// Cloning gives another handle to the same queue.
#[derive(Clone, Default)]
pub struct MainThreadDispatcher {
    queue: Arc<Mutex<VecDeque<Job>>>,
}

impl MainThreadDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a job; callable from any thread
    pub fn enqueue<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.lock().push_back(Box::new(job));
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run every queued job in enqueue order; returns how many ran
    ///
    /// The queue is emptied under the lock and jobs run outside it, so a job
    /// may enqueue more work (picked up by the next drain). A panicking job is
    /// logged and the remaining jobs still run.
    pub fn drain(&self) -> usize {
        let jobs = std::mem::take(&mut *self.queue.lock());
        let count = jobs.len();

        for job in jobs {
            if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
                error!("💥 Dispatched job panicked: {}", panic_message(payload));
            }
        }
        count
    }
}

impl std::fmt::Debug for MainThreadDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainThreadDispatcher")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_drain_runs_everything_once() {
        let dispatcher = MainThreadDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = Arc::clone(&log);
            dispatcher.enqueue(move || log.lock().push(i));
        }

        assert_eq!(dispatcher.pending(), 3);
        assert_eq!(dispatcher.drain(), 3);
        assert_eq!(dispatcher.drain(), 0);
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_panicking_job_does_not_stop_the_drain() {
        let dispatcher = MainThreadDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let before = Arc::clone(&log);
        dispatcher.enqueue(move || before.lock().push("before"));
        dispatcher.enqueue(|| panic!("boom"));
        let after = Arc::clone(&log);
        dispatcher.enqueue(move || after.lock().push("after"));

        assert_eq!(dispatcher.drain(), 3);
        assert_eq!(*log.lock(), vec!["before", "after"]);
    }

    #[test]
    fn test_job_enqueued_during_drain_waits_for_next_tick() {
        let dispatcher = MainThreadDispatcher::new();
        let ran = Arc::new(Mutex::new(0));

        let inner_dispatcher = dispatcher.clone();
        let inner_ran = Arc::clone(&ran);
        dispatcher.enqueue(move || {
            let ran = Arc::clone(&inner_ran);
            inner_dispatcher.enqueue(move || *ran.lock() += 1);
        });

        assert_eq!(dispatcher.drain(), 1);
        assert_eq!(*ran.lock(), 0);
        assert_eq!(dispatcher.drain(), 1);
        assert_eq!(*ran.lock(), 1);
    }

    #[test]
    fn test_jobs_from_other_threads_keep_per_thread_order() {
        let dispatcher = MainThreadDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let dispatcher = dispatcher.clone();
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let log = Arc::clone(&log);
                        dispatcher.enqueue(move || log.lock().push((t, i)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(dispatcher.drain(), 200);
        let log = log.lock();
        for t in 0..4 {
            let seen: Vec<_> = log.iter().filter(|(thread, _)| *thread == t).map(|(_, i)| *i).collect();
            assert_eq!(seen, (0..50).collect::<Vec<_>>());
        }
    }

    proptest! {
        #[test]
        fn prop_drain_preserves_enqueue_order(values in prop::collection::vec(any::<u32>(), 0..64)) {
            let dispatcher = MainThreadDispatcher::new();
            let log = Arc::new(Mutex::new(Vec::new()));
            for v in &values {
                let log = Arc::clone(&log);
                let v = *v;
                dispatcher.enqueue(move || log.lock().push(v));
            }
            prop_assert_eq!(dispatcher.drain(), values.len());
            prop_assert_eq!(&*log.lock(), &values);
        }
    }
}

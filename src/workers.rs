//! Background threads owned by a store.
//!
//! - [`WorkerPool`]: fixed set of iteration threads fed through a channel.
//! - [`SyncWorker`]: periodic ticker driving sync and space reclamation.
//!
//! Both shut down and join when dropped.

use crossbeam_channel::{select, tick, unbounded, Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of worker threads.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one).
    pub fn new(name: &str, size: usize) -> std::io::Result<Self> {
        let (sender, receiver) = unbounded::<Job>();
        let mut threads = Vec::with_capacity(size.max(1));

        for i in 0..size.max(1) {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            warn!("worker job panicked");
                        }
                    }
                })?;
            threads.push(handle);
        }

        Ok(Self {
            sender: Some(sender),
            threads,
        })
    }

    pub fn size(&self) -> usize {
        self.threads.len()
    }

    /// Queue a job. Returns `false` if the pool is shutting down.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> bool {
        match &self.sender {
            Some(sender) => sender.send(Box::new(job)).is_ok(),
            None => false,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets every worker fall out of its loop.
        drop(self.sender.take());
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("iteration worker panicked");
            }
        }
    }
}

/// Thread that calls a task every `interval` until stopped.
pub struct SyncWorker {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl SyncWorker {
    pub fn spawn(
        name: &str,
        interval: Duration,
        task: impl Fn() + Send + 'static,
    ) -> std::io::Result<Self> {
        let (shutdown, stopped): (Sender<()>, Receiver<()>) = crossbeam_channel::bounded(1);
        let ticker = tick(interval);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                select! {
                    recv(ticker) -> _ => task(),
                    recv(stopped) -> _ => {
                        debug!("sync worker stopping");
                        break;
                    }
                }
            })?;

        Ok(Self {
            shutdown: Some(shutdown),
            handle: Some(handle),
        })
    }

    /// Stop the ticker and wait for an in-flight task to finish.
    pub fn stop(&mut self) {
        // Dropping the sender wakes the receiver with a disconnect.
        drop(self.shutdown.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("sync worker panicked");
            }
        }
    }
}

impl Drop for SyncWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_pool_runs_all_jobs() {
        let pool = WorkerPool::new("test", 4).unwrap();
        assert_eq!(pool.size(), 4);

        let counter = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = unbounded();
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            let done_tx = done_tx.clone();
            assert!(pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                done_tx.send(()).unwrap();
            }));
        }
        for _ in 0..100 {
            done_rx.recv().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_pool_survives_panicking_job() {
        let pool = WorkerPool::new("test", 1).unwrap();
        assert!(pool.execute(|| panic!("job failed")));

        let (done_tx, done_rx) = unbounded();
        assert!(pool.execute(move || done_tx.send(()).unwrap()));
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_zero_size_pool_gets_one_thread() {
        let pool = WorkerPool::new("test", 0).unwrap();
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_sync_worker_ticks_and_stops() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let mut worker = SyncWorker::spawn("sync-test", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        thread::sleep(Duration::from_millis(60));
        worker.stop();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 1);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }
}

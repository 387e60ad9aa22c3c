//! Single-consumer FIFO worker serializing module mutations

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use tokio::sync::oneshot;

use crate::host::EXIT_INTERNAL;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Exit code of a queued module operation, delivered when the worker finishes it
pub struct Completion {
    rx: oneshot::Receiver<i32>,
}

impl Completion {
    /// Block until the operation finishes. Must not be called from async code.
    pub fn wait(self) -> i32 {
        self.rx.blocking_recv().unwrap_or(EXIT_INTERNAL)
    }

    pub async fn exit_code(self) -> i32 {
        self.rx.await.unwrap_or(EXIT_INTERNAL)
    }
}

/// Dedicated worker thread draining a job queue in submission order
pub struct ModuleWorker {
    tx: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl ModuleWorker {
    pub fn spawn() -> std::io::Result<Self> {
        let (tx, rx) = unbounded::<Job>();
        let handle = std::thread::Builder::new()
            .name("ModuleWorker".to_string())
            .spawn(move || {
                for job in rx.iter() {
                    // A panicking job drops its completion sender; the caller sees 255
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        tracing::error!("module job panicked");
                    }
                }
                tracing::debug!("module worker stopped");
            })?;

        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    fn enqueue(&self, job: Job) {
        let sent = self.tx.as_ref().map(|tx| tx.send(job).is_ok()).unwrap_or(false);
        if !sent {
            tracing::error!("module worker is not running");
        }
    }

    /// Queue an operation producing an exit code
    pub fn submit<F>(&self, f: F) -> Completion
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Box::new(move || {
            let _ = tx.send(f());
        }));
        Completion { rx }
    }

    /// Queue an operation and block the calling thread until it has run.
    ///
    /// Returns `None` if the job panicked or the worker is gone.
    pub fn run_blocking<F, T>(&self, f: F) -> Option<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.enqueue(Box::new(move || {
            let _ = tx.send(f());
        }));
        rx.recv().ok()
    }
}

impl Drop for ModuleWorker {
    fn drop(&mut self) {
        // Closing the queue lets the worker finish pending jobs and exit
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("module worker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[test]
    fn test_jobs_run_in_fifo_order() {
        let worker = ModuleWorker::spawn().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let completions: Vec<Completion> = (0..5)
            .map(|i| {
                let order = order.clone();
                worker.submit(move || {
                    std::thread::sleep(Duration::from_millis(5 - i as u64));
                    order.lock().unwrap().push(i);
                    i
                })
            })
            .collect();

        let codes: Vec<i32> = completions.into_iter().map(Completion::wait).collect();
        assert_eq!(codes, vec![0, 1, 2, 3, 4]);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_run_blocking_waits_behind_queue() {
        let worker = ModuleWorker::spawn().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let slow = {
            let log = log.clone();
            worker.submit(move || {
                std::thread::sleep(Duration::from_millis(50));
                log.lock().unwrap().push("install");
                0
            })
        };
        let log_inline = log.clone();
        let value = worker.run_blocking(move || {
            log_inline.lock().unwrap().push("enable");
            7
        });

        assert_eq!(value, Some(7));
        assert_eq!(*log.lock().unwrap(), vec!["install", "enable"]);
        assert_eq!(slow.wait(), 0);
    }

    #[test]
    fn test_panicking_job_reports_internal_and_worker_survives() {
        let worker = ModuleWorker::spawn().unwrap();
        let crashed = worker.submit(|| panic!("boom"));
        assert_eq!(crashed.wait(), EXIT_INTERNAL);
        assert_eq!(worker.submit(|| 0).wait(), 0);
    }

    #[test]
    fn test_drop_drains_pending_jobs() {
        let counter = Arc::new(Mutex::new(0));
        {
            let worker = ModuleWorker::spawn().unwrap();
            for _ in 0..3 {
                let counter = counter.clone();
                worker.submit(move || {
                    *counter.lock().unwrap() += 1;
                    0
                });
            }
        }
        assert_eq!(*counter.lock().unwrap(), 3);
    }

    #[test]
    fn test_completion_can_be_awaited() {
        let worker = ModuleWorker::spawn().unwrap();
        let completion = worker.submit(|| 3);
        assert_eq!(tokio_test::block_on(completion.exit_code()), 3);
    }
}

use std::{
    panic::{self, AssertUnwindSafe},
    sync::mpsc::{self, RecvTimeoutError, SyncSender},
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::status::Status;

/// What a worker handler reports after one activation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    /// Did something; run again right away.
    Busy,
    /// Nothing to do; sleep until signalled or the interval elapses.
    Idle,
    /// Done for good; the worker exits and runs its finish hook.
    Finished,
}

/// Wakes an idle worker. Signals sent while the worker is busy coalesce.
#[derive(Clone)]
pub struct WorkerSignal {
    tx: SyncSender<()>,
}

impl WorkerSignal {
    pub fn signal(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Named thread calling a handler until it reports `Finished`, the worker is
/// stopped, or the emergency flag is raised.
pub struct PeriodicWorker {
    name: String,
    signal: WorkerSignal,
    cancel: CancellationToken,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicWorker {
    pub fn spawn<H, F>(
        name: &str,
        interval: Duration,
        status: &Status,
        mut handler: H,
        on_finish: F,
    ) -> anyhow::Result<Self>
    where
        H: FnMut() -> anyhow::Result<WorkerState> + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel::<()>(1);
        let cancel = status.child_token();
        let thread_cancel = cancel.clone();
        let thread_status = status.clone();
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> anyhow::Result<bool> {
                    loop {
                        if thread_cancel.is_cancelled() {
                            return Ok(false);
                        }
                        match handler()? {
                            WorkerState::Busy => {}
                            WorkerState::Idle => match rx.recv_timeout(interval) {
                                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                                Err(RecvTimeoutError::Disconnected) => thread::sleep(interval),
                            },
                            WorkerState::Finished => return Ok(true),
                        }
                    }
                }));
                match outcome {
                    Ok(Ok(true)) => {
                        log::debug!("worker {} finished", thread_name);
                        on_finish();
                    }
                    Ok(Ok(false)) => log::debug!("worker {} stopped", thread_name),
                    Ok(Err(e)) => {
                        log::error!("worker {} failed: {:#}", thread_name, e);
                        thread_status.set_emergency();
                    }
                    Err(_) => {
                        log::error!("worker {} panicked", thread_name);
                        thread_status.set_emergency();
                    }
                }
            })?;
        Ok(Self {
            name: name.to_string(),
            signal: WorkerSignal { tx },
            cancel,
            thread_id: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn signal(&self) {
        self.signal.signal();
    }

    pub fn signaller(&self) -> WorkerSignal {
        self.signal.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_none_or(|handle| handle.is_finished())
    }

    /// Joins the worker once it has exited on its own.
    pub fn join(&self) {
        if thread::current().id() == self.thread_id {
            return;
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("worker {} could not be joined", self.name);
            }
        }
    }

    /// Cancels and joins. From the worker's own thread it only cancels.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.signal.signal();
        self.join();
    }
}

impl Drop for PeriodicWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn test_runs_until_finished() -> anyhow::Result<()> {
        let status = Status::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicBool::new(false));
        let counter = calls.clone();
        let done = finished.clone();
        let worker = PeriodicWorker::spawn(
            "test-worker",
            Duration::from_millis(1),
            &status,
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(if n >= 5 {
                    WorkerState::Finished
                } else {
                    WorkerState::Busy
                })
            },
            move || done.store(true, Ordering::SeqCst),
        )?;
        worker.join();
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(finished.load(Ordering::SeqCst));
        assert!(!status.is_emergency());
        Ok(())
    }

    #[test]
    fn test_signal_wakes_idle_worker() -> anyhow::Result<()> {
        let status = Status::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let worker = PeriodicWorker::spawn(
            "idle-worker",
            Duration::from_secs(3600),
            &status,
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(if n >= 2 {
                    WorkerState::Finished
                } else {
                    WorkerState::Idle
                })
            },
            || {},
        )?;
        while calls.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        worker.signal();
        worker.join();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn test_handler_error_raises_emergency() -> anyhow::Result<()> {
        let status = Status::new();
        let finished = Arc::new(AtomicBool::new(false));
        let done = finished.clone();
        let worker = PeriodicWorker::spawn(
            "failing-worker",
            Duration::from_millis(1),
            &status,
            || Err(anyhow::anyhow!("boom")),
            move || done.store(true, Ordering::SeqCst),
        )?;
        worker.join();
        assert!(status.is_emergency());
        assert!(!finished.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn test_stop_cancels_idle_worker() -> anyhow::Result<()> {
        let status = Status::new();
        let worker = PeriodicWorker::spawn(
            "stopped-worker",
            Duration::from_millis(5),
            &status,
            || Ok(WorkerState::Idle),
            || {},
        )?;
        worker.stop();
        assert!(worker.is_finished());
        assert!(!status.is_emergency());
        Ok(())
    }
}

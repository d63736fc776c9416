//! Buffer pump: the per-device streaming thread.
//!
//! A pump repeatedly moves one block between a device's ring buffer and its
//! hardware. Between blocks it sleeps for the update interval, or less when
//! woken. When the run is complete, fails, or is interrupted, the pump releases
//! the shared [`Completion`] exactly once with a [`PumpExit`] describing why.
//!
//! ```text
//!   caller thread                 pump thread (one per streaming device)
//!   ─────────────                 ──────────────────────────────────────
//!   device.start(Some(&done)) ──▶ loop {
//!                                     wait(update_time) or wake
//!                                     interrupted?      ──▶ release(Interrupted)
//!                                     transfer_block()  ──▶ Err: release(Failed)
//!                                     no_more_data()?   ──▶ release(Finished)
//!                                 }
//!   done.acquire(n, timeout) ◀────────────────┘
//! ```

use crate::error::{DeviceError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Why a pump stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum PumpExit {
    /// All data was transferred
    Finished,
    /// A stop was requested before the run completed
    Interrupted,
    /// The device reported a runtime error
    Failed(DeviceError),
}

impl PumpExit {
    /// Whether the pump ended before finishing its run.
    pub fn is_error(&self) -> bool {
        !matches!(self, PumpExit::Finished)
    }
}

/// One release of the completion semaphore.
#[derive(Debug, Clone, PartialEq)]
pub struct PumpReport {
    /// Identifier of the device whose pump exited
    pub device: String,
    /// Why the pump exited
    pub exit: PumpExit,
}

#[derive(Debug, Default)]
struct CompletionInner {
    reports: Mutex<VecDeque<PumpReport>>,
    cond: Condvar,
}

/// Counting semaphore released once by every pump that exits.
///
/// Each permit carries the report of the pump that released it.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

impl Completion {
    /// Semaphore without permits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one permit carrying `report` and wakes all waiters.
    pub fn release(&self, report: PumpReport) {
        let mut reports = self.inner.reports.lock();
        reports.push_back(report);
        self.inner.cond.notify_all();
    }

    /// Permits currently available.
    pub fn available(&self) -> usize {
        self.inner.reports.lock().len()
    }

    /// Takes `n` permits, waiting at most `timeout` (forever if `None`).
    ///
    /// Returns `None` on timeout, leaving the permits untouched.
    pub fn acquire(&self, n: usize, timeout: Option<Duration>) -> Option<Vec<PumpReport>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut reports = self.inner.reports.lock();
        while reports.len() < n {
            match deadline {
                Some(deadline) => {
                    if self.inner.cond.wait_until(&mut reports, deadline).timed_out()
                        && reports.len() < n
                    {
                        return None;
                    }
                }
                None => self.inner.cond.wait(&mut reports),
            }
        }
        Some(reports.drain(..n).collect())
    }

    /// Takes `n` permits if they are available right now.
    pub fn try_acquire(&self, n: usize) -> Option<Vec<PumpReport>> {
        let mut reports = self.inner.reports.lock();
        if reports.len() < n {
            return None;
        }
        Some(reports.drain(..n).collect())
    }

    /// Takes all available permits.
    pub fn drain(&self) -> Vec<PumpReport> {
        self.inner.reports.lock().drain(..).collect()
    }
}

/// Something a pump can drive.
pub trait BlockTransfer: Send + Sync {
    /// Device ident used in reports and log fields.
    fn ident(&self) -> &str;

    /// Moves one block; samples moved, `0` if nothing was ready.
    fn transfer_block(&self) -> Result<usize>;

    /// Whether the run is complete.
    fn no_more_data(&self) -> bool;

    /// Whether a stop was requested.
    fn interrupted(&self) -> bool;
}

#[derive(Debug, Default)]
struct Wake {
    woken: Mutex<bool>,
    cond: Condvar,
}

impl Wake {
    fn wait(&self, timeout: Duration) {
        let mut woken = self.woken.lock();
        if !*woken {
            let _ = self.cond.wait_for(&mut woken, timeout);
        }
        *woken = false;
    }

    fn notify(&self) {
        let mut woken = self.woken.lock();
        *woken = true;
        self.cond.notify_all();
    }
}

/// Handle to a running pump thread.
#[derive(Debug)]
pub struct BufferPump {
    device: String,
    wake: Arc<Wake>,
    finished: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl BufferPump {
    /// Starts a pump thread for `source`.
    pub fn spawn<T>(
        source: Arc<T>,
        update_time: Duration,
        completion: Completion,
    ) -> std::io::Result<Self>
    where
        T: BlockTransfer + ?Sized + 'static,
    {
        let device = source.ident().to_string();
        let wake = Arc::new(Wake::default());
        let finished = Arc::new(AtomicBool::new(false));

        let thread_wake = Arc::clone(&wake);
        let thread_finished = Arc::clone(&finished);
        let handle = thread::Builder::new()
            .name(format!("pump-{}", device))
            .spawn(move || {
                let exit = run(source.as_ref(), &thread_wake, update_time);
                thread_finished.store(true, Ordering::SeqCst);
                completion.release(PumpReport {
                    device: source.ident().to_string(),
                    exit,
                });
            })?;

        debug!(device = %device, update_ms = update_time.as_millis() as u64, "Spawned buffer pump");
        Ok(Self {
            device,
            wake,
            finished,
            handle: Some(handle),
        })
    }

    /// Ident of the driven device.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Cuts the current sleep short.
    pub fn wake(&self) {
        self.wake.notify();
    }

    /// Whether the thread has released its completion permit.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Waits for the thread to exit.
    pub fn join(mut self) {
        self.join_inner();
    }

    fn join_inner(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(device = %self.device, "Buffer pump thread panicked");
            }
        }
    }
}

impl Drop for BufferPump {
    fn drop(&mut self) {
        // A pump still running is detached; it exits on its own interrupt check.
        if self.is_finished() {
            self.join_inner();
        }
    }
}

fn run<T: BlockTransfer + ?Sized>(source: &T, wake: &Wake, update_time: Duration) -> PumpExit {
    let device = source.ident();
    info!(device = %device, "Buffer pump running");
    let mut blocks = 0u64;
    let mut samples = 0u64;

    let exit = loop {
        wake.wait(update_time);
        if source.interrupted() {
            break PumpExit::Interrupted;
        }
        match source.transfer_block() {
            Ok(n) => {
                blocks += 1;
                samples += n as u64;
                trace!(device = %device, samples = n, "Block transferred");
            }
            Err(err) => {
                warn!(device = %device, error = %err, "Buffer pump stopped on error");
                break PumpExit::Failed(err);
            }
        }
        if source.interrupted() {
            break PumpExit::Interrupted;
        }
        if source.no_more_data() {
            break PumpExit::Finished;
        }
    };

    info!(device = %device, blocks, samples, exit = ?exit, "Buffer pump exited");
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        blocks: AtomicUsize,
        limit: usize,
        fail_at: Option<usize>,
        stop: AtomicBool,
    }

    impl Counter {
        fn new(limit: usize) -> Self {
            Self {
                blocks: AtomicUsize::new(0),
                limit,
                fail_at: None,
                stop: AtomicBool::new(false),
            }
        }
    }

    impl BlockTransfer for Counter {
        fn ident(&self) -> &str {
            "counter"
        }

        fn transfer_block(&self) -> Result<usize> {
            let n = self.blocks.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_at == Some(n) {
                return Err(DeviceError::Underrun {
                    device: "counter".into(),
                });
            }
            Ok(10)
        }

        fn no_more_data(&self) -> bool {
            self.blocks.load(Ordering::SeqCst) >= self.limit
        }

        fn interrupted(&self) -> bool {
            self.stop.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_pump_finishes() {
        let done = Completion::new();
        let source = Arc::new(Counter::new(5));
        let pump =
            BufferPump::spawn(Arc::clone(&source), Duration::from_millis(1), done.clone()).unwrap();

        let reports = done.acquire(1, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(reports[0].exit, PumpExit::Finished);
        assert_eq!(reports[0].device, "counter");
        assert_eq!(source.blocks.load(Ordering::SeqCst), 5);
        pump.join();
    }

    #[test]
    fn test_pump_reports_failure() {
        let done = Completion::new();
        let mut counter = Counter::new(100);
        counter.fail_at = Some(3);
        let _pump =
            BufferPump::spawn(Arc::new(counter), Duration::from_millis(1), done.clone()).unwrap();

        let reports = done.acquire(1, Some(Duration::from_secs(5))).unwrap();
        assert!(matches!(reports[0].exit, PumpExit::Failed(DeviceError::Underrun { .. })));
    }

    #[test]
    fn test_wake_interrupts_long_sleep() {
        let done = Completion::new();
        let source = Arc::new(Counter::new(usize::MAX));
        let update = Duration::from_millis(200);
        let pump = BufferPump::spawn(Arc::clone(&source), update, done.clone()).unwrap();

        std::thread::sleep(Duration::from_millis(30));
        let requested = Instant::now();
        source.stop.store(true, Ordering::SeqCst);
        pump.wake();

        let reports = done.acquire(1, Some(update)).unwrap();
        assert!(requested.elapsed() < update);
        assert_eq!(reports[0].exit, PumpExit::Interrupted);
        assert!(pump.is_finished());
    }

    #[test]
    fn test_acquire_times_out() {
        let done = Completion::new();
        assert!(done.acquire(1, Some(Duration::from_millis(20))).is_none());
        done.release(PumpReport {
            device: "a".into(),
            exit: PumpExit::Finished,
        });
        assert_eq!(done.available(), 1);
        assert!(done.try_acquire(2).is_none());
        assert_eq!(done.try_acquire(1).unwrap().len(), 1);
        assert!(done.drain().is_empty());
    }
}

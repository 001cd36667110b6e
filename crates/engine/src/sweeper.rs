//! Background lease-expiration sweep
//!
//! One named thread (`covenant-sweep`) that calls [`ManagerInner::sweep`]
//! every interval. It holds only a weak reference to the manager and exits
//! when the manager is gone or the sweeper is stopped. The wait is on a
//! condvar, so stopping never waits out the interval.

use crate::manager::ManagerInner;
use covenant_core::Result;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error};

#[derive(Debug, Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Handle to the sweep thread; stops and joins it on drop
#[derive(Debug)]
pub(crate) struct ExpirationSweeper {
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl ExpirationSweeper {
    /// Start sweeping `manager` every `interval`
    ///
    /// # Errors
    ///
    /// Returns `Io` if the thread cannot be spawned.
    pub(crate) fn spawn(manager: Weak<ManagerInner>, interval: Duration) -> Result<Self> {
        let signal = Arc::new(StopSignal::default());
        let thread_signal = Arc::clone(&signal);
        let handle = thread::Builder::new()
            .name("covenant-sweep".to_string())
            .spawn(move || sweep_loop(&manager, &thread_signal, interval))?;
        Ok(ExpirationSweeper {
            signal,
            handle: Some(handle),
        })
    }

    /// Signal the thread and wait for it to exit
    pub(crate) fn stop(&mut self) {
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(target: "covenant::sweep", "Sweeper thread panicked");
            }
        }
    }
}

impl Drop for ExpirationSweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sweep_loop(manager: &Weak<ManagerInner>, signal: &StopSignal, interval: Duration) {
    debug!(target: "covenant::sweep", interval_ms = interval.as_millis() as u64, "Sweeper started");
    let mut stopped = signal.stopped.lock();
    loop {
        let deadline = Instant::now() + interval;
        while !*stopped {
            if signal.wake.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        if *stopped {
            break;
        }
        let Some(manager) = manager.upgrade() else {
            break;
        };
        MutexGuard::unlocked(&mut stopped, || {
            manager.sweep();
        });
    }
    debug!(target: "covenant::sweep", "Sweeper stopped");
}

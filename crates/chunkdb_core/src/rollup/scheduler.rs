//! Background thread that runs due rollups.

use crate::error::CoreResult;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Default)]
struct Shutdown {
    stopped: Mutex<bool>,
    cond: Condvar,
}

/// Handle to the rollup thread.
///
/// The thread wakes every poll interval and calls its tick function until the
/// tick returns `false` or the handle is shut down. Dropping the handle stops
/// and joins the thread.
#[derive(Debug)]
pub struct RollupScheduler {
    shutdown: Arc<Shutdown>,
    handle: Option<JoinHandle<()>>,
}

impl RollupScheduler {
    /// Spawns the thread.
    pub fn spawn<F>(poll_interval: Duration, mut tick: F) -> CoreResult<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let shutdown = Arc::new(Shutdown::default());
        let signal = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("chunkdb-rollup".into())
            .spawn(move || loop {
                {
                    let mut stopped = signal.stopped.lock();
                    if !*stopped {
                        signal.cond.wait_for(&mut stopped, poll_interval);
                    }
                    if *stopped {
                        break;
                    }
                }
                if !tick() {
                    break;
                }
            })?;

        tracing::debug!(?poll_interval, "rollup scheduler started");
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Stops the thread and waits for the running tick to finish.
    pub fn shutdown(&mut self) {
        {
            let mut stopped = self.shutdown.stopped.lock();
            *stopped = true;
        }
        self.shutdown.cond.notify_all();

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("rollup scheduler thread panicked");
            } else {
                tracing::debug!("rollup scheduler stopped");
            }
        }
    }

    /// Returns true while the thread has not been shut down.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for RollupScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

use std::{
    io,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::debug;

/// Flush intervals at or below this value disable the periodic flush.
pub(crate) const MIN_FLUSH_INTERVAL: Duration = Duration::from_micros(100);

/// Background thread that periodically flushes the buffer.
///
/// The thread waits on a cancellation channel with a timeout equal to the flush interval: each timeout triggers a
/// flush, and dropping the sender side wakes the thread immediately so that it can exit.
pub(crate) struct FlushScheduler {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl FlushScheduler {
    /// Spawns the flush thread.
    ///
    /// `flush` is called on every tick. Returning `false` from it stops the thread.
    pub fn spawn<F>(flush_interval: Duration, flush: F) -> io::Result<Self>
    where
        F: Fn() -> bool + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let handle = thread::Builder::new().name("dogstatsd-client-flush".to_string()).spawn(move || loop {
            match stop_rx.recv_timeout(flush_interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if !flush() {
                        break;
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })?;

        debug!(?flush_interval, "Flush thread started.");

        Ok(Self { stop_tx, handle })
    }

    /// Signals the flush thread to stop and waits for it to exit.
    pub fn stop(self) {
        drop(self.stop_tx);
        if self.handle.join().is_err() {
            debug!("Flush thread panicked.");
        }
        debug!("Flush thread stopped.");
    }
}

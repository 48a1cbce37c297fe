use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::error;

/// A background thread that can be told to stop and waited on.
///
/// The thread holds the only sender of the `exited` channel, so the channel disconnects
/// once the thread is gone, panics included.
#[derive(Debug)]
pub(crate) struct Task {
    stop: Sender<()>,
    exited: Receiver<()>,
    handle: JoinHandle<()>,
}

impl Task {
    pub fn spawn<F>(name: String, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(&Receiver<()>) + Send + 'static,
    {
        let (stop, stop_rx) = channel::bounded(1);
        let (exited_tx, exited) = channel::bounded::<()>(0);

        let handle = thread::Builder::new().name(name).spawn(move || {
            let _exited = exited_tx;
            body(&stop_rx);
        })?;

        Ok(Task {
            stop,
            exited,
            handle,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signals the thread and waits up to `timeout` for it to exit.
    /// Returns false if it is still running, in which case it is left detached
    pub fn stop(self, timeout: Duration) -> bool {
        let Task {
            stop,
            exited,
            handle,
        } = self;

        let _ = stop.try_send(());
        drop(stop);

        match exited.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    error!("Worker thread panicked");
                }
                true
            }
        }
    }
}

/// Sleeps for `duration` unless told to stop first. Returns true if a stop was requested
pub(crate) fn wait(stop: &Receiver<()>, duration: Duration) -> bool {
    !matches!(stop.recv_timeout(duration), Err(RecvTimeoutError::Timeout))
}

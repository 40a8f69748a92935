use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Owner side of a cooperative cancellation signal. Cancelling drops the sender,
/// which disconnects every [`CancelToken`] cloned from it.
#[derive(Debug)]
pub struct CancelHandle {
    sender: Option<Sender<()>>,
}

/// Worker side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    receiver: Receiver<()>,
}

pub fn cancellation() -> (CancelHandle, CancelToken) {
    let (sender, receiver) = crossbeam_channel::bounded(0);
    (
        CancelHandle {
            sender: Some(sender),
        },
        CancelToken { receiver },
    )
}

impl CancelHandle {
    pub fn cancel(&mut self) {
        self.sender.take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.sender.is_none()
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.receiver.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for `duration` or until cancelled. Returns true when cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        match self.receiver.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }
}

/// Join a worker, giving up after `timeout`. A worker that does not finish in time is
/// detached and a warning is logged. Returns true when the thread was joined.
pub fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::warn!(
                "Worker {:?} did not stop within {:?}, detaching",
                handle.thread().name(),
                timeout
            );
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    if handle.join().is_err() {
        log::error!("Worker panicked during shutdown");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_observes_cancel() {
        let (mut handle, token) = cancellation();
        assert!(!token.is_cancelled());
        handle.cancel();
        assert!(token.is_cancelled());
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_sleep_wakes_on_cancel() {
        let (mut handle, token) = cancellation();
        let worker = std::thread::spawn(move || {
            let start = Instant::now();
            let cancelled = token.sleep(Duration::from_secs(10));
            (cancelled, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        handle.cancel();
        let (cancelled, elapsed) = worker.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_sleep_times_out_without_cancel() {
        let (_handle, token) = cancellation();
        assert!(!token.sleep(Duration::from_millis(5)));
    }

    #[test]
    fn test_join_with_timeout_detaches_stuck_worker() {
        let (_handle, token) = cancellation();
        let stuck = std::thread::spawn(move || {
            token.sleep(Duration::from_millis(500));
        });
        assert!(!join_with_timeout(stuck, Duration::from_millis(10)));

        let quick = std::thread::spawn(|| {});
        assert!(join_with_timeout(quick, Duration::from_secs(1)));
    }
}

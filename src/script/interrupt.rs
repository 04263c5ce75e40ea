//! Single-slot interrupt channel between a supervisor and one interpreter.

use tokio::sync::mpsc;

/// Create a connected handle/receiver pair with room for one pending request.
pub fn channel() -> (InterruptHandle, Interrupt) {
    let (tx, rx) = mpsc::channel(1);
    (InterruptHandle { tx }, Interrupt { rx })
}

/// Sending side, held by whoever may stop the interpreter.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    tx: mpsc::Sender<()>,
}

impl InterruptHandle {
    /// Queue a cancellation request without blocking.
    ///
    /// Returns `false` when a request is already pending or the
    /// interpreter is gone; either way the call is a no-op.
    pub fn request(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

/// Receiving side, polled by the interpreter at every checkpoint.
#[derive(Debug)]
pub struct Interrupt {
    rx: mpsc::Receiver<()>,
}

impl Interrupt {
    /// Consume a pending request, if any.
    pub fn take(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_slot() {
        let (handle, mut interrupt) = channel();
        assert!(handle.request());
        // Slot occupied: second request is dropped, not queued.
        assert!(!handle.request());
        assert!(interrupt.take());
        assert!(!interrupt.take());
    }

    #[test]
    fn test_request_after_receiver_dropped() {
        let (handle, interrupt) = channel();
        drop(interrupt);
        assert!(!handle.request());
    }
}

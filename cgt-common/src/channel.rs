use tokio::sync::mpsc::{self, error::SendError};

use crate::CgroupEvent;

/// The producing half of a bounded cgroup event stream. Cloneable; the stream is closed once
/// every sender has been dropped.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<CgroupEvent>,
}

/// The consuming half of a bounded cgroup event stream.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<CgroupEvent>,
}

/// Creates a new bounded event stream with room for `buffer` in-flight events. Relies on
/// Tokio's [`mpsc`] channel, so a producer that outruns the consumer waits in
/// [`EventSender::send`] until there is capacity again.
pub fn channel(buffer: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(buffer);
    (EventSender { tx }, EventReceiver { rx })
}

impl EventSender {
    /// Sends an event, waiting until there is capacity.
    ///
    /// A return value of `Err` means the receiver has hung up and the event will never be
    /// received.
    pub async fn send(&self, event: CgroupEvent) -> Result<(), SendError<CgroupEvent>> {
        self.tx.send(event).await
    }

    /// Sends an event from synchronous code, blocking the current thread until there is
    /// capacity. Must not be called from within an asynchronous execution context.
    pub fn blocking_send(&self, event: CgroupEvent) -> Result<(), SendError<CgroupEvent>> {
        self.tx.blocking_send(event)
    }
}

impl EventReceiver {
    /// Receives the next event.
    ///
    /// Returns `None` once all senders have been dropped and every buffered event has been
    /// received. If the buffer is empty but the stream is still open, this sleeps until an
    /// event is sent or the stream is closed.
    pub async fn recv(&mut self) -> Option<CgroupEvent> {
        self.rx.recv().await
    }
}

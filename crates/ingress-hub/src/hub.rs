//! Single-slot, latest-value-wins hand-off between the snapshot worker and
//! the one downstream consumer.
//!
//! Publishing never blocks: an unconsumed value is simply replaced. The
//! consumer only ever cares about the current routing state, so superseded
//! snapshots are dropped and memory stays bounded however fast changes
//! arrive.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

struct Slot<T> {
    value: Option<T>,
    closed: bool,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    notify: Notify,
}

/// Producer half. Dropping it closes the hub.
pub struct Publisher<T> {
    shared: Arc<Shared<T>>,
}

/// Consumer half.
pub struct Subscriber<T> {
    shared: Arc<Shared<T>>,
}

/// Create a connected publisher/subscriber pair
pub fn channel<T>() -> (Publisher<T>, Subscriber<T>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot {
            value: None,
            closed: false,
        }),
        notify: Notify::new(),
    });
    (
        Publisher {
            shared: shared.clone(),
        },
        Subscriber { shared },
    )
}

impl<T> Publisher<T> {
    /// Store `value` for the consumer, replacing any value it has not taken
    /// yet. Returns `true` if a previous value was superseded.
    ///
    /// Publishing after [`Publisher::close`] is a no-op.
    pub fn publish(&self, value: T) -> bool {
        let superseded = {
            let mut slot = self.shared.slot.lock();
            if slot.closed {
                return false;
            }
            slot.value.replace(value).is_some()
        };
        if superseded {
            debug!("Superseded a snapshot the consumer had not received yet");
        }
        self.shared.notify.notify_one();
        superseded
    }

    /// Signal end of stream. A value already in the slot is still delivered.
    pub fn close(&self) {
        self.shared.slot.lock().closed = true;
        self.shared.notify.notify_waiters();
        self.shared.notify.notify_one();
    }
}

impl<T> Drop for Publisher<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> Subscriber<T> {
    /// Wait for the most recently published value.
    ///
    /// Returns `None` once the publisher is closed and the slot is empty;
    /// no more values will arrive after that.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut slot = self.shared.slot.lock();
                if let Some(value) = slot.value.take() {
                    return Some(value);
                }
                if slot.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Take the current value without waiting
    pub fn try_recv(&mut self) -> Option<T> {
        self.shared.slot.lock().value.take()
    }
}

//! Tracking of inbound messages awaiting asynchronous completion.
//!
//! When a content frameset is handed to the message sink, the session
//! registers a pending record here and gives the sink a [`CompletionHandle`].
//! The sink's workers may complete the handle from any thread: the record is
//! moved onto a scheduled list and the connection's I/O task is woken (once
//! per batch) to fold the completions back into session state in command
//! order.
//!
//! The arena exclusively owns its records. A handle is a weak reference in
//! spirit: once [`IncompleteStore::cancel_all`] has run, completing a stale
//! handle is a no-op. Cancellation takes the same lock the completion path
//! holds for its whole critical section, so it blocks until any callback
//! currently executing on another thread has finished.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use log::debug;

use crate::{
    sequence::SequenceNumber,
    session::{SessionName, Wakeup, WakeupSender},
};

/// A completion popped off the scheduled list, ready to fold into state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompletedTransfer {
    /// Command id of the completed transfer.
    pub command_id: SequenceNumber,
    /// True when the transfer must appear in the next `message.accept`.
    pub requires_accept: bool,
    /// True when the peer asked for immediate completion notification.
    pub sync: bool,
}

#[derive(Debug)]
struct Inner {
    next_key: u64,
    entries: HashMap<u64, CompletedTransfer>,
    scheduled: VecDeque<CompletedTransfer>,
    attached: bool,
    drain_pending: bool,
    wakeups: WakeupSender,
}

/// Arena of inbound messages whose completion is still outstanding.
#[derive(Debug)]
pub struct IncompleteStore {
    name: SessionName,
    inner: Mutex<Inner>,
}

impl IncompleteStore {
    /// Create the store for the session named `name`.
    #[must_use]
    pub fn new(name: SessionName, wakeups: WakeupSender) -> Arc<Self> {
        Arc::new(Self {
            name,
            inner: Mutex::new(Inner {
                next_key: 0,
                entries: HashMap::new(),
                scheduled: VecDeque::new(),
                attached: true,
                drain_pending: false,
                wakeups,
            }),
        })
    }

    /// Point wakeups at a new connection's I/O task after a resume.
    pub fn rebind(&self, wakeups: WakeupSender) {
        self.inner
            .lock()
            .expect("incomplete store poisoned")
            .wakeups = wakeups;
    }

    /// Register a pending message and hand out its completion handle.
    #[must_use]
    pub fn register(
        self: &Arc<Self>,
        command_id: SequenceNumber,
        requires_accept: bool,
        sync: bool,
    ) -> CompletionHandle {
        let mut inner = self.inner.lock().expect("incomplete store poisoned");
        let key = inner.next_key;
        inner.next_key += 1;
        inner.entries.insert(
            key,
            CompletedTransfer {
                command_id,
                requires_accept,
                sync,
            },
        );
        CompletionHandle {
            store: Arc::clone(self),
            key,
            command_id,
        }
    }

    fn complete(&self, key: u64) {
        // The whole callback body runs under the lock: `cancel_all` taking
        // the same lock therefore waits out any in-flight completion.
        let mut inner = self.inner.lock().expect("incomplete store poisoned");
        let Some(record) = inner.entries.remove(&key) else {
            debug!("{}: completion for cancelled transfer ignored", self.name);
            return;
        };
        if !inner.attached {
            return;
        }
        inner.scheduled.push_back(record);
        if !inner.drain_pending {
            inner.drain_pending = true;
            debug!(
                "{}: scheduling completion drain for command {}",
                self.name, record.command_id
            );
            // The I/O task may already be gone during teardown.
            let _ = inner.wakeups.send(Wakeup::Completions(self.name.clone()));
        }
    }

    fn discard(&self, key: u64) {
        let mut inner = self.inner.lock().expect("incomplete store poisoned");
        inner.entries.remove(&key);
    }

    /// Pop every scheduled completion, in the order they arrived.
    ///
    /// Called only from the connection's I/O task.
    #[must_use]
    pub fn drain_scheduled(&self) -> Vec<CompletedTransfer> {
        let mut inner = self.inner.lock().expect("incomplete store poisoned");
        inner.drain_pending = false;
        inner.scheduled.drain(..).collect()
    }

    /// Record whether the owning session is attached.
    ///
    /// Completions arriving while detached are dropped; the broker does not
    /// keep completion state for detached sessions.
    pub fn set_attached(&self, attached: bool) {
        self.inner
            .lock()
            .expect("incomplete store poisoned")
            .attached = attached;
    }

    /// Cancel every outstanding record and clear the scheduled list.
    ///
    /// Blocks until no completion callback is mid-flight, then invalidates
    /// all handles. Called only from the I/O task at detach or destruction.
    pub fn cancel_all(&self) {
        let mut inner = self.inner.lock().expect("incomplete store poisoned");
        let outstanding = inner.entries.len();
        if outstanding > 0 {
            debug!("{}: cancelling {outstanding} outstanding completions", self.name);
        }
        inner.entries.clear();
        inner.scheduled.clear();
        inner.drain_pending = false;
    }

    /// Number of messages still awaiting completion.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner
            .lock()
            .expect("incomplete store poisoned")
            .entries
            .len()
    }
}

/// Capability to complete one registered inbound message.
///
/// Completing after cancellation is a harmless no-op.
#[derive(Debug)]
pub struct CompletionHandle {
    store: Arc<IncompleteStore>,
    key: u64,
    command_id: SequenceNumber,
}

impl CompletionHandle {
    /// Command id of the transfer this handle belongs to.
    #[must_use]
    pub const fn command_id(&self) -> SequenceNumber { self.command_id }

    /// Mark the message fully processed.
    ///
    /// Safe to call from any thread; wakes the session's I/O task on the
    /// first completion of a batch.
    pub fn complete(self) { self.store.complete(self.key); }
}

impl Drop for CompletionHandle {
    fn drop(&mut self) {
        // A handle dropped without completing (e.g. the sink rejected the
        // message) must not leave a record behind; removal after a normal
        // completion is a no-op.
        self.store.discard(self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use super::*;
    use crate::session::wakeup_channel;

    fn store() -> (Arc<IncompleteStore>, crate::session::WakeupReceiver) {
        let (tx, rx) = wakeup_channel();
        (IncompleteStore::new(SessionName::from("s"), tx), rx)
    }

    #[test]
    fn first_completion_of_a_batch_wakes_the_io_task() {
        let (store, mut rx) = store();
        let first = store.register(SequenceNumber(0), false, false);
        let second = store.register(SequenceNumber(1), true, false);
        first.complete();
        second.complete();

        assert_eq!(
            rx.try_recv().expect("wakeup"),
            Wakeup::Completions(SessionName::from("s"))
        );
        assert!(rx.try_recv().is_err(), "one wakeup per batch");
        let drained = store.drain_scheduled();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].command_id, SequenceNumber(0));
        assert!(drained[1].requires_accept);
    }

    #[test]
    fn completion_after_cancel_is_a_no_op() {
        let (store, mut rx) = store();
        let handle = store.register(SequenceNumber(7), false, false);
        store.cancel_all();
        handle.complete();
        assert!(rx.try_recv().is_err());
        assert!(store.drain_scheduled().is_empty());
    }

    #[test]
    fn completions_while_detached_are_dropped() {
        let (store, mut rx) = store();
        let handle = store.register(SequenceNumber(3), false, false);
        store.set_attached(false);
        handle.complete();
        assert!(rx.try_recv().is_err());
        assert!(store.drain_scheduled().is_empty());
    }

    #[test]
    fn cancel_waits_for_in_flight_completion() {
        let (store, _rx) = store();
        let mut handles = Vec::new();
        for i in 0..512 {
            handles.push(store.register(SequenceNumber(i), false, false));
        }
        let barrier = Arc::new(Barrier::new(2));
        let worker = {
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                for handle in handles {
                    handle.complete();
                }
            })
        };
        barrier.wait();
        store.cancel_all();
        // Whatever won the race, the store must end up empty and quiesced.
        worker.join().expect("worker");
        assert_eq!(store.outstanding(), 0);
        store.cancel_all();
        assert!(store.drain_scheduled().is_empty());
    }
}

//! A single-slot hand-off between one waiting thread and one resumer. The
//! waiter parks until the notifier supplies a value; the hand-off is safe even
//! if the notifier fires before the waiter has parked.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use atomic_refcell::AtomicRefCell;

struct Slot<T> {
    ready: AtomicBool,
    value: AtomicRefCell<Option<T>>,
    /// The thread that will park on this slot, captured at pair creation.
    thread: std::thread::Thread,
}

/// The waiting half. Must be consumed on the thread that created the pair.
pub struct Waiter<T> {
    slot: Arc<Slot<T>>,
    // park() only wakes the thread the notifier unparks, so the waiter must
    // stay on its creating thread
    _not_send: PhantomData<*const ()>,
}

/// The resuming half. May be moved to any thread (or stored until a callback
/// fires) and used exactly once.
pub struct Notifier<T> {
    slot: Arc<Slot<T>>,
}

/// Create a connected waiter/notifier pair for the current thread.
pub fn pair<T>() -> (Waiter<T>, Notifier<T>) {
    let slot = Arc::new(Slot {
        ready: AtomicBool::new(false),
        value: AtomicRefCell::new(None),
        thread: std::thread::current(),
    });
    let waiter = Waiter {
        slot: Arc::clone(&slot),
        _not_send: PhantomData,
    };
    (waiter, Notifier { slot })
}

impl<T> Waiter<T> {
    /// Park until the notifier hands over a value. Returns immediately if the
    /// notifier already fired.
    pub fn wait(self) -> T {
        // the value write happens-before the Release store of the ready flag,
        // so the Acquire exchange here makes it visible
        while self
            .slot
            .ready
            .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // spurious wakeups just re-check the flag
            std::thread::park();
        }
        self.slot
            .value
            .borrow_mut()
            .take()
            .expect("rendezvous fired without a value")
    }
}

impl<T> Notifier<T> {
    /// Hand `value` to the waiter and wake it. If the waiter has not parked
    /// yet, its next `wait()` observes the value and returns at once.
    pub fn notify(self, value: T) {
        *self.slot.value.borrow_mut() = Some(value);
        self.slot.ready.store(true, Ordering::Release);
        self.slot.thread.unpark();
    }
}

impl<T> std::fmt::Debug for Notifier<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Notifier")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_then_wait() {
        let (waiter, notifier) = pair();

        // there is no race condition here: if `notify` happens first, `wait`
        // will return immediately
        notifier.notify(7);

        assert_eq!(waiter.wait(), 7);
    }

    #[test]
    fn test_notify_from_other_thread() {
        let (waiter, notifier) = pair();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            notifier.notify("done");
        });

        assert_eq!(waiter.wait(), "done");
        handle.join().unwrap();
    }

    #[test]
    fn test_value_moves_through() {
        let (waiter, notifier) = pair();
        let payload = vec![1u8, 2, 3];

        let handle = std::thread::spawn(move || notifier.notify(payload));

        assert_eq!(waiter.wait(), vec![1u8, 2, 3]);
        handle.join().unwrap();
    }
}

//! The stack execution context: a dedicated thread that owns the network
//! stack and runs closures posted by user threads. All pcb mutation happens on
//! this thread; user threads talk to it only through [`ContextHandle`].

use crossbeam::channel::{self, Receiver, Sender};

use crate::rendezvous::{self, Notifier};
use crate::stack::NetStack;

/// Work posted into the stack context.
pub type StackClosure = Box<dyn FnOnce(&mut dyn NetStack) + Send>;

const DEFAULT_QUEUE_DEPTH: usize = 128;

/// Owns the stack thread. The thread keeps running for as long as any
/// [`ContextHandle`] (including the ones held by open sockets) is alive.
pub struct StackContext {
    handle: ContextHandle,
}

/// A clonable way to post work into the stack context.
#[derive(Clone)]
pub struct ContextHandle {
    tx: Sender<StackClosure>,
}

impl StackContext {
    /// Spawn the stack thread with the default closure-queue depth.
    pub fn spawn(stack: Box<dyn NetStack>) -> Self {
        Self::with_queue_depth(stack, DEFAULT_QUEUE_DEPTH)
    }

    /// Spawn the stack thread with an embedder-chosen closure-queue depth.
    /// Posting blocks while the queue is full.
    pub fn with_queue_depth(stack: Box<dyn NetStack>, depth: usize) -> Self {
        let (tx, rx) = channel::bounded::<StackClosure>(depth);
        std::thread::Builder::new()
            .name("stack-context".to_string())
            .spawn(move || Self::run(rx, stack))
            .expect("failed to spawn the stack context thread");
        Self {
            handle: ContextHandle { tx },
        }
    }

    fn run(rx: Receiver<StackClosure>, mut stack: Box<dyn NetStack>) {
        while let Ok(closure) = rx.recv() {
            closure(&mut *stack);
            // drain everything the closure made runnable before the next
            // call, so completed operations are visible to later closures
            while stack.poll() {}
        }
        log::debug!("stack context shutting down");
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle.clone()
    }
}

impl ContextHandle {
    /// Post a closure to run on the stack context, without waiting for it.
    /// Dropped (with a warning) if the context has shut down.
    pub fn post(&self, f: impl FnOnce(&mut dyn NetStack) + Send + 'static) {
        if self.tx.send(Box::new(f)).is_err() {
            log::warn!("stack context is gone, dropping posted closure");
        }
    }

    /// Post a closure and park until it, or a stack callback it arms, hands
    /// back a result through the supplied notifier.
    ///
    /// Must not be called from the stack context itself (the closure could
    /// never run). Panics if the context has shut down.
    pub fn call<T, F>(&self, f: F) -> T
    where
        T: Send + Sync + 'static,
        F: FnOnce(&mut dyn NetStack, Notifier<T>) + Send + 'static,
    {
        let (waiter, notifier) = rendezvous::pair();
        self.tx
            .send(Box::new(move |stack: &mut dyn NetStack| f(stack, notifier)))
            .expect("stack context terminated with calls outstanding");
        waiter.wait()
    }
}

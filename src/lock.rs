//! lock policy: how (and whether) a bus instance is guarded.
//!
//! the dispatch engine never holds the lock while a handler runs - every
//! step (pick the next handler, repair cursors, mutate membership) takes the
//! lock on its own, and user code always runs with the lock released. this
//! makes reentrant use (a handler connecting, disconnecting, or dispatching
//! on the bus it is being called from) safe under *either* policy, without a
//! recursive mutex.

use std::{
    cell::RefCell,
    sync::{Mutex, PoisonError},
};

/// selects the shell that wraps a bus instance's state, and with it the
/// thread-safety bound on anything parked behind that shell.
pub trait Lock: 'static {
    type Shell<T>: StateShell<T>;

    /// trait-object type a deferred call is boxed as. carries `Send`
    /// exactly when the shell is thread-safe, so a single-threaded bus can
    /// queue closures over its own `Rc`-based state.
    type Call<I: ?Sized + 'static>: ?Sized + for<'a> FnMut(&'a I) + 'static;

    /// same idea for one-shot deferred functions.
    type Task<E: 'static>: ?Sized + for<'a> FnOnce(&'a E) + 'static;
}

/// admits a closure into a deferred slot guarded by the lock policy `L`.
/// the blanket impls require `Send` only for [`MultiThread`]; custom lock
/// policies provide their own.
pub trait IntoCall<L: Lock, I: ?Sized + 'static> {
    fn into_call(self) -> Box<L::Call<I>>;
}

impl<I: ?Sized + 'static, F: FnMut(&I) + 'static> IntoCall<SingleThread, I> for F {
    fn into_call(self) -> Box<dyn FnMut(&I)> {
        Box::new(self)
    }
}

impl<I: ?Sized + 'static, F: FnMut(&I) + Send + 'static> IntoCall<MultiThread, I> for F {
    fn into_call(self) -> Box<dyn FnMut(&I) + Send> {
        Box::new(self)
    }
}

/// [`IntoCall`], but for one-shot functions over some environment `E`.
pub trait IntoTask<L: Lock, E: 'static> {
    fn into_task(self) -> Box<L::Task<E>>;
}

impl<E: 'static, F: FnOnce(&E) + 'static> IntoTask<SingleThread, E> for F {
    fn into_task(self) -> Box<dyn FnOnce(&E)> {
        Box::new(self)
    }
}

impl<E: 'static, F: FnOnce(&E) + Send + 'static> IntoTask<MultiThread, E> for F {
    fn into_task(self) -> Box<dyn FnOnce(&E) + Send> {
        Box::new(self)
    }
}

/// the wrapper itself. `with` runs `f` with exclusive access; the access
/// must never be held across user code (see module docs).
pub trait StateShell<T> {
    fn new(value: T) -> Self;
    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R;
}

/// no locking at all. the bus is confined to one thread (it is neither
/// `Send` nor `Sync`), which is the statically-enforced version of the
/// "single threaded by contract" default.
pub struct SingleThread;

impl Lock for SingleThread {
    type Shell<T> = UnsyncShell<T>;
    type Call<I: ?Sized + 'static> = dyn FnMut(&I);
    type Task<E: 'static> = dyn FnOnce(&E);
}

pub struct UnsyncShell<T>(RefCell<T>);

impl<T> StateShell<T> for UnsyncShell<T> {
    fn new(value: T) -> Self {
        Self(RefCell::new(value))
    }

    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }
}

/// a real mutex. the bus may be shared across threads (it is `Send + Sync`
/// whenever the configured interface and id types allow it).
pub struct MultiThread;

impl Lock for MultiThread {
    type Shell<T> = SyncShell<T>;
    type Call<I: ?Sized + 'static> = dyn FnMut(&I) + Send;
    type Task<E: 'static> = dyn FnOnce(&E) + Send;
}

pub struct SyncShell<T>(Mutex<T>);

impl<T> StateShell<T> for SyncShell<T> {
    fn new(value: T) -> Self {
        Self(Mutex::new(value))
    }

    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        // a panic inside a handler poisons the mutex but cannot leave the
        // state half-written: mutation only happens between handler calls
        f(&mut self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

//! where a bus instance lives.
//!
//! a [`Bus`] is just a handle; any ownership scheme works (struct field,
//! function local, whatever). for the common "one well-known bus per
//! config type" pattern this module keeps registries keyed by config
//! [`TypeId`]: one per process, one per thread. both are lazy - the first
//! access creates the instance - and both have explicit teardown for tests
//! and orderly shutdown.

use std::{
    any::{Any, TypeId},
    cell::RefCell,
    collections::HashMap,
    sync::{Mutex, OnceLock, PoisonError},
};

use crate::{config::Config, Bus};

static PROCESS: OnceLock<Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>> = OnceLock::new();

fn process_map() -> &'static Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>> {
    PROCESS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// the process-wide instance for `C`, created on first call. all threads
/// see the same bus, so `C` must use a thread-safe lock policy (that is
/// what the `Send + Sync` bound enforces).
pub fn process_shared<C: Config>() -> Bus<C>
where
    Bus<C>: Send + Sync,
{
    let mut map = process_map()
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    map.entry(TypeId::of::<C>())
        .or_insert_with(|| {
            debug!(config = std::any::type_name::<C>(), "creating process-shared bus");
            Box::new(Bus::<C>::new())
        })
        .downcast_ref::<Bus<C>>()
        .expect("registry entry keyed by C holds a Bus<C>")
        .clone()
}

/// drop the process-wide instance for `C`. handlers stay connected through
/// any other handle still out there; the next [`process_shared`] call
/// creates a fresh, empty bus.
pub fn teardown_process_shared<C: Config>()
where
    Bus<C>: Send + Sync,
{
    let removed = process_map()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&TypeId::of::<C>());
    // the bus (and possibly its deferred queue) drops outside the registry
    // lock
    drop(removed);
}

thread_local! {
    static THREAD: RefCell<HashMap<TypeId, Box<dyn Any>>> = RefCell::new(HashMap::new());
}

/// the calling thread's instance for `C`, created on first call. each
/// thread gets its own independent bus, so a single-threaded lock policy
/// is fine here.
pub fn per_thread<C: Config>() -> Bus<C> {
    THREAD.with(|map| {
        map.borrow_mut()
            .entry(TypeId::of::<C>())
            .or_insert_with(|| {
                debug!(config = std::any::type_name::<C>(), "creating per-thread bus");
                Box::new(Bus::<C>::new())
            })
            .downcast_ref::<Bus<C>>()
            .expect("registry entry keyed by C holds a Bus<C>")
            .clone()
    })
}

/// drop the calling thread's instance for `C`. other threads' instances
/// are untouched.
pub fn teardown_per_thread<C: Config>() {
    let removed = THREAD.with(|map| map.borrow_mut().remove(&TypeId::of::<C>()));
    drop(removed);
}

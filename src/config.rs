//! bus configuration.
//!
//! one `Config` impl describes one bus type; the unit struct implementing it
//! is never instantiated, it only carries the associated items. a typical
//! notification bus looks like:
//!
//! ```
//! use busbar::{config::Config, lock, policy};
//!
//! trait SensorEvents {
//!     fn reading(&self, value: f64);
//! }
//!
//! struct SensorBus;
//! impl Config for SensorBus {
//!     type Interface = dyn SensorEvents;
//!     type Addresses = policy::ById<u32>;
//!     type Handlers = policy::ManyHandlers;
//!     type Lock = lock::SingleThread;
//!     type QueueLock = lock::SingleThread;
//! }
//! ```

use std::sync::Arc;

use crate::{
    lock::Lock,
    policy::{AddressPolicy, HandlerPolicy},
    Bus,
};

/// the address id type of a config (shorthand for the policy's `Id`).
pub type AddrId<C> = <<C as Config>::Addresses as AddressPolicy<C>>::Id;

/// compile-time description of a bus: the interface handlers implement plus
/// every policy knob. the (interface, config) pair *is* the bus type.
pub trait Config: Sized + 'static {
    /// what handlers implement and dispatch closures receive. normally a
    /// `dyn Trait`; handlers mutate themselves through interior mutability.
    type Interface: ?Sized + 'static;

    /// how many addresses exist and how broadcast orders them.
    type Addresses: AddressPolicy<Self>;

    /// how many handlers may sit at one address and in what order.
    type Handlers: HandlerPolicy<Self>;

    /// guards the container, repair stack, and router chain.
    type Lock: Lock;

    /// guards the deferred queue. deliberately separate from [`Lock`] so
    /// queue producers never contend with an active dispatch.
    type QueueLock: Lock;

    /// drop all deferred messages the moment the last address disappears.
    ///
    /// off by default: it is a lifetime heuristic, not a guarantee, and a
    /// queued broadcast to a bus that later regains handlers is usually
    /// still meaningful.
    const PURGE_QUEUE_ON_LAST_DROP: bool = false;

    /// runs after a handler is connected, outside the container lock. a
    /// connection hook typically replays current state at late joiners.
    fn on_connect(_bus: &Bus<Self>, _handler: &Arc<Self::Interface>, _id: &AddrId<Self>) {}

    /// runs after a handler is disconnected, outside the container lock.
    fn on_disconnect(_bus: &Bus<Self>, _handler: &Arc<Self::Interface>, _id: &AddrId<Self>) {}
}

/// opt-in marker for the deferred queue. the `queue_*` and
/// `execute_queued` methods only exist on buses whose config implements
/// this, so "queueing on a bus without a queue" does not compile.
pub trait Queued: Config {}

//! address and handler policies.
//!
//! these are type-level switches: a [`Config`] names one address policy and
//! one handler policy, and the choice decides which methods even exist on
//! the bus. calling an addressed method on a single-address bus is a type
//! error, not a runtime assertion.

use std::{cmp::Ordering, fmt::Debug, hash::Hash, marker::PhantomData};

use crate::config::Config;

/// a comparator, lifted to a type so it can sit inside a `Config`.
pub trait OrderBy<T: ?Sized>: 'static {
    /// whether `a` should come before (`Less`) or after (`Greater`) `b`.
    fn order(a: &T, b: &T) -> Ordering;
}

/// ordering straight from the type's own `Ord`.
pub struct Natural;

impl<T: Ord + ?Sized> OrderBy<T> for Natural {
    fn order(a: &T, b: &T) -> Ordering {
        a.cmp(b)
    }
}

/// how many addresses a bus has, and how broadcast walks them.
pub trait AddressPolicy<C: Config>: 'static {
    type Id: Clone + Eq + Hash + Debug + 'static;
    const ORDERED: bool;
    /// broadcast visiting order between addresses. only consulted when
    /// `ORDERED` is set.
    fn order(_a: &Self::Id, _b: &Self::Id) -> Ordering {
        Ordering::Equal
    }
}

/// marker: exactly one implicit address. enables `connect`/`bind`.
pub trait SoleAddress<C: Config>: AddressPolicy<C, Id = ()> {}

/// marker: the bus is addressed by id. enables `connect_at`/`event`/etc.
pub trait WithId<C: Config>: AddressPolicy<C> {}

/// one implicit address; every handler hears every event.
pub struct SingleAddress;

impl<C: Config> AddressPolicy<C> for SingleAddress {
    type Id = ();
    const ORDERED: bool = false;
}

impl<C: Config> SoleAddress<C> for SingleAddress {}

/// many addresses keyed by `Id`; broadcast visits them in creation order.
pub struct ById<Id>(PhantomData<fn() -> Id>);

impl<C: Config, Id: Clone + Eq + Hash + Debug + 'static> AddressPolicy<C> for ById<Id> {
    type Id = Id;
    const ORDERED: bool = false;
}

impl<C: Config, Id: Clone + Eq + Hash + Debug + 'static> WithId<C> for ById<Id> {}

/// many addresses keyed by `Id`; broadcast visits them sorted by `O`.
pub struct ByIdOrderedBy<Id, O>(PhantomData<fn() -> (Id, O)>);

/// the common case of [`ByIdOrderedBy`]: sorted by the id's own `Ord`.
pub type ByIdOrdered<Id> = ByIdOrderedBy<Id, Natural>;

impl<C, Id, O> AddressPolicy<C> for ByIdOrderedBy<Id, O>
where
    C: Config,
    Id: Clone + Eq + Hash + Debug + 'static,
    O: OrderBy<Id>,
{
    type Id = Id;
    const ORDERED: bool = true;

    fn order(a: &Self::Id, b: &Self::Id) -> Ordering {
        O::order(a, b)
    }
}

impl<C, Id, O> WithId<C> for ByIdOrderedBy<Id, O>
where
    C: Config,
    Id: Clone + Eq + Hash + Debug + 'static,
    O: OrderBy<Id>,
{
}

/// how many handlers may sit at one address, and in what order they hear
/// an event.
pub trait HandlerPolicy<C: Config>: 'static {
    /// at most one handler per address; a second connect is refused.
    const SINGLE: bool = false;
    /// keep handlers sorted by [`order`](Self::order) instead of FIFO.
    const ORDERED: bool = false;
    fn order(_a: &C::Interface, _b: &C::Interface) -> Ordering {
        Ordering::Equal
    }
}

/// one handler per address (the request-bus shape).
pub struct SingleHandler;

impl<C: Config> HandlerPolicy<C> for SingleHandler {
    const SINGLE: bool = true;
}

/// any number of handlers, invoked in connection order.
pub struct ManyHandlers;

impl<C: Config> HandlerPolicy<C> for ManyHandlers {}

/// any number of handlers, kept sorted by the comparator `O` on every
/// connect. equal handlers keep connection order (insertion is stable).
pub struct OrderedHandlers<O>(PhantomData<fn() -> O>);

impl<C: Config, O: OrderBy<C::Interface>> HandlerPolicy<C> for OrderedHandlers<O> {
    const ORDERED: bool = true;

    fn order(a: &C::Interface, b: &C::Interface) -> Ordering {
        O::order(a, b)
    }
}

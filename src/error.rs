//! error type for membership and router operations.
//!
//! none of these ever leave the bus in a broken state: the failed operation
//! is a no-op, reported here and on the `warn` log channel.

/// why a connect/disconnect/router operation was refused.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    #[error("handler is already connected at this address")]
    AlreadyConnected,
    #[error("handler is not connected at this address")]
    NotConnected,
    #[error("address already has a handler (single-handler policy)")]
    AddressOccupied,
    #[error("router chain cannot change while a dispatch is in progress")]
    DispatchActive,
    #[error("router is not connected to this bus")]
    RouterNotConnected,
    #[error("cached address reference belongs to a different bus instance")]
    ForeignNodeRef,
}

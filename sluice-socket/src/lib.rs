//! Event-driven, layered TCP socket stack.
//!
//! Each socket owns a worker thread (its *pump*) that blocks in the OS
//! multiplexer and translates readiness into events posted to the owning
//! handler's loop. The data path is entirely non-blocking: reads and writes
//! return [`SocketError::WouldBlock`] when no progress is possible, which
//! re-arms readiness interest for that direction. Readiness events are
//! edge-triggered from the consumer's perspective: after a `Read` or
//! `Write` event, no further event fires for that direction until the
//! consumer has drained it to would-block.
//!
//! Transforming layers implement [`SocketInterface`] over the layer below
//! them; the whole chain shares one event source identity.

mod address;
mod base;
mod error;
mod event;
mod layer;
mod options;
mod pump;

mod listen;
mod stream;

pub use address::{address_to_string, AddressFamily};
pub use base::{ListenState, SocketState};
pub use error::SocketError;
pub use event::{
    change_socket_event_handler, remove_socket_events, HostAddressEvent, SocketEvent,
    SocketEventFlag,
};
pub use layer::SocketInterface;
pub use listen::ListenSocket;
pub use options::SocketFlags;
pub use stream::{SocketDescriptor, StreamSocket};

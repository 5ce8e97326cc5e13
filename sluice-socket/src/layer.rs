use sluice_event::{HandlerRef, SourceId};

use crate::{AddressFamily, SocketError, SocketState};

/// The stackable socket surface.
///
/// Zero or more transforming layers sit between the application and a base
/// [`StreamSocket`](crate::StreamSocket); each layer wraps its *next layer*
/// (toward the wire) and forwards or transforms calls and readiness events.
/// The whole chain shares the base socket's [`SourceId`], exposed through
/// [`SocketInterface::root`], so a handler sees one consistent event source
/// no matter which element of the chain emitted the event.
///
/// Two kinds of layers exist:
///
/// - *Passthrough* layers forward `set_event_handler` to the next layer, so
///   readiness events originating at the base reach the consumer directly.
///   A rate limiter is one: it only gates the data path and synthesizes
///   additional readiness events of its own.
/// - *Translating* layers keep the downstream events to themselves, perform
///   their own work (handshakes, buffering) and emit events to the consumer
///   when the transformed stream has something to report.
pub trait SocketInterface: Send {
    /// Non-blocking read; `Ok(0)` is orderly peer close,
    /// [`SocketError::WouldBlock`] re-arms read interest.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SocketError>;

    /// Non-blocking write; [`SocketError::WouldBlock`] re-arms write
    /// interest.
    fn write(&mut self, buf: &[u8]) -> Result<usize, SocketError>;

    /// Half-closes the write side.
    fn shutdown(&mut self) -> Result<(), SocketError>;

    /// Starts an asynchronous connect on the underlying stream.
    fn connect(&mut self, host: &str, port: u16, family: AddressFamily)
        -> Result<(), SocketError>;

    /// State of the stream. Layers with their own lifecycle (handshakes)
    /// override this to reflect the compound state.
    fn state(&self) -> SocketState;

    /// Swaps the consumer-facing event handler.
    fn set_event_handler(&mut self, handler: Option<HandlerRef>);

    /// The chain-wide event routing identity.
    fn root(&self) -> SourceId;
}

use sluice_event::{Event, HandlerRef, SourceId};

use crate::SocketError;

/// What a socket event reports.
///
/// Listen sockets reuse `Connection` for accept readiness; consumers tell the
/// two apart by the event's source identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEventFlag {
    /// Connect completed (stream) or a connection is pending (listen).
    Connection,
    /// A connect candidate failed but more remain; another attempt follows.
    ConnectionNext,
    Read,
    Write,
}

/// Readiness or completion notification from a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketEvent {
    pub source: SourceId,
    pub flag: SocketEventFlag,
    /// `None` on success.
    pub error: Option<SocketError>,
}

/// Emitted once per candidate address attempted during connect, carrying the
/// printable numeric address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddressEvent {
    pub source: SourceId,
    pub address: String,
}

fn event_matches_source(event: &Event, source: SourceId) -> bool {
    if let Some(ev) = event.downcast_ref::<SocketEvent>() {
        return ev.source == source;
    }
    if let Some(ev) = event.downcast_ref::<HostAddressEvent>() {
        return ev.source == source;
    }
    false
}

/// Strips all queued socket and host-address events for `source` that are
/// addressed to `handler`. Used on close and teardown so that no stale event
/// reaches a consumer afterwards.
pub fn remove_socket_events(handler: &HandlerRef, source: SourceId) {
    let id = handler.id();
    handler.filter_events(|target, event| *target == id && event_matches_source(event, source));
}

/// Atomically retargets queued events for `source` from `old` to `new`.
///
/// Both handlers must live on the same loop. No event is lost or delivered
/// twice across the swap.
pub fn change_socket_event_handler(old: &HandlerRef, new: &HandlerRef, source: SourceId) {
    if old == new {
        return;
    }
    let old_id = old.id();
    let new_id = new.id();
    old.filter_events(|target, event| {
        if *target == old_id && event_matches_source(event, source) {
            *target = new_id;
        }
        false
    });
}

/// Whether an event with the given flag for `source` is already queued for
/// `handler`.
pub(crate) fn has_pending_event(
    handler: &HandlerRef,
    source: SourceId,
    flag: SocketEventFlag,
) -> bool {
    let id = handler.id();
    let mut pending = false;
    handler.filter_events(|target, event| {
        if *target == id {
            if let Some(ev) = event.downcast_ref::<SocketEvent>() {
                if ev.source == source && ev.flag == flag {
                    pending = true;
                }
            }
        }
        false
    });
    pending
}

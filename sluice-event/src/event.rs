use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A type-erased event value.
///
/// The payload's [`TypeId`](std::any::TypeId) doubles as the event's derived
/// type: consumers match on it with [`Event::is`] and [`Event::downcast_ref`]
/// instead of a hand-rolled tag.
pub struct Event {
    payload: Box<dyn Any + Send>,
}

impl Event {
    pub fn new<T: Any + Send>(payload: T) -> Self {
        Self {
            payload: Box::new(payload),
        }
    }

    /// Returns `true` if the payload is a `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.payload.is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.payload.downcast_mut::<T>()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").finish_non_exhaustive()
    }
}

/// Routing identity of an event origin.
///
/// Sockets and layers allocate one and stamp it on every event they emit, so
/// a handler receiving events from several sources can tell them apart. A
/// whole layer chain shares the identity of its base socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl SourceId {
    /// Allocates a fresh, process-unique identity.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identifier of a timer armed through [`HandlerRef::add_timer`].
///
/// [`HandlerRef::add_timer`]: crate::HandlerRef::add_timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

/// Delivered to the handler that armed the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    pub id: TimerId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downcast_round_trip() {
        let ev = Event::new(TimerEvent { id: TimerId(7) });
        assert!(ev.is::<TimerEvent>());
        assert!(!ev.is::<u32>());
        assert_eq!(ev.downcast_ref::<TimerEvent>().unwrap().id, TimerId(7));
    }

    #[test]
    fn source_ids_are_unique() {
        let a = SourceId::next();
        let b = SourceId::next();
        assert_ne!(a, b);
    }
}

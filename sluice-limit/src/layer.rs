use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use sluice_event::{Event, HandlerRef, SourceId};
use sluice_socket::{
    AddressFamily, SocketError, SocketEvent, SocketEventFlag, SocketInterface, SocketState,
};

use crate::limiter::{Bucket, BucketWaker, Direction, RateLimiter, UNLIMITED};

struct LayerShared {
    source: SourceId,
    handler: Mutex<Option<HandlerRef>>,
}

impl LayerShared {
    fn send_wakeup(&self, direction: Direction) {
        let handler = self.handler.lock().clone();
        let Some(handler) = handler else {
            return;
        };
        let flag = match direction {
            Direction::Inbound => SocketEventFlag::Read,
            Direction::Outbound => SocketEventFlag::Write,
        };
        handler.send(Event::new(SocketEvent {
            source: self.source,
            flag,
            error: None,
        }));
    }
}

struct LayerWaker {
    shared: Arc<LayerShared>,
}

impl BucketWaker for LayerWaker {
    fn wakeup(&self, direction: Direction) {
        self.shared.send_wakeup(direction);
    }
}

/// A socket layer that makes its stream obey one limiter tree.
///
/// This is an event-passthrough layer: readiness events keep flowing from
/// the base socket to the consumer's handler. The layer only gates the data
/// path, clamping each read or write to the bucket's available tokens and
/// charging it afterwards, and synthesizes a fresh readiness event when a
/// starved direction gets tokens again.
pub struct RateLimitedLayer<S: SocketInterface> {
    next: S,
    bucket: Bucket,
    shared: Arc<LayerShared>,
}

impl<S: SocketInterface> RateLimitedLayer<S> {
    pub fn new(handler: Option<HandlerRef>, mut next: S, limiter: Option<&RateLimiter>) -> Self {
        let shared = Arc::new(LayerShared {
            source: next.root(),
            handler: Mutex::new(handler.clone()),
        });
        next.set_event_handler(handler);
        let bucket = Bucket::with_waker(Arc::new(LayerWaker {
            shared: Arc::clone(&shared),
        }));
        if let Some(limiter) = limiter {
            limiter.add_bucket(&bucket);
        }
        Self {
            next,
            bucket,
            shared,
        }
    }

    /// The bucket backing this layer, for attaching to a different limiter.
    pub fn bucket(&self) -> &Bucket {
        &self.bucket
    }

    pub fn next_layer(&self) -> &S {
        &self.next
    }

    pub fn next_layer_mut(&mut self) -> &mut S {
        &mut self.next
    }
}

impl<S: SocketInterface> SocketInterface for RateLimitedLayer<S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
        let max = self.bucket.available(Direction::Inbound);
        if max == 0 {
            return Err(SocketError::WouldBlock);
        }
        let len = buf.len().min(usize::try_from(max).unwrap_or(usize::MAX));
        let n = self.next.read(&mut buf[..len])?;
        if n > 0 && max != UNLIMITED {
            self.bucket.consume(Direction::Inbound, n as u64);
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, SocketError> {
        let max = self.bucket.available(Direction::Outbound);
        if max == 0 {
            return Err(SocketError::WouldBlock);
        }
        let len = buf.len().min(usize::try_from(max).unwrap_or(usize::MAX));
        let n = self.next.write(&buf[..len])?;
        if n > 0 && max != UNLIMITED {
            self.bucket.consume(Direction::Outbound, n as u64);
        }
        Ok(n)
    }

    fn shutdown(&mut self) -> Result<(), SocketError> {
        self.next.shutdown()
    }

    fn connect(
        &mut self,
        host: &str,
        port: u16,
        family: AddressFamily,
    ) -> Result<(), SocketError> {
        self.next.connect(host, port, family)
    }

    fn state(&self) -> SocketState {
        self.next.state()
    }

    fn set_event_handler(&mut self, handler: Option<HandlerRef>) {
        *self.shared.handler.lock() = handler.clone();
        self.next.set_event_handler(handler);
    }

    fn root(&self) -> SourceId {
        self.shared.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::RateLimitManager;
    use parking_lot::Mutex as PlMutex;
    use sluice_event::{EventHandler, EventLoop};
    use std::time::{Duration, Instant};

    /// A connected stream with an endless supply of zeroes in both
    /// directions.
    struct FakeSocket {
        source: SourceId,
        handler: Option<HandlerRef>,
    }

    impl FakeSocket {
        fn new() -> Self {
            Self {
                source: SourceId::next(),
                handler: None,
            }
        }
    }

    impl SocketInterface for FakeSocket {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
            buf.fill(0);
            Ok(buf.len())
        }

        fn write(&mut self, buf: &[u8]) -> Result<usize, SocketError> {
            Ok(buf.len())
        }

        fn shutdown(&mut self) -> Result<(), SocketError> {
            Ok(())
        }

        fn connect(
            &mut self,
            _host: &str,
            _port: u16,
            _family: AddressFamily,
        ) -> Result<(), SocketError> {
            Ok(())
        }

        fn state(&self) -> SocketState {
            SocketState::Connected
        }

        fn set_event_handler(&mut self, handler: Option<HandlerRef>) {
            self.handler = handler;
        }

        fn root(&self) -> SourceId {
            self.source
        }
    }

    struct Collector {
        events: Arc<PlMutex<Vec<SocketEvent>>>,
    }

    impl EventHandler for Collector {
        fn on_event(&mut self, _ctx: &HandlerRef, event: sluice_event::Event) {
            if let Some(ev) = event.downcast_ref::<SocketEvent>() {
                self.events.lock().push(*ev);
            }
        }
    }

    #[test]
    fn reads_are_clamped_and_charged() {
        let _ = tracing_subscriber::fmt::try_init();
        let event_loop = EventLoop::new();
        let manager = RateLimitManager::new(&event_loop.handle());
        let limiter = RateLimiter::new();
        limiter.set_limits(500, 500);

        let mut layer = RateLimitedLayer::new(None, FakeSocket::new(), Some(&limiter));
        manager.add(&limiter);

        // One tick's grant is 100; a large read is clamped to it.
        let mut buf = [0u8; 4096];
        let n = layer.read(&mut buf).unwrap();
        assert_eq!(n, 100);
        assert_eq!(layer.read(&mut buf), Err(SocketError::WouldBlock));

        // Replenishment unblocks the starved direction.
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut total = n;
        while total < 300 && Instant::now() < deadline {
            match layer.read(&mut buf) {
                Ok(n) => total += n,
                Err(SocketError::WouldBlock) => {
                    std::thread::sleep(Duration::from_millis(20))
                }
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert!(total >= 300, "replenishment never resumed reads");

        limiter.remove();
    }

    #[test]
    fn starved_direction_gets_a_synthetic_event() {
        let _ = tracing_subscriber::fmt::try_init();
        let event_loop = EventLoop::new();
        let manager = RateLimitManager::new(&event_loop.handle());
        let events = Arc::new(PlMutex::new(Vec::new()));
        let handler = event_loop.handle().register(Collector {
            events: Arc::clone(&events),
        });

        let limiter = RateLimiter::new();
        limiter.set_limits(500, 500);
        let fake = FakeSocket::new();
        let source = fake.source;
        let mut layer = RateLimitedLayer::new(Some(handler), fake, Some(&limiter));
        manager.add(&limiter);

        let mut buf = [0u8; 4096];
        while layer.read(&mut buf).is_ok() {}

        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            let found = events
                .lock()
                .iter()
                .any(|ev| ev.source == source && ev.flag == SocketEventFlag::Read);
            if found {
                break;
            }
            assert!(Instant::now() < deadline, "no wakeup event arrived");
            std::thread::sleep(Duration::from_millis(20));
        }

        limiter.remove();
    }

    #[test]
    fn compound_layer_obeys_the_tightest_bucket() {
        let _ = tracing_subscriber::fmt::try_init();
        let event_loop = EventLoop::new();
        let manager = RateLimitManager::new(&event_loop.handle());

        let tight = RateLimiter::new();
        tight.set_limits(100, 100);
        let loose = RateLimiter::new();
        loose.set_limits(100_000, 100_000);

        let mut layer = CompoundRateLimitedLayer::new(None, FakeSocket::new());
        layer.add_limiter(&tight);
        layer.add_limiter(&loose);
        manager.add(&tight);
        manager.add(&loose);

        let mut buf = [0u8; 4096];
        let n = layer.read(&mut buf).unwrap();
        assert_eq!(n, 20, "read not clamped to the tight limiter's grant");
        assert_eq!(layer.read(&mut buf), Err(SocketError::WouldBlock));

        // Dropping the tight membership lifts the clamp.
        layer.remove_limiter(&tight);
        let n = layer.read(&mut buf).unwrap();
        assert!(n > 20, "loose limiter alone should allow more, got {n}");

        tight.remove();
        loose.remove();
    }
}

#[derive(Default)]
struct PendingWakeups([AtomicBool; 2]);

struct CompoundWaker {
    shared: Arc<LayerShared>,
    pending: Arc<PendingWakeups>,
}

impl CompoundWaker {
    fn fire(&self, direction: Direction) {
        if !self.pending.0[direction.index()].swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.send_wakeup(direction);
    }
}

impl BucketWaker for CompoundWaker {
    fn wakeup(&self, direction: Direction) {
        self.fire(direction);
    }
}

struct Membership {
    limiter: Arc<crate::limiter::Node>,
    bucket: Bucket,
    waker: Arc<CompoundWaker>,
    pending: Arc<PendingWakeups>,
    max: [u64; 2],
}

/// A rate-limited layer holding any number of limiter memberships.
///
/// A transfer is clamped to the tightest bucket across all memberships and
/// charged to every one of them. The per-direction pending flags make the
/// wakeup edge-triggered: only a direction that actually starved produces a
/// synthetic readiness event.
pub struct CompoundRateLimitedLayer<S: SocketInterface> {
    next: S,
    shared: Arc<LayerShared>,
    memberships: Vec<Membership>,
}

impl<S: SocketInterface> CompoundRateLimitedLayer<S> {
    pub fn new(handler: Option<HandlerRef>, mut next: S) -> Self {
        let shared = Arc::new(LayerShared {
            source: next.root(),
            handler: Mutex::new(handler.clone()),
        });
        next.set_event_handler(handler);
        Self {
            next,
            shared,
            memberships: Vec::new(),
        }
    }

    /// Adds a membership in `limiter`. Idempotent per limiter.
    pub fn add_limiter(&mut self, limiter: &RateLimiter) {
        if self
            .memberships
            .iter()
            .any(|m| Arc::ptr_eq(&m.limiter, &limiter.node))
        {
            return;
        }
        let pending = Arc::new(PendingWakeups::default());
        let waker = Arc::new(CompoundWaker {
            shared: Arc::clone(&self.shared),
            pending: Arc::clone(&pending),
        });
        let bucket = Bucket::with_waker(Arc::clone(&waker) as Arc<dyn BucketWaker>);
        limiter.add_bucket(&bucket);
        self.memberships.push(Membership {
            limiter: Arc::clone(&limiter.node),
            bucket,
            waker,
            pending,
            max: [UNLIMITED; 2],
        });
    }

    /// Drops the membership in `limiter`, waking both directions in case a
    /// consumer was starving on it.
    pub fn remove_limiter(&mut self, limiter: &RateLimiter) {
        let Some(pos) = self
            .memberships
            .iter()
            .position(|m| Arc::ptr_eq(&m.limiter, &limiter.node))
        else {
            return;
        };
        let membership = self.memberships.swap_remove(pos);
        membership.bucket.remove();
        membership.waker.fire(Direction::Inbound);
        membership.waker.fire(Direction::Outbound);
    }

    fn clamp(&mut self, direction: Direction, len: usize) -> Result<usize, SocketError> {
        let d = direction.index();
        let mut max = UNLIMITED;
        for membership in &mut self.memberships {
            membership.pending.0[d].store(true, Ordering::SeqCst);
            let available = membership.bucket.available(direction);
            if available == 0 {
                return Err(SocketError::WouldBlock);
            }
            membership.pending.0[d].store(false, Ordering::SeqCst);
            membership.max[d] = available;
            max = max.min(available);
        }
        Ok(len.min(usize::try_from(max).unwrap_or(usize::MAX)))
    }

    fn charge(&mut self, direction: Direction, amount: usize) {
        let d = direction.index();
        for membership in &self.memberships {
            if membership.max[d] != UNLIMITED {
                membership.bucket.consume(direction, amount as u64);
            }
        }
    }
}

impl<S: SocketInterface> SocketInterface for CompoundRateLimitedLayer<S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
        let len = self.clamp(Direction::Inbound, buf.len())?;
        let n = self.next.read(&mut buf[..len])?;
        if n > 0 {
            self.charge(Direction::Inbound, n);
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, SocketError> {
        let len = self.clamp(Direction::Outbound, buf.len())?;
        let n = self.next.write(&buf[..len])?;
        if n > 0 {
            self.charge(Direction::Outbound, n);
        }
        Ok(n)
    }

    fn shutdown(&mut self) -> Result<(), SocketError> {
        self.next.shutdown()
    }

    fn connect(
        &mut self,
        host: &str,
        port: u16,
        family: AddressFamily,
    ) -> Result<(), SocketError> {
        self.next.connect(host, port, family)
    }

    fn state(&self) -> SocketState {
        self.next.state()
    }

    fn set_event_handler(&mut self, handler: Option<HandlerRef>) {
        *self.shared.handler.lock() = handler.clone();
        self.next.set_event_handler(handler);
    }

    fn root(&self) -> SourceId {
        self.shared.source
    }
}

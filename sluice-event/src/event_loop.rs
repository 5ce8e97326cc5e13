use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{Event, TimerEvent, TimerId};

/// A consumer of events.
///
/// Handlers are driven by exactly one [`EventLoop`]; events addressed to the
/// same handler never execute concurrently. The `ctx` argument is a reference
/// to the handler's own registration, usable to re-send events to itself or
/// to arm timers from inside a dispatch.
pub trait EventHandler: Send {
    fn on_event(&mut self, ctx: &HandlerRef, event: Event);
}

/// Identifies a registered handler within its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct TimerSlot {
    handler: HandlerId,
    period: Option<Duration>,
    deadline: Instant,
}

struct LoopState {
    queue: VecDeque<(HandlerId, Event)>,
    handlers: HashMap<HandlerId, Arc<Mutex<dyn EventHandler>>>,
    timers: HashMap<TimerId, TimerSlot>,
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    dispatching: Option<HandlerId>,
    quit: bool,
    next_handler: u64,
    next_timer: u64,
}

struct LoopShared {
    state: Mutex<LoopState>,
    cond: Condvar,
    thread_id: OnceLock<ThreadId>,
}

/// A single-threaded serial dispatcher of events and timers.
///
/// The loop owns a FIFO of `(handler, event)` entries and a deadline-ordered
/// timer heap. One dispatcher thread pops entries and invokes the addressed
/// handler; two handlers registered on *different* loops may run
/// concurrently, two on the same loop never do.
///
/// Dropping the loop stops the dispatcher and joins it.
pub struct EventLoop {
    shared: Arc<LoopShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoop {
    /// Starts a new loop with its own dispatcher thread.
    ///
    /// # Panics
    ///
    /// Panics if the dispatcher thread cannot be spawned.
    pub fn new() -> Self {
        let shared = Arc::new(LoopShared {
            state: Mutex::new(LoopState {
                queue: VecDeque::new(),
                handlers: HashMap::new(),
                timers: HashMap::new(),
                heap: BinaryHeap::new(),
                dispatching: None,
                quit: false,
                next_handler: 1,
                next_timer: 1,
            }),
            cond: Condvar::new(),
            thread_id: OnceLock::new(),
        });

        let run_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("sluice-loop".into())
            .spawn(move || run(run_shared))
            .expect("failed to spawn event loop thread");

        Self {
            shared,
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.quit = true;
            self.shared.cond.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Cheap clonable handle for registering handlers on an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Registers a handler, taking ownership of it.
    pub fn register<H: EventHandler + 'static>(&self, handler: H) -> HandlerRef {
        self.register_shared(Arc::new(Mutex::new(handler)))
    }

    /// Registers a shared handler.
    ///
    /// The caller keeps its `Arc` and may lock it to inspect or drive the
    /// handler from outside the loop; dispatch takes the same mutex, so the
    /// serial-execution guarantee extends to such external calls.
    pub fn register_shared<H: EventHandler + 'static>(&self, handler: Arc<Mutex<H>>) -> HandlerRef {
        let mut state = self.shared.state.lock();
        let id = HandlerId(state.next_handler);
        state.next_handler += 1;
        let erased: Arc<Mutex<dyn EventHandler>> = handler;
        state.handlers.insert(id, erased);
        HandlerRef {
            shared: Arc::clone(&self.shared),
            id,
        }
    }
}

/// Reference to a registered handler.
///
/// All queue and timer operations of the loop are exposed through the
/// reference of the handler they act for.
#[derive(Clone)]
pub struct HandlerRef {
    shared: Arc<LoopShared>,
    id: HandlerId,
}

impl PartialEq for HandlerRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared) && self.id == other.id
    }
}

impl Eq for HandlerRef {}

impl fmt::Debug for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandlerRef").field(&self.id).finish()
    }
}

impl HandlerRef {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Enqueues an event for this handler.
    ///
    /// Silently dropped if the handler has been removed or the loop has shut
    /// down.
    pub fn send(&self, event: Event) {
        let mut state = self.shared.state.lock();
        if state.quit || !state.handlers.contains_key(&self.id) {
            return;
        }
        state.queue.push_back((self.id, event));
        self.shared.cond.notify_all();
    }

    /// Arms a timer; a [`TimerEvent`] is delivered to this handler when the
    /// deadline passes. Periodic timers re-arm themselves until stopped.
    pub fn add_timer(&self, after: Duration, one_shot: bool) -> TimerId {
        let mut state = self.shared.state.lock();
        let id = TimerId(state.next_timer);
        state.next_timer += 1;
        let deadline = Instant::now() + after;
        state.timers.insert(
            id,
            TimerSlot {
                handler: self.id,
                period: (!one_shot).then_some(after),
                deadline,
            },
        );
        state.heap.push(Reverse((deadline, id.0)));
        self.shared.cond.notify_all();
        id
    }

    /// Stops a timer. A fired-but-undelivered [`TimerEvent`] is withdrawn
    /// from the queue as well.
    pub fn stop_timer(&self, id: TimerId) {
        let mut state = self.shared.state.lock();
        state.timers.remove(&id);
        state
            .queue
            .retain(|(_, ev)| ev.downcast_ref::<TimerEvent>().map(|t| t.id) != Some(id));
    }

    /// Unregisters the handler: drains its queued events, cancels its timers
    /// and waits for a dispatch already in flight to finish.
    ///
    /// Calling this from inside the handler's own dispatch is allowed; the
    /// in-flight wait is skipped in that case.
    pub fn remove(&self) {
        let mut state = self.shared.state.lock();
        state.handlers.remove(&self.id);
        let id = self.id;
        state.queue.retain(|(h, _)| *h != id);
        state.timers.retain(|_, slot| slot.handler != id);

        let on_loop_thread = self.shared.thread_id.get().copied() == Some(thread::current().id());
        while state.dispatching == Some(self.id) && !on_loop_thread {
            self.shared.cond.wait(&mut state);
        }
    }

    /// Walks the queue under the loop lock. `f` may rewrite an entry's target
    /// handler in place; returning `true` removes the entry.
    ///
    /// This is the mechanism behind cancelling or redirecting socket events
    /// when handlers are replaced or sockets close.
    pub fn filter_events(&self, mut f: impl FnMut(&mut HandlerId, &Event) -> bool) {
        let mut state = self.shared.state.lock();
        state.queue.retain_mut(|(handler, event)| !f(handler, event));
    }
}

fn run(shared: Arc<LoopShared>) {
    let _ = shared.thread_id.set(thread::current().id());

    let mut state = shared.state.lock();
    loop {
        if state.quit {
            break;
        }

        let next_deadline = fire_due_timers(&mut state);

        if let Some((id, event)) = state.queue.pop_front() {
            let Some(slot) = state.handlers.get(&id).cloned() else {
                continue;
            };
            state.dispatching = Some(id);
            MutexGuard::unlocked(&mut state, || {
                let ctx = HandlerRef {
                    shared: Arc::clone(&shared),
                    id,
                };
                slot.lock().on_event(&ctx, event);
            });
            state.dispatching = None;
            shared.cond.notify_all();
            continue;
        }

        match next_deadline {
            Some(deadline) => {
                let _ = shared.cond.wait_until(&mut state, deadline);
            }
            None => shared.cond.wait(&mut state),
        }
    }
}

/// Moves due timers onto the event queue and reports the next pending
/// deadline, if any.
fn fire_due_timers(state: &mut LoopState) -> Option<Instant> {
    let now = Instant::now();
    loop {
        let &Reverse((deadline, raw)) = state.heap.peek()?;
        let id = TimerId(raw);

        // Heap entries are not withdrawn on stop_timer or periodic re-arm;
        // an entry is live only while it matches the slot's deadline.
        let live = state
            .timers
            .get(&id)
            .is_some_and(|slot| slot.deadline == deadline);
        if !live {
            state.heap.pop();
            continue;
        }
        if deadline > now {
            return Some(deadline);
        }

        state.heap.pop();
        let slot = state.timers.get_mut(&id).expect("live timer slot");
        let handler = slot.handler;
        if let Some(period) = slot.period {
            slot.deadline = now + period;
            let next = slot.deadline;
            state.heap.push(Reverse((next, raw)));
        } else {
            state.timers.remove(&id);
        }
        state.queue.push_back((handler, Event::new(TimerEvent { id })));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        seen: Arc<Mutex<Vec<u32>>>,
        resend: bool,
    }

    impl EventHandler for Recorder {
        fn on_event(&mut self, ctx: &HandlerRef, event: Event) {
            if let Some(&n) = event.downcast_ref::<u32>() {
                self.seen.lock().push(n);
                if self.resend && n < 5 {
                    ctx.send(Event::new(n + 1));
                }
            }
        }
    }

    fn recorder(loop_: &EventLoop, resend: bool) -> (HandlerRef, Arc<Mutex<Vec<u32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = loop_.handle().register(Recorder {
            seen: Arc::clone(&seen),
            resend,
        });
        (handler, seen)
    }

    fn wait_for(pred: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pred() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn delivers_in_order() {
        let loop_ = EventLoop::new();
        let (handler, seen) = recorder(&loop_, false);
        for n in 0..100u32 {
            handler.send(Event::new(n));
        }
        wait_for(|| seen.lock().len() == 100);
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn handler_can_send_to_itself() {
        let loop_ = EventLoop::new();
        let (handler, seen) = recorder(&loop_, true);
        handler.send(Event::new(0u32));
        wait_for(|| seen.lock().len() == 6);
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn one_shot_timer_fires_once() {
        struct Ticks(Arc<AtomicUsize>);
        impl EventHandler for Ticks {
            fn on_event(&mut self, _ctx: &HandlerRef, event: Event) {
                if event.is::<TimerEvent>() {
                    self.0.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let loop_ = EventLoop::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let handler = loop_.handle().register(Ticks(Arc::clone(&ticks)));
        handler.add_timer(Duration::from_millis(10), true);
        wait_for(|| ticks.load(Ordering::SeqCst) == 1);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn periodic_timer_rearms_until_stopped() {
        struct Ticks(Arc<AtomicUsize>);
        impl EventHandler for Ticks {
            fn on_event(&mut self, _ctx: &HandlerRef, event: Event) {
                if event.is::<TimerEvent>() {
                    self.0.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let loop_ = EventLoop::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let handler = loop_.handle().register(Ticks(Arc::clone(&ticks)));
        let id = handler.add_timer(Duration::from_millis(5), false);
        wait_for(|| ticks.load(Ordering::SeqCst) >= 3);
        handler.stop_timer(id);
        let settled = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert!(ticks.load(Ordering::SeqCst) <= settled + 1);
    }

    #[test]
    fn filter_retargets_and_removes() {
        let loop_ = EventLoop::new();
        let (first, first_seen) = recorder(&loop_, false);
        let (second, second_seen) = recorder(&loop_, false);

        // Park the loop so entries stay queued while we filter.
        struct Sleeper;
        impl EventHandler for Sleeper {
            fn on_event(&mut self, _ctx: &HandlerRef, _event: Event) {
                thread::sleep(Duration::from_millis(50));
            }
        }
        let sleeper = loop_.handle().register(Sleeper);
        sleeper.send(Event::new(()));
        thread::sleep(Duration::from_millis(10));

        first.send(Event::new(1u32));
        first.send(Event::new(2u32));
        let first_id = first.id();
        let second_id = second.id();
        first.filter_events(|handler, event| {
            if *handler != first_id {
                return false;
            }
            match event.downcast_ref::<u32>().copied() {
                Some(1) => {
                    *handler = second_id;
                    false
                }
                Some(2) => true,
                _ => false,
            }
        });

        wait_for(|| second_seen.lock().len() == 1);
        assert_eq!(*second_seen.lock(), vec![1]);
        assert!(first_seen.lock().is_empty());
    }

    #[test]
    fn remove_drains_pending_events() {
        let loop_ = EventLoop::new();

        struct Sleeper;
        impl EventHandler for Sleeper {
            fn on_event(&mut self, _ctx: &HandlerRef, _event: Event) {
                thread::sleep(Duration::from_millis(50));
            }
        }
        let sleeper = loop_.handle().register(Sleeper);
        sleeper.send(Event::new(()));
        thread::sleep(Duration::from_millis(10));

        let (handler, seen) = recorder(&loop_, false);
        handler.send(Event::new(1u32));
        handler.remove();
        handler.send(Event::new(2u32));

        thread::sleep(Duration::from_millis(100));
        assert!(seen.lock().is_empty());
    }
}

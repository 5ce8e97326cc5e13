use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use sluice_event::{Event, EventHandler, HandlerRef, LoopHandle, TimerEvent, TimerId};

use crate::limiter::{detach, lock_tree, LockedNode, Node, Parent, RateLimiter, TICK, UNLIMITED};

/// Periodic replenisher for attached limiter trees.
///
/// Runs as an ordinary handler on the loop it was created with. The timer is
/// demand-driven: a bucket signalling pressure (an empty `available`, a
/// non-trivial `consume`, a limit change, an attach) re-arms it, and two
/// consecutive ticks without pressure stop it again, so an idle tree costs
/// no wakeups.
pub struct RateLimitManager {
    shared: Arc<ManagerShared>,
    handler: HandlerRef,
}

pub(crate) struct ManagerShared {
    pub(crate) limiters: Mutex<Vec<Arc<Node>>>,
    activity: AtomicI32,
    timer: Mutex<Option<TimerId>>,
    handler: OnceLock<HandlerRef>,
}

impl RateLimitManager {
    pub fn new(loop_handle: &LoopHandle) -> Self {
        let shared = Arc::new(ManagerShared {
            limiters: Mutex::new(Vec::new()),
            activity: AtomicI32::new(2),
            timer: Mutex::new(None),
            handler: OnceLock::new(),
        });
        let handler = loop_handle.register(ManagerHandler {
            shared: Arc::clone(&shared),
        });
        let _ = shared.handler.set(handler.clone());
        Self { shared, handler }
    }

    /// Attaches a top-level limiter, detaching it from any previous parent,
    /// and gives it one full replenishment pass immediately.
    pub fn add(&self, limiter: &RateLimiter) {
        detach(&limiter.node);

        let mut list = self.shared.limiters.lock();
        let mut locked = lock_tree(&limiter.node);

        locked.set_mgr(Some(Arc::clone(&self.shared)));
        locked.guard.parent = Parent::Manager(Arc::downgrade(&self.shared));
        locked.guard.idx = list.len();
        list.push(Arc::clone(&limiter.node));

        self.shared.process_locked(&mut locked);
        locked.unlock();
    }

    /// Whether the replenishment timer is currently armed. Meant for tests
    /// and diagnostics; the timer arms and stops on its own.
    pub fn timer_active(&self) -> bool {
        self.shared.timer.lock().is_some()
    }
}

impl Drop for RateLimitManager {
    fn drop(&mut self) {
        debug_assert!(self.shared.limiters.lock().is_empty());
        self.handler.remove();
    }
}

impl ManagerShared {
    /// Resets the idle counter; arms the timer if it had been stopped.
    pub(crate) fn record_activity(&self) {
        if self.activity.swap(0, Ordering::SeqCst) == 2 {
            let Some(handler) = self.handler.get() else {
                return;
            };
            tracing::trace!("rate limit timer armed");
            let new = handler.add_timer(TICK, false);
            let old = self.timer.lock().replace(new);
            if let Some(old) = old {
                handler.stop_timer(old);
            }
        }
    }

    fn on_timer(&self, id: TimerId) {
        let list = self.limiters.lock();
        if self.activity.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
            let mut slot = self.timer.lock();
            if *slot == Some(id) {
                *slot = None;
                if let Some(handler) = self.handler.get() {
                    handler.stop_timer(id);
                }
                tracing::trace!("rate limit timer stopped");
            }
        }
        for node in list.iter() {
            self.process(node);
        }
    }

    pub(crate) fn process(&self, node: &Arc<Node>) {
        let mut locked = lock_tree(node);
        self.process_locked(&mut locked);
        locked.unlock();
    }

    /// One replenishment pass over an already locked subtree: refresh stats,
    /// hand out this tick's tokens, then mop up the overflow.
    pub(crate) fn process_locked(&self, locked: &mut LockedNode) {
        let mut active = false;
        locked.update_stats(&mut active);
        if active {
            self.record_activity();
        }
        for d in 0..2 {
            locked.add_tokens(d, UNLIMITED, UNLIMITED);
            locked.distribute_overflow(d, 0);
        }
    }
}

struct ManagerHandler {
    shared: Arc<ManagerShared>,
}

impl EventHandler for ManagerHandler {
    fn on_event(&mut self, _ctx: &HandlerRef, event: Event) {
        if let Some(timer) = event.downcast_ref::<TimerEvent>() {
            self.shared.on_timer(timer.id);
        }
    }
}

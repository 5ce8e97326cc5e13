//! Hierarchical token buckets.
//!
//! Limits can be nested; every bucket gets a share of tokens proportional to
//! its weight, excess flows to siblings that can absorb it, and the periodic
//! pass touches each descendant exactly once. Attach and detach are O(1).
//!
//! Locking discipline: every node owns a mutex. The periodic pass locks a
//! subtree top-down (parent before children) and unlocks leaves first, which
//! is when consumers blocked on an empty bucket get woken. Detach only ever
//! `try_lock`s the parent, backing off for a millisecond on contention, so
//! it cannot deadlock against a pass in flight.

use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

use crate::manager::ManagerShared;

/// Sentinel rate meaning "no limit".
pub const UNLIMITED: u64 = u64::MAX;

pub(crate) const FREQUENCY: u64 = 5;
/// Replenish period of the manager timer.
pub(crate) const TICK: Duration = Duration::from_millis(1000 / FREQUENCY);

const DETACHED: usize = usize::MAX;
const MAX_OVERFLOW_MULTIPLIER: u64 = 1 << 20;

/// Transfer direction a limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub(crate) fn index(self) -> usize {
        match self {
            Direction::Inbound => 0,
            Direction::Outbound => 1,
        }
    }

    pub(crate) fn from_index(index: usize) -> Self {
        if index == 0 {
            Direction::Inbound
        } else {
            Direction::Outbound
        }
    }
}

/// Hook invoked when a bucket that a consumer was starving on has tokens
/// again. Called while the bucket's lock is held; implementations should
/// only post an event and return.
pub trait BucketWaker: Send + Sync {
    fn wakeup(&self, direction: Direction);
}

pub(crate) type Node = Mutex<NodeState>;
pub(crate) type Guard = ArcMutexGuard<RawMutex, NodeState>;

pub(crate) enum Parent {
    None,
    Manager(Weak<ManagerShared>),
    Limiter(Weak<Node>),
}

pub(crate) struct NodeState {
    pub parent: Parent,
    pub idx: usize,
    pub mgr: Option<Arc<ManagerShared>>,
    pub kind: Kind,
}

pub(crate) enum Kind {
    Limiter(LimiterState),
    Leaf(LeafState),
}

pub(crate) struct LimiterState {
    pub limit: [u64; 2],
    pub children: Vec<Arc<Node>>,
    /// Sum of the children's weights, recomputed every pass.
    pub weight: u64,
    pub unsaturated: [u64; 2],
    /// Indices of children claiming spare capacity, valid within one pass.
    pub scratch: Vec<usize>,
    pub overflow: [u64; 2],
    /// Tokens granted per unit of weight this tick.
    pub merged_tokens: [u64; 2],
    /// Tokens granted beyond the limit earlier, repaid over later ticks.
    pub debt: [u64; 2],
    pub unused_capacity: [u64; 2],
    /// Remainder of the integer division, carried across ticks.
    pub carry: [u64; 2],
}

pub(crate) struct LeafState {
    pub available: [u64; 2],
    pub overflow_multiplier: [u64; 2],
    pub waiting: [bool; 2],
    pub unsaturated: [bool; 2],
    pub bucket_size: [u64; 2],
    pub waker: Option<Arc<dyn BucketWaker>>,
}

fn new_limiter_node() -> Arc<Node> {
    Arc::new(Mutex::new(NodeState {
        parent: Parent::None,
        idx: DETACHED,
        mgr: None,
        kind: Kind::Limiter(LimiterState {
            limit: [UNLIMITED; 2],
            children: Vec::new(),
            weight: 0,
            unsaturated: [0; 2],
            scratch: Vec::new(),
            overflow: [0; 2],
            merged_tokens: [0; 2],
            debt: [0; 2],
            unused_capacity: [0; 2],
            carry: [0; 2],
        }),
    }))
}

fn new_leaf_node(waker: Option<Arc<dyn BucketWaker>>) -> Arc<Node> {
    Arc::new(Mutex::new(NodeState {
        parent: Parent::None,
        idx: DETACHED,
        mgr: None,
        kind: Kind::Leaf(LeafState {
            available: [UNLIMITED; 2],
            overflow_multiplier: [1; 2],
            waiting: [false; 2],
            unsaturated: [false; 2],
            bucket_size: [UNLIMITED; 2],
            waker,
        }),
    }))
}

/// A subtree locked top-down for one consistent pass. Dropping it without
/// [`LockedNode::unlock`] releases the guards in field order, which skips
/// the leaf wakeups; always unlock explicitly.
pub(crate) struct LockedNode {
    pub(crate) guard: Guard,
    pub(crate) children: Vec<LockedNode>,
}

pub(crate) fn lock_tree(node: &Arc<Node>) -> LockedNode {
    let guard = node.lock_arc();
    let child_nodes: Vec<Arc<Node>> = match &guard.kind {
        Kind::Limiter(l) => l.children.clone(),
        Kind::Leaf(_) => Vec::new(),
    };
    let children = child_nodes.iter().map(lock_tree).collect();
    LockedNode { guard, children }
}

impl LockedNode {
    pub(crate) fn weight(&self) -> u64 {
        match &self.guard.kind {
            Kind::Limiter(l) => l.weight,
            Kind::Leaf(_) => 1,
        }
    }

    fn unsaturated(&self, d: usize) -> u64 {
        match &self.guard.kind {
            Kind::Limiter(l) => {
                if l.unused_capacity[d] != 0 {
                    l.unsaturated[d]
                } else {
                    0
                }
            }
            Kind::Leaf(b) => b.unsaturated[d] as u64,
        }
    }

    pub(crate) fn set_mgr(&mut self, mgr: Option<Arc<ManagerShared>>) {
        let same = match (&self.guard.mgr, &mgr) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if same {
            return;
        }
        self.guard.mgr.clone_from(&mgr);
        for child in &mut self.children {
            child.set_mgr(mgr.clone());
        }
    }

    /// Recomputes weights and unsaturated counts bottom-up; flips `active`
    /// when any leaf has a starving consumer.
    pub(crate) fn update_stats(&mut self, active: &mut bool) {
        let LockedNode { guard, children } = self;
        match &mut guard.kind {
            Kind::Limiter(l) => {
                l.weight = 0;
                l.unsaturated = [0, 0];
                for child in children.iter_mut() {
                    child.update_stats(active);
                    l.weight += child.weight();
                    for d in 0..2 {
                        l.unsaturated[d] += child.unsaturated(d);
                    }
                }
            }
            Kind::Leaf(b) => {
                for d in 0..2 {
                    if b.bucket_size[d] == UNLIMITED {
                        b.overflow_multiplier[d] = 1;
                    } else if b.available[d] > b.bucket_size[d] / 2 && b.overflow_multiplier[d] > 1 {
                        b.overflow_multiplier[d] /= 2;
                    } else {
                        b.unsaturated[d] = b.waiting[d];
                        if b.waiting[d] {
                            *active = true;
                        }
                    }
                }
            }
        }
    }

    /// Hands this node its per-tick token grant and pushes the grant down to
    /// the children. Returns the portion the node could not use.
    pub(crate) fn add_tokens(&mut self, d: usize, tokens: u64, limit: u64) -> u64 {
        let LockedNode { guard, children } = self;
        match &mut guard.kind {
            Kind::Leaf(b) => leaf_add_tokens(b, d, tokens, limit),
            Kind::Limiter(l) => {
                if l.weight == 0 {
                    l.merged_tokens[d] = l.limit[d].min(tokens);
                    pay_debt(l, d);
                    return if tokens == UNLIMITED { 0 } else { tokens };
                }

                let mut merged_limit = limit;
                if l.limit[d] != UNLIMITED {
                    let my_limit = (l.carry[d] + l.limit[d]) / l.weight;
                    l.carry[d] = (l.carry[d] + l.limit[d]) % l.weight;
                    if my_limit < merged_limit {
                        merged_limit = my_limit;
                    }
                    l.carry[d] += (merged_limit % FREQUENCY) * l.weight;
                }

                l.merged_tokens[d] = if merged_limit != UNLIMITED {
                    merged_limit / FREQUENCY
                } else {
                    UNLIMITED
                };
                if tokens < l.merged_tokens[d] {
                    l.merged_tokens[d] = tokens;
                }

                pay_debt(l, d);

                if l.limit[d] == UNLIMITED {
                    l.unused_capacity[d] = UNLIMITED;
                } else if l.merged_tokens[d] * l.weight * FREQUENCY < l.limit[d] {
                    l.unused_capacity[d] =
                        (l.limit[d] - l.merged_tokens[d] * l.weight * FREQUENCY) / FREQUENCY;
                } else {
                    l.unused_capacity[d] = 0;
                }

                l.overflow[d] = 0;
                l.scratch.clear();
                let merged = l.merged_tokens[d];
                for (i, child) in children.iter_mut().enumerate() {
                    l.overflow[d] += child.add_tokens(d, merged, merged_limit);
                    if child.unsaturated(d) != 0 {
                        l.scratch.push(i);
                    } else {
                        l.overflow[d] += child.distribute_overflow(d, 0);
                    }
                }
                if l.overflow[d] >= l.unused_capacity[d] {
                    l.unused_capacity[d] = 0;
                } else if l.unused_capacity[d] != UNLIMITED {
                    l.unused_capacity[d] -= l.overflow[d];
                }

                if tokens == UNLIMITED {
                    0
                } else {
                    (tokens - l.merged_tokens[d]) * l.weight
                }
            }
        }
    }

    /// Offers spare tokens to unsaturated descendants, fairly per head and
    /// repeatedly until the pool drains. Returns the externally supplied
    /// overflow that could not be absorbed.
    pub(crate) fn distribute_overflow(&mut self, d: usize, overflow: u64) -> u64 {
        let LockedNode { guard, children } = self;
        match &mut guard.kind {
            Kind::Leaf(b) => leaf_distribute_overflow(b, d, overflow),
            Kind::Limiter(l) => {
                let usable_external = if l.unused_capacity[d] == UNLIMITED {
                    overflow
                } else {
                    overflow.min(l.unused_capacity[d])
                };
                let mut remaining = l.overflow[d] + usable_external;

                loop {
                    let mut size = 0u64;
                    for &idx in &l.scratch {
                        size += children[idx].unsaturated(d);
                    }
                    l.unsaturated[d] = size;

                    if remaining == 0 || l.scratch.is_empty() || size == 0 {
                        break;
                    }

                    let extra = remaining / size;
                    remaining %= size;
                    let mut i = 0;
                    while i < l.scratch.len() {
                        let sub = children[l.scratch[i]].distribute_overflow(d, extra);
                        if sub != 0 {
                            remaining += sub;
                            l.scratch.swap_remove(i);
                        } else {
                            i += 1;
                        }
                    }
                    if extra == 0 {
                        break;
                    }
                }

                if usable_external > remaining {
                    if l.unused_capacity[d] != UNLIMITED {
                        l.unused_capacity[d] -= usable_external - remaining;
                    }
                    l.overflow[d] = 0;
                    remaining + overflow - usable_external
                } else {
                    l.overflow[d] = remaining - usable_external;
                    overflow
                }
            }
        }
    }

    /// Releases the subtree, leaves first. A leaf whose consumer went hungry
    /// and has tokens again fires its wakeup hook on the way out.
    pub(crate) fn unlock(mut self) {
        for child in self.children.drain(..) {
            child.unlock();
        }
        if let Kind::Leaf(b) = &mut self.guard.kind {
            for d in 0..2 {
                if b.waiting[d] && b.available[d] > 0 {
                    b.waiting[d] = false;
                    if let Some(waker) = b.waker.clone() {
                        waker.wakeup(Direction::from_index(d));
                    }
                }
            }
        }
    }
}

fn pay_debt(l: &mut LimiterState, d: usize) {
    if l.merged_tokens[d] != UNLIMITED {
        let weight = l.weight.max(1);
        let reduction = l.merged_tokens[d].min(l.debt[d] / weight);
        l.merged_tokens[d] -= reduction;
        l.debt[d] -= reduction;
    } else {
        l.debt[d] = 0;
    }
}

fn leaf_add_tokens(b: &mut LeafState, d: usize, tokens: u64, limit: u64) -> u64 {
    if limit == UNLIMITED {
        b.bucket_size[d] = UNLIMITED;
        b.available[d] = UNLIMITED;
        return 0;
    }

    b.bucket_size[d] = limit.saturating_mul(b.overflow_multiplier[d]);
    if b.available[d] == UNLIMITED {
        b.available[d] = tokens;
        0
    } else if b.bucket_size[d] < b.available[d] {
        b.available[d] = b.bucket_size[d];
        tokens
    } else {
        let mut capacity = b.bucket_size[d] - b.available[d];
        if capacity < tokens && b.unsaturated[d] {
            b.unsaturated[d] = false;
            if b.overflow_multiplier[d] < MAX_OVERFLOW_MULTIPLIER {
                capacity += b.bucket_size[d];
                b.bucket_size[d] *= 2;
                b.overflow_multiplier[d] *= 2;
            }
        }
        let added = tokens.min(capacity);
        b.available[d] += added;
        tokens - added
    }
}

fn leaf_distribute_overflow(b: &mut LeafState, d: usize, tokens: u64) -> u64 {
    if b.available[d] == UNLIMITED {
        return 0;
    }

    let mut capacity = b.bucket_size[d] - b.available[d];
    if capacity < tokens && b.unsaturated[d] {
        b.unsaturated[d] = false;
        if b.overflow_multiplier[d] < MAX_OVERFLOW_MULTIPLIER {
            capacity += b.bucket_size[d];
            b.bucket_size[d] *= 2;
            b.overflow_multiplier[d] *= 2;
        }
    }
    let added = tokens.min(capacity);
    b.available[d] += added;
    tokens - added
}

/// Unlinks `node` from whatever parent it is attached to. Safe to call at
/// any time, including against a replenishment pass holding parts of the
/// tree; idempotent.
pub(crate) fn detach(node: &Arc<Node>) {
    loop {
        let mut state = node.lock();
        if state.idx == DETACHED || matches!(state.parent, Parent::None) {
            state.parent = Parent::None;
            state.idx = DETACHED;
            return;
        }

        let unlinked = match &state.parent {
            Parent::None => true,
            Parent::Manager(weak) => match weak.upgrade() {
                None => true,
                Some(mgr) => match mgr.limiters.try_lock() {
                    Some(mut list) => {
                        unlink_from(&mut list, node, state.idx);
                        true
                    }
                    None => false,
                },
            },
            Parent::Limiter(weak) => match weak.upgrade() {
                None => true,
                Some(parent) => match parent.try_lock() {
                    Some(mut parent_state) => {
                        if let Kind::Limiter(l) = &mut parent_state.kind {
                            unlink_from(&mut l.children, node, state.idx);
                        }
                        true
                    }
                    None => false,
                },
            },
        };

        if unlinked {
            state.parent = Parent::None;
            state.idx = DETACHED;
            return;
        }

        // Contention with a top-down pass; back off and retry.
        drop(state);
        thread::sleep(Duration::from_millis(1));
    }
}

/// Swap-removes `node` at `idx`, fixing the moved sibling's back-index.
fn unlink_from(list: &mut Vec<Arc<Node>>, node: &Arc<Node>, idx: usize) {
    if let Some(last) = list.last().cloned() {
        if !Arc::ptr_eq(&last, node) {
            last.lock().idx = idx;
            list[idx] = last;
        }
    }
    list.pop();
}

/// An aggregate node: children share this node's per-direction limits, each
/// receiving a weight-proportional cut plus whatever its siblings leave
/// unused.
pub struct RateLimiter {
    pub(crate) node: Arc<Node>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            node: new_limiter_node(),
        }
    }

    /// Sets the per-direction limits in bytes per second; [`UNLIMITED`]
    /// disables a direction's cap. Re-tightening only clamps the current
    /// grant, it creates no new debt.
    pub fn set_limits(&self, inbound: u64, outbound: u64) {
        let mut state = self.node.lock();
        let state = &mut *state;
        let Kind::Limiter(l) = &mut state.kind else {
            return;
        };
        let mut changed = do_set_limit(l, 0, inbound);
        changed |= do_set_limit(l, 1, outbound);
        if changed {
            if let Some(mgr) = &state.mgr {
                mgr.record_activity();
            }
        }
    }

    pub fn limit(&self, direction: Direction) -> u64 {
        let state = self.node.lock();
        match &state.kind {
            Kind::Limiter(l) => l.limit[direction.index()],
            Kind::Leaf(_) => UNLIMITED,
        }
    }

    /// Attaches a child limiter, detaching it from any previous parent.
    pub fn add_limiter(&self, child: &RateLimiter) {
        self.attach(&child.node);
    }

    /// Attaches a leaf bucket, detaching it from any previous parent.
    pub fn add_bucket(&self, child: &Bucket) {
        self.attach(&child.node);
    }

    fn attach(&self, child: &Arc<Node>) {
        if Arc::ptr_eq(child, &self.node) {
            return;
        }
        detach(child);

        let mut state = self.node.lock();
        let state = &mut *state;
        let mut locked = lock_tree(child);

        locked.set_mgr(state.mgr.clone());
        locked.guard.parent = Parent::Limiter(Arc::downgrade(&self.node));

        let Kind::Limiter(l) = &mut state.kind else {
            locked.unlock();
            return;
        };
        locked.guard.idx = l.children.len();
        l.children.push(Arc::clone(child));

        let mut active = false;
        locked.update_stats(&mut active);
        if active {
            if let Some(mgr) = &state.mgr {
                mgr.record_activity();
            }
        }

        let child_weight = locked.weight().max(1);
        l.weight += child_weight;

        // A freshly attached bucket gets half a tick's worth up front; the
        // grant is recorded as debt so it does not double-dip on the next
        // pass.
        for d in 0..2 {
            let tokens = if l.merged_tokens[d] == UNLIMITED {
                UNLIMITED
            } else {
                l.merged_tokens[d] / (child_weight * 2)
            };
            locked.add_tokens(d, tokens, tokens);
            locked.distribute_overflow(d, 0);
            if tokens != UNLIMITED {
                l.debt[d] += tokens * child_weight;
            }
        }

        locked.unlock();
    }

    /// Detaches this limiter from its parent. Idempotent.
    pub fn remove(&self) {
        detach(&self.node);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        {
            let mut state = self.node.lock();
            if let Kind::Limiter(l) = &mut state.kind {
                for child in l.children.drain(..) {
                    let mut child_state = child.lock();
                    child_state.parent = Parent::None;
                    child_state.idx = DETACHED;
                }
            }
        }
        detach(&self.node);
    }
}

fn do_set_limit(l: &mut LimiterState, d: usize, limit: u64) -> bool {
    if l.limit[d] == limit {
        return false;
    }
    l.limit[d] = limit;
    let weight = l.weight.max(1);
    if limit != UNLIMITED {
        l.merged_tokens[d] = l.merged_tokens[d].min(limit / weight);
    }
    true
}

/// A consumable token reservoir, one per direction.
///
/// `available`/`consume` are the application-facing calls: a reader asks how
/// many tokens it may spend, performs a transfer clamped to that, and
/// charges the actual amount. When `available` returns zero the consumer
/// must suspend; the bucket marks itself waiting and the waker fires once
/// tokens arrive.
pub struct Bucket {
    pub(crate) node: Arc<Node>,
}

impl Bucket {
    pub fn new() -> Self {
        Self {
            node: new_leaf_node(None),
        }
    }

    pub fn with_waker(waker: Arc<dyn BucketWaker>) -> Self {
        Self {
            node: new_leaf_node(Some(waker)),
        }
    }

    /// Tokens currently spendable in `direction`; [`UNLIMITED`] when no
    /// limiter caps this bucket. Returning zero marks the bucket waiting and
    /// nudges the manager to resume replenishment.
    pub fn available(&self, direction: Direction) -> u64 {
        let d = direction.index();
        let mut state = self.node.lock();
        let state = &mut *state;
        let Kind::Leaf(b) = &mut state.kind else {
            return UNLIMITED;
        };
        if b.available[d] == 0 {
            b.waiting[d] = true;
            if let Some(mgr) = &state.mgr {
                mgr.record_activity();
            }
        }
        b.available[d]
    }

    /// Charges `amount` tokens against `direction`.
    pub fn consume(&self, direction: Direction, amount: u64) {
        if amount == 0 {
            return;
        }
        let d = direction.index();
        let mut state = self.node.lock();
        let state = &mut *state;
        let Kind::Leaf(b) = &mut state.kind else {
            return;
        };
        if b.available[d] != UNLIMITED {
            if let Some(mgr) = &state.mgr {
                mgr.record_activity();
            }
            b.available[d] = b.available[d].saturating_sub(amount);
        }
    }

    /// Detaches this bucket from its parent. Idempotent.
    pub fn remove(&self) {
        detach(&self.node);
    }
}

impl Default for Bucket {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Bucket {
    fn drop(&mut self) {
        detach(&self.node);
    }
}

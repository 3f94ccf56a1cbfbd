//! Removal policies
//!
//! Decide which indexed slot a full backend evicts next. A policy only
//! tracks slots this process wrote or rebuilt; anything else is reached by
//! the slot map's own purge scan.

use lru::LruCache;

use crate::config::RemovalPolicyKind;
use crate::entry::SlotId;

/// Eviction ordering over the slots of one backend
pub trait RemovalPolicy: Send {
    /// Start tracking a newly stored slot
    fn add(&mut self, slot: SlotId);

    /// Stop tracking a slot (freed or overwritten)
    fn remove(&mut self, slot: SlotId);

    /// A reader started using the slot
    fn referenced(&mut self, slot: SlotId);

    /// A reader finished with the slot
    fn dereferenced(&mut self, slot: SlotId);

    /// Next eviction candidate; the caller removes it once evicted
    fn pick_victim(&mut self) -> Option<SlotId>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn name(&self) -> &'static str;
}

/// Insertion-ordered queue; with `promote_on_reference` it behaves as LRU
pub struct QueuePolicy {
    order: LruCache<SlotId, ()>,
    promote_on_reference: bool,
}

impl QueuePolicy {
    pub fn lru() -> Self {
        Self {
            order: LruCache::unbounded(),
            promote_on_reference: true,
        }
    }

    pub fn fifo() -> Self {
        Self {
            order: LruCache::unbounded(),
            promote_on_reference: false,
        }
    }
}

impl RemovalPolicy for QueuePolicy {
    fn add(&mut self, slot: SlotId) {
        self.order.put(slot, ());
    }

    fn remove(&mut self, slot: SlotId) {
        self.order.pop(&slot);
    }

    fn referenced(&mut self, slot: SlotId) {
        if self.promote_on_reference {
            self.order.promote(&slot);
        }
    }

    fn dereferenced(&mut self, slot: SlotId) {
        if self.promote_on_reference {
            self.order.promote(&slot);
        }
    }

    fn pick_victim(&mut self) -> Option<SlotId> {
        self.order.peek_lru().map(|(slot, _)| *slot)
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn name(&self) -> &'static str {
        if self.promote_on_reference {
            "lru"
        } else {
            "fifo"
        }
    }
}

/// Build the configured policy
pub fn build(kind: RemovalPolicyKind) -> Box<dyn RemovalPolicy> {
    match kind {
        RemovalPolicyKind::Lru => Box::new(QueuePolicy::lru()),
        RemovalPolicyKind::Fifo => Box::new(QueuePolicy::fifo()),
    }
}

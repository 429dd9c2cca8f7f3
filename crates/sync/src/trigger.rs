//! Per-application trigger queue. Ticks, source changes, drift and refresh requests all land
//! here; duplicates coalesce so a burst of events becomes one pass.

use std::collections::VecDeque;
use std::mem::discriminant;
use std::sync::Mutex;

use rustc_hash::FxHashMap;
use tokio::sync::Notify;

use crate::policy::Trigger;

/// Coalescing key: one slot per trigger kind, except drift which keeps one per resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Slot {
    Kind(std::mem::Discriminant<Trigger>),
    Drift(keel_core::ResourceId),
}

fn slot(t: &Trigger) -> Slot {
    match t {
        Trigger::Drift(id) => Slot::Drift(id.clone()),
        other => Slot::Kind(discriminant(other)),
    }
}

/// FIFO of distinct triggers with a fixed capacity. A later trigger with the same slot replaces
/// the earlier one in place (the newest source revision wins).
pub struct Coalescer {
    map: FxHashMap<Slot, Trigger>,
    order: VecDeque<Slot>,
    cap: usize,
    dropped: u64,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1), dropped: 0 }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn dropped(&self) -> u64 { self.dropped }

    /// Over capacity the oldest drift slot is evicted. Interval, source change and refresh
    /// slots are never dropped (there is at most one of each); a drift trigger arriving when
    /// no drift slot can make room is dropped itself.
    pub fn push(&mut self, t: Trigger) {
        let key = slot(&t);
        if !self.map.contains_key(&key) {
            if self.order.len() >= self.cap {
                match self.order.iter().position(|k| matches!(k, Slot::Drift(_))) {
                    Some(i) => {
                        if let Some(old) = self.order.remove(i) { self.map.remove(&old); }
                        self.dropped += 1;
                    }
                    None if matches!(key, Slot::Drift(_)) => {
                        self.dropped += 1;
                        return;
                    }
                    None => {}
                }
            }
            self.order.push_back(key.clone());
        }
        self.map.insert(key, t);
    }

    pub fn drain_ready(&mut self) -> Vec<Trigger> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(k) = self.order.pop_front() {
            if let Some(t) = self.map.remove(&k) { out.push(t); }
        }
        out
    }
}

/// [`Coalescer`] plus a wakeup for the application's worker.
pub struct TriggerQueue {
    pending: Mutex<Coalescer>,
    notify: Notify,
}

impl TriggerQueue {
    pub fn new(cap: usize) -> Self { Self { pending: Mutex::new(Coalescer::with_capacity(cap)), notify: Notify::new() } }

    pub fn push(&self, t: Trigger) {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).push(t);
        self.notify.notify_one();
    }

    pub fn drain(&self) -> Vec<Trigger> { self.pending.lock().unwrap_or_else(|p| p.into_inner()).drain_ready() }

    /// Resolves once something was pushed since the last wakeup.
    pub async fn notified(&self) { self.notify.notified().await }
}

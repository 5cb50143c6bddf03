//! Shared flow table with tick-based idle accounting
//!
//! # Design
//!
//! Flows and their idle counters sit in one `HashMap` behind a single
//! `parking_lot::Mutex`. A datagram arriving (`touch`) and the sweeper
//! decrementing (`sweep`) both take that lock, so a flow that just saw
//! traffic can never be evicted on a stale counter.
//!
//! Closing happens after the lock is released. Flows make their own close
//! idempotent (see [`ManagedFlow`]), so a flow torn down by an I/O error
//! and by the sweeper at the same time is still closed once.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::FlowId;

/// Default number of sweep intervals a flow may stay idle
pub const DEFAULT_IDLE_TICKS: u32 = 360;

/// A flow owned by the table.
///
/// Both methods must be idempotent and must not block.
pub trait ManagedFlow: Send + Sync {
    /// Release only the proxy-side connection. Used when a newer flow takes
    /// over the same identity and inherits the stack-side handle.
    fn release_proxy(&self);

    /// Close the proxy connection and the stack-side handle.
    fn close(&self);
}

#[derive(Debug)]
struct Entry<F> {
    flow: Arc<F>,
    ticks: u32,
}

/// Concurrency-safe registry of live flows.
#[derive(Debug)]
pub struct FlowTable<F> {
    entries: Mutex<HashMap<FlowId, Entry<F>>>,
    ceiling: u32,
}

impl<F: ManagedFlow> FlowTable<F> {
    /// Create a table whose flows expire after `ceiling` idle sweeps.
    #[must_use]
    pub fn new(ceiling: u32) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ceiling: ceiling.max(1),
        }
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Insert `flow` under `id`, replacing any existing entry.
    ///
    /// A replaced flow has its proxy connection released before this
    /// returns; the previous flow is handed back to the caller.
    pub fn upsert(&self, id: FlowId, flow: Arc<F>) -> Option<Arc<F>> {
        let previous = {
            let mut entries = self.entries.lock();
            entries
                .insert(
                    id,
                    Entry {
                        flow,
                        ticks: self.ceiling,
                    },
                )
                .map(|e| e.flow)
        };

        if let Some(old) = &previous {
            debug!(flow = %id, "replacing flow, releasing previous proxy connection");
            old.release_proxy();
        }
        previous
    }

    /// Insert `flow` unless an entry already exists; returns whichever flow
    /// ends up in the table and whether it was inserted.
    pub fn get_or_insert_with(&self, id: FlowId, make: impl FnOnce() -> Arc<F>) -> (Arc<F>, bool) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&id) {
            entry.ticks = self.ceiling;
            return (Arc::clone(&entry.flow), false);
        }
        let flow = make();
        entries.insert(
            id,
            Entry {
                flow: Arc::clone(&flow),
                ticks: self.ceiling,
            },
        );
        (flow, true)
    }

    pub fn get(&self, id: &FlowId) -> Option<Arc<F>> {
        self.entries.lock().get(id).map(|e| Arc::clone(&e.flow))
    }

    /// Reset the idle counter of `id` to the ceiling. Returns `false` when
    /// the flow is no longer in the table.
    pub fn touch(&self, id: &FlowId) -> bool {
        match self.entries.lock().get_mut(id) {
            Some(entry) => {
                entry.ticks = self.ceiling;
                true
            }
            None => false,
        }
    }

    /// Remaining idle ticks for `id`
    pub fn ticks_remaining(&self, id: &FlowId) -> Option<u32> {
        self.entries.lock().get(id).map(|e| e.ticks)
    }

    /// Remove `id` only while it still maps to this exact `flow`, so a stale
    /// teardown cannot evict a replacement.
    pub fn remove_if_same(&self, id: &FlowId, flow: &Arc<F>) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(id) {
            Some(entry) if Arc::ptr_eq(&entry.flow, flow) => {
                entries.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Remove `id` from the table and close it.
    pub fn close(&self, id: &FlowId) -> bool {
        let removed = self.entries.lock().remove(id);
        match removed {
            Some(entry) => {
                entry.flow.close();
                true
            }
            None => false,
        }
    }

    /// Age every entry by one tick; entries reaching zero are removed and
    /// closed. Returns the identities evicted.
    pub fn sweep(&self) -> Vec<FlowId> {
        let expired: Vec<(FlowId, Arc<F>)> = {
            let mut entries = self.entries.lock();
            let mut expired = Vec::new();
            entries.retain(|id, entry| {
                entry.ticks = entry.ticks.saturating_sub(1);
                if entry.ticks == 0 {
                    expired.push((*id, Arc::clone(&entry.flow)));
                    false
                } else {
                    true
                }
            });
            expired
        };

        for (id, flow) in &expired {
            trace!(flow = %id, "idle flow expired");
            flow.close();
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "swept idle flows");
        }
        expired.into_iter().map(|(id, _)| id).collect()
    }

    /// Remove and close every flow.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Arc<F>> = self.entries.lock().drain().map(|(_, e)| e.flow).collect();
        for flow in &drained {
            flow.close();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

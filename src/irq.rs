//! Edge-interrupt plumbing.
//!
//! Handlers are registered once at init as `(line, edge, handler)` rows and
//! dispatched by [`IrqTable::dispatch`]. Data handed from interrupt context
//! to the cooperative loop goes through an [`EdgeCell`]: the producer writes
//! the payload and then publishes its sequence number (Release); the
//! consumer reads the sequence (Acquire), the payload, then re-checks it.

use log::trace;
use std::sync::atomic::{fence, AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
}

/// Input lines known to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    ReferencePps,
    GnssPps,
    ZeroCross,
}

type Handler = Box<dyn FnMut(u64) + Send>;

struct Registration {
    line: Line,
    edge: Edge,
    handler: Handler,
}

/// Static table of edge handlers, built at startup.
#[derive(Default)]
pub struct IrqTable {
    rows: Vec<Registration>,
}

impl IrqTable {
    pub fn new() -> Self {
        IrqTable { rows: Vec::new() }
    }

    pub fn register<F>(&mut self, line: Line, edge: Edge, handler: F)
    where
        F: FnMut(u64) + Send + 'static,
    {
        self.rows.push(Registration {
            line,
            edge,
            handler: Box::new(handler),
        });
    }

    /// Run every handler bound to `(line, edge)`. Returns how many ran.
    pub fn dispatch(&mut self, line: Line, edge: Edge, now_us: u64) -> usize {
        let mut ran = 0;
        for row in self.rows.iter_mut().filter(|r| r.line == line && r.edge == edge) {
            (row.handler)(now_us);
            ran += 1;
        }
        if ran == 0 {
            trace!("[IRQ] Spurious {:?} edge on {:?}", edge, line);
        }
        ran
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Single-producer/single-consumer edge capture cell.
///
/// `seq` is odd while the producer is writing. The consumer remembers the
/// last sequence it took, so "data ready" is `seq != taken`.
#[derive(Debug, Default)]
pub struct EdgeCell {
    seq: AtomicU64,
    taken: AtomicU64,
    timestamp_us: AtomicU64,
    cycles: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturedEdge {
    pub timestamp_us: u64,
    pub cycles: u64,
    pub count: u64,
}

impl EdgeCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Producer side (interrupt context): payload first, ready last.
    pub fn publish(&self, timestamp_us: u64, cycles: u64) {
        self.seq.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::Release);
        self.timestamp_us.store(timestamp_us, Ordering::Relaxed);
        self.cycles.store(cycles, Ordering::Relaxed);
        self.seq.fetch_add(1, Ordering::Release);
    }

    /// Consumer side: flag, payload, flag re-check. Returns each edge once;
    /// `None` if nothing new or the producer was mid-write (the next call
    /// picks it up).
    pub fn take(&self) -> Option<CapturedEdge> {
        let s1 = self.seq.load(Ordering::Acquire);
        if s1 == self.taken.load(Ordering::Relaxed) || s1 & 1 == 1 {
            return None;
        }
        let timestamp_us = self.timestamp_us.load(Ordering::Relaxed);
        let cycles = self.cycles.load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        if self.seq.load(Ordering::Relaxed) != s1 {
            return None;
        }
        self.taken.store(s1, Ordering::Relaxed);
        Some(CapturedEdge {
            timestamp_us,
            cycles,
            count: s1 / 2,
        })
    }

    /// Edges published so far.
    pub fn count(&self) -> u64 {
        self.seq.load(Ordering::Acquire) / 2
    }
}

//! Live-resource accounting for engine-issued images and templates.
//!
//! Every [`ImageHandle`](crate::ImageHandle) and [`Template`](crate::Template)
//! holds a [`LedgerToken`]. Issuing a token increments the counter for its
//! kind; dropping it decrements. A pipeline that leaves the ledger where it
//! found it released everything it obtained.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Image,
    Template,
}

#[derive(Debug, Default)]
pub struct ResourceLedger {
    images: AtomicUsize,
    templates: AtomicUsize,
}

impl ResourceLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn live_images(&self) -> usize {
        self.images.load(Ordering::SeqCst)
    }

    pub fn live_templates(&self) -> usize {
        self.templates.load(Ordering::SeqCst)
    }

    /// True when no image or template issued against this ledger is alive.
    pub fn is_quiescent(&self) -> bool {
        self.live_images() == 0 && self.live_templates() == 0
    }

    pub fn issue(self: &Arc<Self>, kind: ResourceKind) -> LedgerToken {
        self.counter(kind).fetch_add(1, Ordering::SeqCst);
        LedgerToken {
            ledger: Arc::clone(self),
            kind,
        }
    }

    fn counter(&self, kind: ResourceKind) -> &AtomicUsize {
        match kind {
            ResourceKind::Image => &self.images,
            ResourceKind::Template => &self.templates,
        }
    }
}

/// Proof of one live resource. Released exactly once, on drop.
#[derive(Debug)]
pub struct LedgerToken {
    ledger: Arc<ResourceLedger>,
    kind: ResourceKind,
}

impl LedgerToken {
    /// Issue a fresh token of the same kind against the same ledger.
    pub fn reissue(&self) -> LedgerToken {
        self.ledger.issue(self.kind)
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }
}

impl Drop for LedgerToken {
    fn drop(&mut self) {
        self.ledger.counter(self.kind).fetch_sub(1, Ordering::SeqCst);
    }
}

//! Per-module callback registration table.

use crate::frame::FrameEnvelope;
use crate::types::{Context, EventKind, HandlerId};
use crate::{BridgeError, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Error type foreign handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Foreign code called synchronously for every delivered envelope.
///
/// Implemented for closures `Fn(FrameEnvelope) -> Result<(), HandlerError>`.
pub trait FrameHandler: Send + Sync {
    fn on_frame(&self, envelope: FrameEnvelope) -> std::result::Result<(), HandlerError>;
}

impl<F> FrameHandler for F
where
    F: Fn(FrameEnvelope) -> std::result::Result<(), HandlerError> + Send + Sync,
{
    fn on_frame(&self, envelope: FrameEnvelope) -> std::result::Result<(), HandlerError> {
        self(envelope)
    }
}

/// Why a queue refused an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("queue full")]
    Full,
    #[error("queue closed")]
    Closed,
}

/// Foreign queue fed without blocking by the dispatching thread.
pub trait FrameQueue: Send + Sync {
    /// Enqueue `envelope` or fail immediately. Must never block.
    fn try_enqueue(&self, envelope: FrameEnvelope) -> std::result::Result<(), EnqueueError>;
}

impl FrameQueue for crossbeam_channel::Sender<FrameEnvelope> {
    fn try_enqueue(&self, envelope: FrameEnvelope) -> std::result::Result<(), EnqueueError> {
        self.try_send(envelope).map_err(|e| match e {
            crossbeam_channel::TrySendError::Full(_) => EnqueueError::Full,
            crossbeam_channel::TrySendError::Disconnected(_) => EnqueueError::Closed,
        })
    }
}

/// Async consumers read the receiving half as a `Stream`. The channel is
/// unbounded, so only a dropped receiver refuses an envelope.
impl FrameQueue for futures::channel::mpsc::UnboundedSender<FrameEnvelope> {
    fn try_enqueue(&self, envelope: FrameEnvelope) -> std::result::Result<(), EnqueueError> {
        self.unbounded_send(envelope).map_err(|_| EnqueueError::Closed)
    }
}

/// How envelopes reach the foreign side for one registration.
#[derive(Clone)]
pub enum Delivery {
    /// Call the handler on the dispatching thread and wait for it.
    Direct(Arc<dyn FrameHandler>),
    /// Hand the envelope to a queue and return immediately.
    Queued(Arc<dyn FrameQueue>),
}

impl Delivery {
    pub fn direct(handler: impl FrameHandler + 'static) -> Delivery {
        Delivery::Direct(Arc::new(handler))
    }

    /// Direct delivery to a closure.
    pub fn from_fn<F>(handler: F) -> Delivery
    where
        F: Fn(FrameEnvelope) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        Delivery::Direct(Arc::new(handler))
    }

    pub fn queued(queue: impl FrameQueue + 'static) -> Delivery {
        Delivery::Queued(Arc::new(queue))
    }
}

/// Delivery counters of one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandlerStats {
    pub delivered: u64,
    /// Envelopes a full queue refused.
    pub dropped: u64,
    pub failed: u64,
}

pub(crate) struct Registration {
    pub(crate) id: HandlerId,
    pub(crate) event: EventKind,
    pub(crate) context: Context,
    pub(crate) delivery: Delivery,
    active: AtomicBool,
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl Registration {
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn stats(&self) -> HandlerStats {
        HandlerStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

struct Table {
    next_id: HandlerId,
    entries: BTreeMap<HandlerId, Arc<Registration>>,
}

/// Table of live registrations on one module, keyed by handler id.
///
/// The table is locked internally, so connect and disconnect may race from
/// any thread. No foreign code ever runs while the lock is held: dispatch
/// works on a snapshot, and a disconnected registration is flagged inactive
/// so a snapshot taken before the disconnect skips it.
pub struct CallbackRegistry {
    table: Mutex<Table>,
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                next_id: 1,
                entries: BTreeMap::new(),
            }),
        }
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a subscription and return its id.
    pub fn connect(&self, event: EventKind, context: Context, delivery: Delivery) -> HandlerId {
        let mut table = self.table();
        let id = table.next_id;
        table.next_id += 1;
        table.entries.insert(
            id,
            Arc::new(Registration {
                id,
                event,
                context,
                delivery,
                active: AtomicBool::new(true),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        );
        id
    }

    /// Remove a subscription. A delivery already running for it completes,
    /// no new one starts.
    pub fn disconnect(&self, id: HandlerId) -> Result<()> {
        let removed = self.table().entries.remove(&id);
        match removed {
            Some(registration) => {
                registration.deactivate();
                Ok(())
            }
            None => Err(BridgeError::UnknownHandler(id)),
        }
    }

    pub fn is_registered(&self, id: HandlerId) -> bool {
        self.table().entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.table().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self, id: HandlerId) -> Option<HandlerStats> {
        self.table().entries.get(&id).map(|r| r.stats())
    }

    /// Active registrations for `event`, in connect order.
    pub(crate) fn snapshot(&self, event: EventKind) -> Vec<Arc<Registration>> {
        self.table()
            .entries
            .values()
            .filter(|r| r.event == event)
            .cloned()
            .collect()
    }

    /// Drop every registration. Ids are not reset.
    pub(crate) fn clear(&self) -> usize {
        let drained = std::mem::take(&mut self.table().entries);
        for registration in drained.values() {
            registration.deactivate();
        }
        drained.len()
    }
}

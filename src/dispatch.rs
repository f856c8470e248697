//! Routing of native callbacks to registered handlers.
//!
//! The native SDK fires callbacks on the thread that called `update` or
//! `wait_update`. [`Dispatcher`] receives them there, suppresses frames that
//! were already delivered through the other entry point, and fans each frame
//! out to the module's registrations in connect order.

use crate::error::panic_message;
use crate::frame::FrameEnvelope;
use crate::handle::ModuleInner;
use crate::native::{EventSink, NativeFrame, NativeModuleId};
use crate::registry::{Delivery, EnqueueError, Registration};
use crate::session::SessionCore;
use crate::types::{EventKind, HandlerId};
use crate::{BridgeError, Result};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

thread_local! {
    static DRIVING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as driving the native SDK.
///
/// Handlers run inside this scope, so a handler that calls back into
/// `update`, `wait_update` or `release` is detected and rejected instead of
/// deadlocking the native SDK.
pub(crate) struct DriveScope(());

impl DriveScope {
    /// Returns `None` if this thread is already driving.
    pub(crate) fn enter() -> Option<DriveScope> {
        DRIVING.with(|flag| {
            if flag.get() {
                None
            } else {
                flag.set(true);
                Some(DriveScope(()))
            }
        })
    }
}

impl Drop for DriveScope {
    fn drop(&mut self) {
        DRIVING.with(|flag| flag.set(false));
    }
}

/// Whether the current thread is inside `update` or `wait_update`.
pub(crate) fn is_driving() -> bool {
    DRIVING.with(Cell::get)
}

/// Outcome of one `update` or `wait_update` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Callbacks the native SDK fired.
    pub events: usize,
    /// Envelopes handed to handlers or queues.
    pub delivered: usize,
    /// Envelopes refused by full queues.
    pub dropped: usize,
    /// Frames already delivered by an earlier call.
    pub duplicates: usize,
    /// Frames older than one already delivered. They are never delivered.
    pub out_of_order: usize,
    /// Events that arrived after the session stopped being live.
    pub skipped: usize,
    failures: Vec<(HandlerId, String)>,
}

impl DispatchReport {
    /// Handlers that failed during this call, with their error text.
    pub fn failures(&self) -> &[(HandlerId, String)] {
        &self.failures
    }

    pub(crate) fn into_result(self) -> Result<DispatchReport> {
        match self.failures.first() {
            None => Ok(self),
            Some((handler, message)) => Err(BridgeError::Dispatch {
                handler: *handler,
                message: message.clone(),
                failures: self.failures.len(),
            }),
        }
    }
}

enum Outcome {
    Delivered,
    Dropped,
    Failed(String),
}

/// [`EventSink`] handed to the native SDK for one update call.
pub(crate) struct Dispatcher<'a> {
    core: &'a SessionCore,
    report: DispatchReport,
}

impl<'a> Dispatcher<'a> {
    pub(crate) fn new(core: &'a SessionCore) -> Self {
        Self {
            core,
            report: DispatchReport::default(),
        }
    }

    pub(crate) fn finish(self) -> DispatchReport {
        self.report
    }
}

impl EventSink for Dispatcher<'_> {
    fn deliver(&mut self, module: NativeModuleId, event: EventKind, frame: Arc<dyn NativeFrame>) {
        self.report.events += 1;
        let Some(_busy) = self.core.begin_dispatch() else {
            self.report.skipped += 1;
            log::debug!("Session released, dropping {} event for module {}", event, module);
            return;
        };
        match self.core.module(module) {
            Some(inner) => dispatch_event(&inner, event, frame, &mut self.report),
            None => log::debug!("Ignoring {} event for unknown module {}", event, module),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Admission {
    New,
    /// The same frame again, as SDKs that repeat callbacks do.
    Duplicate,
    /// An older frame behind a newer one that was already delivered.
    OutOfOrder { last: u64 },
}

/// Advance the cursor of `event` if `sequence` is newer than the last delivered frame.
fn admit(cursors: &mut BTreeMap<EventKind, u64>, event: EventKind, sequence: u64) -> Admission {
    match cursors.get(&event) {
        Some(&last) if sequence == last => Admission::Duplicate,
        Some(&last) if sequence < last => Admission::OutOfOrder { last },
        _ => {
            cursors.insert(event, sequence);
            Admission::New
        }
    }
}

fn dispatch_event(
    module: &ModuleInner,
    event: EventKind,
    frame: Arc<dyn NativeFrame>,
    report: &mut DispatchReport,
) {
    // Held for the whole fan-out so concurrent update/wait_update calls
    // deliver each module's frames in sequence order.
    let mut cursors = module.lock_cursors();
    let sequence = frame.sequence();
    match admit(&mut cursors, event, sequence) {
        Admission::New => {}
        Admission::Duplicate => {
            report.duplicates += 1;
            log::trace!(
                "{} {} frame {} already delivered",
                module.kind,
                event,
                sequence
            );
            return;
        }
        Admission::OutOfOrder { last } => {
            report.out_of_order += 1;
            log::warn!(
                "{} {} frame {} arrived after frame {}, not delivered",
                module.kind,
                event,
                sequence,
                last
            );
            return;
        }
    }

    for registration in module.registry.snapshot(event) {
        if !registration.is_active() {
            continue;
        }
        let envelope = FrameEnvelope::new(
            Arc::clone(&frame),
            module.kind,
            event,
            registration.id,
            registration.context,
        );
        match deliver(&registration, envelope) {
            Outcome::Delivered => {
                registration.record_delivered();
                report.delivered += 1;
            }
            Outcome::Dropped => {
                registration.record_dropped();
                report.dropped += 1;
                log::trace!(
                    "Queue of handler {} full, dropping {} frame {}",
                    registration.id,
                    module.kind,
                    sequence
                );
            }
            Outcome::Failed(message) => {
                registration.record_failed();
                log::warn!(
                    "Handler {} failed on {} {} frame {}: {}",
                    registration.id,
                    module.kind,
                    event,
                    sequence,
                    message
                );
                report.failures.push((registration.id, message));
            }
        }
    }
}

fn deliver(registration: &Registration, envelope: FrameEnvelope) -> Outcome {
    match &registration.delivery {
        Delivery::Direct(handler) => {
            match panic::catch_unwind(AssertUnwindSafe(|| handler.on_frame(envelope))) {
                Ok(Ok(())) => Outcome::Delivered,
                Ok(Err(e)) => Outcome::Failed(e.to_string()),
                Err(payload) => {
                    Outcome::Failed(format!("handler panicked: {}", panic_message(payload.as_ref())))
                }
            }
        }
        Delivery::Queued(queue) => match queue.try_enqueue(envelope) {
            Ok(()) => Outcome::Delivered,
            Err(EnqueueError::Full) => Outcome::Dropped,
            Err(EnqueueError::Closed) => Outcome::Failed(EnqueueError::Closed.to_string()),
        },
    }
}

use crate::error::{guard, Operation};
use crate::frame::FrameEnvelope;
use crate::native::NativeModuleId;
use crate::registry::{CallbackRegistry, Delivery, FrameQueue, HandlerError, HandlerStats};
use crate::session::SessionCore;
use crate::types::{Context, EventKind, HandlerId, ModuleKind};
use crate::{BridgeError, Result};
use futures::channel::mpsc::{self, UnboundedReceiver};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Shared state of one native module instance.
pub(crate) struct ModuleInner {
    pub(crate) id: NativeModuleId,
    pub(crate) kind: ModuleKind,
    /// Session generation the module was created in.
    pub(crate) generation: u64,
    pub(crate) registry: CallbackRegistry,
    /// Last delivered sequence per event kind.
    cursors: Mutex<BTreeMap<EventKind, u64>>,
    waiting: AtomicBool,
    session: Weak<SessionCore>,
}

impl ModuleInner {
    pub(crate) fn new(
        id: NativeModuleId,
        kind: ModuleKind,
        generation: u64,
        session: Weak<SessionCore>,
    ) -> Self {
        Self {
            id,
            kind,
            generation,
            registry: CallbackRegistry::new(),
            cursors: Mutex::new(BTreeMap::new()),
            waiting: AtomicBool::new(false),
            session,
        }
    }

    pub(crate) fn lock_cursors(&self) -> MutexGuard<'_, BTreeMap<EventKind, u64>> {
        self.cursors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the single `wait_update` slot of this module.
    pub(crate) fn begin_wait(&self) -> Result<WaitGuard<'_>> {
        if self.waiting.swap(true, Ordering::AcqRel) {
            return Err(BridgeError::WaitInProgress(self.kind));
        }
        Ok(WaitGuard(&self.waiting))
    }

    pub(crate) fn belongs_to(&self, core: &Arc<SessionCore>) -> bool {
        std::ptr::eq(self.session.as_ptr(), Arc::as_ptr(core))
    }
}

impl Drop for ModuleInner {
    fn drop(&mut self) {
        if let Some(core) = self.session.upgrade() {
            core.forget_module(self.id, self.generation);
        }
    }
}

pub(crate) struct WaitGuard<'a>(&'a AtomicBool);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Handle to a module created by a [`Session`](crate::Session).
///
/// Handles are cheap to clone; all clones refer to the same native module,
/// which is destroyed when the last clone is dropped. A handle outlives
/// `release` but every operation on it then fails, and it never becomes
/// valid again after the session is re-initialized.
///
/// [`ModuleHandle::null`] stands in for a missing handle; every operation on
/// it fails with [`ErrorKind::NullHandle`](crate::ErrorKind::NullHandle).
///
/// Registered handlers are owned by the module, so a handler that needs its
/// own module (to disconnect itself, say) must capture a
/// [`WeakModuleHandle`] from [`downgrade`](Self::downgrade). A captured strong
/// handle keeps the module alive until the handler is disconnected or the
/// session is released.
#[derive(Clone, Default)]
pub struct ModuleHandle {
    inner: Option<Arc<ModuleInner>>,
}

impl ModuleHandle {
    pub(crate) fn from_inner(inner: Arc<ModuleInner>) -> Self {
        Self { inner: Some(inner) }
    }

    pub fn null() -> Self {
        Self { inner: None }
    }

    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    pub fn kind(&self) -> Option<ModuleKind> {
        self.inner.as_ref().map(|m| m.kind)
    }

    pub fn native_id(&self) -> Option<NativeModuleId> {
        self.inner.as_ref().map(|m| m.id)
    }

    pub(crate) fn inner(&self, operation: Operation) -> Result<&Arc<ModuleInner>> {
        self.inner
            .as_ref()
            .ok_or(BridgeError::NullHandle(operation))
    }

    /// Resolve the owning session and check the handle is still current.
    fn live(&self, operation: Operation) -> Result<(&Arc<ModuleInner>, Arc<SessionCore>)> {
        let inner = self.inner(operation)?;
        let core = inner
            .session
            .upgrade()
            .ok_or(BridgeError::StaleHandle(operation))?;
        core.check_generation(operation, inner.generation)?;
        Ok((inner, core))
    }

    /// Seconds the native module spent on its last frame.
    pub fn processing_time(&self) -> Result<f32> {
        let (inner, core) = self.live(Operation::Query)?;
        guard(Operation::Query, || core.sdk().processing_time(inner.id))
    }

    pub fn timestamp(&self) -> Result<u64> {
        let (inner, core) = self.live(Operation::Query)?;
        guard(Operation::Query, || core.sdk().timestamp(inner.id))
    }

    /// Whether the module has data waiting for the next update.
    pub fn can_update(&self) -> Result<bool> {
        let (inner, core) = self.live(Operation::Query)?;
        guard(Operation::Query, || core.sdk().can_update(inner.id))
    }

    /// Latest frame of the module's primary event, if one was produced.
    pub fn snapshot(&self) -> Result<Option<FrameEnvelope>> {
        let kind = self.inner(Operation::Snapshot)?.kind;
        self.latest(kind.primary_event())
    }

    /// Latest frame the module produced for `event`.
    ///
    /// The returned envelope carries handler id 0 and no context.
    pub fn latest(&self, event: EventKind) -> Result<Option<FrameEnvelope>> {
        let (inner, core) = self.live(Operation::Snapshot)?;
        if !inner.kind.emits(event) {
            return Err(BridgeError::Unknown(format!(
                "{} does not emit {} events",
                inner.kind, event
            )));
        }
        let frame = guard(Operation::Snapshot, || core.sdk().latest_frame(inner.id, event))?;
        Ok(frame.map(|frame| FrameEnvelope::new(frame, inner.kind, event, 0, Context::NONE)))
    }

    /// Subscribe to `event`. Returns the id to pass to [`disconnect`](Self::disconnect).
    pub fn connect(&self, event: EventKind, context: Context, delivery: Delivery) -> Result<HandlerId> {
        let inner = self.inner(Operation::Connect)?;
        let core = inner
            .session
            .upgrade()
            .ok_or_else(|| BridgeError::Connect("session was dropped".into()))?;
        core.check_generation(Operation::Connect, inner.generation)
            .map_err(|e| BridgeError::Connect(e.to_string()))?;
        if !inner.kind.emits(event) {
            return Err(BridgeError::Connect(format!(
                "{} does not emit {} events",
                inner.kind, event
            )));
        }
        let id = inner.registry.connect(event, context, delivery);
        log::debug!("Connected handler {} to {} {}", id, inner.kind, event);
        Ok(id)
    }

    pub fn connect_on_frame<F>(&self, context: Context, handler: F) -> Result<HandlerId>
    where
        F: Fn(FrameEnvelope) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.connect(EventKind::Frame, context, Delivery::from_fn(handler))
    }

    pub fn connect_on_new_user<F>(&self, context: Context, handler: F) -> Result<HandlerId>
    where
        F: Fn(FrameEnvelope) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.connect(EventKind::NewUser, context, Delivery::from_fn(handler))
    }

    pub fn connect_on_lost_user<F>(&self, context: Context, handler: F) -> Result<HandlerId>
    where
        F: Fn(FrameEnvelope) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.connect(EventKind::LostUser, context, Delivery::from_fn(handler))
    }

    pub fn connect_on_gestures<F>(&self, context: Context, handler: F) -> Result<HandlerId>
    where
        F: Fn(FrameEnvelope) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.connect(EventKind::Gestures, context, Delivery::from_fn(handler))
    }

    /// Subscribe a non-blocking queue to `event`.
    pub fn connect_queue(
        &self,
        event: EventKind,
        context: Context,
        queue: impl FrameQueue + 'static,
    ) -> Result<HandlerId> {
        self.connect(event, context, Delivery::queued(queue))
    }

    pub fn connect_on_frame_queue(
        &self,
        context: Context,
        queue: impl FrameQueue + 'static,
    ) -> Result<HandlerId> {
        self.connect_queue(EventKind::Frame, context, queue)
    }

    pub fn connect_on_new_user_queue(
        &self,
        context: Context,
        queue: impl FrameQueue + 'static,
    ) -> Result<HandlerId> {
        self.connect_queue(EventKind::NewUser, context, queue)
    }

    pub fn connect_on_lost_user_queue(
        &self,
        context: Context,
        queue: impl FrameQueue + 'static,
    ) -> Result<HandlerId> {
        self.connect_queue(EventKind::LostUser, context, queue)
    }

    pub fn connect_on_gestures_queue(
        &self,
        context: Context,
        queue: impl FrameQueue + 'static,
    ) -> Result<HandlerId> {
        self.connect_queue(EventKind::Gestures, context, queue)
    }

    /// Subscribe `event` to a fresh channel and return its receiving half.
    ///
    /// Poll the receiver from any executor. Dropping it makes later
    /// deliveries fail with a closed-queue error until the handler is
    /// disconnected.
    pub fn connect_stream(
        &self,
        event: EventKind,
        context: Context,
    ) -> Result<(HandlerId, UnboundedReceiver<FrameEnvelope>)> {
        let (tx, rx) = mpsc::unbounded();
        let id = self.connect_queue(event, context, tx)?;
        Ok((id, rx))
    }

    pub fn frame_stream(&self, context: Context) -> Result<(HandlerId, UnboundedReceiver<FrameEnvelope>)> {
        self.connect_stream(EventKind::Frame, context)
    }

    /// Remove a subscription. A delivery already in progress still completes.
    pub fn disconnect(&self, id: HandlerId) -> Result<()> {
        let inner = self.inner(Operation::Disconnect)?;
        inner.registry.disconnect(id)?;
        log::debug!("Disconnected handler {} from {}", id, inner.kind);
        Ok(())
    }

    pub fn is_connected(&self, id: HandlerId) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|m| m.registry.is_registered(id))
    }

    pub fn handler_count(&self) -> usize {
        self.inner.as_ref().map_or(0, |m| m.registry.len())
    }

    pub fn handler_stats(&self, id: HandlerId) -> Option<HandlerStats> {
        self.inner.as_ref().and_then(|m| m.registry.stats(id))
    }

    /// A handle that does not keep the module alive.
    pub fn downgrade(&self) -> WeakModuleHandle {
        WeakModuleHandle {
            inner: self.inner.as_ref().map_or_else(Weak::new, Arc::downgrade),
        }
    }

    /// Whether both handles refer to the same module instance.
    pub fn ptr_eq(&self, other: &ModuleHandle) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

/// Non-owning reference to a module, for use inside its own handlers.
#[derive(Clone, Default)]
pub struct WeakModuleHandle {
    inner: Weak<ModuleInner>,
}

impl WeakModuleHandle {
    /// The module, if some [`ModuleHandle`] still keeps it alive.
    pub fn upgrade(&self) -> Option<ModuleHandle> {
        self.inner.upgrade().map(ModuleHandle::from_inner)
    }
}

impl fmt::Debug for WeakModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakModuleHandle")
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(inner) => f
                .debug_struct("ModuleHandle")
                .field("kind", &inner.kind)
                .field("native_id", &inner.id)
                .field("generation", &inner.generation)
                .field("handlers", &inner.registry.len())
                .finish(),
            None => f.write_str("ModuleHandle(null)"),
        }
    }
}

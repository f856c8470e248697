use crate::native::NativeFrame;
use crate::types::{Context, EventKind, HandlerId, ModuleKind};
use std::fmt;
use std::sync::Arc;

/// Shared-ownership wrapper around one native frame.
///
/// Cloning an envelope or handing it to several handlers never copies the
/// payload: every envelope holds an `Arc` to the same native frame, which is
/// freed once the native SDK and every envelope have let go of it.
#[derive(Clone)]
pub struct FrameEnvelope {
    frame: Arc<dyn NativeFrame>,
    module: ModuleKind,
    event: EventKind,
    handler: HandlerId,
    context: Context,
}

impl FrameEnvelope {
    pub(crate) fn new(
        frame: Arc<dyn NativeFrame>,
        module: ModuleKind,
        event: EventKind,
        handler: HandlerId,
        context: Context,
    ) -> Self {
        Self {
            frame,
            module,
            event,
            handler,
            context,
        }
    }

    pub fn module(&self) -> ModuleKind {
        self.module
    }

    pub fn event(&self) -> EventKind {
        self.event
    }

    /// Handler the envelope was delivered to. `0` for snapshots.
    pub fn handler_id(&self) -> HandlerId {
        self.handler
    }

    /// Context supplied when the handler was connected.
    pub fn context(&self) -> Context {
        self.context
    }

    pub fn sequence(&self) -> u64 {
        self.frame.sequence()
    }

    pub fn timestamp(&self) -> u64 {
        self.frame.timestamp()
    }

    pub fn data(&self) -> &[u8] {
        self.frame.data()
    }

    pub fn frame(&self) -> &Arc<dyn NativeFrame> {
        &self.frame
    }

    /// Access the native frame as its concrete type.
    pub fn downcast_ref<T: NativeFrame>(&self) -> Option<&T> {
        self.frame.as_any().downcast_ref::<T>()
    }

    /// Whether both envelopes wrap the very same native frame.
    pub fn shares_frame(&self, other: &FrameEnvelope) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.frame), Arc::as_ptr(&other.frame))
    }

    /// Number of live references to the native frame, native side included.
    pub fn frame_refs(&self) -> usize {
        Arc::strong_count(&self.frame)
    }
}

impl fmt::Debug for FrameEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameEnvelope")
            .field("module", &self.module)
            .field("event", &self.event)
            .field("handler", &self.handler)
            .field("context", &self.context)
            .field("sequence", &self.frame.sequence())
            .field("timestamp", &self.frame.timestamp())
            .finish()
    }
}

//! The seam between the bridge and the native tracking SDK.
//!
//! A vendor SDK is plugged in by implementing [`NativeSdk`]. The bridge never
//! looks inside frames; it only moves `Arc<dyn NativeFrame>` values around.

use crate::error::NativeError;
use crate::types::{DeviceInfo, EventKind, ModuleKind};
use std::any::Any;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Identifier the native SDK assigns to a module instance.
pub type NativeModuleId = u64;

/// An immutable frame or event payload owned by the native SDK.
pub trait NativeFrame: Any + Send + Sync + fmt::Debug {
    /// Production counter, strictly increasing per module and event kind.
    ///
    /// The bridge delivers a frame only if its sequence is greater than the
    /// last one delivered for that module and event. Repeats of the last frame
    /// are counted as duplicates; older frames arriving late are counted as
    /// out of order and dropped, so an SDK that fires one module's callbacks
    /// from several threads at once must serialize them to avoid losses.
    fn sequence(&self) -> u64;

    /// Module-local timestamp of the frame.
    fn timestamp(&self) -> u64;

    /// Raw payload bytes, if the frame exposes any.
    fn data(&self) -> &[u8] {
        &[]
    }

    fn as_any(&self) -> &dyn Any;
}

/// Receiver of the callbacks the native SDK fires while advancing.
///
/// The SDK must call [`EventSink::deliver`] on the thread that invoked
/// `update`/`wait_update`, before that call returns. Events of one module
/// must be delivered in sequence order.
pub trait EventSink {
    fn deliver(&mut self, module: NativeModuleId, event: EventKind, frame: Arc<dyn NativeFrame>);
}

/// Operations the bridge needs from the native SDK.
///
/// Implementations are internally synchronized; every method takes `&self`.
pub trait NativeSdk: Send + Sync {
    /// Start the SDK with the configuration file at `config_path`.
    /// An empty path selects the SDK's default configuration.
    fn init(&self, config_path: &Path) -> Result<(), NativeError>;

    /// Start the processing pipeline.
    fn run(&self) -> Result<(), NativeError>;

    /// Tear down the SDK. Blocked `wait_update` calls must return.
    fn release(&self) -> Result<(), NativeError>;

    /// Advance every module by one tick, firing due callbacks into `sink`.
    fn update(&self, sink: &mut dyn EventSink) -> Result<(), NativeError>;

    /// Block until `module` has new data, then fire its callbacks into `sink`.
    fn wait_update(&self, module: NativeModuleId, sink: &mut dyn EventSink) -> Result<(), NativeError>;

    fn set_config_value(&self, key: &str, value: &str) -> Result<(), NativeError>;

    fn config_value(&self, key: &str) -> Result<String, NativeError>;

    fn devices(&self) -> Result<Vec<DeviceInfo>, NativeError>;

    fn select_device(&self, index: usize) -> Result<(), NativeError>;

    fn create_module(&self, kind: ModuleKind) -> Result<NativeModuleId, NativeError>;

    /// Drop the SDK's reference to a module. Unknown ids are ignored.
    fn destroy_module(&self, module: NativeModuleId);

    /// Seconds spent processing the last frame.
    fn processing_time(&self, module: NativeModuleId) -> Result<f32, NativeError>;

    fn timestamp(&self, module: NativeModuleId) -> Result<u64, NativeError>;

    /// Whether the module has data waiting for the next update.
    fn can_update(&self, module: NativeModuleId) -> Result<bool, NativeError>;

    /// Latest frame the module produced for `event`, if any.
    fn latest_frame(
        &self,
        module: NativeModuleId,
        event: EventKind,
    ) -> Result<Option<Arc<dyn NativeFrame>>, NativeError>;
}

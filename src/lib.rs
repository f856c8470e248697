//! # trackbridge - safe bridge between a native tracking SDK and foreign runtimes
//!
//! Wraps a callback-driven body/hand/depth tracking SDK behind an explicit
//! session object. Provides:
//! - Session lifecycle (init, run, update, wait_update, release) with config overrides
//! - Module handles for depth, color, user, skeleton, hand and gesture modules
//! - Per-module callback registration with stable handler ids and opaque context
//! - Direct or queued, zero-copy delivery of native frames
//! - Native failures translated into a small, stable error taxonomy
//! - C FFI for integration with C/C++/Unity/Swift
//!
//! ## Quick Start
//! ```no_run
//! use std::sync::Arc;
//! use trackbridge::{Context, Session, SimulatedSdk};
//!
//! let session = Session::new(Arc::new(SimulatedSdk::new()));
//! session.init("config.json").unwrap();
//! session.run().unwrap();
//!
//! let skeleton = session.create_skeleton_tracker().unwrap();
//! let id = skeleton
//!     .connect_on_frame(Context::new(7), |frame| {
//!         println!("frame {} ({} bytes)", frame.sequence(), frame.data().len());
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! for _ in 0..100 {
//!     session.update().unwrap();
//! }
//! skeleton.disconnect(id).unwrap();
//! session.release().unwrap();
//! ```

pub mod error;
pub mod types;
pub mod config;
pub mod native;
pub mod frame;
pub mod registry;
pub mod dispatch;
pub mod handle;
pub mod session;
pub mod sim;
pub mod ffi;

pub use config::{ConfigError, ConfigStore};
pub use dispatch::DispatchReport;
pub use error::{translate, BridgeError, ErrorKind, NativeError, NativeFailure, Operation, SubKind};
pub use frame::FrameEnvelope;
pub use handle::{ModuleHandle, WeakModuleHandle};
pub use native::{EventSink, NativeFrame, NativeModuleId, NativeSdk};
pub use registry::{
    CallbackRegistry, Delivery, EnqueueError, FrameHandler, FrameQueue, HandlerError, HandlerStats,
};
pub use session::{Session, SessionBuilder};
pub use sim::{SimFrame, SimOp, SimulatedSdk};
pub use types::*;

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

use crate::types::{HandlerId, ModuleKind, SessionState};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// Coarse, foreign-visible error category.
///
/// The discriminants are the codes returned by the C API (0 means success).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Init = 1,
    Creation = 2,
    Connect = 3,
    UnknownHandler = 4,
    NullHandle = 5,
    Update = 6,
    Dispatch = 7,
    InvalidState = 8,
    Unknown = 9,
}

/// Refinement of an [`ErrorKind`] that callers may special-case.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubKind {
    None = 0,
    /// The native SDK refused to work without a valid license.
    LicenseNotAcquired = 1,
}

/// Failure category reported by the native SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum NativeFailure {
    #[error("license not acquired")]
    LicenseNotAcquired,
    #[error("bad configuration")]
    BadConfig,
    #[error("device unavailable")]
    DeviceUnavailable,
    #[error("unsupported")]
    Unsupported,
    #[error("timed out")]
    Timeout,
    #[error("terminated")]
    Terminated,
    #[error("internal error")]
    Internal,
    #[error("error")]
    Other,
}

/// A failure signal raised by the native SDK.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{failure}: {message}")]
pub struct NativeError {
    pub failure: NativeFailure,
    pub message: String,
}

impl NativeError {
    pub fn new(failure: NativeFailure, message: impl Into<String>) -> Self {
        Self {
            failure,
            message: message.into(),
        }
    }
}

/// Bridge operation in which an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Init,
    Run,
    Update,
    WaitUpdate,
    Release,
    Config,
    Devices,
    SelectDevice,
    Create(ModuleKind),
    Connect,
    Disconnect,
    Query,
    Snapshot,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Init => f.write_str("init"),
            Operation::Run => f.write_str("run"),
            Operation::Update => f.write_str("update"),
            Operation::WaitUpdate => f.write_str("wait_update"),
            Operation::Release => f.write_str("release"),
            Operation::Config => f.write_str("config"),
            Operation::Devices => f.write_str("devices"),
            Operation::SelectDevice => f.write_str("select_device"),
            Operation::Create(kind) => write!(f, "create {}", kind),
            Operation::Connect => f.write_str("connect"),
            Operation::Disconnect => f.write_str("disconnect"),
            Operation::Query => f.write_str("module query"),
            Operation::Snapshot => f.write_str("snapshot"),
        }
    }
}

/// Errors returned by the bridge.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    #[error("Initialization failed: {0}")]
    Init(String),

    #[error("Failed to create {module}: {message}")]
    Creation { module: ModuleKind, message: String },

    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Handler {0} is not registered")]
    UnknownHandler(HandlerId),

    #[error("Null handle passed to {0}")]
    NullHandle(Operation),

    #[error("Update failed: {0}")]
    Update(String),

    #[error("Dispatch to handler {handler} failed: {message} ({failures} failed deliveries)")]
    Dispatch {
        handler: HandlerId,
        message: String,
        failures: usize,
    },

    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        operation: Operation,
        state: SessionState,
    },

    #[error("Handle used for {0} belongs to a released session")]
    StaleHandle(Operation),

    #[error("wait_update already in progress for this {0}")]
    WaitInProgress(ModuleKind),

    #[error("Cannot {0} from inside a callback")]
    Reentrant(Operation),

    #[error("Cannot release while a dispatch is in progress")]
    DispatchPending,

    #[error("Native SDK is already initialized by another session")]
    SdkInUse,

    #[error("License not acquired during {operation}: {message}")]
    License { operation: Operation, message: String },

    #[error("{0}")]
    Unknown(String),
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Init(_) => ErrorKind::Init,
            BridgeError::Creation { .. } => ErrorKind::Creation,
            BridgeError::Connect(_) => ErrorKind::Connect,
            BridgeError::UnknownHandler(_) => ErrorKind::UnknownHandler,
            BridgeError::NullHandle(_) => ErrorKind::NullHandle,
            BridgeError::Update(_) => ErrorKind::Update,
            BridgeError::Dispatch { .. } => ErrorKind::Dispatch,
            BridgeError::InvalidState { .. }
            | BridgeError::StaleHandle(_)
            | BridgeError::WaitInProgress(_)
            | BridgeError::Reentrant(_)
            | BridgeError::DispatchPending
            | BridgeError::SdkInUse => ErrorKind::InvalidState,
            BridgeError::License { operation, .. } => match operation {
                Operation::Init | Operation::Run | Operation::SelectDevice => ErrorKind::Init,
                Operation::Update | Operation::WaitUpdate => ErrorKind::Update,
                _ => ErrorKind::Unknown,
            },
            BridgeError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    pub fn sub_kind(&self) -> SubKind {
        match self {
            BridgeError::License { .. } => SubKind::LicenseNotAcquired,
            _ => SubKind::None,
        }
    }

    pub fn is_license(&self) -> bool {
        self.sub_kind() == SubKind::LicenseNotAcquired
    }

    /// Error code for the C API.
    pub fn code(&self) -> i32 {
        self.kind() as i32
    }
}

/// Map a native failure raised during `operation` onto the bridge taxonomy.
pub fn translate(operation: Operation, err: NativeError) -> BridgeError {
    if err.failure == NativeFailure::LicenseNotAcquired {
        return BridgeError::License {
            operation,
            message: err.message,
        };
    }
    let message = format!("{} ({})", err, operation);
    match operation {
        Operation::Init | Operation::Run | Operation::SelectDevice => BridgeError::Init(message),
        Operation::Create(module) => BridgeError::Creation { module, message },
        Operation::Connect => BridgeError::Connect(message),
        Operation::Update | Operation::WaitUpdate => BridgeError::Update(message),
        _ => BridgeError::Unknown(message),
    }
}

/// Run a native call, translating both returned failures and panics.
pub(crate) fn guard<T, F>(operation: Operation, call: F) -> crate::Result<T>
where
    F: FnOnce() -> Result<T, NativeError>,
{
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            log::warn!("Native {} failed: {}", operation, e);
            Err(translate(operation, e))
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            log::error!("Native {} panicked: {}", operation, message);
            Err(BridgeError::Unknown(format!(
                "native panic during {}: {}",
                operation, message
            )))
        }
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Last-error storage for the C FFI layer.
///
/// One instance lives per thread (see `ffi`), so the pointer handed out by
/// [`LastError::as_ptr`] stays valid until the next failing call on that thread.
pub(crate) struct LastError {
    message: String,
    kind: Option<ErrorKind>,
    sub_kind: SubKind,
}

impl LastError {
    pub const fn new() -> Self {
        Self {
            message: String::new(),
            kind: None,
            sub_kind: SubKind::None,
        }
    }

    pub fn set(&mut self, err: &BridgeError) {
        let mut message = err.to_string().replace('\0', " ");
        message.push('\0');
        self.message = message;
        self.kind = Some(err.kind());
        self.sub_kind = err.sub_kind();
    }

    pub fn clear(&mut self) {
        self.message.clear();
        self.kind = None;
        self.sub_kind = SubKind::None;
    }

    pub fn as_ptr(&self) -> *const std::ffi::c_char {
        if self.message.is_empty() {
            std::ptr::null()
        } else {
            self.message.as_ptr() as *const std::ffi::c_char
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        self.kind
    }

    pub fn sub_kind(&self) -> SubKind {
        self.sub_kind
    }
}

//! C FFI layer for trackbridge.
//!
//! Provides an opaque handle-based API for C/C++ consumers.
//! The generated C header is written to `include/trackbridge.h` by cbindgen.
//!
//! Every fallible function returns `0` on success or an
//! [`ErrorKind`](crate::ErrorKind) code and records the error text for
//! [`tb_last_error`]. Null pointers are reported as `ErrorKind::NullHandle`
//! before anything else happens.

use crate::error::{panic_message, LastError, Operation, SubKind};
use crate::frame::FrameEnvelope;
use crate::handle::ModuleHandle;
use crate::registry::{Delivery, EnqueueError, FrameHandler, FrameQueue, HandlerError};
use crate::session::Session;
use crate::sim::SimulatedSdk;
use crate::types::{Context, EventKind, HandlerId, ModuleKind};
use crate::{BridgeError, Result};
use crossbeam_channel::{Receiver, Sender};
use std::cell::RefCell;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

thread_local! {
    /// Last error message for C consumers, one slot per thread.
    static LAST_ERROR: RefCell<LastError> = const { RefCell::new(LastError::new()) };
}

/// Opaque session handle for C consumers.
pub struct TbSession(Session);

/// Opaque module handle for C consumers.
pub struct TbModule(ModuleHandle);

/// Opaque frame envelope. Owned by whoever received it; free with `tb_envelope_free`.
pub struct TbEnvelope(FrameEnvelope);

/// Bridge-owned queue that C consumers drain from any thread.
pub struct TbQueue {
    sender: Sender<FrameEnvelope>,
    receiver: Receiver<FrameEnvelope>,
}

/// Direct frame callback.
///
/// Receives the context given at connect time and a new envelope the callee
/// owns. Returning non-zero reports a handler failure.
pub type TbFrameCallback = Option<unsafe extern "C" fn(*mut c_void, *mut TbEnvelope) -> c_int>;

/// Foreign enqueue function. Must not block.
///
/// Returns 0 when the envelope was accepted (the callee now owns it),
/// 1 when the queue is full, any other value when it is closed. On non-zero
/// the bridge frees the envelope.
pub type TbEnqueueCallback = Option<unsafe extern "C" fn(*mut c_void, *mut TbEnvelope) -> c_int>;

fn set_last_error(err: &BridgeError) {
    LAST_ERROR.with(|slot| slot.borrow_mut().set(err));
}

/// Run `call`, turning its result into a C status code.
fn ffi_call<F>(call: F) -> c_int
where
    F: FnOnce() -> Result<()>,
{
    let result = panic::catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|payload| {
        Err(BridgeError::Unknown(format!(
            "panic in bridge: {}",
            panic_message(payload.as_ref())
        )))
    });
    match result {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(&e);
            e.code()
        }
    }
}

unsafe fn session_ref<'a>(session: *const TbSession, operation: Operation) -> Result<&'a Session> {
    session
        .as_ref()
        .map(|s| &s.0)
        .ok_or(BridgeError::NullHandle(operation))
}

/// A null module pointer behaves exactly like a null [`ModuleHandle`].
unsafe fn module_ref(module: *const TbModule) -> ModuleHandle {
    module.as_ref().map(|m| m.0.clone()).unwrap_or_default()
}

unsafe fn out_ref<'a, T>(out: *mut T, operation: Operation) -> Result<&'a mut T> {
    out.as_mut().ok_or(BridgeError::NullHandle(operation))
}

unsafe fn c_str<'a>(ptr: *const c_char, operation: Operation) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(BridgeError::NullHandle(operation));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|e| BridgeError::Unknown(format!("string passed to {} is not UTF-8: {}", operation, e)))
}

fn event_from_raw(event: c_int) -> Result<EventKind> {
    EventKind::from_raw(event).ok_or_else(|| BridgeError::Connect(format!("unknown event kind {}", event)))
}

fn into_raw_envelope(envelope: FrameEnvelope) -> *mut TbEnvelope {
    Box::into_raw(Box::new(TbEnvelope(envelope)))
}

/// The context handed to C comes from the envelope, i.e. from the
/// registration table.
struct CallbackHandler {
    callback: unsafe extern "C" fn(*mut c_void, *mut TbEnvelope) -> c_int,
}

impl FrameHandler for CallbackHandler {
    fn on_frame(&self, envelope: FrameEnvelope) -> std::result::Result<(), HandlerError> {
        let context = envelope.context().as_ptr();
        let raw = into_raw_envelope(envelope);
        // SAFETY: the caller of tb_connect promised a valid callback.
        match unsafe { (self.callback)(context, raw) } {
            0 => Ok(()),
            code => Err(format!("callback returned {}", code).into()),
        }
    }
}

struct CallbackQueue {
    enqueue: unsafe extern "C" fn(*mut c_void, *mut TbEnvelope) -> c_int,
}

impl FrameQueue for CallbackQueue {
    fn try_enqueue(&self, envelope: FrameEnvelope) -> std::result::Result<(), EnqueueError> {
        let context = envelope.context().as_ptr();
        let raw = into_raw_envelope(envelope);
        // SAFETY: the caller of tb_connect_enqueue promised a valid function.
        let code = unsafe { (self.enqueue)(context, raw) };
        if code == 0 {
            return Ok(());
        }
        // SAFETY: ownership stays with us when the queue refuses.
        drop(unsafe { Box::from_raw(raw) });
        if code == 1 {
            Err(EnqueueError::Full)
        } else {
            Err(EnqueueError::Closed)
        }
    }
}

/// Hand a Rust-side session to C. Free it with `tb_session_free`.
pub fn session_into_raw(session: Session) -> *mut TbSession {
    Box::into_raw(Box::new(TbSession(session)))
}

/// Create a session backed by the in-process simulator.
#[no_mangle]
pub extern "C" fn tb_session_new_simulated() -> *mut TbSession {
    session_into_raw(Session::new(Arc::new(SimulatedSdk::new())))
}

/// Free a session, releasing it first if it is still live.
///
/// # Safety
/// `session` must be a pointer returned by `tb_session_new_simulated`, or null.
#[no_mangle]
pub unsafe extern "C" fn tb_session_free(session: *mut TbSession) {
    if !session.is_null() {
        drop(Box::from_raw(session));
    }
}

/// Current `SessionState` value, or -1 for a null session.
///
/// # Safety
/// `session` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn tb_session_state(session: *const TbSession) -> c_int {
    match session.as_ref() {
        Some(s) => s.0.state() as c_int,
        None => -1,
    }
}

/// Initialize the session. A null or empty `config_path` selects the default configuration.
///
/// # Safety
/// `session` must be a valid session pointer, or null. `config_path` must be
/// a NUL-terminated string, or null.
#[no_mangle]
pub unsafe extern "C" fn tb_init(session: *mut TbSession, config_path: *const c_char) -> c_int {
    ffi_call(|| {
        let session = session_ref(session, Operation::Init)?;
        let path = if config_path.is_null() {
            PathBuf::new()
        } else {
            PathBuf::from(c_str(config_path, Operation::Init)?)
        };
        session.init(path)
    })
}

/// # Safety
/// `session` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn tb_run(session: *mut TbSession) -> c_int {
    ffi_call(|| session_ref(session, Operation::Run)?.run())
}

/// Advance all modules and deliver due callbacks on the calling thread.
///
/// # Safety
/// `session` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn tb_update(session: *mut TbSession) -> c_int {
    ffi_call(|| session_ref(session, Operation::Update)?.update().map(drop))
}

/// Block until `module` has new data, then deliver its callbacks.
///
/// # Safety
/// `session` and `module` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn tb_wait_update(session: *mut TbSession, module: *const TbModule) -> c_int {
    ffi_call(|| {
        let session = session_ref(session, Operation::WaitUpdate)?;
        session.wait_update(&module_ref(module)).map(drop)
    })
}

/// # Safety
/// `session` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn tb_release(session: *mut TbSession) -> c_int {
    ffi_call(|| session_ref(session, Operation::Release)?.release())
}

/// # Safety
/// `session` must be a valid session pointer, or null. `key` and `value`
/// must be NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn tb_set_config_value(
    session: *mut TbSession,
    key: *const c_char,
    value: *const c_char,
) -> c_int {
    ffi_call(|| {
        let session = session_ref(session, Operation::Config)?;
        session.set_config_value(c_str(key, Operation::Config)?, c_str(value, Operation::Config)?)
    })
}

/// Copy a configuration value into `buf` as a NUL-terminated string,
/// truncating to `len - 1` bytes.
///
/// # Safety
/// `session` must be a valid session pointer, or null. `key` must be a
/// NUL-terminated string. `buf` must point to at least `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn tb_get_config_value(
    session: *mut TbSession,
    key: *const c_char,
    buf: *mut c_char,
    len: usize,
) -> c_int {
    ffi_call(|| {
        let session = session_ref(session, Operation::Config)?;
        let key = c_str(key, Operation::Config)?;
        if buf.is_null() || len == 0 {
            return Err(BridgeError::NullHandle(Operation::Config));
        }
        let value = session.get_config_value(key)?;
        let bytes = value.as_bytes();
        let n = bytes.len().min(len - 1);
        std::ptr::copy_nonoverlapping(bytes.as_ptr() as *const c_char, buf, n);
        buf.add(n).write(0);
        Ok(())
    })
}

/// Create a module of `kind` (a `ModuleKind` value) and store its handle in `out`.
///
/// # Safety
/// `session` must be a valid session pointer, or null. `out` must be a valid
/// pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn tb_create_module(
    session: *mut TbSession,
    kind: c_int,
    out: *mut *mut TbModule,
) -> c_int {
    ffi_call(|| {
        let kind = ModuleKind::from_raw(kind).ok_or_else(|| BridgeError::Creation {
            module: ModuleKind::DepthSensor,
            message: format!("unknown module kind {}", kind),
        })?;
        let session = session_ref(session, Operation::Create(kind))?;
        let out = out_ref(out, Operation::Create(kind))?;
        let handle = session.create_module(kind)?;
        *out = Box::into_raw(Box::new(TbModule(handle)));
        Ok(())
    })
}

/// Free a module handle. The native module goes away with its last handle.
///
/// # Safety
/// `module` must be a pointer returned by `tb_create_module`, or null.
#[no_mangle]
pub unsafe extern "C" fn tb_module_free(module: *mut TbModule) {
    if !module.is_null() {
        drop(Box::from_raw(module));
    }
}

/// # Safety
/// `module` must be a valid module pointer, or null. `out` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn tb_module_processing_time(module: *const TbModule, out: *mut f32) -> c_int {
    ffi_call(|| {
        let out = out_ref(out, Operation::Query)?;
        *out = module_ref(module).processing_time()?;
        Ok(())
    })
}

/// # Safety
/// `module` must be a valid module pointer, or null. `out` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn tb_module_timestamp(module: *const TbModule, out: *mut u64) -> c_int {
    ffi_call(|| {
        let out = out_ref(out, Operation::Query)?;
        *out = module_ref(module).timestamp()?;
        Ok(())
    })
}

/// # Safety
/// `module` must be a valid module pointer, or null. `out` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn tb_module_can_update(module: *const TbModule, out: *mut bool) -> c_int {
    ffi_call(|| {
        let out = out_ref(out, Operation::Query)?;
        *out = module_ref(module).can_update()?;
        Ok(())
    })
}

/// Store the module's latest frame in `out`, or null if it has none yet.
///
/// # Safety
/// `module` must be a valid module pointer, or null. `out` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn tb_module_snapshot(module: *const TbModule, out: *mut *mut TbEnvelope) -> c_int {
    ffi_call(|| {
        let out = out_ref(out, Operation::Snapshot)?;
        *out = module_ref(module)
            .snapshot()?
            .map_or(std::ptr::null_mut(), into_raw_envelope);
        Ok(())
    })
}

unsafe fn connect_raw(
    module: *const TbModule,
    event: c_int,
    context: *mut c_void,
    out_id: *mut HandlerId,
    delivery: Result<Delivery>,
) -> Result<()> {
    let module = module_ref(module);
    if module.is_null() {
        return Err(BridgeError::NullHandle(Operation::Connect));
    }
    let out_id = out_ref(out_id, Operation::Connect)?;
    let id = module.connect(event_from_raw(event)?, Context::from_ptr(context), delivery?)?;
    *out_id = id;
    Ok(())
}

/// Register a direct callback for `event` (an `EventKind` value).
///
/// `context` is passed back on every invocation. The handler id is stored in `out_id`.
///
/// # Safety
/// `module` must be a valid module pointer, or null. `callback` must stay
/// callable until disconnected. `out_id` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn tb_connect(
    module: *const TbModule,
    event: c_int,
    callback: TbFrameCallback,
    context: *mut c_void,
    out_id: *mut HandlerId,
) -> c_int {
    ffi_call(|| {
        let delivery = callback
            .map(|callback| Delivery::direct(CallbackHandler { callback }))
            .ok_or(BridgeError::NullHandle(Operation::Connect));
        connect_raw(module, event, context, out_id, delivery)
    })
}

/// Register a foreign non-blocking enqueue function for `event`.
///
/// # Safety
/// `module` must be a valid module pointer, or null. `enqueue` must be safe
/// to call from the driving thread until disconnected. `out_id` must be a
/// valid pointer.
#[no_mangle]
pub unsafe extern "C" fn tb_connect_enqueue(
    module: *const TbModule,
    event: c_int,
    enqueue: TbEnqueueCallback,
    context: *mut c_void,
    out_id: *mut HandlerId,
) -> c_int {
    ffi_call(|| {
        let delivery = enqueue
            .map(|enqueue| Delivery::queued(CallbackQueue { enqueue }))
            .ok_or(BridgeError::NullHandle(Operation::Connect));
        connect_raw(module, event, context, out_id, delivery)
    })
}

/// Feed `event` into a bridge-owned queue created with `tb_queue_new`.
///
/// # Safety
/// `module` and `queue` must be valid pointers, or null. `out_id` must be a
/// valid pointer.
#[no_mangle]
pub unsafe extern "C" fn tb_connect_queue(
    module: *const TbModule,
    event: c_int,
    queue: *const TbQueue,
    context: *mut c_void,
    out_id: *mut HandlerId,
) -> c_int {
    ffi_call(|| {
        let delivery = queue
            .as_ref()
            .map(|q| Delivery::queued(q.sender.clone()))
            .ok_or(BridgeError::NullHandle(Operation::Connect));
        connect_raw(module, event, context, out_id, delivery)
    })
}

/// # Safety
/// `module` must be a valid module pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn tb_disconnect(module: *const TbModule, id: HandlerId) -> c_int {
    ffi_call(|| module_ref(module).disconnect(id))
}

/// Create a queue holding up to `capacity` envelopes (0 = unbounded).
#[no_mangle]
pub extern "C" fn tb_queue_new(capacity: usize) -> *mut TbQueue {
    let (sender, receiver) = if capacity == 0 {
        crossbeam_channel::unbounded()
    } else {
        crossbeam_channel::bounded(capacity)
    };
    Box::into_raw(Box::new(TbQueue { sender, receiver }))
}

/// Receive the next envelope.
/// `timeout_ms`: timeout in milliseconds (0 = try without blocking, -1 = block forever).
/// Returns NULL if nothing arrived in time.
///
/// A queue keeps its own sender, so `-1` blocks until an envelope arrives.
///
/// # Safety
/// `queue` must be a valid queue pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn tb_queue_recv(queue: *const TbQueue, timeout_ms: c_int) -> *mut TbEnvelope {
    let Some(queue) = queue.as_ref() else {
        return std::ptr::null_mut();
    };
    let received = if timeout_ms == 0 {
        queue.receiver.try_recv().ok()
    } else if timeout_ms < 0 {
        queue.receiver.recv().ok()
    } else {
        queue
            .receiver
            .recv_timeout(Duration::from_millis(timeout_ms as u64))
            .ok()
    };
    received.map_or(std::ptr::null_mut(), into_raw_envelope)
}

/// Number of envelopes waiting in the queue.
///
/// # Safety
/// `queue` must be a valid queue pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn tb_queue_len(queue: *const TbQueue) -> usize {
    queue.as_ref().map_or(0, |q| q.receiver.len())
}

/// Free a queue and any envelopes still in it. Registrations feeding it
/// start failing with a closed-queue dispatch error.
///
/// # Safety
/// `queue` must be a pointer returned by `tb_queue_new`, or null.
#[no_mangle]
pub unsafe extern "C" fn tb_queue_free(queue: *mut TbQueue) {
    if !queue.is_null() {
        drop(Box::from_raw(queue));
    }
}

/// Pointer to the frame payload; its length is stored in `len`.
/// The pointer is valid until the envelope is freed.
///
/// # Safety
/// `envelope` must be a valid envelope pointer, or null. `len` must be a
/// valid pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn tb_envelope_data(envelope: *const TbEnvelope, len: *mut usize) -> *const u8 {
    let data = envelope.as_ref().map_or(&[][..], |e| e.0.data());
    if let Some(len) = len.as_mut() {
        *len = data.len();
    }
    if data.is_empty() {
        std::ptr::null()
    } else {
        data.as_ptr()
    }
}

/// # Safety
/// `envelope` must be a valid envelope pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn tb_envelope_sequence(envelope: *const TbEnvelope) -> u64 {
    envelope.as_ref().map_or(0, |e| e.0.sequence())
}

/// # Safety
/// `envelope` must be a valid envelope pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn tb_envelope_timestamp(envelope: *const TbEnvelope) -> u64 {
    envelope.as_ref().map_or(0, |e| e.0.timestamp())
}

/// `EventKind` of the envelope, or -1 for null.
///
/// # Safety
/// `envelope` must be a valid envelope pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn tb_envelope_event(envelope: *const TbEnvelope) -> c_int {
    envelope.as_ref().map_or(-1, |e| e.0.event() as c_int)
}

/// `ModuleKind` of the envelope, or -1 for null.
///
/// # Safety
/// `envelope` must be a valid envelope pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn tb_envelope_module(envelope: *const TbEnvelope) -> c_int {
    envelope.as_ref().map_or(-1, |e| e.0.module() as c_int)
}

/// # Safety
/// `envelope` must be a valid envelope pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn tb_envelope_handler_id(envelope: *const TbEnvelope) -> HandlerId {
    envelope.as_ref().map_or(0, |e| e.0.handler_id())
}

/// Context given when the receiving handler was connected.
///
/// # Safety
/// `envelope` must be a valid envelope pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn tb_envelope_context(envelope: *const TbEnvelope) -> *mut c_void {
    envelope
        .as_ref()
        .map_or(std::ptr::null_mut(), |e| e.0.context().as_ptr())
}

/// A second owner of the same frame. The payload is not copied.
///
/// # Safety
/// `envelope` must be a valid envelope pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn tb_envelope_clone(envelope: *const TbEnvelope) -> *mut TbEnvelope {
    envelope
        .as_ref()
        .map_or(std::ptr::null_mut(), |e| into_raw_envelope(e.0.clone()))
}

/// # Safety
/// `envelope` must be a pointer handed out by this library, or null.
#[no_mangle]
pub unsafe extern "C" fn tb_envelope_free(envelope: *mut TbEnvelope) {
    if !envelope.is_null() {
        drop(Box::from_raw(envelope));
    }
}

/// Get the last error message. Returns NULL if no error.
/// The returned pointer is valid until the next failing call on this thread.
#[no_mangle]
pub extern "C" fn tb_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| slot.borrow().as_ptr())
}

/// `ErrorKind` code of the last error, or 0 if none.
#[no_mangle]
pub extern "C" fn tb_last_error_kind() -> c_int {
    LAST_ERROR.with(|slot| slot.borrow().kind().map_or(0, |k| k as c_int))
}

/// Whether the last error was a licensing failure.
#[no_mangle]
pub extern "C" fn tb_last_error_is_license() -> bool {
    LAST_ERROR.with(|slot| slot.borrow().sub_kind() == SubKind::LicenseNotAcquired)
}

#[no_mangle]
pub extern "C" fn tb_clear_last_error() {
    LAST_ERROR.with(|slot| slot.borrow_mut().clear());
}

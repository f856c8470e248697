#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use trackbridge::{Context, FrameEnvelope, ModuleHandle, Session, SimulatedSdk};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Write `contents` to a fresh JSON file under the temp dir.
pub fn write_config(contents: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let path = std::env::temp_dir().join(format!(
        "trackbridge-{}-{}.json",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::write(&path, contents).unwrap();
    path
}

pub fn sim_session() -> (SimulatedSdk, Session) {
    init_logging();
    let sdk = SimulatedSdk::new();
    let session = Session::new(Arc::new(sdk.clone()));
    (sdk, session)
}

/// A session that is already running.
pub fn running_session() -> (SimulatedSdk, Session) {
    let (sdk, session) = sim_session();
    session.init("").unwrap();
    session.run().unwrap();
    (sdk, session)
}

/// Connect a frame handler that stores every envelope it receives.
pub fn record_frames(handle: &ModuleHandle, context: Context) -> (u64, Arc<Mutex<Vec<FrameEnvelope>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let id = handle
        .connect_on_frame(context, move |envelope| {
            sink.lock().unwrap().push(envelope);
            Ok(())
        })
        .unwrap();
    (id, seen)
}

pub fn sequences(seen: &Mutex<Vec<FrameEnvelope>>) -> Vec<u64> {
    seen.lock().unwrap().iter().map(|e| e.sequence()).collect()
}

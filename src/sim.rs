//! In-process stand-in for a vendor tracking SDK.
//!
//! [`SimulatedSdk`] implements [`NativeSdk`] entirely in memory. Frames are
//! injected with [`SimulatedSdk::push_frame`] and come out of the next
//! `update`/`wait_update`, which makes the bridge usable without hardware
//! and drives the test suite.

use crate::config::ConfigStore;
use crate::error::{NativeError, NativeFailure};
use crate::native::{EventSink, NativeFrame, NativeModuleId, NativeSdk};
use crate::types::{DeviceInfo, EventKind, ModuleKind, ModuleSet};
use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(1000);
const WAIT_TIMEOUT_KEY: &str = "Simulation.WaitTimeoutMs";

/// A frame produced by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimFrame {
    sequence: u64,
    timestamp: u64,
    data: Vec<u8>,
}

impl SimFrame {
    pub fn new(sequence: u64, timestamp: u64, data: Vec<u8>) -> Self {
        Self {
            sequence,
            timestamp,
            data,
        }
    }
}

impl NativeFrame for SimFrame {
    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn timestamp(&self) -> u64 {
        self.timestamp
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Native entry points that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    Init,
    Run,
    Update,
    WaitUpdate,
    Release,
    CreateModule,
    SelectDevice,
    Query,
    Config,
}

struct SimModule {
    kind: ModuleKind,
    pending: VecDeque<(EventKind, Arc<SimFrame>)>,
    latest: HashMap<EventKind, Arc<SimFrame>>,
    next_sequence: HashMap<EventKind, u64>,
    timestamp: u64,
    processing_time: f32,
}

struct SimState {
    initialized: bool,
    running: bool,
    config: ConfigStore,
    devices: Vec<DeviceInfo>,
    selected: Option<usize>,
    modules: BTreeMap<NativeModuleId, SimModule>,
    next_module: NativeModuleId,
    failures: HashMap<SimOp, NativeError>,
    wait_timeout: Duration,
    redeliver_latest: bool,
    clock: u64,
}

impl SimState {
    fn take_failure(&mut self, op: SimOp) -> Result<(), NativeError> {
        match self.failures.remove(&op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn require_init(&self, what: &str) -> Result<(), NativeError> {
        if self.initialized {
            Ok(())
        } else {
            Err(NativeError::new(
                NativeFailure::Terminated,
                format!("{} called on an uninitialized SDK", what),
            ))
        }
    }

    fn module(&self, id: NativeModuleId) -> Result<&SimModule, NativeError> {
        self.modules.get(&id).ok_or_else(|| {
            NativeError::new(NativeFailure::Internal, format!("no module with id {}", id))
        })
    }

    /// Take one pending event from every module that has any.
    fn drain_tick(&mut self) -> Vec<(NativeModuleId, EventKind, Arc<SimFrame>)> {
        let mut fired = Vec::new();
        for (id, module) in self.modules.iter_mut() {
            if let Some((event, frame)) = module.pending.pop_front() {
                fired.push((*id, event, frame));
            } else if self.redeliver_latest {
                for (event, frame) in &module.latest {
                    fired.push((*id, *event, Arc::clone(frame)));
                }
            }
        }
        fired
    }

    /// Next event of one module: its oldest pending event, or its latest
    /// frames again when redelivery is on.
    fn take_for(&mut self, id: NativeModuleId) -> Vec<(NativeModuleId, EventKind, Arc<SimFrame>)> {
        let redeliver = self.redeliver_latest;
        let Some(module) = self.modules.get_mut(&id) else {
            return Vec::new();
        };
        match module.pending.pop_front() {
            Some((event, frame)) => vec![(id, event, frame)],
            None if redeliver => module
                .latest
                .iter()
                .map(|(event, frame)| (id, *event, Arc::clone(frame)))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Update module bookkeeping for events about to fire.
    fn record(&mut self, fired: &[(NativeModuleId, EventKind, Arc<SimFrame>)]) {
        for (id, event, frame) in fired {
            if let Some(module) = self.modules.get_mut(id) {
                module.timestamp = frame.timestamp();
                module.processing_time = 0.001 * frame.data().len().max(1) as f32;
                module.latest.insert(*event, Arc::clone(frame));
            }
        }
    }
}

struct SimInner {
    state: Mutex<SimState>,
    ready: Condvar,
    emit: Mutex<()>,
}

/// In-memory [`NativeSdk`].
///
/// Clones share state, so a test can keep one clone to inject frames while
/// the session owns another.
#[derive(Clone)]
pub struct SimulatedSdk {
    inner: Arc<SimInner>,
}

impl Default for SimulatedSdk {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedSdk {
    /// A simulator with one device able to host every module.
    pub fn new() -> Self {
        Self::with_devices(vec![DeviceInfo {
            name: "Simulated Sensor".into(),
            serial_number: "SIM-0001".into(),
            provider: "sim".into(),
            index: 0,
            modules: ModuleSet::all(),
        }])
    }

    /// A simulator exposing `devices`. Their `index` fields are renumbered.
    pub fn with_devices(mut devices: Vec<DeviceInfo>) -> Self {
        for (index, device) in devices.iter_mut().enumerate() {
            device.index = index;
        }
        Self {
            inner: Arc::new(SimInner {
                state: Mutex::new(SimState {
                    initialized: false,
                    running: false,
                    config: ConfigStore::default(),
                    devices,
                    selected: None,
                    modules: BTreeMap::new(),
                    next_module: 1,
                    failures: HashMap::new(),
                    wait_timeout: DEFAULT_WAIT_TIMEOUT,
                    redeliver_latest: false,
                    clock: 0,
                }),
                ready: Condvar::new(),
                emit: Mutex::new(()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serializes event emission so frames of one module leave in order.
    fn emit_lock(&self) -> MutexGuard<'_, ()> {
        self.inner.emit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until `module` has something to fire or `deadline` passes.
    fn wait_ready(&self, module: NativeModuleId, deadline: Instant) -> Result<(), NativeError> {
        let mut state = self.state();
        loop {
            if !state.initialized {
                return Err(NativeError::new(
                    NativeFailure::Terminated,
                    "SDK released while waiting",
                ));
            }
            let ready = match state.modules.get(&module) {
                Some(m) => !m.pending.is_empty() || (state.redeliver_latest && !m.latest.is_empty()),
                None => {
                    return Err(NativeError::new(
                        NativeFailure::Terminated,
                        format!("module {} destroyed while waiting", module),
                    ))
                }
            };
            if ready && state.running {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(NativeError::new(
                    NativeFailure::Timeout,
                    format!("no data for module {} within {:?}", module, state.wait_timeout),
                ));
            }
            state = self
                .inner
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// How long `wait_update` blocks before reporting a timeout.
    pub fn set_wait_timeout(&self, timeout: Duration) {
        self.state().wait_timeout = timeout;
    }

    /// Make idle modules fire their latest frame again on every tick, the
    /// way some vendor SDKs repeat callbacks when nothing new arrived.
    pub fn set_redeliver_latest(&self, enabled: bool) {
        self.state().redeliver_latest = enabled;
    }

    /// Make the next call to `op` fail with `failure`.
    pub fn fail_next(&self, op: SimOp, failure: NativeFailure, message: impl Into<String>) {
        self.state()
            .failures
            .insert(op, NativeError::new(failure, message));
    }

    /// Queue `event` with payload `data` on every live module of `kind`.
    ///
    /// Returns the number of modules the event was queued on.
    pub fn push_frame(&self, kind: ModuleKind, event: EventKind, data: impl Into<Vec<u8>>) -> usize {
        let data = data.into();
        let mut state = self.state();
        state.clock += 33;
        let now = state.clock;
        let mut queued = 0;
        for module in state.modules.values_mut().filter(|m| m.kind == kind) {
            let sequence = module.next_sequence.entry(event).or_insert(0);
            *sequence += 1;
            let frame = Arc::new(SimFrame::new(*sequence, now, data.clone()));
            module.pending.push_back((event, frame));
            queued += 1;
        }
        drop(state);
        if queued > 0 {
            self.inner.ready.notify_all();
        }
        queued
    }

    /// Events queued on module `id` and not yet fired.
    pub fn pending(&self, id: NativeModuleId) -> usize {
        self.state().modules.get(&id).map_or(0, |m| m.pending.len())
    }

    pub fn live_modules(&self) -> usize {
        self.state().modules.len()
    }

    pub fn is_initialized(&self) -> bool {
        self.state().initialized
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }
}

fn emit(sink: &mut dyn EventSink, fired: Vec<(NativeModuleId, EventKind, Arc<SimFrame>)>) {
    for (id, event, frame) in fired {
        sink.deliver(id, event, frame);
    }
}

impl NativeSdk for SimulatedSdk {
    fn init(&self, config_path: &Path) -> Result<(), NativeError> {
        let mut state = self.state();
        state.take_failure(SimOp::Init)?;
        if state.initialized {
            return Err(NativeError::new(
                NativeFailure::Internal,
                "SDK is already initialized",
            ));
        }
        let config = if config_path.as_os_str().is_empty() {
            ConfigStore::default()
        } else {
            ConfigStore::load(config_path)
                .map_err(|e| NativeError::new(NativeFailure::BadConfig, e.to_string()))?
        };
        state.wait_timeout = config
            .get_parsed::<u64>(WAIT_TIMEOUT_KEY)
            .map(Duration::from_millis)
            .unwrap_or(state.wait_timeout);
        state.config = config;
        state.initialized = true;
        state.selected = None;
        log::debug!("Simulator initialized with {} config values", state.config.len());
        Ok(())
    }

    fn run(&self) -> Result<(), NativeError> {
        let mut state = self.state();
        state.take_failure(SimOp::Run)?;
        state.require_init("run")?;
        state.running = true;
        Ok(())
    }

    fn release(&self) -> Result<(), NativeError> {
        let mut state = self.state();
        state.initialized = false;
        state.running = false;
        state.modules.clear();
        state.selected = None;
        let failure = state.take_failure(SimOp::Release);
        drop(state);
        self.inner.ready.notify_all();
        failure
    }

    fn update(&self, sink: &mut dyn EventSink) -> Result<(), NativeError> {
        let _emit = self.emit_lock();
        let mut state = self.state();
        state.take_failure(SimOp::Update)?;
        state.require_init("update")?;
        if !state.running {
            return Ok(());
        }
        let fired = state.drain_tick();
        state.record(&fired);
        drop(state);
        emit(sink, fired);
        Ok(())
    }

    fn wait_update(&self, module: NativeModuleId, sink: &mut dyn EventSink) -> Result<(), NativeError> {
        let deadline = {
            let mut state = self.state();
            state.take_failure(SimOp::WaitUpdate)?;
            state.require_init("wait_update")?;
            state.module(module)?;
            Instant::now() + state.wait_timeout
        };
        loop {
            self.wait_ready(module, deadline)?;
            let _emit = self.emit_lock();
            let mut state = self.state();
            let fired = state.take_for(module);
            if fired.is_empty() {
                // A concurrent update got there first.
                continue;
            }
            state.record(&fired);
            drop(state);
            emit(sink, fired);
            return Ok(());
        }
    }

    fn set_config_value(&self, key: &str, value: &str) -> Result<(), NativeError> {
        let mut state = self.state();
        state.take_failure(SimOp::Config)?;
        state.require_init("set_config_value")?;
        if key == WAIT_TIMEOUT_KEY {
            let ms: u64 = value.parse().map_err(|_| {
                NativeError::new(NativeFailure::BadConfig, format!("{} must be an integer", key))
            })?;
            state.wait_timeout = Duration::from_millis(ms);
        }
        state.config.set(key, value);
        Ok(())
    }

    fn config_value(&self, key: &str) -> Result<String, NativeError> {
        let mut state = self.state();
        state.take_failure(SimOp::Config)?;
        state.require_init("config_value")?;
        state.config.get(key).map(str::to_string).ok_or_else(|| {
            NativeError::new(NativeFailure::BadConfig, format!("unknown config key {}", key))
        })
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>, NativeError> {
        let state = self.state();
        state.require_init("devices")?;
        Ok(state.devices.clone())
    }

    fn select_device(&self, index: usize) -> Result<(), NativeError> {
        let mut state = self.state();
        state.take_failure(SimOp::SelectDevice)?;
        state.require_init("select_device")?;
        if index >= state.devices.len() {
            return Err(NativeError::new(
                NativeFailure::DeviceUnavailable,
                format!("no device at index {}", index),
            ));
        }
        state.selected = Some(index);
        Ok(())
    }

    fn create_module(&self, kind: ModuleKind) -> Result<NativeModuleId, NativeError> {
        let mut state = self.state();
        state.take_failure(SimOp::CreateModule)?;
        state.require_init("create_module")?;
        let device = state
            .devices
            .get(state.selected.unwrap_or(0))
            .ok_or_else(|| NativeError::new(NativeFailure::DeviceUnavailable, "no device connected"))?;
        if !device.modules.supports(kind) {
            return Err(NativeError::new(
                NativeFailure::Unsupported,
                format!("{} cannot host {}", device.name, kind),
            ));
        }
        let id = state.next_module;
        state.next_module += 1;
        state.modules.insert(
            id,
            SimModule {
                kind,
                pending: VecDeque::new(),
                latest: HashMap::new(),
                next_sequence: HashMap::new(),
                timestamp: 0,
                processing_time: 0.0,
            },
        );
        Ok(id)
    }

    fn destroy_module(&self, module: NativeModuleId) {
        self.state().modules.remove(&module);
    }

    fn processing_time(&self, module: NativeModuleId) -> Result<f32, NativeError> {
        let mut state = self.state();
        state.take_failure(SimOp::Query)?;
        Ok(state.module(module)?.processing_time)
    }

    fn timestamp(&self, module: NativeModuleId) -> Result<u64, NativeError> {
        let mut state = self.state();
        state.take_failure(SimOp::Query)?;
        Ok(state.module(module)?.timestamp)
    }

    fn can_update(&self, module: NativeModuleId) -> Result<bool, NativeError> {
        let mut state = self.state();
        state.take_failure(SimOp::Query)?;
        Ok(!state.module(module)?.pending.is_empty())
    }

    fn latest_frame(
        &self,
        module: NativeModuleId,
        event: EventKind,
    ) -> Result<Option<Arc<dyn NativeFrame>>, NativeError> {
        let mut state = self.state();
        state.take_failure(SimOp::Query)?;
        Ok(state
            .module(module)?
            .latest
            .get(&event)
            .map(|f| Arc::clone(f) as Arc<dyn NativeFrame>))
    }
}

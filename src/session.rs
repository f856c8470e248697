use crate::dispatch::{self, DispatchReport, Dispatcher, DriveScope};
use crate::error::{guard, Operation};
use crate::handle::{ModuleHandle, ModuleInner};
use crate::native::{NativeModuleId, NativeSdk};
use crate::types::{DeviceInfo, DeviceSelector, ModuleKind, SessionState};
use crate::{BridgeError, Result};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Native SDK instances that currently back an initialized session,
/// keyed by the address of the SDK object.
static CLAIMED_SDKS: Mutex<BTreeSet<usize>> = Mutex::new(BTreeSet::new());

fn claimed_sdks() -> MutexGuard<'static, BTreeSet<usize>> {
    CLAIMED_SDKS.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Lifecycle {
    state: SessionState,
    /// Bumped by every successful init; handles from older generations are stale.
    generation: u64,
    config_path: Option<PathBuf>,
    device: Option<DeviceInfo>,
}

/// State shared between a [`Session`] and the handles it created.
///
/// Lock order is `lifecycle` before `modules`. Neither lock is held while a
/// handler runs.
pub(crate) struct SessionCore {
    sdk: Arc<dyn NativeSdk>,
    lifecycle: Mutex<Lifecycle>,
    modules: Mutex<HashMap<NativeModuleId, Weak<ModuleInner>>>,
    dispatching: AtomicUsize,
}

impl SessionCore {
    pub(crate) fn sdk(&self) -> &dyn NativeSdk {
        self.sdk.as_ref()
    }

    fn sdk_key(&self) -> usize {
        Arc::as_ptr(&self.sdk) as *const () as usize
    }

    /// Take exclusive use of the native SDK for this session.
    fn claim_sdk(&self) -> Result<()> {
        if !claimed_sdks().insert(self.sdk_key()) {
            return Err(BridgeError::SdkInUse);
        }
        Ok(())
    }

    fn unclaim_sdk(&self) {
        claimed_sdks().remove(&self.sdk_key());
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn modules(&self) -> MutexGuard<'_, HashMap<NativeModuleId, Weak<ModuleInner>>> {
        self.modules.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> SessionState {
        self.lifecycle().state
    }

    /// Current generation, provided the session is live.
    fn live_generation(&self, operation: Operation) -> Result<u64> {
        let lifecycle = self.lifecycle();
        if !lifecycle.state.is_live() {
            return Err(BridgeError::InvalidState {
                operation,
                state: lifecycle.state,
            });
        }
        Ok(lifecycle.generation)
    }

    /// Fail unless the session is live and still in `generation`.
    pub(crate) fn check_generation(&self, operation: Operation, generation: u64) -> Result<()> {
        let current = self.live_generation(operation)?;
        if current != generation {
            return Err(BridgeError::StaleHandle(operation));
        }
        Ok(())
    }

    /// Fail unless native processing has been started.
    fn require_running(&self, operation: Operation) -> Result<()> {
        let state = self.state();
        if state != SessionState::Running {
            return Err(BridgeError::InvalidState { operation, state });
        }
        Ok(())
    }

    pub(crate) fn module(&self, id: NativeModuleId) -> Option<Arc<ModuleInner>> {
        self.modules().get(&id).and_then(Weak::upgrade)
    }

    fn register_module(&self, inner: &Arc<ModuleInner>) -> Result<()> {
        self.check_generation(Operation::Create(inner.kind), inner.generation)?;
        self.modules().insert(inner.id, Arc::downgrade(inner));
        Ok(())
    }

    /// Called when the last handle to a module goes away.
    pub(crate) fn forget_module(&self, id: NativeModuleId, generation: u64) {
        let current = {
            let lifecycle = self.lifecycle();
            lifecycle.state.is_live() && lifecycle.generation == generation
        };
        if !current {
            return;
        }
        let removed = {
            let mut modules = self.modules();
            match modules.get(&id) {
                Some(weak) if weak.strong_count() == 0 => {
                    modules.remove(&id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.sdk.destroy_module(id);
            log::debug!("Destroyed native module {}", id);
        }
    }

    /// Drop every module from the table and clear its registrations.
    fn invalidate_modules(&self) -> usize {
        let modules: Vec<Arc<ModuleInner>> = self
            .modules()
            .drain()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect();
        modules.iter().map(|m| m.registry.clear()).sum()
    }

    /// Mark a delivery in progress. Returns `None` once the session is no
    /// longer live; `release` checks the counter under the same lock.
    pub(crate) fn begin_dispatch(&self) -> Option<DispatchGuard<'_>> {
        let lifecycle = self.lifecycle();
        if !lifecycle.state.is_live() {
            return None;
        }
        self.dispatching.fetch_add(1, Ordering::AcqRel);
        Some(DispatchGuard(&self.dispatching))
    }
}

pub(crate) struct DispatchGuard<'a>(&'a AtomicUsize);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A tracking session bound to one native SDK instance.
///
/// The session moves through `Uninitialized -> Initialized -> Running ->
/// Released` and may be initialized again after release. Module handles
/// created before a release stay memory-safe but are permanently stale.
///
/// Dropping a live session releases it.
pub struct Session {
    core: Arc<SessionCore>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(sdk: Arc<dyn NativeSdk>) -> Session {
        Session {
            core: Arc::new(SessionCore {
                sdk,
                lifecycle: Mutex::new(Lifecycle {
                    state: SessionState::Uninitialized,
                    generation: 0,
                    config_path: None,
                    device: None,
                }),
                modules: Mutex::new(HashMap::new()),
                dispatching: AtomicUsize::new(0),
            }),
        }
    }

    pub fn builder(sdk: Arc<dyn NativeSdk>) -> SessionBuilder {
        SessionBuilder::new(sdk)
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    /// Configuration file passed to the last successful `init`.
    pub fn config_path(&self) -> Option<PathBuf> {
        self.core.lifecycle().config_path.clone()
    }

    /// Device chosen with [`select_device`](Self::select_device), if any.
    pub fn selected_device(&self) -> Option<DeviceInfo> {
        self.core.lifecycle().device.clone()
    }

    /// Number of modules with at least one live handle.
    pub fn module_count(&self) -> usize {
        self.core
            .modules()
            .values()
            .filter(|m| m.strong_count() > 0)
            .count()
    }

    /// Initialize the native SDK. An empty path selects the default configuration.
    ///
    /// Legal from `Uninitialized` and `Released`. On failure the state is unchanged.
    /// At most one session may hold a given SDK initialized at a time; others
    /// get [`SdkInUse`](BridgeError::SdkInUse) until it is released.
    pub fn init(&self, config_path: impl AsRef<Path>) -> Result<()> {
        if dispatch::is_driving() {
            return Err(BridgeError::Reentrant(Operation::Init));
        }
        let config_path = config_path.as_ref();
        let mut lifecycle = self.core.lifecycle();
        if !matches!(
            lifecycle.state,
            SessionState::Uninitialized | SessionState::Released
        ) {
            return Err(BridgeError::InvalidState {
                operation: Operation::Init,
                state: lifecycle.state,
            });
        }
        self.core.claim_sdk()?;
        if let Err(e) = guard(Operation::Init, || self.core.sdk.init(config_path)) {
            self.core.unclaim_sdk();
            return Err(e);
        }
        lifecycle.state = SessionState::Initialized;
        lifecycle.generation += 1;
        lifecycle.device = None;
        lifecycle.config_path = if config_path.as_os_str().is_empty() {
            None
        } else {
            Some(config_path.to_path_buf())
        };
        log::info!(
            "Session initialized (generation {}, config {})",
            lifecycle.generation,
            if config_path.as_os_str().is_empty() {
                "<default>".into()
            } else {
                config_path.display().to_string()
            }
        );
        Ok(())
    }

    /// Start native processing.
    ///
    /// A native failure here is unrecoverable for this initialization: the
    /// SDK is released and the session drops back to `Uninitialized`, so the
    /// caller can `init` again from scratch.
    pub fn run(&self) -> Result<()> {
        if dispatch::is_driving() {
            return Err(BridgeError::Reentrant(Operation::Run));
        }
        let failure = {
            let mut lifecycle = self.core.lifecycle();
            if lifecycle.state != SessionState::Initialized {
                return Err(BridgeError::InvalidState {
                    operation: Operation::Run,
                    state: lifecycle.state,
                });
            }
            match guard(Operation::Run, || self.core.sdk.run()) {
                Ok(()) => {
                    lifecycle.state = SessionState::Running;
                    log::info!("Session running");
                    return Ok(());
                }
                Err(e) => {
                    lifecycle.state = SessionState::Uninitialized;
                    lifecycle.device = None;
                    e
                }
            }
        };
        self.core.invalidate_modules();
        if let Err(e) = guard(Operation::Release, || self.core.sdk.release()) {
            log::warn!("Release after failed run also failed: {}", e);
        }
        self.core.unclaim_sdk();
        log::warn!("Run failed, session reset to uninitialized: {}", failure);
        Err(failure)
    }

    /// Advance every module by one tick and dispatch the resulting callbacks.
    ///
    /// Legal only while `Running`.
    ///
    /// Returns [`Dispatch`](BridgeError::Dispatch) if any handler failed; the
    /// remaining handlers still received their frames.
    pub fn update(&self) -> Result<DispatchReport> {
        let _scope = DriveScope::enter().ok_or(BridgeError::Reentrant(Operation::Update))?;
        self.core.require_running(Operation::Update)?;
        let mut dispatcher = Dispatcher::new(&self.core);
        let native = guard(Operation::Update, || self.core.sdk.update(&mut dispatcher));
        let report = dispatcher.finish();
        native?;
        report.into_result()
    }

    /// Block until `module` has new data, then dispatch its callbacks.
    ///
    /// Frames already delivered by `update` are not delivered again. Only one
    /// `wait_update` may be pending per module.
    pub fn wait_update(&self, module: &ModuleHandle) -> Result<DispatchReport> {
        let _scope = DriveScope::enter().ok_or(BridgeError::Reentrant(Operation::WaitUpdate))?;
        let inner = module.inner(Operation::WaitUpdate)?;
        if !inner.belongs_to(&self.core) {
            return Err(BridgeError::StaleHandle(Operation::WaitUpdate));
        }
        self.core
            .check_generation(Operation::WaitUpdate, inner.generation)?;
        self.core.require_running(Operation::WaitUpdate)?;
        let _waiting = inner.begin_wait()?;
        let mut dispatcher = Dispatcher::new(&self.core);
        let native = guard(Operation::WaitUpdate, || {
            self.core.sdk.wait_update(inner.id, &mut dispatcher)
        });
        let report = dispatcher.finish();
        native?;
        report.into_result()
    }

    /// Tear down the native SDK and invalidate every handle.
    ///
    /// The SDK may then be initialized by this or another session. Fails while any thread is delivering frames to handlers. A blocked
    /// `wait_update` on another thread is woken and returns an error.
    pub fn release(&self) -> Result<()> {
        if dispatch::is_driving() {
            return Err(BridgeError::Reentrant(Operation::Release));
        }
        {
            let mut lifecycle = self.core.lifecycle();
            if !lifecycle.state.is_live() {
                return Err(BridgeError::InvalidState {
                    operation: Operation::Release,
                    state: lifecycle.state,
                });
            }
            if self.core.dispatching.load(Ordering::Acquire) > 0 {
                return Err(BridgeError::DispatchPending);
            }
            lifecycle.state = SessionState::Released;
            lifecycle.device = None;
        }
        let dropped = self.core.invalidate_modules();
        let result = guard(Operation::Release, || self.core.sdk.release());
        self.core.unclaim_sdk();
        log::info!("Session released ({} registrations dropped)", dropped);
        result
    }

    /// Override a configuration value for this session.
    pub fn set_config_value(&self, key: &str, value: &str) -> Result<()> {
        self.core.live_generation(Operation::Config)?;
        guard(Operation::Config, || self.core.sdk.set_config_value(key, value))?;
        log::debug!("Config {} = {}", key, value);
        Ok(())
    }

    pub fn get_config_value(&self, key: &str) -> Result<String> {
        self.core.live_generation(Operation::Config)?;
        guard(Operation::Config, || self.core.sdk.config_value(key))
    }

    /// Sensors visible to the native SDK.
    pub fn devices(&self) -> Result<Vec<DeviceInfo>> {
        self.core.live_generation(Operation::Devices)?;
        guard(Operation::Devices, || self.core.sdk.devices())
    }

    /// Bind the session to one device. Must precede module creation.
    pub fn select_device(&self, selector: &DeviceSelector) -> Result<DeviceInfo> {
        let mut lifecycle = self.core.lifecycle();
        if lifecycle.state != SessionState::Initialized {
            return Err(BridgeError::InvalidState {
                operation: Operation::SelectDevice,
                state: lifecycle.state,
            });
        }
        let devices = guard(Operation::Devices, || self.core.sdk.devices())?;
        let device = selector.resolve(&devices)?.clone();
        guard(Operation::SelectDevice, || {
            self.core.sdk.select_device(device.index)
        })?;
        log::info!(
            "Selected device {} ({}, serial {})",
            device.index,
            device.name,
            device.serial_number
        );
        lifecycle.device = Some(device.clone());
        Ok(device)
    }

    /// Create a native module of `kind`.
    pub fn create_module(&self, kind: ModuleKind) -> Result<ModuleHandle> {
        let operation = Operation::Create(kind);
        let generation = self.core.live_generation(operation)?;
        let id = guard(operation, || self.core.sdk.create_module(kind))?;
        let inner = Arc::new(ModuleInner::new(
            id,
            kind,
            generation,
            Arc::downgrade(&self.core),
        ));
        if let Err(e) = self.core.register_module(&inner) {
            // Released while the native call ran.
            self.core.sdk.destroy_module(id);
            return Err(e);
        }
        log::info!("Created {} (native id {})", kind, id);
        Ok(ModuleHandle::from_inner(inner))
    }

    pub fn create_depth_sensor(&self) -> Result<ModuleHandle> {
        self.create_module(ModuleKind::DepthSensor)
    }

    pub fn create_color_sensor(&self) -> Result<ModuleHandle> {
        self.create_module(ModuleKind::ColorSensor)
    }

    pub fn create_user_tracker(&self) -> Result<ModuleHandle> {
        self.create_module(ModuleKind::UserTracker)
    }

    pub fn create_skeleton_tracker(&self) -> Result<ModuleHandle> {
        self.create_module(ModuleKind::SkeletonTracker)
    }

    pub fn create_hand_tracker(&self) -> Result<ModuleHandle> {
        self.create_module(ModuleKind::HandTracker)
    }

    pub fn create_gesture_recognizer(&self) -> Result<ModuleHandle> {
        self.create_module(ModuleKind::GestureRecognizer)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let state = self.state();
        if state.is_live() {
            log::info!("Session dropped while {}, releasing", state);
            if let Err(e) = self.release() {
                log::warn!("Release on drop failed: {}", e);
            }
        }
    }
}

/// Step-by-step setup of a [`Session`]: init, device, overrides, modules, run.
pub struct SessionBuilder {
    sdk: Arc<dyn NativeSdk>,
    config_path: PathBuf,
    overrides: Vec<(String, String)>,
    device: Option<DeviceSelector>,
    modules: Vec<ModuleKind>,
    run: bool,
}

impl SessionBuilder {
    pub fn new(sdk: Arc<dyn NativeSdk>) -> Self {
        Self {
            sdk,
            config_path: PathBuf::new(),
            overrides: Vec::new(),
            device: None,
            modules: Vec::new(),
            run: true,
        }
    }

    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = path.into();
        self
    }

    /// Applied after init, before any module is created.
    pub fn with_config_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((key.into(), value.into()));
        self
    }

    pub fn with_device(mut self, selector: DeviceSelector) -> Self {
        self.device = Some(selector);
        self
    }

    pub fn with_module(mut self, kind: ModuleKind) -> Self {
        self.modules.push(kind);
        self
    }

    pub fn with_modules(mut self, kinds: impl IntoIterator<Item = ModuleKind>) -> Self {
        self.modules.extend(kinds);
        self
    }

    /// Whether `build` also starts processing. Defaults to `true`.
    pub fn run(mut self, run: bool) -> Self {
        self.run = run;
        self
    }

    /// Returns the session and one handle per requested module, in request order.
    pub fn build(self) -> Result<(Session, Vec<ModuleHandle>)> {
        let session = Session::new(self.sdk);
        session.init(&self.config_path)?;
        if let Some(selector) = &self.device {
            session.select_device(selector)?;
        }
        for (key, value) in &self.overrides {
            session.set_config_value(key, value)?;
        }
        let handles = self
            .modules
            .iter()
            .map(|kind| session.create_module(*kind))
            .collect::<Result<Vec<_>>>()?;
        if self.run {
            session.run()?;
        }
        Ok((session, handles))
    }
}

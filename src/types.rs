use crate::{BridgeError, Result};
use std::ffi::c_void;
use std::fmt;

/// Stable identifier of one callback registration on a module.
///
/// Ids start at 1 and are never reused for the lifetime of a module.
pub type HandlerId = u64;

/// Tracking/sensing unit a module handle refers to.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModuleKind {
    DepthSensor = 0,
    ColorSensor = 1,
    UserTracker = 2,
    SkeletonTracker = 3,
    HandTracker = 4,
    GestureRecognizer = 5,
}

impl ModuleKind {
    pub const ALL: [ModuleKind; 6] = [
        ModuleKind::DepthSensor,
        ModuleKind::ColorSensor,
        ModuleKind::UserTracker,
        ModuleKind::SkeletonTracker,
        ModuleKind::HandTracker,
        ModuleKind::GestureRecognizer,
    ];

    /// Convert a raw C enum value.
    pub fn from_raw(raw: i32) -> Option<ModuleKind> {
        Self::ALL.iter().copied().find(|k| *k as i32 == raw)
    }

    pub fn name(self) -> &'static str {
        match self {
            ModuleKind::DepthSensor => "DepthSensor",
            ModuleKind::ColorSensor => "ColorSensor",
            ModuleKind::UserTracker => "UserTracker",
            ModuleKind::SkeletonTracker => "SkeletonTracker",
            ModuleKind::HandTracker => "HandTracker",
            ModuleKind::GestureRecognizer => "GestureRecognizer",
        }
    }

    /// Events this module kind emits, primary event first.
    pub fn events(self) -> &'static [EventKind] {
        match self {
            ModuleKind::DepthSensor | ModuleKind::ColorSensor | ModuleKind::HandTracker => {
                &[EventKind::Frame]
            }
            ModuleKind::UserTracker | ModuleKind::SkeletonTracker => {
                &[EventKind::Frame, EventKind::NewUser, EventKind::LostUser]
            }
            ModuleKind::GestureRecognizer => &[EventKind::Gestures],
        }
    }

    /// Whether callbacks for `event` can be connected on this module kind.
    pub fn emits(self, event: EventKind) -> bool {
        self.events().contains(&event)
    }

    /// The event returned by synchronous snapshot accessors.
    pub fn primary_event(self) -> EventKind {
        self.events()[0]
    }

    /// Capability flag a device must report to host this module.
    pub fn capability(self) -> ModuleSet {
        match self {
            ModuleKind::DepthSensor => ModuleSet::DEPTH_SENSOR,
            ModuleKind::ColorSensor => ModuleSet::COLOR_SENSOR,
            ModuleKind::UserTracker => ModuleSet::USER_TRACKER,
            ModuleKind::SkeletonTracker => ModuleSet::SKELETON_TRACKER,
            ModuleKind::HandTracker => ModuleSet::HAND_TRACKER,
            ModuleKind::GestureRecognizer => ModuleSet::GESTURE_RECOGNIZER,
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of native event a callback subscribes to.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// A new frame (depth, color, user, skeleton or hand data).
    Frame = 0,
    /// A user entered the scene.
    NewUser = 1,
    /// A user left the scene.
    LostUser = 2,
    /// Completed gestures.
    Gestures = 3,
}

impl EventKind {
    pub fn from_raw(raw: i32) -> Option<EventKind> {
        match raw {
            0 => Some(EventKind::Frame),
            1 => Some(EventKind::NewUser),
            2 => Some(EventKind::LostUser),
            3 => Some(EventKind::Gestures),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Frame => "Frame",
            EventKind::NewUser => "NewUser",
            EventKind::LostUser => "LostUser",
            EventKind::Gestures => "Gestures",
        };
        f.write_str(name)
    }
}

bitflags::bitflags! {
    /// Set of modules a device can host.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[repr(C)]
    pub struct ModuleSet: u32 {
        const DEPTH_SENSOR       = 1 << 0;
        const COLOR_SENSOR       = 1 << 1;
        const USER_TRACKER       = 1 << 2;
        const SKELETON_TRACKER   = 1 << 3;
        const HAND_TRACKER       = 1 << 4;
        const GESTURE_RECOGNIZER = 1 << 5;
    }
}

impl ModuleSet {
    pub fn supports(self, kind: ModuleKind) -> bool {
        self.contains(kind.capability())
    }
}

/// Lifecycle state of a [`Session`](crate::Session).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Uninitialized = 0,
    Initialized = 1,
    Running = 2,
    Released = 3,
}

impl SessionState {
    /// Module creation, configuration and release are legal in these states.
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Initialized | SessionState::Running)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initialized => "initialized",
            SessionState::Running => "running",
            SessionState::Released => "released",
        };
        f.write_str(name)
    }
}

/// Opaque value supplied by the foreign side at registration time.
///
/// The bridge stores it next to the handler id and hands it back with every
/// envelope. It is never dereferenced, so a pointer-sized integer is enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Context(usize);

impl Context {
    pub const NONE: Context = Context(0);

    pub fn new(value: usize) -> Context {
        Context(value)
    }

    pub fn from_ptr<T>(ptr: *mut T) -> Context {
        Context(ptr as usize)
    }

    pub fn value(self) -> usize {
        self.0
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }
}

/// A sensor visible to the native SDK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub serial_number: String,
    pub provider: String,
    /// Position in the native device list.
    pub index: usize,
    pub modules: ModuleSet,
}

/// Policy for binding a session to one device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceSelector {
    /// Use the device at this position in the device list.
    ByIndex(usize),
    /// Use the device with this serial number.
    BySerialNumber(String),
    /// Expect exactly one device and use it.
    #[default]
    DefaultSingle,
}

impl DeviceSelector {
    /// Pick a device from `devices` according to this policy.
    pub fn resolve<'a>(&self, devices: &'a [DeviceInfo]) -> Result<&'a DeviceInfo> {
        match self {
            DeviceSelector::ByIndex(index) => devices.get(*index).ok_or_else(|| {
                BridgeError::Init(format!(
                    "no device at index {} ({} available)",
                    index,
                    devices.len()
                ))
            }),
            DeviceSelector::BySerialNumber(serial) => devices
                .iter()
                .find(|d| &d.serial_number == serial)
                .ok_or_else(|| BridgeError::Init(format!("no device with serial {}", serial))),
            DeviceSelector::DefaultSingle => match devices {
                [only] => Ok(only),
                [] => Err(BridgeError::Init("no device found".into())),
                many => Err(BridgeError::Init(format!(
                    "expected exactly one device, found {}",
                    many.len()
                ))),
            },
        }
    }
}

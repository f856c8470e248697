mod common;

use common::{running_session, sim_session, write_config};
use std::sync::Arc;
use std::time::{Duration, Instant};
use trackbridge::{
    BridgeError, Context, DeviceInfo, DeviceSelector, ErrorKind, ModuleHandle, ModuleKind,
    ModuleSet, NativeFailure, Operation, Session, SessionBuilder, SessionState, SimOp,
    SimulatedSdk, SubKind,
};

#[test]
fn init_release_init_with_config_file() {
    let (_sdk, session) = sim_session();
    let path = write_config(r#"{"Skeletonization": {"ActiveUsers": 2}, "Depth": {"Mirror": false}}"#);

    session.init(&path).unwrap();
    assert_eq!(session.state(), SessionState::Initialized);
    assert_eq!(session.config_path(), Some(path.clone()));
    assert_eq!(session.get_config_value("Skeletonization.ActiveUsers").unwrap(), "2");

    session.run().unwrap();
    session.release().unwrap();
    assert_eq!(session.state(), SessionState::Released);

    session.init(&path).unwrap();
    assert_eq!(session.state(), SessionState::Initialized);
    assert_eq!(session.get_config_value("Depth.Mirror").unwrap(), "false");
    session.release().unwrap();
}

#[test]
fn bad_config_fails_init_and_allows_retry() {
    let (_sdk, session) = sim_session();

    let err = session.init("/definitely/not/here/config.json").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Init);
    assert!(err.to_string().contains("config.json"));
    assert_eq!(session.state(), SessionState::Uninitialized);

    let garbage = write_config("{ not json");
    assert_eq!(session.init(&garbage).unwrap_err().kind(), ErrorKind::Init);
    let not_object = write_config("[1, 2, 3]");
    assert_eq!(session.init(&not_object).unwrap_err().kind(), ErrorKind::Init);

    session.init(write_config("{}")).unwrap();
    assert_eq!(session.state(), SessionState::Initialized);
}

#[test]
fn lifecycle_misuse_is_invalid_state() {
    let (_sdk, session) = sim_session();
    assert_eq!(session.update().unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(session.release().unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(
        session.create_depth_sensor().unwrap_err(),
        BridgeError::InvalidState {
            operation: Operation::Create(ModuleKind::DepthSensor),
            state: SessionState::Uninitialized,
        }
    );

    session.init("").unwrap();
    assert_eq!(
        session.init("").unwrap_err(),
        BridgeError::InvalidState {
            operation: Operation::Init,
            state: SessionState::Initialized,
        }
    );
    assert_eq!(
        session.update().unwrap_err(),
        BridgeError::InvalidState {
            operation: Operation::Update,
            state: SessionState::Initialized,
        }
    );
    let depth = session.create_depth_sensor().unwrap();
    assert_eq!(session.wait_update(&depth).unwrap_err().kind(), ErrorKind::InvalidState);
    session.run().unwrap();
    assert_eq!(session.update().unwrap().events, 0);
}

#[test]
fn handles_are_stale_after_release() {
    let (sdk, session) = running_session();
    let depth = session.create_depth_sensor().unwrap();
    let id = depth.connect_on_frame(Context::NONE, |_env| Ok(())).unwrap();
    assert!(depth.is_connected(id));

    session.release().unwrap();
    assert_eq!(sdk.live_modules(), 0);
    assert_eq!(depth.processing_time().unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(
        depth.connect_on_frame(Context::NONE, |_env| Ok(())).unwrap_err().kind(),
        ErrorKind::Connect
    );
    assert_eq!(depth.disconnect(id), Err(BridgeError::UnknownHandler(id)));

    // A new generation never revives old handles.
    session.init("").unwrap();
    assert_eq!(
        depth.timestamp().unwrap_err(),
        BridgeError::StaleHandle(Operation::Query)
    );
    assert_eq!(
        session.wait_update(&depth).unwrap_err(),
        BridgeError::StaleHandle(Operation::WaitUpdate)
    );
    let fresh = session.create_depth_sensor().unwrap();
    assert!(!fresh.ptr_eq(&depth));
    assert!(fresh.timestamp().is_ok());
}

#[test]
fn wait_update_after_release_fails_without_blocking() {
    let (sdk, session) = running_session();
    sdk.set_wait_timeout(Duration::from_secs(30));
    let hand = session.create_hand_tracker().unwrap();
    session.release().unwrap();

    let started = Instant::now();
    let err = session.wait_update(&hand).unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(
        err,
        BridgeError::InvalidState {
            operation: Operation::WaitUpdate,
            state: SessionState::Released,
        }
    );
}

#[test]
fn release_wakes_a_blocked_waiter() {
    let (sdk, session) = running_session();
    sdk.set_wait_timeout(Duration::from_secs(30));
    let hand = session.create_hand_tracker().unwrap();

    std::thread::scope(|scope| {
        let waiter = scope.spawn(|| session.wait_update(&hand));
        std::thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        session.release().unwrap();
        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Update);
        assert!(started.elapsed() < Duration::from_secs(5));
    });
}

#[test]
fn run_failure_resets_session_for_a_fresh_init() {
    let (sdk, session) = sim_session();
    session.init("").unwrap();
    let depth = session.create_depth_sensor().unwrap();
    sdk.fail_next(SimOp::Run, NativeFailure::DeviceUnavailable, "sensor unplugged");

    let err = session.run().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Init);
    assert!(err.to_string().contains("sensor unplugged"));
    assert_eq!(session.state(), SessionState::Uninitialized);
    assert!(!sdk.is_initialized());
    assert_eq!(sdk.live_modules(), 0);
    assert_eq!(depth.timestamp().unwrap_err().kind(), ErrorKind::InvalidState);

    session.init("").unwrap();
    session.run().unwrap();
    assert_eq!(session.state(), SessionState::Running);
}

#[test]
fn license_failure_during_init_is_distinguishable() {
    let (sdk, session) = sim_session();
    sdk.fail_next(SimOp::Init, NativeFailure::LicenseNotAcquired, "no license file");
    let err = session.init("").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Init);
    assert_eq!(err.sub_kind(), SubKind::LicenseNotAcquired);
    assert_eq!(session.state(), SessionState::Uninitialized);
    session.init("").unwrap();
}

#[test]
fn null_handle_fails_before_native_call() {
    let (sdk, session) = running_session();
    sdk.fail_next(SimOp::WaitUpdate, NativeFailure::Internal, "must not be reached");
    let null = ModuleHandle::null();
    assert_eq!(
        session.wait_update(&null).unwrap_err(),
        BridgeError::NullHandle(Operation::WaitUpdate)
    );
    assert_eq!(null.can_update().unwrap_err().kind(), ErrorKind::NullHandle);
    assert_eq!(null.handler_count(), 0);
}

#[test]
fn module_queries_report_native_state() {
    let (sdk, session) = running_session();
    let color = session.create_color_sensor().unwrap();
    assert_eq!(color.kind(), Some(ModuleKind::ColorSensor));
    assert!(!color.can_update().unwrap());
    assert!(color.snapshot().unwrap().is_none());

    sdk.push_frame(ModuleKind::ColorSensor, trackbridge::EventKind::Frame, vec![0u8; 10]);
    assert!(color.can_update().unwrap());
    session.update().unwrap();
    assert!(!color.can_update().unwrap());
    assert!(color.timestamp().unwrap() > 0);
    assert!(color.processing_time().unwrap() > 0.0);

    let snapshot = color.snapshot().unwrap().unwrap();
    assert_eq!(snapshot.handler_id(), 0);
    assert_eq!(snapshot.data().len(), 10);
}

#[test]
fn connect_rejects_events_the_module_does_not_emit() {
    let (_sdk, session) = running_session();
    let gestures = session.create_gesture_recognizer().unwrap();
    let err = gestures
        .connect_on_new_user(Context::NONE, |_env| Ok(()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connect);
    assert!(gestures.connect_on_gestures(Context::NONE, |_env| Ok(())).is_ok());
}

#[test]
fn builder_creates_everything_in_order() {
    common::init_logging();
    let sdk = SimulatedSdk::new();
    let path = write_config(r#"{"Skeletonization": {"ActiveUsers": 1}}"#);
    let (session, handles) = SessionBuilder::new(Arc::new(sdk.clone()))
        .config_path(&path)
        .with_device(DeviceSelector::DefaultSingle)
        .with_config_value("Skeletonization.ActiveUsers", "4")
        .with_modules([ModuleKind::SkeletonTracker, ModuleKind::HandTracker])
        .build()
        .unwrap();

    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(
        handles.iter().map(|h| h.kind()).collect::<Vec<_>>(),
        vec![Some(ModuleKind::SkeletonTracker), Some(ModuleKind::HandTracker)]
    );
    assert_eq!(session.get_config_value("Skeletonization.ActiveUsers").unwrap(), "4");
    assert_eq!(session.selected_device().map(|d| d.serial_number), Some("SIM-0001".into()));
    assert_eq!(sdk.live_modules(), 2);
}

#[test]
fn failed_build_releases_the_partial_session() {
    common::init_logging();
    let sdk = SimulatedSdk::with_devices(vec![DeviceInfo {
        name: "Depth camera".into(),
        serial_number: "D-1".into(),
        provider: "sim".into(),
        index: 0,
        modules: ModuleSet::DEPTH_SENSOR,
    }]);
    let err = Session::builder(Arc::new(sdk.clone()))
        .with_module(ModuleKind::DepthSensor)
        .with_module(ModuleKind::GestureRecognizer)
        .build()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Creation);
    assert!(!sdk.is_initialized());
}

#[test]
fn device_selection() {
    common::init_logging();
    let device = |name: &str, serial: &str, modules| DeviceInfo {
        name: name.into(),
        serial_number: serial.into(),
        provider: "sim".into(),
        index: 0,
        modules,
    };
    let sdk = SimulatedSdk::with_devices(vec![
        device("Front", "A", ModuleSet::all()),
        device("Rear", "B", ModuleSet::DEPTH_SENSOR | ModuleSet::COLOR_SENSOR),
    ]);
    let session = Session::new(Arc::new(sdk));
    session.init("").unwrap();

    let devices = session.devices().unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[1].index, 1);

    assert_eq!(
        session.select_device(&DeviceSelector::DefaultSingle).unwrap_err().kind(),
        ErrorKind::Init
    );
    assert!(session.select_device(&DeviceSelector::ByIndex(5)).is_err());

    let rear = session
        .select_device(&DeviceSelector::BySerialNumber("B".into()))
        .unwrap();
    assert_eq!(rear.index, 1);
    assert_eq!(session.selected_device(), Some(rear));
    assert!(session.create_depth_sensor().is_ok());
    assert_eq!(
        session.create_skeleton_tracker().unwrap_err().kind(),
        ErrorKind::Creation
    );

    session.run().unwrap();
    assert_eq!(
        session.select_device(&DeviceSelector::ByIndex(0)).unwrap_err().kind(),
        ErrorKind::InvalidState
    );
}

#[test]
fn dropping_a_running_session_releases_it() {
    let (sdk, session) = running_session();
    let skeleton = session.create_skeleton_tracker().unwrap();
    drop(session);
    assert!(!sdk.is_initialized());
    // The handle outlives its session and stays safe to use.
    assert_eq!(skeleton.can_update().unwrap_err().kind(), ErrorKind::InvalidState);
    drop(skeleton);
}

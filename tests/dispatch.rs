mod common;

use common::{record_frames, running_session, sequences, write_config};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use trackbridge::{
    BridgeError, Context, ErrorKind, EventKind, FrameEnvelope, HandlerId, ModuleKind,
    NativeFailure, Operation, Session, SimOp, SimulatedSdk, SubKind,
};

#[test]
fn connect_update_disconnect_release() {
    common::init_logging();
    let sdk = SimulatedSdk::new();
    let session = Session::new(Arc::new(sdk.clone()));
    session
        .init(write_config(r#"{"Skeletonization": {"ActiveUsers": 2}}"#))
        .unwrap();
    session.run().unwrap();

    let skeleton = session.create_skeleton_tracker().unwrap();
    let ctx = Context::new(0xC0FFEE);
    let (id, seen) = record_frames(&skeleton, ctx);
    assert_eq!(id, 1);

    for _ in 0..3 {
        sdk.push_frame(ModuleKind::SkeletonTracker, EventKind::Frame, vec![1, 2, 3]);
        let report = session.update().unwrap();
        assert_eq!(report.delivered, 1);
    }
    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|e| e.context() == ctx && e.handler_id() == id));
        assert!(seen.iter().all(|e| e.module() == ModuleKind::SkeletonTracker));
    }
    assert_eq!(sequences(&seen), vec![1, 2, 3]);

    skeleton.disconnect(id).unwrap();
    assert_eq!(skeleton.disconnect(id), Err(BridgeError::UnknownHandler(id)));
    sdk.push_frame(ModuleKind::SkeletonTracker, EventKind::Frame, vec![4]);
    let report = session.update().unwrap();
    assert_eq!(report.events, 1);
    assert_eq!(report.delivered, 0);
    assert_eq!(seen.lock().unwrap().len(), 3);

    session.release().unwrap();
}

#[test]
fn frames_arrive_in_production_order() {
    for n in [0u64, 1, 100] {
        let (sdk, session) = running_session();
        let depth = session.create_depth_sensor().unwrap();
        let (_id, seen) = record_frames(&depth, Context::NONE);

        for i in 0..n {
            sdk.push_frame(ModuleKind::DepthSensor, EventKind::Frame, i.to_le_bytes());
        }
        for _ in 0..=n {
            session.update().unwrap();
        }
        assert_eq!(sequences(&seen), (1..=n).collect::<Vec<_>>(), "n = {}", n);
    }
}

#[test]
fn mixing_update_and_wait_update_never_double_delivers() {
    let (sdk, session) = running_session();
    sdk.set_redeliver_latest(true);
    sdk.set_wait_timeout(Duration::from_millis(200));
    let hand = session.create_hand_tracker().unwrap();
    let (id, seen) = record_frames(&hand, Context::NONE);

    sdk.push_frame(ModuleKind::HandTracker, EventKind::Frame, vec![1]);
    assert_eq!(session.wait_update(&hand).unwrap().delivered, 1);

    // The SDK repeats the latest frame; the bridge must not.
    let report = session.update().unwrap();
    assert_eq!(report.delivered, 0);
    assert_eq!(report.duplicates, 1);
    let report = session.wait_update(&hand).unwrap();
    assert_eq!(report.duplicates, 1);

    sdk.push_frame(ModuleKind::HandTracker, EventKind::Frame, vec![2]);
    session.update().unwrap();
    session.wait_update(&hand).unwrap();
    session.update().unwrap();

    assert_eq!(sequences(&seen), vec![1, 2]);
    assert_eq!(hand.handler_stats(id).map(|s| s.delivered), Some(2));
}

#[test]
fn update_and_wait_update_from_different_threads() {
    let (sdk, session) = running_session();
    sdk.set_wait_timeout(Duration::from_millis(100));
    let depth = session.create_depth_sensor().unwrap();
    let hand = session.create_hand_tracker().unwrap();
    let (_d, depth_seen) = record_frames(&depth, Context::NONE);
    let (_h, hand_seen) = record_frames(&hand, Context::NONE);

    std::thread::scope(|scope| {
        let waiter = scope.spawn(|| {
            let deadline = Instant::now() + Duration::from_secs(10);
            while hand_seen.lock().unwrap().len() < 20 && Instant::now() < deadline {
                // Timeouts are expected whenever update drained the frame first.
                let _ = session.wait_update(&hand);
            }
        });
        for _ in 0..20 {
            sdk.push_frame(ModuleKind::DepthSensor, EventKind::Frame, vec![0]);
            sdk.push_frame(ModuleKind::HandTracker, EventKind::Frame, vec![1]);
            session.update().unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }
        waiter.join().unwrap();
    });

    assert_eq!(sequences(&depth_seen), (1..=20).collect::<Vec<_>>());
    assert_eq!(sequences(&hand_seen), (1..=20).collect::<Vec<_>>());
}

#[test]
fn failing_handler_does_not_starve_others() {
    let (sdk, session) = running_session();
    let user = session.create_user_tracker().unwrap();
    let bad = user
        .connect_on_frame(Context::NONE, |_env| panic!("handler bug"))
        .unwrap();
    let erring = user
        .connect_on_frame(Context::NONE, |_env| Err("cannot keep up".into()))
        .unwrap();
    let (good, seen) = record_frames(&user, Context::NONE);

    sdk.push_frame(ModuleKind::UserTracker, EventKind::Frame, vec![7]);
    match session.update() {
        Err(BridgeError::Dispatch {
            handler,
            message,
            failures,
        }) => {
            assert_eq!(handler, bad);
            assert!(message.contains("handler bug"));
            assert_eq!(failures, 2);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(sequences(&seen), vec![1]);
    assert_eq!(user.handler_stats(bad).map(|s| s.failed), Some(1));
    assert_eq!(user.handler_stats(good).map(|s| s.delivered), Some(1));

    user.disconnect(bad).unwrap();
    user.disconnect(erring).unwrap();
    sdk.push_frame(ModuleKind::UserTracker, EventKind::Frame, vec![8]);
    session.update().unwrap();
    assert_eq!(sequences(&seen), vec![1, 2]);
}

#[test]
fn license_failure_during_update_is_a_sub_kind() {
    let (sdk, session) = running_session();
    sdk.fail_next(SimOp::Update, NativeFailure::LicenseNotAcquired, "trial expired");
    let err = session.update().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Update);
    assert_eq!(err.sub_kind(), SubKind::LicenseNotAcquired);
    assert!(err.to_string().contains("trial expired"));
    assert!(session.update().is_ok());
}

#[test]
fn user_events_reach_their_own_handlers() {
    let (sdk, session) = running_session();
    let users = session.create_user_tracker().unwrap();
    let new_users = Arc::new(AtomicUsize::new(0));
    let lost_users = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&new_users);
    users
        .connect_on_new_user(Context::new(1), move |env| {
            assert_eq!(env.event(), EventKind::NewUser);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    let counter = Arc::clone(&lost_users);
    users
        .connect_on_lost_user(Context::new(2), move |env| {
            assert_eq!(env.event(), EventKind::LostUser);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    sdk.push_frame(ModuleKind::UserTracker, EventKind::NewUser, vec![1]);
    sdk.push_frame(ModuleKind::UserTracker, EventKind::NewUser, vec![2]);
    sdk.push_frame(ModuleKind::UserTracker, EventKind::LostUser, vec![1]);
    for _ in 0..3 {
        session.update().unwrap();
    }
    assert_eq!(new_users.load(Ordering::SeqCst), 2);
    assert_eq!(lost_users.load(Ordering::SeqCst), 1);
}

#[test]
fn envelopes_share_one_native_frame() {
    let (sdk, session) = running_session();
    let depth = session.create_depth_sensor().unwrap();
    let (_a, first) = record_frames(&depth, Context::new(1));
    let (_b, second) = record_frames(&depth, Context::new(2));

    sdk.push_frame(ModuleKind::DepthSensor, EventKind::Frame, vec![0u8; 4096]);
    session.update().unwrap();

    let a = first.lock().unwrap()[0].clone();
    let b = second.lock().unwrap()[0].clone();
    assert!(a.shares_frame(&b));
    assert_eq!(a.context(), Context::new(1));
    assert_eq!(b.context(), Context::new(2));
    assert!(std::ptr::eq(a.data().as_ptr(), b.data().as_ptr()));

    // Envelopes outlive the session that produced them.
    session.release().unwrap();
    drop(session);
    assert_eq!(a.data().len(), 4096);
}

#[test]
fn queued_delivery_feeds_a_consumer_thread() {
    let (sdk, session) = running_session();
    let skeleton = session.create_skeleton_tracker().unwrap();
    let (tx, rx) = crossbeam_channel::bounded::<FrameEnvelope>(64);
    let id = skeleton
        .connect_on_frame_queue(Context::new(9), tx)
        .unwrap();

    let consumer = std::thread::spawn(move || {
        let mut received = Vec::new();
        while received.len() < 10 {
            let envelope = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(envelope.context(), Context::new(9));
            received.push(envelope.sequence());
        }
        received
    });

    for _ in 0..10 {
        sdk.push_frame(ModuleKind::SkeletonTracker, EventKind::Frame, vec![3]);
        session.update().unwrap();
    }
    assert_eq!(consumer.join().unwrap(), (1..=10).collect::<Vec<_>>());
    assert_eq!(skeleton.handler_stats(id).map(|s| s.delivered), Some(10));
}

#[test]
fn frame_stream_drains_on_an_executor() {
    use futures::StreamExt;

    let (sdk, session) = running_session();
    let depth = session.create_depth_sensor().unwrap();
    let (id, stream) = depth.frame_stream(Context::new(5)).unwrap();

    let consumer = std::thread::spawn(move || {
        futures::executor::block_on(
            stream
                .take(5)
                .map(|envelope| (envelope.context(), envelope.sequence()))
                .collect::<Vec<_>>(),
        )
    });

    for _ in 0..5 {
        sdk.push_frame(ModuleKind::DepthSensor, EventKind::Frame, vec![8]);
        assert_eq!(session.update().unwrap().delivered, 1);
    }
    let received = consumer.join().unwrap();
    assert!(received.iter().all(|(ctx, _)| *ctx == Context::new(5)));
    assert_eq!(
        received.iter().map(|(_, seq)| *seq).collect::<Vec<_>>(),
        vec![1, 2, 3, 4, 5]
    );

    // The stream is gone, so the next delivery reports a closed queue.
    sdk.push_frame(ModuleKind::DepthSensor, EventKind::Frame, vec![8]);
    assert_eq!(session.update().unwrap_err().kind(), ErrorKind::Dispatch);
    assert_eq!(depth.handler_stats(id).map(|s| s.delivered), Some(5));
}

#[test]
fn full_queue_drops_and_closed_queue_fails() {
    let (sdk, session) = running_session();
    let depth = session.create_depth_sensor().unwrap();
    let (tx, rx) = crossbeam_channel::bounded::<FrameEnvelope>(1);
    let id = depth.connect_queue(EventKind::Frame, Context::NONE, tx).unwrap();

    let mut dropped = 0;
    for _ in 0..3 {
        sdk.push_frame(ModuleKind::DepthSensor, EventKind::Frame, vec![1]);
        dropped += session.update().unwrap().dropped;
    }
    assert_eq!(dropped, 2);
    let stats = depth.handler_stats(id).unwrap();
    assert_eq!((stats.delivered, stats.dropped), (1, 2));
    assert_eq!(rx.try_recv().unwrap().sequence(), 1);

    drop(rx);
    sdk.push_frame(ModuleKind::DepthSensor, EventKind::Frame, vec![1]);
    let err = session.update().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Dispatch);
}

#[test]
fn handler_may_disconnect_itself() {
    let (sdk, session) = running_session();
    let hand = session.create_hand_tracker().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let own_id: Arc<Mutex<Option<HandlerId>>> = Arc::new(Mutex::new(None));

    let handle = hand.downgrade();
    let counter = Arc::clone(&calls);
    let slot = Arc::clone(&own_id);
    let id = hand
        .connect_on_frame(Context::NONE, move |_env| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let (Some(id), Some(hand)) = (slot.lock().unwrap().take(), handle.upgrade()) {
                hand.disconnect(id)?;
            }
            Ok(())
        })
        .unwrap();
    *own_id.lock().unwrap() = Some(id);

    for _ in 0..3 {
        sdk.push_frame(ModuleKind::HandTracker, EventKind::Frame, vec![1]);
        session.update().unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!hand.is_connected(id));
}

#[test]
fn handler_holding_its_module_weakly_does_not_leak_it() {
    let (sdk, session) = running_session();
    let hand = session.create_hand_tracker().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let weak = hand.downgrade();
    let counter = Arc::clone(&calls);
    hand.connect_on_frame(Context::NONE, move |_env| {
        assert!(weak.upgrade().is_some());
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();

    sdk.push_frame(ModuleKind::HandTracker, EventKind::Frame, vec![1]);
    session.update().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    drop(hand);
    assert_eq!(sdk.live_modules(), 0);
    assert_eq!(session.module_count(), 0);
    assert_eq!(sdk.push_frame(ModuleKind::HandTracker, EventKind::Frame, vec![2]), 0);
    assert_eq!(session.update().unwrap().delivered, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn reentrant_calls_from_a_handler_are_rejected() {
    let (sdk, session) = running_session();
    let session = Arc::new(session);
    let depth = session.create_depth_sensor().unwrap();
    let errors: Arc<Mutex<Vec<BridgeError>>> = Arc::new(Mutex::new(Vec::new()));

    let inner = Arc::clone(&session);
    let sink = Arc::clone(&errors);
    let waited = depth.downgrade();
    depth
        .connect_on_frame(Context::NONE, move |_env| {
            let mut sink = sink.lock().unwrap();
            sink.extend(inner.update().err());
            if let Some(waited) = waited.upgrade() {
                sink.extend(inner.wait_update(&waited).err());
            }
            sink.extend(inner.release().err());
            Ok(())
        })
        .unwrap();

    sdk.push_frame(ModuleKind::DepthSensor, EventKind::Frame, vec![1]);
    session.update().unwrap();
    assert_eq!(
        *errors.lock().unwrap(),
        vec![
            BridgeError::Reentrant(Operation::Update),
            BridgeError::Reentrant(Operation::WaitUpdate),
            BridgeError::Reentrant(Operation::Release),
        ]
    );
    assert!(errors.lock().unwrap().iter().all(|e| e.kind() == ErrorKind::InvalidState));
    session.release().unwrap();
}

#[test]
fn release_while_another_thread_dispatches_is_refused() {
    let (sdk, session) = running_session();
    let depth = session.create_depth_sensor().unwrap();
    let (entered_tx, entered_rx) = crossbeam_channel::bounded::<()>(1);
    let (go_tx, go_rx) = crossbeam_channel::bounded::<()>(1);
    depth
        .connect_on_frame(Context::NONE, move |_env| {
            entered_tx.send(()).ok();
            go_rx.recv_timeout(Duration::from_secs(5)).ok();
            Ok(())
        })
        .unwrap();
    sdk.push_frame(ModuleKind::DepthSensor, EventKind::Frame, vec![1]);

    std::thread::scope(|scope| {
        let driver = scope.spawn(|| session.update());
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(session.release(), Err(BridgeError::DispatchPending));
        go_tx.send(()).unwrap();
        driver.join().unwrap().unwrap();
    });
    session.release().unwrap();
}

#[test]
fn second_waiter_on_a_module_fails_fast() {
    let (sdk, session) = running_session();
    sdk.set_wait_timeout(Duration::from_secs(5));
    let hand = session.create_hand_tracker().unwrap();

    std::thread::scope(|scope| {
        let waiter = scope.spawn(|| session.wait_update(&hand));
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(
            session.wait_update(&hand).unwrap_err(),
            BridgeError::WaitInProgress(ModuleKind::HandTracker)
        );
        sdk.push_frame(ModuleKind::HandTracker, EventKind::Frame, vec![1]);
        assert!(waiter.join().unwrap().is_ok());
    });
}

//! Feed a consumer thread through a queue while the main thread drives
//! the session with `wait_update()`.
//!
//! Usage: cargo run --example queued

use std::sync::Arc;
use std::time::Duration;
use trackbridge::{Context, EventKind, FrameEnvelope, ModuleKind, Session, SimulatedSdk};

const FRAMES: u64 = 120;

fn main() {
    env_logger::init();

    let sdk = SimulatedSdk::new();
    let session = Session::new(Arc::new(sdk.clone()));
    if let Err(e) = session.init("").and_then(|_| session.run()) {
        eprintln!("Failed to start session: {}", e);
        std::process::exit(1);
    }

    let hand = match session.create_hand_tracker() {
        Ok(h) => h,
        Err(e) => {
            eprintln!("Failed to create hand tracker: {}", e);
            std::process::exit(1);
        }
    };

    let (sender, receiver) = crossbeam_channel::bounded::<FrameEnvelope>(16);
    let id = match hand.connect_on_frame_queue(Context::new(42), sender) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("Failed to connect queue: {}", e);
            std::process::exit(1);
        }
    };

    let consumer = std::thread::Builder::new()
        .name("hand-consumer".into())
        .spawn(move || {
            let mut received = 0u64;
            while let Ok(frame) = receiver.recv_timeout(Duration::from_secs(1)) {
                received += 1;
                if received % 20 == 0 {
                    println!(
                        "consumer: seq={} ctx={} refs={}",
                        frame.sequence(),
                        frame.context().value(),
                        frame.frame_refs()
                    );
                }
            }
            received
        });
    let consumer = match consumer {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to spawn consumer: {}", e);
            std::process::exit(1);
        }
    };

    for i in 0..FRAMES {
        sdk.push_frame(ModuleKind::HandTracker, EventKind::Frame, i.to_le_bytes());
        if let Err(e) = session.wait_update(&hand) {
            eprintln!("wait_update failed: {}", e);
            break;
        }
    }

    if let Some(stats) = hand.handler_stats(id) {
        println!(
            "queued={} dropped={} failed={}",
            stats.delivered, stats.dropped, stats.failed
        );
    }
    let _ = hand.disconnect(id);
    let received = consumer.join().unwrap_or(0);
    println!("consumer received {} of {} frames", received, FRAMES);

    if let Err(e) = session.release() {
        eprintln!("Release failed: {}", e);
    }
}

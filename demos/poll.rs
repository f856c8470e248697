//! Drive a simulated session with `update()` and print skeleton frames.
//!
//! Usage: cargo run --example poll [config.json]
//! Runs for five seconds.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use trackbridge::{Context, EventKind, ModuleKind, SessionBuilder, SimulatedSdk};

fn main() {
    env_logger::init();

    let config = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "demos/config.json".into());

    let sdk = SimulatedSdk::new();
    let (session, handles) = match SessionBuilder::new(Arc::new(sdk.clone()))
        .config_path(&config)
        .with_modules([ModuleKind::SkeletonTracker, ModuleKind::UserTracker])
        .build()
    {
        Ok(built) => built,
        Err(e) => {
            eprintln!("Failed to start session: {}", e);
            std::process::exit(1);
        }
    };
    let (skeleton, users) = (&handles[0], &handles[1]);

    println!("Config:       {}", config);
    println!(
        "ActiveUsers:  {}",
        session
            .get_config_value("Skeletonization.ActiveUsers")
            .unwrap_or_else(|_| "?".into())
    );
    println!();

    let frames = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&frames);
    let connected = skeleton.connect_on_frame(Context::new(1), move |frame| {
        let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
        // Print every ~30th frame to avoid flooding the terminal
        if n % 30 == 1 {
            println!(
                "seq={:<6} ts={:<8} bytes={}",
                frame.sequence(),
                frame.timestamp(),
                frame.data().len()
            );
        }
        Ok(())
    });
    if let Err(e) = connected {
        eprintln!("Failed to connect: {}", e);
        std::process::exit(1);
    }
    let _ = users.connect_on_new_user(Context::new(2), |event| {
        println!("new user (event {})", event.sequence());
        Ok(())
    });

    // Stand-in for the camera: produce frames at ~30 Hz.
    let stop = Arc::new(AtomicBool::new(false));
    let producer = {
        let sdk = sdk.clone();
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let mut tick = 0u32;
            while !stop.load(Ordering::Relaxed) {
                sdk.push_frame(ModuleKind::SkeletonTracker, EventKind::Frame, tick.to_le_bytes());
                if tick % 90 == 0 {
                    sdk.push_frame(ModuleKind::UserTracker, EventKind::NewUser, vec![1]);
                }
                tick += 1;
                std::thread::sleep(Duration::from_millis(33));
            }
        })
    };

    println!("Polling for 5s...");
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if let Err(e) = session.update() {
            eprintln!("Update failed: {}", e);
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    stop.store(true, Ordering::Relaxed);
    let _ = producer.join();

    let elapsed = start.elapsed().as_secs_f64();
    let count = frames.load(Ordering::Relaxed);
    println!(
        "\nTotal: {} frames in {:.1}s ({:.1} Hz)",
        count,
        elapsed,
        count as f64 / elapsed
    );

    if let Err(e) = session.release() {
        eprintln!("Release failed: {}", e);
    }
}

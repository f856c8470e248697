//! List the devices a simulated session sees and what each can host.

use std::sync::Arc;
use trackbridge::{DeviceInfo, DeviceSelector, ModuleKind, ModuleSet, Session, SimulatedSdk};

fn main() {
    env_logger::init();

    let sdk = SimulatedSdk::with_devices(vec![
        DeviceInfo {
            name: "Simulated Sensor".into(),
            serial_number: "SIM-0001".into(),
            provider: "sim".into(),
            index: 0,
            modules: ModuleSet::all(),
        },
        DeviceInfo {
            name: "Simulated Depth Camera".into(),
            serial_number: "SIM-0002".into(),
            provider: "sim".into(),
            index: 1,
            modules: ModuleSet::DEPTH_SENSOR | ModuleSet::COLOR_SENSOR,
        },
    ]);
    let session = Session::new(Arc::new(sdk));
    if let Err(e) = session.init("") {
        eprintln!("Init failed: {}", e);
        std::process::exit(1);
    }

    match session.devices() {
        Ok(devices) => {
            println!("Found {} device(s):", devices.len());
            for dev in &devices {
                let hosts: Vec<&str> = ModuleKind::ALL
                    .iter()
                    .filter(|k| dev.modules.supports(**k))
                    .map(|k| k.name())
                    .collect();
                println!(
                    "  [{}] {}  Serial={}  Provider={}  Modules={}",
                    dev.index,
                    dev.name,
                    dev.serial_number,
                    dev.provider,
                    hosts.join(",")
                );
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }

    match session.select_device(&DeviceSelector::BySerialNumber("SIM-0002".into())) {
        Ok(dev) => println!("\nSelected {}", dev.name),
        Err(e) => eprintln!("\nSelection failed: {}", e),
    }
    match session.create_skeleton_tracker() {
        Ok(_) => println!("SkeletonTracker created"),
        Err(e) => println!("SkeletonTracker unavailable: {} ({:?})", e, e.kind()),
    }
}

//! List all connected Kinect cameras and read their tilt state.

fn main() {
    env_logger::init();

    let devices = match depthcam::list_devices() {
        Ok(devices) => devices,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    println!("Found {} Kinect camera(s):", devices.len());
    for dev in &devices {
        println!(
            "  [{}] Bus={} Addr={}  Subdevices={:?}",
            dev.index, dev.bus_number, dev.address, dev.subdevices
        );
        if !dev.subdevices.contains(depthcam::Subdevices::MOTOR) {
            continue;
        }
        match depthcam::Motor::open(dev.index as usize).and_then(|m| m.tilt_state()) {
            Ok(state) => println!(
                "      tilt={:?}  accel={:?}  status={:?}",
                state.angle, state.accelerometer, state.status
            ),
            Err(e) => println!("      motor unavailable: {}", e),
        }
    }
}

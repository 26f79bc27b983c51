//! Stream frames from the emulated camera and print point cloud statistics.
//!
//! Usage: cargo run --example stream [overwrite]

use depthcam::{Context, DepthData, DepthFormat, GrabStatus, Overflow, SessionConfig, WaitMode};
use std::time::{Duration, Instant};

fn main() {
    env_logger::init();

    let overflow = match std::env::args().nth(1).as_deref() {
        Some("overwrite") => Overflow::Overwrite,
        _ => Overflow::Stall,
    };

    let ctx = Context::new();
    let mut session = match ctx.open(-1, SessionConfig::default().with_buffers(3)) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to open device: {}", e);
            std::process::exit(1);
        }
    };

    let info = match session.start(overflow) {
        Ok(info) => info,
        Err(e) => {
            eprintln!("Failed to start capture: {}", e);
            std::process::exit(1);
        }
    };
    println!(
        "Depth {}x{}  Color {}x{}  {:.1} fps  ({:?})",
        info.depth_width, info.depth_height, info.color_width, info.color_height, info.fps, overflow
    );

    let start = Instant::now();
    let mut count: u64 = 0;

    while start.elapsed() < Duration::from_secs(5) {
        let grab = match session.grab_frame(WaitMode::Block, true) {
            Ok(grab) => grab,
            Err(e) => {
                eprintln!("Error: {}", e);
                break;
            }
        };
        if grab.status != GrabStatus::FrameReady {
            eprintln!("Capture stopped");
            break;
        }
        count += 1;

        if count % 30 == 1 {
            if let Ok(image) = session.depth_image(DepthFormat::Metric) {
                if let DepthData::F64(z) = &image.data {
                    let valid: Vec<f64> = z.iter().copied().filter(|v| v.is_finite()).collect();
                    let mean = valid.iter().sum::<f64>() / valid.len().max(1) as f64;
                    println!(
                        "t={:<8.3}  pending={}  valid={:<6}  mean z={:.3} m",
                        grab.timestamp,
                        grab.pending,
                        valid.len(),
                        mean
                    );
                }
            }
        }

        if let Err(e) = session.release_frame() {
            eprintln!("Error: {}", e);
            break;
        }
    }

    let status = session.status();
    session.stop();
    let elapsed = start.elapsed().as_secs_f64();
    println!(
        "\nTotal: {} frames in {:.1}s ({:.1} Hz), {} xruns",
        count,
        elapsed,
        count as f64 / elapsed,
        status.xruns
    );
}

//! Stream coregistration-ready coordinates from a tracker to stdout.
//!
//! Usage: cargo run --example stream [tracker-id]
//! Defaults to the debug approach tracker (10). Runs for 30 seconds.

use neuronav::{Collaborators, DeviceKind, LinkState, MemorySession, RefMode, Tracker};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() {
    env_logger::init();

    let kind = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse::<u8>().ok())
        .and_then(DeviceKind::from_id)
        .unwrap_or(DeviceKind::DebugApproach);

    let mut tracker = Tracker::new(Arc::new(MemorySession::new()), Collaborators::default());
    if let Err(e) = tracker.set_tracker(kind, None) {
        eprintln!("Failed to connect {}: {}", kind, e);
        std::process::exit(1);
    }

    println!("Tracker:  {}", kind);
    println!("Lib mode: {}", tracker.lib_mode());
    println!("Sampling every {:?}", tracker.sampling_config().sleep_coord);
    println!();

    let start = Instant::now();
    let mut count: u64 = 0;
    let mut last_sequence = 0;

    while start.elapsed() < Duration::from_secs(30) {
        let snapshot = tracker.snapshot();
        if snapshot.link == LinkState::Lost {
            eprintln!("Tracker link lost");
        }
        if snapshot.sequence != last_sequence {
            last_sequence = snapshot.sequence;
            count += 1;
            let reading = tracker.get_tracker_coordinates(RefMode::Dynamic, 1);
            let c = &reading.coord;
            println!(
                "seq={:<6}  probe=[{:+8.2}, {:+8.2}, {:+8.2}]  rot=[{:+7.1}, {:+7.1}, {:+7.1}]  visible={:?}",
                snapshot.sequence, c[0], c[1], c[2], c[3], c[4], c[5], reading.visibilities,
            );
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    tracker.disconnect_tracker();
    let elapsed = start.elapsed().as_secs_f64();
    println!(
        "\nTotal: {} frames in {:.1}s ({:.1} Hz)",
        count,
        elapsed,
        count as f64 / elapsed
    );
}

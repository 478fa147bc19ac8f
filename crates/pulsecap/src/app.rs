//! Capture loop
//!
//! ```txt
//!   IqReader ──frames──► PulseDetector ──bursts──► ClientPipeline
//!                                                       │
//!                      publisher thread ◄──OutQueue─────┘
//! ```
//!
//! The loop runs on the main thread until the input is exhausted
//! or shutdown is requested. Publishing happens on its own thread,
//! so a slow or absent broker never stalls the detector.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};

use pulsewire::{ClientPipeline, IqError, IqReader, OutQueue, PulseDetector, Registry};

/// Run the capture loop
///
/// Reads every frame from `reader`, detects bursts and queues
/// the resulting messages. Returns the number of bursts found.
pub fn run<R: Read>(
    reader: &mut IqReader<R>,
    detector: &mut PulseDetector,
    pipeline: &ClientPipeline,
    queue: &OutQueue,
    shutdown: &AtomicBool,
) -> Result<u64, IqError> {
    let mut bursts = 0u64;
    let mut frames = 0u64;

    while !shutdown.load(Ordering::Relaxed) {
        let frame = match reader.next_frame()? {
            Some(frame) => frame,
            None => {
                info!("end of input after {} frames", frames);
                break;
            }
        };
        frames += 1;

        for burst in detector.process(&frame) {
            bursts += 1;
            debug!(
                "burst {}: {} pulses, {}",
                bursts,
                burst.pulse.num_pulses(),
                burst.modulation
            );
            for msg in pipeline.process(&burst) {
                queue.push(msg);
            }
        }
    }

    if detector.is_busy() {
        debug!("discarding burst in progress");
        detector.reset();
    }
    Ok(bursts)
}

/// Print the decoder list, as for `-R help`
pub fn list_protocols(registry: &Registry) {
    println!("Supported device protocols:");
    for info in registry.list() {
        println!(
            "    [{:02}]{} {} ({})",
            info.number,
            if info.enabled { " " } else { "*" },
            info.name,
            info.coding
        );
    }
    println!();
    println!("* Disabled by default, use -R n or a conf file to enable");
}

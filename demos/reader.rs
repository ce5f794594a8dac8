//! Example Reader
//!
//! Attaches to an owner's shared memory and prints the value.
//!
//! ```bash
//! cargo run --example reader demo            # print once
//! cargo run --example reader demo watch      # print every second
//! cargo run --example reader demo stop       # ask the owner to stop
//! ```

use shmem_value::{SharedSegment, Value};
use std::time::Duration;

fn main() {
    tracing_subscriber::fmt::init();

    let name = std::env::args().nth(1).unwrap_or_else(|| "demo".to_string());
    let mode = std::env::args().nth(2).unwrap_or_default();

    let mut segment = match SharedSegment::open(&name) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[Reader] Failed to open: {}", e);
            std::process::exit(1);
        }
    };

    match mode.as_str() {
        "stop" => match segment.set_item("stop", true) {
            Ok(true) => println!("[Reader] Stop flag set"),
            Ok(false) => println!("[Reader] Shared memory unavailable, is the owner running?"),
            Err(e) => eprintln!("[Reader] {}", e),
        },
        "watch" => loop {
            // Picks the owner up again after it restarts
            if !segment.availability() {
                let _ = segment.reconnect();
            }
            print_value(&mut segment);
            std::thread::sleep(Duration::from_secs(1));
        },
        _ => print_value(&mut segment),
    }
}

fn print_value(segment: &mut SharedSegment) {
    match segment.get_value() {
        Ok(Some(value)) => println!("[Reader] {}: {:?}", segment.name(), value),
        Ok(None) => println!("[Reader] {}: unavailable", segment.name()),
        Err(e) => eprintln!("[Reader] {}: {}", segment.name(), e),
    }
}

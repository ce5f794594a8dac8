//! Example Owner (Writer)
//!
//! Creates a shared mapping and bumps a counter in it once a second until
//! Ctrl+C or until a reader sets "stop" to true.

use shmem_value::{SharedSegment, Value};
use std::time::Duration;

fn main() {
    tracing_subscriber::fmt::init();

    let name = std::env::args().nth(1).unwrap_or_else(|| "demo".to_string());

    println!("[Owner] Creating shared memory: {}", name);

    let initial = Value::mapping([
        ("counter", Value::Integer(0)),
        ("stop", Value::Bool(false)),
    ]);
    let mut segment = match SharedSegment::builder(name.as_str())
        .value(initial)
        .capacity(4096)
        .create()
    {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[Owner] Failed to create shared memory: {}", e);
            std::process::exit(1);
        }
    };

    println!("[Owner] Capacity: {} bytes", segment.capacity().unwrap_or(0));
    println!("[Owner] Run `cargo run --example reader {}` in another shell", name);

    loop {
        std::thread::sleep(Duration::from_secs(1));

        let bumped = segment.update(|value| {
            let next = match value.get_item(&"counter".into())? {
                Value::Integer(n) => n + 1,
                _ => 0,
            };
            value.set_item("counter".into(), Value::Integer(next))?;
            Ok(next)
        });

        match bumped {
            Ok(Some(n)) => println!("[Owner] counter = {}", n),
            Ok(None) => println!("[Owner] shared memory unavailable"),
            Err(e) => {
                eprintln!("[Owner] update failed: {}", e);
                break;
            }
        }

        if let Ok(Some(Value::Bool(true))) = segment.get_item(&"stop".into()) {
            println!("[Owner] Stop requested");
            break;
        }
    }

    match segment.close() {
        Ok(_) => println!("[Owner] Closed"),
        Err(e) => eprintln!("[Owner] Close failed: {}", e),
    }
}

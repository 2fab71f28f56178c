//! VizStream Live Counter Demo
//!
//! Streams a few views to the dashboard from worker threads. Run it twice at
//! once and the second process attaches to the first one's server.

use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use vizstream::client::{Client, SendOptions};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Starting VizStream Live Counter Demo");

    let viz = Arc::new(Client::new()?);
    if viz.is_attached() {
        println!("Attached to a running server on port {}", viz.config().port);
    }

    viz.markdown("# Live counter\nUpdated from several threads.", Some("intro"))?;
    viz.log(&[json!("demo started")], None)?;

    let mut workers = Vec::new();
    for worker in 0..3 {
        let viz = Arc::clone(&viz);
        workers.push(thread::spawn(move || -> vizstream::Result<()> {
            let mut rng = rand::thread_rng();
            for step in 1..=20 {
                let id = format!("worker-{}", worker);
                viz.progress(step as f64 / 20.0, Some(&id))?;
                viz.send_with(
                    json!([[step, rng.gen_range(0..100)]]),
                    SendOptions::new()
                        .id(format!("samples-{}", worker))
                        .view("area")
                        .append(true),
                )?;
                thread::sleep(Duration::from_millis(250));
            }
            viz.log(&[json!("worker finished"), json!(worker)], None)
        }));
    }

    for worker in workers {
        match worker.join() {
            Ok(result) => result?,
            Err(_) => eprintln!("Worker thread panicked"),
        }
    }

    viz.number(60, Some("total-steps"))?;
    viz.wait()?;

    println!("Demo finished; press Ctrl+C to stop");
    thread::sleep(Duration::from_secs(30));
    Ok(())
}

//! Stream one PSMove controller's pose and buttons to stdout.
//!
//! Usage: cargo run --example controller_stream [controller_id]
//! Press Ctrl+C to stop.

use psmove_client::{Client, ClientConfig, DataStreamFlags, EventType, Message, PsMoveButton};
use std::time::{Duration, Instant};

fn main() {
    env_logger::init();

    let controller_id: i32 = std::env::args()
        .nth(1)
        .and_then(|a| a.parse().ok())
        .unwrap_or(0);

    let mut client = Client::with_config(ClientConfig::from_env());
    if let Err(e) = client.initialize_from_config() {
        eprintln!("Failed to connect: {}", e);
        std::process::exit(1);
    }

    // Fills the static fields of the mirror before registering.
    if let Err(e) = client.get_controller_list() {
        eprintln!("Controller list failed: {}", e);
    }
    if let Err(e) = client.register_as_controller_listener(controller_id) {
        eprintln!("Failed to register controller {}: {}", controller_id, e);
        std::process::exit(1);
    }
    let flags = DataStreamFlags::INCLUDE_POSITION | DataStreamFlags::INCLUDE_PHYSICS;
    if let Err(e) = client.start_controller_data_stream(controller_id, flags) {
        eprintln!("Failed to start stream: {}", e);
        std::process::exit(1);
    }

    println!("Streaming controller {} (Ctrl+C to stop)...", controller_id);

    let mut last_report = Instant::now();
    let mut last_seq = 0;

    loop {
        if let Err(e) = client.pump() {
            eprintln!("Error: {}", e);
            break;
        }
        while let Some(message) = client.poll_next_message() {
            if let Message::Event(event) = message {
                println!("event: {:?}", event.event_type);
                if event.event_type == EventType::DisconnectedFromService {
                    return;
                }
            }
        }

        let Some(controller) = client.controller(controller_id) else {
            break;
        };
        if let Some(psmove) = controller.psmove() {
            let seq = controller.input_sequence_num();
            // Print every ~30th frame to avoid flooding the terminal
            if seq != last_seq && seq % 30 == 1 {
                let p = psmove.pose.position;
                let q = psmove.pose.orientation;
                println!(
                    "seq={:<8} pos=[{:+.2}, {:+.2}, {:+.2}]  quat=[{:+.3}, {:+.3}, {:+.3}, {:+.3}]  trigger={:3} move={:?}",
                    seq,
                    p.x, p.y, p.z,
                    q.x, q.y, q.z, q.w,
                    psmove.trigger_value,
                    psmove.button(PsMoveButton::Move),
                );
            }
            last_seq = seq;
        }

        let now = Instant::now();
        if now.duration_since(last_report) >= Duration::from_secs(3) {
            println!("--- {:.1} Hz ---", controller.data_frame_average_fps());
            last_report = now;
        }

        std::thread::sleep(Duration::from_millis(5));
    }

    let _ = client.shutdown();
}

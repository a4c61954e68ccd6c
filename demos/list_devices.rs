//! Print the controllers and trackers PSMoveService knows about.
//!
//! Usage: cargo run --example list_devices
//! Endpoint comes from PSM_HOST / PSM_PORT (default localhost:9512).

fn main() {
    env_logger::init();

    let mut client = psmove_client::Client::with_config(psmove_client::ClientConfig::from_env());
    if let Err(e) = client.initialize_from_config() {
        eprintln!("Failed to connect: {}", e);
        std::process::exit(1);
    }

    match client.get_controller_list() {
        Ok(list) => {
            println!("Controllers: {}", list.controllers.len());
            for c in &list.controllers {
                println!(
                    "  #{} {:?}  serial={}  path={}",
                    c.controller_id, c.controller_type, c.device_serial, c.device_path
                );
            }
        }
        Err(e) => eprintln!("Controller list failed: {}", e),
    }

    match client.get_tracker_list() {
        Ok(list) => {
            println!("Trackers: {}", list.trackers.len());
            for t in &list.trackers {
                println!(
                    "  #{} {:?}/{:?}  fov={:.1}x{:.1}  video={}",
                    t.tracker_id,
                    t.tracker_type,
                    t.tracker_driver,
                    t.hfov,
                    t.vfov,
                    t.shared_memory_name
                );
            }
        }
        Err(e) => eprintln!("Tracker list failed: {}", e),
    }

    let _ = client.shutdown();
}

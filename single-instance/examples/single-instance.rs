use std::time::Duration;
use unix_single_instance::*;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let app_name = "org.example.MyApp";

    match only_single_instance(app_name, |message| {
        println!("\n⚡ Handoff received from secondary instance!");
        println!("   arguments: {:?}", message.arguments);
        println!("   working directory: {:?}", message.working_directory);
        println!("   (This is where you could bring your window to front, etc.)");
    }) {
        Ok(_) => {
            println!("✓ This is the primary instance");
            println!("  Press Ctrl+C to exit.\n");
            std::thread::sleep(Duration::from_secs(99999999));
        }
        Err(Error::AlreadyRunning) => {
            println!("✗ Another instance is already running");
            println!("  Arguments were handed to the primary instance.");
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            return Err(e.into());
        }
    }

    Ok(())
}
